//! Redis persistence for list entries.
//!
//! One lazily established synchronous connection, re-dialed on the next
//! operation after any error. Values are `<abs_expiration_epoch>:<reason>`
//! under `<prefix>:<kind_name>:<key>`, expired natively via `EX`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

pub(crate) struct RedisPersist {
    enabled: AtomicBool,
    persist_replicated: AtomicBool,
    timeout_secs: AtomicU64,
    server: RwLock<Option<(String, u16)>>,
    prefix: RwLock<String>,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisPersist {
    pub fn new(default_prefix: &str) -> RedisPersist {
        RedisPersist {
            enabled: AtomicBool::new(false),
            persist_replicated: AtomicBool::new(false),
            timeout_secs: AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_SECS),
            server: RwLock::new(None),
            prefix: RwLock::new(default_prefix.to_string()),
            conn: Mutex::new(None),
        }
    }

    pub fn configure(&self, host: &str, port: u16) {
        *self.server.write().unwrap() = Some((host.to_string(), port));
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_persist_replicated(&self, on: bool) {
        self.persist_replicated.store(on, Ordering::Relaxed);
    }

    pub fn persist_replicated(&self) -> bool {
        self.persist_replicated.load(Ordering::Relaxed)
    }

    pub fn set_connect_timeout(&self, secs: u64) {
        self.timeout_secs.store(secs.max(1), Ordering::Relaxed);
    }

    pub fn set_prefix(&self, prefix: &str) {
        *self.prefix.write().unwrap() = prefix.to_string();
    }

    pub fn prefix(&self) -> String {
        self.prefix.read().unwrap().clone()
    }

    /// Run `f` against the connection, dialing if necessary. Any error
    /// drops the connection so the next operation reconnects.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, crate::Error> {
        let (host, port) = self
            .server
            .read()
            .unwrap()
            .clone()
            .ok_or(crate::Error::PersistenceDisabled)?;

        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
            let timeout = Duration::from_secs(self.timeout_secs.load(Ordering::Relaxed));
            *guard = match client.get_connection_with_timeout(timeout) {
                Ok(conn) => Some(conn),
                Err(err) => {
                    tracing::error!(%err, "could not connect to redis");
                    return Err(err.into());
                }
            };
        }

        match f(guard.as_mut().expect("connection was just established")) {
            Ok(v) => Ok(v),
            Err(err) => {
                *guard = None;
                Err(err.into())
            }
        }
    }

    pub fn set_entry(
        &self,
        kind_name: &str,
        key: &str,
        abs_expiration: i64,
        ttl: i64,
        reason: &str,
    ) -> Result<(), crate::Error> {
        let rkey = format!("{}:{kind_name}:{key}", self.prefix());
        let value = format!("{abs_expiration}:{reason}");
        self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(&rkey)
                .arg(&value)
                .arg("EX")
                .arg(ttl)
                .query(conn)
        })
    }

    pub fn delete_entry(&self, kind_name: &str, key: &str) -> Result<(), crate::Error> {
        let rkey = format!("{}:{kind_name}:{key}", self.prefix());
        self.with_conn(|conn| redis::cmd("DEL").arg(&rkey).query(conn))
    }

    /// All persisted `(redis_key, value)` pairs under this prefix, fetched
    /// by SCAN plus batched MGET.
    pub fn scan_entries(&self) -> Result<Vec<(String, String)>, crate::Error> {
        let pattern = format!("{}:*", self.prefix());
        self.with_conn(|conn| {
            let mut out = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(1000)
                    .query(conn)?;
                if !keys.is_empty() {
                    let values: Vec<Option<String>> =
                        redis::cmd("MGET").arg(&keys).query(conn)?;
                    for (key, value) in keys.into_iter().zip(values) {
                        // A key may expire between SCAN and MGET.
                        if let Some(value) = value {
                            out.push((key, value));
                        }
                    }
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(out)
        })
    }
}
