use crate::persist::RedisPersist;
use crate::trie::NetmaskTrie;
use crate::{now_epoch, Error, Kind, ListSide};
use prost::Message;
use proto_breakwater::{ListOpType, ListOperation, ReplicationMsg, ReplicationSink};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// One list entry. `seq` preserves insertion order for listings; the
/// expiration index orders the expiry sweep.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub key: String,
    pub kind: Kind,
    /// Absolute expiration, epoch seconds.
    pub expiration: i64,
    pub reason: String,
    seq: u64,
}

impl ListEntry {
    /// Remaining seconds, -1 when already expired.
    pub fn remaining(&self, now: i64) -> i64 {
        let left = self.expiration - now;
        if left >= 0 {
            left
        } else {
            -1
        }
    }
}

#[derive(Default)]
struct Table {
    by_key: HashMap<String, ListEntry>,
    by_expiry: BTreeSet<(i64, String)>,
}

struct State {
    tables: [Table; 3],
    trie: NetmaskTrie,
    next_seq: u64,
}

struct Inner {
    side: ListSide,
    state: RwLock<State>,
    persist: RedisPersist,
    sink: RwLock<Option<ReplicationSink>>,
}

/// A block-list or allow-list: three kind-partitioned entry tables plus a
/// netmask trie mirroring the IP kind. One write lock covers the tables
/// and the trie together, keeping them consistent at all times.
#[derive(Clone)]
pub struct ListDb {
    inner: Arc<Inner>,
}

impl ListDb {
    pub fn new(side: ListSide) -> ListDb {
        ListDb {
            inner: Arc::new(Inner {
                side,
                state: RwLock::new(State {
                    tables: Default::default(),
                    trie: NetmaskTrie::new(),
                    next_seq: 0,
                }),
                persist: RedisPersist::new(side.redis_prefix()),
                sink: RwLock::new(None),
            }),
        }
    }

    pub fn side(&self) -> ListSide {
        self.inner.side
    }

    pub fn set_replication_sink(&self, sink: ReplicationSink) {
        *self.inner.sink.write().unwrap() = Some(sink);
    }

    // ---- mutations ----

    /// Upsert an entry for `ttl` seconds. Re-adding a key replaces its
    /// expiration and reason and moves it to the end of the listing.
    pub fn add(&self, kind: Kind, key: &str, ttl: i64, reason: &str) {
        self.add_internal(kind, key, ttl, reason, true);
    }

    pub fn add_internal(&self, kind: Kind, key: &str, ttl: i64, reason: &str, replicate: bool) {
        self.add_at(kind, key, ttl, reason, replicate, now_epoch());
    }

    pub(crate) fn add_at(
        &self,
        kind: Kind,
        key: &str,
        ttl: i64,
        reason: &str,
        replicate: bool,
        now: i64,
    ) {
        let expiration = now + ttl.max(0);
        {
            let mut state = self.inner.state.write().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;

            let table = &mut state.tables[kind.index()];
            if let Some(old) = table.by_key.remove(key) {
                table.by_expiry.remove(&(old.expiration, old.key));
            }
            table.by_key.insert(
                key.to_string(),
                ListEntry {
                    key: key.to_string(),
                    kind,
                    expiration,
                    reason: reason.to_string(),
                    seq,
                },
            );
            table.by_expiry.insert((expiration, key.to_string()));
            let len = table.by_key.len() as i64;

            if kind == Kind::Ip {
                if let Err(err) = state.trie.add_mask(key) {
                    tracing::warn!(key, %err, "IP list key is not a valid netmask");
                }
            }

            ops::metrics::LIST_ENTRIES
                .with_label_values(&[self.inner.side.label(), kind.type_name()])
                .set(len);
        }

        tracing::info!(
            list = self.inner.side.label(),
            kind = kind.type_name(),
            key,
            expire_secs = ttl,
            reason,
            "add entry"
        );

        // Originating nodes always persist; replicas only when configured.
        if self.inner.persist.enabled()
            && (replicate || self.inner.persist.persist_replicated())
        {
            if let Err(err) = self.inner.persist.set_entry(
                kind.redis_name(self.inner.side),
                key,
                expiration,
                ttl,
                reason,
            ) {
                tracing::error!(key, %err, "persisting list entry");
            }
        }

        if replicate {
            self.replicate(ListOpType::Add, kind, key, ttl, reason);
            // Webhooks fire for the originating add only, not on replicas.
            webhooks::run_event_hooks(
                self.inner.side.add_event(),
                &json!({
                    "key": key,
                    (self.inner.side.type_field()): kind.type_name(),
                    "reason": reason,
                    "expire_secs": ttl,
                }),
            );
        }
    }

    pub fn delete(&self, kind: Kind, key: &str) {
        self.delete_internal(kind, key, true);
    }

    pub fn delete_internal(&self, kind: Kind, key: &str, replicate: bool) {
        {
            let mut state = self.inner.state.write().unwrap();
            let table = &mut state.tables[kind.index()];
            if let Some(old) = table.by_key.remove(key) {
                table.by_expiry.remove(&(old.expiration, old.key));
            }
            let len = table.by_key.len() as i64;
            if kind == Kind::Ip {
                if let Err(err) = state.trie.delete_mask(key) {
                    tracing::debug!(key, %err, "not a netmask, nothing to unlink");
                }
            }
            ops::metrics::LIST_ENTRIES
                .with_label_values(&[self.inner.side.label(), kind.type_name()])
                .set(len);
        }

        tracing::info!(
            list = self.inner.side.label(),
            kind = kind.type_name(),
            key,
            "delete entry"
        );

        if self.inner.persist.enabled()
            && (replicate || self.inner.persist.persist_replicated())
        {
            if let Err(err) = self
                .inner
                .persist
                .delete_entry(kind.redis_name(self.inner.side), key)
            {
                tracing::error!(key, %err, "unpersisting list entry");
            }
        }

        if replicate {
            self.replicate(ListOpType::Delete, kind, key, 0, "");
            webhooks::run_event_hooks(
                self.inner.side.del_event(),
                &json!({
                    "key": key,
                    (self.inner.side.type_field()): kind.type_name(),
                }),
            );
        }
    }

    // ---- lookups ----

    /// Exact-match check. Expired entries never match, even before the
    /// sweep removes them.
    pub fn check(&self, kind: Kind, key: &str) -> bool {
        self.check_at(kind, key, now_epoch())
    }

    pub(crate) fn check_at(&self, kind: Kind, key: &str, now: i64) -> bool {
        let state = self.inner.state.read().unwrap();
        state.tables[kind.index()]
            .by_key
            .get(key)
            .map(|e| e.expiration > now)
            .unwrap_or(false)
    }

    /// Longest-prefix check of an address against the IP kind.
    pub fn check_ip(&self, addr: &std::net::IpAddr) -> bool {
        self.check_ip_at(addr, now_epoch())
    }

    pub(crate) fn check_ip_at(&self, addr: &std::net::IpAddr, now: i64) -> bool {
        let state = self.inner.state.read().unwrap();
        match state.trie.lookup(addr) {
            Some(mask) => state.tables[Kind::Ip.index()]
                .by_key
                .get(mask)
                .map(|e| e.expiration > now)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn get(&self, kind: Kind, key: &str) -> Option<ListEntry> {
        let state = self.inner.state.read().unwrap();
        state.tables[kind.index()].by_key.get(key).cloned()
    }

    /// The entry of the most specific mask matching `addr`.
    pub fn get_ip(&self, addr: &std::net::IpAddr) -> Option<ListEntry> {
        let state = self.inner.state.read().unwrap();
        let mask = state.trie.lookup(addr)?;
        state.tables[Kind::Ip.index()].by_key.get(mask).cloned()
    }

    /// Remaining seconds for `key`, -1 when absent or expired.
    pub fn get_expiration(&self, kind: Kind, key: &str) -> i64 {
        self.get_expiration_at(kind, key, now_epoch())
    }

    pub(crate) fn get_expiration_at(&self, kind: Kind, key: &str, now: i64) -> i64 {
        self.get(kind, key).map(|e| e.remaining(now)).unwrap_or(-1)
    }

    /// Snapshot of one kind, in insertion order.
    pub fn list(&self, kind: Kind) -> Vec<ListEntry> {
        let state = self.inner.state.read().unwrap();
        let mut entries: Vec<_> = state.tables[kind.index()].by_key.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    // ---- replication ----

    fn replicate(&self, op_type: ListOpType, kind: Kind, key: &str, ttl: i64, reason: &str) {
        let sink = self.inner.sink.read().unwrap();
        if let Some(sink) = sink.as_ref() {
            let op = ListOperation {
                op_type: op_type as i32,
                kind: kind.proto() as i32,
                key: key.to_string(),
                ttl,
                reason: reason.to_string(),
            };
            sink(ReplicationMsg {
                rep_type: self.inner.side.rep_type() as i32,
                rep_op: op.encode_to_vec(),
            });
        }
    }

    /// Apply an operation received from a peer; never replicates again.
    pub fn apply(&self, op: &ListOperation) {
        let Some(kind) = Kind::from_proto(op.kind) else {
            tracing::warn!(kind = op.kind, "dropping list operation with unknown kind");
            return;
        };
        match ListOpType::try_from(op.op_type).unwrap_or(ListOpType::None) {
            ListOpType::None => {}
            ListOpType::Add => self.add_internal(kind, &op.key, op.ttl, &op.reason, false),
            ListOpType::Delete => self.delete_internal(kind, &op.key, false),
        }
    }

    // ---- expiry ----

    /// Start the sweep worker. Runs for the remaining process lifetime.
    pub fn start_expiry_worker(&self) {
        let db = self.clone();
        std::thread::Builder::new()
            .name(format!("bw/expire-{}", self.inner.side.label()))
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_secs(1));
                db.purge_expired_at(now_epoch());
            })
            .expect("spawning list expiry worker");
    }

    /// One sweep: walk each kind's expiration index from the smallest
    /// expiration, stopping at the first live entry. Expiry is local; it
    /// never replicates. Returns the number of entries removed.
    pub fn purge_expired_at(&self, now: i64) -> usize {
        let mut expired: Vec<(Kind, String)> = Vec::new();
        {
            let mut state = self.inner.state.write().unwrap();
            for kind in [Kind::Ip, Kind::Login, Kind::IpLogin] {
                loop {
                    let candidate = state.tables[kind.index()]
                        .by_expiry
                        .iter()
                        .next()
                        .cloned();
                    match candidate {
                        Some((expiration, key)) if expiration <= now => {
                            let table = &mut state.tables[kind.index()];
                            table.by_expiry.remove(&(expiration, key.clone()));
                            table.by_key.remove(&key);
                            let len = table.by_key.len() as i64;
                            if kind == Kind::Ip {
                                let _ = state.trie.delete_mask(&key);
                            }
                            ops::metrics::LIST_ENTRIES
                                .with_label_values(&[self.inner.side.label(), kind.type_name()])
                                .set(len);
                            expired.push((kind, key));
                        }
                        _ => break,
                    }
                }
            }
        }

        // Hooks and logs happen after the lock is released.
        for (kind, key) in &expired {
            tracing::info!(
                list = self.inner.side.label(),
                kind = kind.type_name(),
                %key,
                "expire entry"
            );
            webhooks::run_event_hooks(
                self.inner.side.expire_event(),
                &json!({
                    "key": key,
                    (self.inner.side.type_field()): kind.type_name(),
                }),
            );
        }
        expired.len()
    }

    // ---- persistence ----

    pub fn make_persistent(&self, host: &str, port: u16) {
        self.inner.persist.configure(host, port);
    }

    pub fn set_persist_replicated(&self, on: bool) {
        self.inner.persist.set_persist_replicated(on);
    }

    pub fn set_connect_timeout(&self, secs: u64) {
        self.inner.persist.set_connect_timeout(secs);
    }

    pub fn set_redis_prefix(&self, prefix: &str) {
        self.inner.persist.set_prefix(prefix);
    }

    /// Repopulate from Redis at startup. Entries of the other side (when
    /// both lists share a prefix) and already-expired values are skipped.
    pub fn load_persisted(&self) -> Result<usize, Error> {
        let pairs = self.inner.persist.scan_entries()?;
        let prefix = self.inner.persist.prefix();
        let now = now_epoch();
        let mut loaded = 0usize;

        for (redis_key, value) in pairs {
            let Some((kind, key)) = parse_redis_key(&prefix, self.inner.side, &redis_key) else {
                tracing::debug!(%redis_key, "skipping foreign persisted key");
                continue;
            };
            let Some((expiration, reason)) = parse_redis_value(&value) else {
                tracing::warn!(%redis_key, "malformed persisted value");
                continue;
            };
            let ttl = expiration - now;
            if ttl <= 0 {
                continue;
            }
            self.add_at(kind, key, ttl, reason, false, now);
            loaded += 1;
        }
        tracing::info!(
            list = self.inner.side.label(),
            loaded,
            "loaded persisted entries"
        );
        Ok(loaded)
    }
}

/// Split `<prefix>:<kind_name>:<key>`; the key itself may contain colons.
fn parse_redis_key<'a>(prefix: &str, side: ListSide, redis_key: &'a str) -> Option<(Kind, &'a str)> {
    let rest = redis_key.strip_prefix(prefix)?.strip_prefix(':')?;
    let (kind_name, key) = rest.split_once(':')?;
    let kind = Kind::from_redis_name(kind_name, side)?;
    Some((kind, key))
}

/// Split `<abs_expiration_epoch>:<reason>`; the reason may contain colons.
fn parse_redis_value(value: &str) -> Option<(i64, &str)> {
    let (expiration, reason) = value.split_once(':')?;
    Some((expiration.parse().ok()?, reason))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::IpAddr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn netmask_check_and_expiry() {
        let db = ListDb::new(ListSide::Block);
        db.add_at(Kind::Ip, "192.0.2.0/24", 60, "block", false, 0);

        assert!(db.check_ip_at(&addr("192.0.2.17"), 10));
        assert!(!db.check_ip_at(&addr("198.51.100.1"), 10));

        // Not yet swept but already expired: lookups must not match.
        assert!(!db.check_ip_at(&addr("192.0.2.17"), 61));

        assert_eq!(db.purge_expired_at(61), 1);
        assert!(!db.check_ip_at(&addr("192.0.2.17"), 61));
        assert!(db.get(Kind::Ip, "192.0.2.0/24").is_none());
    }

    #[test]
    fn exact_check_per_kind() {
        let db = ListDb::new(ListSide::Block);
        db.add_at(Kind::Login, "mallory", 60, "creds", false, 0);
        db.add_at(Kind::IpLogin, "192.0.2.5:mallory", 60, "pair", false, 0);

        assert!(db.check_at(Kind::Login, "mallory", 1));
        assert!(!db.check_at(Kind::Login, "alice", 1));
        assert!(db.check_at(Kind::IpLogin, "192.0.2.5:mallory", 1));
        // Kinds are separate namespaces.
        assert!(!db.check_at(Kind::Ip, "mallory", 1));
    }

    #[test]
    fn readd_replaces_and_moves_to_listing_end() {
        let db = ListDb::new(ListSide::Block);
        db.add_at(Kind::Login, "a", 60, "first", false, 0);
        db.add_at(Kind::Login, "b", 60, "second", false, 0);
        db.add_at(Kind::Login, "a", 120, "updated", false, 0);

        let listing = db.list(Kind::Login);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].key, "b");
        assert_eq!(listing[1].key, "a");
        assert_eq!(listing[1].reason, "updated");
        assert_eq!(db.get_expiration_at(Kind::Login, "a", 0), 120);
    }

    #[test]
    fn get_expiration_sentinels() {
        let db = ListDb::new(ListSide::Allow);
        db.add_at(Kind::Login, "alice", 60, "ok", false, 0);

        assert_eq!(db.get_expiration_at(Kind::Login, "alice", 10), 50);
        assert_eq!(db.get_expiration_at(Kind::Login, "alice", 61), -1);
        assert_eq!(db.get_expiration_at(Kind::Login, "absent", 0), -1);
    }

    #[test]
    fn delete_unlinks_trie() {
        let db = ListDb::new(ListSide::Block);
        db.add_at(Kind::Ip, "10.0.0.0/8", 600, "wide", false, 0);
        assert!(db.check_ip_at(&addr("10.1.2.3"), 1));

        db.delete_internal(Kind::Ip, "10.0.0.0/8", false);
        assert!(!db.check_ip_at(&addr("10.1.2.3"), 1));
    }

    #[test]
    fn sweep_stops_at_first_live_entry() {
        let db = ListDb::new(ListSide::Block);
        db.add_at(Kind::Login, "soon", 10, "", false, 0);
        db.add_at(Kind::Login, "later", 100, "", false, 0);

        assert_eq!(db.purge_expired_at(50), 1);
        assert!(db.check_at(Kind::Login, "later", 50));
        assert_eq!(db.purge_expired_at(101), 1);
        assert!(db.list(Kind::Login).is_empty());
    }

    #[test]
    fn longest_prefix_entry_lookup() {
        let db = ListDb::new(ListSide::Block);
        db.add_at(Kind::Ip, "10.0.0.0/8", 600, "wide", false, 0);
        db.add_at(Kind::Ip, "10.1.0.0/16", 600, "narrow", false, 0);

        assert_eq!(db.get_ip(&addr("10.1.2.3")).unwrap().reason, "narrow");
        assert_eq!(db.get_ip(&addr("10.9.9.9")).unwrap().reason, "wide");
    }

    #[test]
    fn apply_never_replicates_back() {
        use std::sync::Mutex;

        let db = ListDb::new(ListSide::Block);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let capture = captured.clone();
        db.set_replication_sink(Arc::new(move |msg| {
            capture.lock().unwrap().push(msg);
        }));

        db.add(Kind::Ip, "192.0.2.0/24", 60, "block");
        assert_eq!(captured.lock().unwrap().len(), 1);

        let msg = captured.lock().unwrap().remove(0);
        let op = ListOperation::decode(msg.rep_op.as_slice()).unwrap();

        let peer = ListDb::new(ListSide::Block);
        let peer_captured = Arc::new(Mutex::new(Vec::new()));
        let peer_capture = peer_captured.clone();
        peer.set_replication_sink(Arc::new(move |msg| {
            peer_capture.lock().unwrap().push(msg);
        }));
        peer.apply(&op);

        assert!(peer.check_ip(&addr("192.0.2.17")));
        assert!(peer_captured.lock().unwrap().is_empty());
    }

    #[test]
    fn redis_key_and_value_parsing() {
        assert_eq!(
            parse_redis_key("bw", ListSide::Block, "bw:ip_bl:192.0.2.0/24"),
            Some((Kind::Ip, "192.0.2.0/24"))
        );
        // Composite keys keep their embedded colon.
        assert_eq!(
            parse_redis_key("bw", ListSide::Block, "bw:ip_login_bl:192.0.2.5:bob"),
            Some((Kind::IpLogin, "192.0.2.5:bob"))
        );
        // Allow-side keys are foreign to a block list.
        assert_eq!(parse_redis_key("bw", ListSide::Block, "bw:ip_wl:10.0.0.0/8"), None);
        assert_eq!(parse_redis_key("bw", ListSide::Block, "other:ip_bl:k"), None);

        assert_eq!(
            parse_redis_value("1750000000:too many attempts: tarpitted"),
            Some((1_750_000_000, "too many attempts: tarpitted"))
        );
        assert_eq!(parse_redis_value("garbage"), None);
    }
}
