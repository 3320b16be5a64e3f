use crate::WebHook;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_NUM_THREADS: usize = 5;
const DEFAULT_MAX_CONNS: usize = 10;
const DEFAULT_QUEUE_SIZE: usize = 50_000;
const DEFAULT_TIMEOUT_SECS: u64 = 2;

struct QueueItem {
    event_name: String,
    hook: Arc<WebHook>,
    payload: Arc<String>,
}

struct Shared {
    queue: Mutex<VecDeque<QueueItem>>,
    cv: Condvar,
    num_threads: AtomicUsize,
    max_conns: AtomicUsize,
    max_queue_size: AtomicUsize,
    timeout_secs: AtomicU64,
    verify_peer: AtomicBool,
    verify_host: AtomicBool,
    ca_cert_bundle: RwLock<Option<PathBuf>>,
}

/// The webhook dispatcher: a bounded FIFO drained by worker threads, each
/// owning one HTTP client and issuing up to `max_conns` deliveries
/// concurrently. Submission never blocks; a full queue drops the event.
pub struct WebHookRunner {
    shared: Arc<Shared>,
}

impl WebHookRunner {
    pub fn new() -> WebHookRunner {
        WebHookRunner {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                num_threads: AtomicUsize::new(DEFAULT_NUM_THREADS),
                max_conns: AtomicUsize::new(DEFAULT_MAX_CONNS),
                max_queue_size: AtomicUsize::new(DEFAULT_QUEUE_SIZE),
                timeout_secs: AtomicU64::new(DEFAULT_TIMEOUT_SECS),
                verify_peer: AtomicBool::new(true),
                verify_host: AtomicBool::new(true),
                ca_cert_bundle: RwLock::new(None),
            }),
        }
    }

    // Configuration, applied before `start_threads`.

    pub fn set_num_threads(&self, n: usize) {
        self.shared.num_threads.store(n.max(1), Ordering::Relaxed);
    }

    pub fn set_max_conns(&self, n: usize) {
        self.shared.max_conns.store(n.max(1), Ordering::Relaxed);
    }

    pub fn set_max_queue_size(&self, n: usize) {
        self.shared.max_queue_size.store(n, Ordering::Relaxed);
    }

    pub fn set_timeout(&self, seconds: u64) {
        self.shared
            .timeout_secs
            .store(seconds.max(1), Ordering::Relaxed);
    }

    pub fn set_verify_peer(&self, verify: bool) {
        self.shared.verify_peer.store(verify, Ordering::Relaxed);
    }

    pub fn set_verify_host(&self, verify: bool) {
        self.shared.verify_host.store(verify, Ordering::Relaxed);
    }

    pub fn set_ca_cert_bundle(&self, path: PathBuf) {
        *self.shared.ca_cert_bundle.write().unwrap() = Some(path);
    }

    /// Start the worker pool. Workers run for the remaining process
    /// lifetime.
    pub fn start_threads(&self) {
        let threads = self.shared.num_threads.load(Ordering::Relaxed);
        for i in 0..threads {
            let shared = self.shared.clone();
            std::thread::Builder::new()
                .name(format!("bw/webhook-{i}"))
                .spawn(move || run_worker(shared))
                .expect("spawning webhook worker");
        }
    }

    /// Asynchronously deliver `payload` for `event_name` through `hook`.
    /// Returns immediately; drops (and logs) when the queue is full.
    pub fn run_hook(&self, event_name: &str, hook: Arc<WebHook>, payload: String) {
        if let Err(err) = hook.validate_config() {
            tracing::error!(id = hook.id(), event_name, %err, "webhook config rejected");
            return;
        }

        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.shared.max_queue_size.load(Ordering::Relaxed) {
            tracing::warn!(
                id = hook.id(),
                event_name,
                queue = queue.len(),
                "webhook queue full, dropping event"
            );
            ops::metrics::WEBHOOK_QUEUE_FULL.inc();
            return;
        }
        queue.push_back(QueueItem {
            event_name: event_name.to_string(),
            hook,
            payload: Arc::new(payload),
        });
        ops::metrics::WEBHOOK_QUEUE_SIZE.set(queue.len() as i64);
        drop(queue);
        self.shared.cv.notify_one();
    }

    /// As [`run_hook`], wrapping the payload for Kafka REST endpoints when
    /// the hook asks for it.
    pub fn run_hook_json(&self, event_name: &str, hook: Arc<WebHook>, data: &serde_json::Value) {
        let payload = wrap_payload(&hook, data);
        self.run_hook(event_name, hook, payload);
    }

    /// Synchronous dry-run delivery, for operator validation of a hook's
    /// endpoint.
    pub fn ping_hook(&self, hook: &WebHook) -> bool {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                tracing::error!(%err, "building ping runtime");
                return false;
            }
        };
        let client = build_client(&self.shared);
        rt.block_on(async { deliver(&client, "ping", hook, "").await })
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }
}

impl Default for WebHookRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(shared: Arc<Shared>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building webhook worker runtime");
    let client = build_client(&shared);

    loop {
        let batch = {
            let mut queue = shared.queue.lock().unwrap();
            while queue.is_empty() {
                queue = shared.cv.wait(queue).unwrap();
            }
            let conns = shared.max_conns.load(Ordering::Relaxed).max(1);
            let take = conns.min(queue.len());
            let batch: Vec<QueueItem> = queue.drain(..take).collect();
            ops::metrics::WEBHOOK_QUEUE_SIZE.set(queue.len() as i64);
            batch
        };

        rt.block_on(async {
            let deliveries = batch.iter().map(|item| async {
                let ok = deliver(&client, &item.event_name, &item.hook, &item.payload).await;
                if ok {
                    item.hook.inc_success();
                } else {
                    item.hook.inc_failed();
                }
            });
            futures::future::join_all(deliveries).await;
        });
    }
}

fn build_client(shared: &Shared) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(
            shared.timeout_secs.load(Ordering::Relaxed),
        ))
        .user_agent("breakwater-webhook");

    // rustls has no hostname-only override, so either knob disables
    // certificate checking entirely.
    let verify = shared.verify_peer.load(Ordering::Relaxed)
        && shared.verify_host.load(Ordering::Relaxed);
    if !verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(path) = shared.ca_cert_bundle.read().unwrap().as_ref() {
        match std::fs::read(path).map_err(|e| e.to_string()).and_then(|pem| {
            reqwest::Certificate::from_pem(&pem).map_err(|e| e.to_string())
        }) {
            Ok(cert) => builder = builder.add_root_certificate(cert),
            Err(err) => {
                tracing::warn!(path = %path.display(), err, "ignoring unreadable CA bundle")
            }
        }
    }

    builder.build().expect("building webhook HTTP client")
}

/// One POST. True on a 2xx response; anything else, including transport
/// errors and timeouts, is a failure. No retries.
async fn deliver(client: &reqwest::Client, event_name: &str, hook: &WebHook, payload: &str) -> bool {
    let Some(url) = hook.url() else {
        tracing::error!(id = hook.id(), event_name, "webhook has no url");
        return false;
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in build_headers(event_name, hook, payload) {
        let parsed = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(reqwest::header::HeaderValue::from_str(&value).ok());
        match parsed {
            Some((name, value)) => {
                headers.insert(name, value);
            }
            None => tracing::warn!(id = hook.id(), header = %name, "skipping malformed header"),
        }
    }

    match client
        .post(url)
        .headers(headers)
        .body(payload.to_string())
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(id = hook.id(), event_name, url, "webhook succeeded");
            true
        }
        Ok(resp) => {
            tracing::error!(
                id = hook.id(),
                event_name,
                url,
                status = resp.status().as_u16(),
                "webhook failed"
            );
            false
        }
        Err(err) => {
            tracing::error!(id = hook.id(), event_name, url, %err, "webhook failed");
            false
        }
    }
}

/// The header set of a delivery, in insertion order.
pub fn build_headers(event_name: &str, hook: &WebHook, payload: &str) -> Vec<(String, String)> {
    let mut headers = vec![("X-Wforce-Event".to_string(), event_name.to_string())];

    let content_type = hook.config_key("content-type").unwrap_or("application/json");
    headers.push(("Content-Type".to_string(), content_type.to_string()));
    headers.push(("X-Wforce-HookID".to_string(), hook.id().to_string()));
    headers.push(("X-Wforce-Delivery".to_string(), delivery_id(event_name, hook.id())));

    if let Some(secret) = hook.config_key("secret") {
        headers.push(("X-Wforce-Signature".to_string(), sign_payload(secret, payload)));
    }
    if let Some(auth) = hook.config_key("basic-auth") {
        headers.push((
            "Authorization".to_string(),
            format!("Basic {}", base64::encode(auth)),
        ));
    }
    if let Some(key) = hook.config_key("api-key") {
        headers.push(("X-API-Key".to_string(), key.to_string()));
    }
    headers
}

/// base64(HMAC-SHA256(secret, body)): the payload signature receivers use
/// to authenticate deliveries.
pub fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    base64::encode(mac.finalize().into_bytes())
}

/// A per-delivery identifier: base64(SHA-256(timestamp || id || event)).
fn delivery_id(event_name: &str, id: u32) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let digest = Sha256::digest(format!("{timestamp}{id}{event_name}").as_bytes());
    base64::encode(digest)
}

fn wrap_payload(hook: &WebHook, data: &serde_json::Value) -> String {
    if hook.config_key("kafka") == Some("true") {
        serde_json::json!({ "records": [ { "value": data } ] }).to_string()
    } else {
        data.to_string()
    }
}
