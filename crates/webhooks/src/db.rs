use crate::WebHook;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// The hook registry. Lookups return shared handles; registration and
/// deletion rewrite the table under the registry lock.
pub struct WebHookDb {
    next_id: AtomicU32,
    hooks: Mutex<Vec<Arc<WebHook>>>,
}

impl WebHookDb {
    pub fn new() -> WebHookDb {
        WebHookDb {
            next_id: AtomicU32::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Allocate the next hook id. Monotonic for the process lifetime.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_webhook(&self, hook: WebHook) -> Result<(), String> {
        hook.validate_config()?;

        let mut hooks = self.hooks.lock().unwrap();
        if hooks.iter().any(|h| h.id() == hook.id()) {
            return Err(format!(
                "registering webhook failed: id={} is already registered",
                hook.id()
            ));
        }
        match hook.name() {
            Some(name) => tracing::info!(
                id = hook.id(),
                name,
                url = hook.url().unwrap_or(""),
                "registering custom webhook"
            ),
            None => tracing::info!(
                id = hook.id(),
                events = ?hook.events(),
                url = hook.url().unwrap_or(""),
                "registering webhook"
            ),
        }
        hooks.push(Arc::new(hook));
        Ok(())
    }

    pub fn delete_webhook(&self, id: u32) -> bool {
        let mut hooks = self.hooks.lock().unwrap();
        let before = hooks.len();
        hooks.retain(|h| h.id() != id);
        hooks.len() != before
    }

    pub fn get_webhook(&self, id: u32) -> Option<Arc<WebHook>> {
        self.hooks
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.id() == id)
            .cloned()
    }

    pub fn get_webhook_by_name(&self, name: &str) -> Option<Arc<WebHook>> {
        self.hooks
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.name() == Some(name))
            .cloned()
    }

    /// Snapshot of the hooks subscribed to `event`.
    pub fn hooks_for_event(&self, event: &str) -> Vec<Arc<WebHook>> {
        self.hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.subscribes_to(event))
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let hooks = self.hooks.lock().unwrap();
        serde_json::Value::Array(hooks.iter().map(|h| h.to_json()).collect())
    }
}

impl Default for WebHookDb {
    fn default() -> Self {
        Self::new()
    }
}
