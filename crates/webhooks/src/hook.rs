use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// The closed set of event names, with the mandatory and optional config
/// keys each accepts. `url` is mandatory everywhere.
pub const EVENT_NAMES: &[(&str, &[&str], &[&str])] = &[
    ("report", &["url"], &["secret", "basic-auth"]),
    ("allow", &["url"], &["secret", "allow_filter", "basic-auth"]),
    ("reset", &["url"], &["secret", "basic-auth"]),
    ("addbl", &["url"], &["secret", "basic-auth"]),
    ("delbl", &["url"], &["secret", "basic-auth"]),
    ("expirebl", &["url"], &["secret", "basic-auth"]),
    ("addwl", &["url"], &["secret", "basic-auth"]),
    ("delwl", &["url"], &["secret", "basic-auth"]),
    ("expirewl", &["url"], &["secret", "basic-auth"]),
];

pub fn valid_event_name(event: &str) -> bool {
    EVENT_NAMES.iter().any(|(name, _, _)| *name == event)
}

/// The `(mandatory, optional)` config keys of an event.
pub fn event_config(event: &str) -> Option<(&'static [&'static str], &'static [&'static str])> {
    EVENT_NAMES
        .iter()
        .find(|(name, _, _)| *name == event)
        .map(|(_, mandatory, optional)| (*mandatory, *optional))
}

/// A configured webhook endpoint. Immutable once registered; the registry
/// swaps whole records to mutate, so lookups can hand out shared handles
/// without further locking. Delivery counters are the only mutable state.
pub struct WebHook {
    id: u32,
    /// Set for custom hooks invoked by name rather than by event.
    name: Option<String>,
    events: Vec<String>,
    active: bool,
    config: HashMap<String, String>,
    num_success: AtomicU64,
    num_failed: AtomicU64,
}

impl WebHook {
    pub fn new(id: u32, events: Vec<String>, active: bool, config: HashMap<String, String>) -> WebHook {
        WebHook {
            id,
            name: None,
            events,
            active,
            config,
            num_success: AtomicU64::new(0),
            num_failed: AtomicU64::new(0),
        }
    }

    pub fn new_custom(
        id: u32,
        name: &str,
        active: bool,
        config: HashMap<String, String>,
    ) -> WebHook {
        WebHook {
            id,
            name: Some(name.to_string()),
            events: Vec::new(),
            active,
            config,
            num_success: AtomicU64::new(0),
            num_failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_custom(&self) -> bool {
        self.name.is_some()
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    pub fn config_key(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(|s| s.as_str())
    }

    pub fn has_config_key(&self, key: &str) -> bool {
        self.config.contains_key(key)
    }

    pub fn url(&self) -> Option<&str> {
        self.config_key("url")
    }

    /// Check the hook's config against its events' key schema. Custom hooks
    /// only require `url`.
    pub fn validate_config(&self) -> Result<(), String> {
        if self.is_custom() {
            if !self.has_config_key("url") {
                return Err("missing mandatory configuration key: url".to_string());
            }
            return Ok(());
        }
        if self.events.is_empty() {
            return Err("no events registered".to_string());
        }
        for event in &self.events {
            let Some((mandatory, _)) = event_config(event) else {
                return Err(format!("unknown event name: {event}"));
            };
            for key in mandatory {
                if !self.has_config_key(key) {
                    return Err(format!("missing mandatory configuration key: {key}"));
                }
            }
        }
        Ok(())
    }

    pub fn inc_success(&self) {
        self.num_success.fetch_add(1, Ordering::Relaxed);
        ops::metrics::inc_webhook_event(self.id, true, self.is_custom());
    }

    pub fn inc_failed(&self) {
        self.num_failed.fetch_add(1, Ordering::Relaxed);
        ops::metrics::inc_webhook_event(self.id, false, self.is_custom());
    }

    pub fn successes(&self) -> u64 {
        self.num_success.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.num_failed.load(Ordering::Relaxed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.name {
            Some(name) => json!({
                "id": self.id,
                "name": name,
                "config": self.config,
            }),
            None => json!({
                "id": self.id,
                "events": self.events,
                "config": self.config,
            }),
        }
    }
}
