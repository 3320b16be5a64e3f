//! Webhook registry and dispatch.
//!
//! Hooks are read-mostly records handed out as shared snapshots; the
//! registry copies on write. Delivery is at-most-once through a bounded
//! queue drained by a pool of worker threads, each multiplexing up to
//! `max_conns` in-flight requests over its own HTTP client.

mod db;
mod hook;
mod runner;

pub use db::WebHookDb;
pub use hook::{event_config, valid_event_name, WebHook, EVENT_NAMES};
pub use runner::{build_headers, sign_payload, WebHookRunner};

use lazy_static::lazy_static;

lazy_static! {
    static ref GLOBAL_DB: WebHookDb = WebHookDb::new();
    static ref GLOBAL_RUNNER: WebHookRunner = WebHookRunner::new();
}

/// The process-wide hook registry.
pub fn global_db() -> &'static WebHookDb {
    &GLOBAL_DB
}

/// The process-wide dispatcher.
pub fn global_runner() -> &'static WebHookRunner {
    &GLOBAL_RUNNER
}

/// Fan `data` out to every active hook subscribed to `event_name`.
pub fn run_event_hooks(event_name: &str, data: &serde_json::Value) {
    for hook in global_db().hooks_for_event(event_name) {
        if hook.active() {
            global_runner().run_hook_json(event_name, hook, data);
        }
    }
}
