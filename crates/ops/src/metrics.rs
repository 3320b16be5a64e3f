//! The process-wide prometheus registry and the metric families shared
//! across crates. Everything registers into one Registry so that the
//! `/metrics` endpoint renders a single coherent exposition.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    /// How many report/allow/reset/custom commands have been received, by command.
    pub static ref COMMANDS: IntCounterVec = register_counter_vec(
        "breakwater_commands_total",
        "How many commands have been received?",
        &["cmd"],
    );

    /// Webhook delivery outcomes for event hooks, by hook id.
    pub static ref WEBHOOK_EVENTS: IntCounterVec = register_counter_vec(
        "breakwater_webhook_events_total",
        "How many webhook events occurred?",
        &["id", "success"],
    );

    /// Webhook delivery outcomes for custom (named) hooks, by hook id.
    pub static ref CUSTOM_WEBHOOK_EVENTS: IntCounterVec = register_counter_vec(
        "breakwater_custom_webhook_events_total",
        "How many custom webhook events occurred?",
        &["id", "success"],
    );

    /// Current depth of the webhook delivery queue.
    pub static ref WEBHOOK_QUEUE_SIZE: IntGauge = register_gauge(
        "breakwater_webhook_queue_size",
        "How full is the webhook worker thread queue?",
    );

    /// Webhook submissions dropped because the queue was at capacity.
    pub static ref WEBHOOK_QUEUE_FULL: IntCounter = register_counter(
        "breakwater_webhook_queue_full_total",
        "How many webhook events were dropped due to a full queue?",
    );

    /// Stats-store writes dropped because the value variant did not match
    /// the field type.
    pub static ref SDB_TYPE_MISMATCH: IntCounter = register_counter(
        "breakwater_sdb_type_mismatch_total",
        "How many stats writes were dropped due to a field type mismatch?",
    );

    /// Stats-store writes dropped because the bucket offset fell outside
    /// the retained windows.
    pub static ref SDB_BUCKET_DROP: IntCounter = register_counter(
        "breakwater_sdb_bucket_drop_total",
        "How many stats writes were dropped due to an out-of-range window?",
    );

    /// Replication datagrams sent to peers.
    pub static ref REPLICATION_SENT: IntCounter = register_counter(
        "breakwater_replication_sent_total",
        "How many replication messages have been sent?",
    );

    /// Replication datagrams received, by disposition
    /// (ok | decrypt_fail | parse_fail | stale_nonce).
    pub static ref REPLICATION_RCVD: IntCounterVec = register_counter_vec(
        "breakwater_replication_rcvd_total",
        "How many replication messages have been received?",
        &["status"],
    );

    /// Live entries per list and kind.
    pub static ref LIST_ENTRIES: IntGaugeVec = register_gauge_vec(
        "breakwater_list_entries",
        "How many live entries does each list hold?",
        &["list", "kind"],
    );

    /// End-to-end command handling latency.
    pub static ref COMMAND_DURATION: Histogram = {
        let h = Histogram::with_opts(
            HistogramOpts::new(
                "breakwater_command_duration_seconds",
                "How long do commands take to run?",
            )
            .buckets(vec![0.001, 0.01, 0.1, 1.0]),
        )
        .expect("building command duration histogram");
        REGISTRY
            .register(Box::new(h.clone()))
            .expect("registering command duration histogram");
        h
    };
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("building counter");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("registering counter");
    c
}

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("building counter vec");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("registering counter vec");
    c
}

fn register_gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("building gauge");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("registering gauge");
    g
}

fn register_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let g = IntGaugeVec::new(Opts::new(name, help), labels).expect("building gauge vec");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("registering gauge vec");
    g
}

/// The registry every breakwater metric registers into.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Render the registry in the prometheus text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}

pub fn inc_command(cmd: &str) {
    COMMANDS.with_label_values(&[cmd]).inc();
}

pub fn inc_webhook_event(id: u32, success: bool, custom: bool) {
    let family: &IntCounterVec = if custom {
        &CUSTOM_WEBHOOK_EVENTS
    } else {
        &WEBHOOK_EVENTS
    };
    family
        .with_label_values(&[&id.to_string(), if success { "true" } else { "false" }])
        .inc();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn families_render() {
        inc_command("report");
        inc_command("report");
        inc_command("allow");
        inc_webhook_event(1, true, false);
        inc_webhook_event(1, false, true);
        WEBHOOK_QUEUE_SIZE.set(3);
        SDB_TYPE_MISMATCH.inc();

        let text = render().unwrap();
        assert!(text.contains("breakwater_commands_total{cmd=\"report\"} 2"));
        assert!(text.contains("breakwater_commands_total{cmd=\"allow\"} 1"));
        assert!(text.contains("breakwater_webhook_queue_size 3"));
        assert!(text.contains("breakwater_sdb_type_mismatch_total 1"));
    }
}
