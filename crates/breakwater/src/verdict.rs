//! The verdict adapter: translates report/allow/reset requests into store
//! operations and policy callouts, and emits the matching webhook events.
//!
//! The adapter is re-entrant; concurrent invocations only contend inside
//! the stores, on the shards their keys hash to.

use crate::config::PolicyConfig;
use crate::tuple::{AllowResponse, LoginTuple};
use statsdb::{Key, StatsDb, Value};
use std::net::IpAddr;

/// The policy callout. Implementations must be re-entrant.
pub trait Policy: Send + Sync {
    /// Fold a reported event into whatever state the policy tracks.
    fn report(&self, tuple: &LoginTuple);

    /// Decide an allow request. List lookups have already been made: a
    /// tuple reaching the policy is neither allow-listed nor deny-listed.
    fn allow(&self, tuple: &LoginTuple) -> AllowResponse;
}

/// Fixed-threshold policy over the default store's fields.
pub struct BuiltinPolicy {
    db: StatsDb,
    config: PolicyConfig,
}

impl BuiltinPolicy {
    pub fn new(db: StatsDb, config: PolicyConfig) -> BuiltinPolicy {
        BuiltinPolicy { db, config }
    }
}

impl Policy for BuiltinPolicy {
    fn report(&self, tuple: &LoginTuple) {
        let remote = Key::Addr(tuple.remote);
        let login = Key::Str(tuple.login.clone());

        self.db.add(&remote, "countLogins", Value::Int(1), None);
        self.db.add(&login, "countLogins", Value::Int(1), None);
        self.db
            .add(&remote, "diffPasswords", Value::Str(tuple.pwhash.clone()), None);
        self.db
            .add(&login, "diffPasswords", Value::Str(tuple.pwhash.clone()), None);
        self.db
            .add(&login, "diffIPs", Value::Addr(tuple.remote), None);
    }

    fn allow(&self, tuple: &LoginTuple) -> AllowResponse {
        let remote = Key::Addr(tuple.remote);
        let login = Key::Str(tuple.login.clone());

        if self.db.get(&remote, "diffPasswords", None) > self.config.max_diff_passwords {
            return AllowResponse::reject("too many different passwords");
        }
        if self.db.get(&login, "countLogins", None) > self.config.max_login_attempts {
            return AllowResponse::tarpit(self.config.tarpit_secs, "too many login attempts");
        }
        AllowResponse::allow()
    }
}

/// The adapter itself. One per process, shared by every HTTP worker.
pub struct Verdict {
    policy: Box<dyn Policy>,
}

impl Verdict {
    pub fn new(policy: Box<dyn Policy>) -> Verdict {
        Verdict { policy }
    }

    pub fn report(&self, tuple: &LoginTuple) {
        ops::metrics::inc_command("report");
        self.policy.report(tuple);

        if let Ok(payload) = serde_json::to_value(tuple) {
            webhooks::run_event_hooks("report", &payload);
        }
    }

    pub fn allow(&self, tuple: &LoginTuple) -> AllowResponse {
        ops::metrics::inc_command("allow");

        let response = self.decide(tuple);

        if let Ok(mut payload) = serde_json::to_value(tuple) {
            payload["status"] = serde_json::json!(response.status);
            for hook in webhooks::global_db().hooks_for_event("allow") {
                if !hook.active() {
                    continue;
                }
                // An allow_filter restricts the hook to non-allow verdicts.
                if hook.has_config_key("allow_filter") && response.status == 0 {
                    continue;
                }
                webhooks::global_runner().run_hook_json("allow", hook, &payload);
            }
        }
        response
    }

    fn decide(&self, tuple: &LoginTuple) -> AllowResponse {
        let ip_key = lists::ip_key(&tuple.remote);
        let composite = lists::ip_login_key(&tuple.remote, &tuple.login);

        let wl = lists::wl_db();
        if wl.check_ip(&tuple.remote)
            || wl.check(lists::Kind::Login, &tuple.login)
            || wl.check(lists::Kind::IpLogin, &composite)
        {
            return AllowResponse::allow();
        }

        let bl = lists::bl_db();
        if bl.check_ip(&tuple.remote)
            || bl.check(lists::Kind::Ip, &ip_key)
            || bl.check(lists::Kind::Login, &tuple.login)
            || bl.check(lists::Kind::IpLogin, &composite)
        {
            return AllowResponse::reject("Temporarily blocked");
        }

        self.policy.allow(tuple)
    }

    /// Clear the counters and list entries of a login, an address, or a
    /// pair of both.
    pub fn reset(&self, login: Option<&str>, remote: Option<IpAddr>) {
        ops::metrics::inc_command("reset");

        for name in statsdb::names() {
            if let Some(db) = statsdb::lookup(&name) {
                if let Some(login) = login {
                    db.reset(&Key::Str(login.to_string()));
                }
                if let Some(remote) = remote {
                    db.reset(&Key::Addr(remote));
                }
            }
        }

        for db in [lists::bl_db(), lists::wl_db()] {
            if let Some(remote) = &remote {
                db.delete(lists::Kind::Ip, &lists::ip_key(remote));
            }
            if let Some(login) = login {
                db.delete(lists::Kind::Login, login);
            }
            if let (Some(remote), Some(login)) = (&remote, login) {
                db.delete(lists::Kind::IpLogin, &lists::ip_login_key(remote, login));
            }
        }

        webhooks::run_event_hooks(
            "reset",
            &serde_json::json!({
                "login": login,
                "remote": remote.map(|r| r.to_string()),
            }),
        );
    }
}
