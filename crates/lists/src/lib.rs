//! Block-list / allow-list stores.
//!
//! Two process-wide instances ([`bl_db`] and [`wl_db`]) partition entries
//! into IP, login, and IP+login kinds. IP entries mirror into a netmask
//! trie for longest-prefix matching. Entries carry a TTL, expire via a
//! 1 Hz sweep, optionally persist to Redis, and replicate to peers.

mod persist;
mod store;
mod trie;

pub use store::{ListDb, ListEntry};
pub use trie::NetmaskTrie;

use ipnetwork::{Ipv4Network, Ipv6Network};
use lazy_static::lazy_static;
use proto_breakwater::{ListKind as ProtoListKind, RepType};
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("persistence is not configured")]
    PersistenceDisabled,
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// The partition an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Ip,
    Login,
    IpLogin,
}

impl Kind {
    pub(crate) fn index(&self) -> usize {
        match self {
            Kind::Ip => 0,
            Kind::Login => 1,
            Kind::IpLogin => 2,
        }
    }

    /// The name used in webhook payloads and metric labels.
    pub fn type_name(&self) -> &'static str {
        match self {
            Kind::Ip => "ip",
            Kind::Login => "login",
            Kind::IpLogin => "ip_login",
        }
    }

    /// The kind segment of Redis keys, which also encodes the side.
    pub fn redis_name(&self, side: ListSide) -> &'static str {
        match (side, self) {
            (ListSide::Block, Kind::Ip) => "ip_bl",
            (ListSide::Block, Kind::Login) => "login_bl",
            (ListSide::Block, Kind::IpLogin) => "ip_login_bl",
            (ListSide::Allow, Kind::Ip) => "ip_wl",
            (ListSide::Allow, Kind::Login) => "login_wl",
            (ListSide::Allow, Kind::IpLogin) => "ip_login_wl",
        }
    }

    pub(crate) fn from_redis_name(name: &str, side: ListSide) -> Option<Kind> {
        [Kind::Ip, Kind::Login, Kind::IpLogin]
            .into_iter()
            .find(|k| k.redis_name(side) == name)
    }

    pub fn parse(name: &str) -> Option<Kind> {
        match name {
            "ip" => Some(Kind::Ip),
            "login" => Some(Kind::Login),
            "ip_login" => Some(Kind::IpLogin),
            _ => None,
        }
    }

    pub(crate) fn proto(&self) -> ProtoListKind {
        match self {
            Kind::Ip => ProtoListKind::Ip,
            Kind::Login => ProtoListKind::Login,
            Kind::IpLogin => ProtoListKind::IpLogin,
        }
    }

    pub(crate) fn from_proto(value: i32) -> Option<Kind> {
        match ProtoListKind::try_from(value).ok()? {
            ProtoListKind::Ip => Some(Kind::Ip),
            ProtoListKind::Login => Some(Kind::Login),
            ProtoListKind::IpLogin => Some(Kind::IpLogin),
        }
    }
}

/// Which list a store is: the side fixes event names, payload fields,
/// Redis key names, and the replication frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSide {
    Block,
    Allow,
}

impl ListSide {
    pub fn label(&self) -> &'static str {
        match self {
            ListSide::Block => "bl",
            ListSide::Allow => "wl",
        }
    }

    pub(crate) fn add_event(&self) -> &'static str {
        match self {
            ListSide::Block => "addbl",
            ListSide::Allow => "addwl",
        }
    }

    pub(crate) fn del_event(&self) -> &'static str {
        match self {
            ListSide::Block => "delbl",
            ListSide::Allow => "delwl",
        }
    }

    pub(crate) fn expire_event(&self) -> &'static str {
        match self {
            ListSide::Block => "expirebl",
            ListSide::Allow => "expirewl",
        }
    }

    pub(crate) fn type_field(&self) -> &'static str {
        match self {
            ListSide::Block => "bl_type",
            ListSide::Allow => "wl_type",
        }
    }

    pub(crate) fn redis_prefix(&self) -> &'static str {
        match self {
            ListSide::Block => "bw_bl",
            ListSide::Allow => "bw_wl",
        }
    }

    pub(crate) fn rep_type(&self) -> RepType {
        match self {
            ListSide::Block => RepType::Bl,
            ListSide::Allow => RepType::Wl,
        }
    }
}

/// The host-mask key form of a plain address: `203.0.113.5/32`.
pub fn ip_key(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(a) => Ipv4Network::new(*a, 32).unwrap().to_string(),
        IpAddr::V6(a) => Ipv6Network::new(*a, 128).unwrap().to_string(),
    }
}

/// The composite key of an (address, login) pair.
pub fn ip_login_key(addr: &IpAddr, login: &str) -> String {
    format!("{addr}:{login}")
}

lazy_static! {
    static ref BL_DB: ListDb = ListDb::new(ListSide::Block);
    static ref WL_DB: ListDb = ListDb::new(ListSide::Allow);
}

/// The process-wide block list.
pub fn bl_db() -> &'static ListDb {
    &BL_DB
}

/// The process-wide allow list.
pub fn wl_db() -> &'static ListDb {
    &WL_DB
}

pub(crate) fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
