//! Sliding-window statistics stores.
//!
//! A [`StatsDb`] maps keys (logins, network addresses, or arbitrary strings)
//! to named fields, each field holding a windowed statistic over a fixed
//! retention horizon. Keys are distributed over independently locked shards,
//! mutations optionally replicate to cluster peers, and a background worker
//! evicts idle entries.

mod bucket;
mod countmin;
mod hll;
mod key;
mod registry;
mod ring;
mod store;
mod value;

pub use key::Key;
pub use registry::{lookup, names, register};
pub use store::{DumpEntry, StatsDb};
pub use value::{parse_field_schema, FieldKind, FieldSchema, Value};

pub(crate) use bucket::BucketData;

/// Seed of the shard-placement hash. Wire- and cluster-stable: every node
/// must map a key to the same shard arithmetic.
pub(crate) const SHARD_HASH_SEED: u32 = 623;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown field type '{0}'")]
    UnknownFieldType(String),
    #[error("store '{0}' is already registered")]
    DuplicateStore(String),
}

/// Epoch seconds, as every timestamp in this crate.
pub(crate) fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
