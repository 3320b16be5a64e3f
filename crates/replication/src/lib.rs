//! Cluster replication: the typed operation envelope, the authenticated
//! datagram framing, and the best-effort UDP fan-out to peers.
//!
//! Delivery is lossy by design. Every replicated operation is idempotent
//! or commutative, so peers converge without retries or ordering
//! guarantees; the nonce counter only guards against replayed and
//! out-of-order datagrams.

mod crypto;
mod envelope;
mod nonce;
mod transport;

pub use crypto::{generate_key, SymmetricKey, KEY_SIZE};
pub use envelope::ReplicationOperation;
pub use nonce::{Nonce, NONCE_SIZE};
pub use transport::Replicator;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid replication key: {0}")]
    InvalidKey(String),
    #[error("encryption failure")]
    Crypto,
    #[error("datagram too short")]
    ShortFrame,
    #[error("unknown replication type {0}")]
    UnknownRepType(i32),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
