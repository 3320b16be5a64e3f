use crate::Error;
use prost::Message;
use proto_breakwater::{ListOperation, RepType, ReplicationMsg, SdbOperation};

/// A decoded replication operation: the outer frame's type tag resolved to
/// its typed sub-message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationOperation {
    Sdb(SdbOperation),
    Bl(ListOperation),
    Wl(ListOperation),
}

impl ReplicationOperation {
    /// Encode into the outer wire frame.
    pub fn serialize(&self) -> Vec<u8> {
        let (rep_type, rep_op) = match self {
            ReplicationOperation::Sdb(op) => (RepType::Sdb, op.encode_to_vec()),
            ReplicationOperation::Bl(op) => (RepType::Bl, op.encode_to_vec()),
            ReplicationOperation::Wl(op) => (RepType::Wl, op.encode_to_vec()),
        };
        ReplicationMsg {
            rep_type: rep_type as i32,
            rep_op,
        }
        .encode_to_vec()
    }

    /// Decode an outer frame. Frames with an unrecognized type tag are an
    /// error the transport drops with a warning, keeping the wire format
    /// forward-compatible.
    pub fn unserialize(frame: &[u8]) -> Result<ReplicationOperation, Error> {
        let msg = ReplicationMsg::decode(frame)?;
        match RepType::try_from(msg.rep_type) {
            Ok(RepType::Sdb) => Ok(ReplicationOperation::Sdb(SdbOperation::decode(
                msg.rep_op.as_slice(),
            )?)),
            Ok(RepType::Bl) => Ok(ReplicationOperation::Bl(ListOperation::decode(
                msg.rep_op.as_slice(),
            )?)),
            Ok(RepType::Wl) => Ok(ReplicationOperation::Wl(ListOperation::decode(
                msg.rep_op.as_slice(),
            )?)),
            Ok(RepType::None) | Err(_) => Err(Error::UnknownRepType(msg.rep_type)),
        }
    }

    /// Apply against the process-wide stores, with replication suppressed
    /// so an applied operation never loops back onto the wire.
    pub fn apply(&self) {
        match self {
            ReplicationOperation::Sdb(op) => match statsdb::lookup(&op.db_name) {
                Some(db) => db.apply(op),
                None => {
                    tracing::warn!(db = %op.db_name, "replication for unknown stats store")
                }
            },
            ReplicationOperation::Bl(op) => lists::bl_db().apply(op),
            ReplicationOperation::Wl(op) => lists::wl_db().apply(op),
        }
    }
}
