//! Wire messages of the breakwater replication protocol.
//!
//! The outer [`ReplicationMsg`] frame carries a type tag and the encoded
//! sub-message bytes. Sub-messages use explicit field presence so a receiver
//! can distinguish "absent" from "zero / empty" when reconstructing an
//! operation. Tags are wire-stable; fields are only ever appended.

/// Stores hand their outbound frames to a sink installed by the transport.
/// Inbound applications never traverse the sink, which is what breaks
/// replication loops.
pub type ReplicationSink = std::sync::Arc<dyn Fn(ReplicationMsg) + Send + Sync>;

/// Outer replication frame: a type tag plus the encoded sub-message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplicationMsg {
    #[prost(enumeration = "RepType", tag = "1")]
    pub rep_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub rep_op: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum RepType {
    None = 0,
    /// Sliding-window stats store mutation.
    Sdb = 1,
    /// Block-list mutation.
    Bl = 2,
    /// Allow-list mutation.
    Wl = 3,
}

/// A mutation of a named sliding-window stats store.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SdbOperation {
    #[prost(enumeration = "SdbOpType", tag = "1")]
    pub op_type: i32,
    #[prost(string, tag = "2")]
    pub db_name: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(string, optional, tag = "4")]
    pub field_name: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub str_param: Option<String>,
    #[prost(int64, optional, tag = "6")]
    pub int_param: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum SdbOpType {
    None = 0,
    Add = 1,
    Sub = 2,
    Reset = 3,
    ResetField = 4,
}

/// A mutation of a block-list or allow-list (which list is carried by the
/// outer frame's type tag).
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListOperation {
    #[prost(enumeration = "ListOpType", tag = "1")]
    pub op_type: i32,
    #[prost(enumeration = "ListKind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(int64, tag = "4")]
    pub ttl: i64,
    #[prost(string, tag = "5")]
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ListOpType {
    None = 0,
    Add = 1,
    Delete = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ListKind {
    Ip = 0,
    Login = 1,
    IpLogin = 2,
}
