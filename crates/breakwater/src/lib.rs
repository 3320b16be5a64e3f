//! The breakwater server: configuration, the REST surface, and the verdict
//! adapter that ties the stores, lists, replication, and webhooks together.

pub mod auth;
pub mod config;
pub mod http;
pub mod tuple;
pub mod verdict;

pub use config::Config;
pub use tuple::{AllowResponse, LoginTuple};
pub use verdict::{BuiltinPolicy, Policy, Verdict};
