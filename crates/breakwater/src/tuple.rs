use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// One authentication event as submitted by an upstream front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginTuple {
    pub login: String,
    pub remote: IpAddr,
    #[serde(default)]
    pub pwhash: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
    #[serde(default)]
    pub attrs_mv: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub protocol: String,
    /// Set when the front-end already rejected on policy grounds and is
    /// reporting for accounting only.
    #[serde(default)]
    pub policy_reject: bool,
}

/// The verdict returned to an allow request. `status` 0 allows, negative
/// rejects, positive asks the front-end to tarpit for that many seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllowResponse {
    pub status: i32,
    pub msg: String,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
}

impl AllowResponse {
    pub fn allow() -> AllowResponse {
        AllowResponse {
            status: 0,
            msg: String::new(),
            attrs: HashMap::new(),
        }
    }

    pub fn reject(msg: &str) -> AllowResponse {
        AllowResponse {
            status: -1,
            msg: msg.to_string(),
            attrs: HashMap::new(),
        }
    }

    pub fn tarpit(seconds: i32, msg: &str) -> AllowResponse {
        AllowResponse {
            status: seconds.max(1),
            msg: msg.to_string(),
            attrs: HashMap::new(),
        }
    }
}
