use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::IpAddr;

/// A store key as submitted by callers. Address keys are canonicalized to a
/// prefix-masked CIDR string before any hashing or storage, so every node in
/// a cluster derives identical key strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Str(String),
    Int(i64),
    Addr(IpAddr),
}

impl Key {
    /// The canonical string form under the store's address prefixes.
    pub(crate) fn canonicalize(&self, v4_prefix: u8, v6_prefix: u8) -> String {
        match self {
            Key::Str(s) => s.clone(),
            Key::Int(v) => v.to_string(),
            Key::Addr(IpAddr::V4(a)) => {
                let prefix = v4_prefix.min(32);
                // Prefix is clamped, so construction cannot fail.
                let net = Ipv4Network::new(*a, prefix).unwrap();
                format!("{}/{}", net.network(), prefix)
            }
            Key::Addr(IpAddr::V6(a)) => {
                let prefix = v6_prefix.min(128);
                let net = Ipv6Network::new(*a, prefix).unwrap();
                format!("{}/{}", net.network(), prefix)
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<IpAddr> for Key {
    fn from(a: IpAddr) -> Self {
        Key::Addr(a)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_keys_mask_to_cidr() {
        let k = Key::Addr("192.0.2.17".parse().unwrap());
        assert_eq!(k.canonicalize(32, 128), "192.0.2.17/32");
        assert_eq!(k.canonicalize(24, 128), "192.0.2.0/24");

        let k = Key::Addr("2001:db8::dead:beef".parse().unwrap());
        assert_eq!(k.canonicalize(32, 64), "2001:db8::/64");
    }

    #[test]
    fn scalar_keys_pass_through() {
        assert_eq!(Key::from("login:bob").canonicalize(24, 64), "login:bob");
        assert_eq!(Key::from(42).canonicalize(24, 64), "42");
    }
}
