use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Request admission: a source-address netmask group plus the shared
/// HTTP Basic password. The username part of the credentials is ignored;
/// only the password is checked.
pub struct AccessControl {
    password: Option<String>,
    acl: Vec<IpNetwork>,
}

impl AccessControl {
    pub fn new(password: Option<String>, acl: Vec<IpNetwork>) -> AccessControl {
        AccessControl { password, acl }
    }

    pub fn addr_allowed(&self, addr: &IpAddr) -> bool {
        self.acl.iter().any(|net| net.contains(*addr))
    }

    pub fn credentials_ok(&self, authorization: Option<&str>) -> bool {
        let Some(expected) = self.password.as_deref() else {
            // No password configured: the ACL is the only gate.
            return true;
        };
        let Some(encoded) = authorization.and_then(|h| h.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = base64::decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((_user, password)) => password == expected,
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn access(password: Option<&str>, nets: &[&str]) -> AccessControl {
        AccessControl::new(
            password.map(|p| p.to_string()),
            nets.iter().map(|n| n.parse().unwrap()).collect(),
        )
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", base64::encode(format!("{user}:{password}")))
    }

    #[test]
    fn acl_matches_by_netmask() {
        let access = access(None, &["192.0.2.0/24", "::1/128"]);
        assert!(access.addr_allowed(&"192.0.2.17".parse().unwrap()));
        assert!(access.addr_allowed(&"::1".parse().unwrap()));
        assert!(!access.addr_allowed(&"198.51.100.1".parse().unwrap()));
        assert!(!access.addr_allowed(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn only_the_password_part_matters() {
        let access = access(Some("super"), &[]);
        assert!(access.credentials_ok(Some(&basic("alice", "super"))));
        assert!(access.credentials_ok(Some(&basic("bob", "super"))));
        assert!(!access.credentials_ok(Some(&basic("alice", "wrong"))));
        assert!(!access.credentials_ok(None));
        assert!(!access.credentials_ok(Some("Bearer token")));
        assert!(!access.credentials_ok(Some("Basic %%%")));
    }

    #[test]
    fn no_password_means_open() {
        let access = access(None, &[]);
        assert!(access.credentials_ok(None));
    }
}
