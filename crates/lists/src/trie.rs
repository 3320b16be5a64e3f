use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// A binary radix trie over CIDR masks supporting longest-prefix lookup.
/// Keys are the mask strings as inserted, so a lookup result indexes the
/// owning table directly. IPv4 and IPv6 live in separate roots.
#[derive(Debug, Default)]
pub struct NetmaskTrie {
    v4: Node,
    v6: Node,
}

#[derive(Debug, Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    /// The mask string terminating at this depth, if any.
    mask: Option<String>,
}

/// The most significant `prefix` bits of the network address, MSB first.
fn network_bits(net: &IpNetwork) -> (u128, u8, bool) {
    match net {
        IpNetwork::V4(n) => (
            (u32::from(n.network()) as u128) << 96,
            n.prefix(),
            true,
        ),
        IpNetwork::V6(n) => (u128::from(n.network()), n.prefix(), false),
    }
}

fn addr_bits(addr: &IpAddr) -> (u128, u8, bool) {
    match addr {
        IpAddr::V4(a) => ((u32::from(*a) as u128) << 96, 32, true),
        IpAddr::V6(a) => (u128::from(*a), 128, false),
    }
}

fn bit(bits: u128, index: u8) -> usize {
    ((bits >> (127 - index)) & 1) as usize
}

impl NetmaskTrie {
    pub fn new() -> NetmaskTrie {
        NetmaskTrie::default()
    }

    fn root(&mut self, v4: bool) -> &mut Node {
        if v4 {
            &mut self.v4
        } else {
            &mut self.v6
        }
    }

    /// Insert `mask` (a CIDR string). Re-inserting replaces silently.
    pub fn add_mask(&mut self, mask: &str) -> Result<(), ipnetwork::IpNetworkError> {
        let net: IpNetwork = mask.parse()?;
        let (bits, prefix, v4) = network_bits(&net);

        let mut node = self.root(v4);
        for i in 0..prefix {
            node = &mut **node.children[bit(bits, i)].get_or_insert_with(Default::default);
        }
        node.mask = Some(mask.to_string());
        Ok(())
    }

    /// Remove `mask`. Absent masks are a no-op.
    pub fn delete_mask(&mut self, mask: &str) -> Result<(), ipnetwork::IpNetworkError> {
        let net: IpNetwork = mask.parse()?;
        let (bits, prefix, v4) = network_bits(&net);

        let mut node = self.root(v4);
        for i in 0..prefix {
            match node.children[bit(bits, i)].as_deref_mut() {
                Some(child) => node = child,
                None => return Ok(()),
            }
        }
        node.mask = None;
        Ok(())
    }

    /// The most specific mask matching `addr`, if any.
    pub fn lookup(&self, addr: &IpAddr) -> Option<&str> {
        let (bits, depth, v4) = addr_bits(addr);
        let mut node = if v4 { &self.v4 } else { &self.v6 };
        let mut best = node.mask.as_deref();

        for i in 0..depth {
            match node.children[bit(bits, i)].as_deref() {
                Some(child) => {
                    node = child;
                    if node.mask.is_some() {
                        best = node.mask.as_deref();
                    }
                }
                None => break,
            }
        }
        best
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        self.lookup(addr).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn prefix_matching() {
        let mut trie = NetmaskTrie::new();
        trie.add_mask("192.0.2.0/24").unwrap();

        assert!(trie.matches(&addr("192.0.2.17")));
        assert!(!trie.matches(&addr("198.51.100.1")));
        assert_eq!(trie.lookup(&addr("192.0.2.17")), Some("192.0.2.0/24"));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut trie = NetmaskTrie::new();
        trie.add_mask("10.0.0.0/8").unwrap();
        trie.add_mask("10.1.0.0/16").unwrap();
        trie.add_mask("10.1.2.0/24").unwrap();

        assert_eq!(trie.lookup(&addr("10.1.2.3")), Some("10.1.2.0/24"));
        assert_eq!(trie.lookup(&addr("10.1.9.9")), Some("10.1.0.0/16"));
        assert_eq!(trie.lookup(&addr("10.9.9.9")), Some("10.0.0.0/8"));
        assert_eq!(trie.lookup(&addr("11.0.0.1")), None);
    }

    #[test]
    fn host_masks_match_exactly() {
        let mut trie = NetmaskTrie::new();
        trie.add_mask("203.0.113.5/32").unwrap();

        assert!(trie.matches(&addr("203.0.113.5")));
        assert!(!trie.matches(&addr("203.0.113.6")));
    }

    #[test]
    fn delete_unlinks_only_the_given_mask() {
        let mut trie = NetmaskTrie::new();
        trie.add_mask("10.0.0.0/8").unwrap();
        trie.add_mask("10.1.0.0/16").unwrap();

        trie.delete_mask("10.1.0.0/16").unwrap();
        assert_eq!(trie.lookup(&addr("10.1.2.3")), Some("10.0.0.0/8"));

        trie.delete_mask("10.0.0.0/8").unwrap();
        assert!(!trie.matches(&addr("10.1.2.3")));

        // Deleting what is not there is fine.
        trie.delete_mask("172.16.0.0/12").unwrap();
    }

    #[test]
    fn ipv6_masks() {
        let mut trie = NetmaskTrie::new();
        trie.add_mask("2001:db8::/32").unwrap();

        assert!(trie.matches(&addr("2001:db8::1")));
        assert!(!trie.matches(&addr("2001:db9::1")));
        // Address families do not bleed into each other.
        assert!(!trie.matches(&addr("32.1.13.184")));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let mut trie = NetmaskTrie::new();
        trie.add_mask("0.0.0.0/0").unwrap();
        assert!(trie.matches(&addr("203.0.113.5")));
        assert!(!trie.matches(&addr("2001:db8::1")));
    }
}
