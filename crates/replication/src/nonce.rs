use rand::RngCore;

/// Nonce width of the XChaCha20-Poly1305 framing.
pub const NONCE_SIZE: usize = 24;

/// A send or receive nonce. The first four bytes are a big-endian message
/// counter; the remainder stays fixed for a session, so a peer can both
/// detect replays (counter does not advance) and distinguish sessions
/// (remainder changed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    value: [u8; NONCE_SIZE],
}

impl Nonce {
    /// A fresh nonce from OS randomness.
    pub fn random() -> Nonce {
        let mut value = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut value);
        Nonce { value }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Nonce> {
        let value: [u8; NONCE_SIZE] = bytes.try_into().ok()?;
        Some(Nonce { value })
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.value
    }

    /// The message counter held in the leading bytes.
    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([self.value[0], self.value[1], self.value[2], self.value[3]])
    }

    /// The session bytes after the counter.
    pub fn session(&self) -> &[u8] {
        &self.value[4..]
    }

    pub fn increment(&mut self) {
        let next = self.counter().wrapping_add(1);
        self.value[..4].copy_from_slice(&next.to_be_bytes());
    }

    /// A composite nonce for handshake re-sync: the low half from one
    /// party, the high half from the other.
    pub fn merge(lower: &Nonce, higher: &Nonce) -> Nonce {
        const HALF: usize = NONCE_SIZE / 2;
        let mut value = [0u8; NONCE_SIZE];
        value[..HALF].copy_from_slice(&lower.value[..HALF]);
        value[HALF..].copy_from_slice(&higher.value[HALF..]);
        Nonce { value }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn increment_advances_the_leading_counter() {
        let mut nonce = Nonce::from_bytes(&[0u8; NONCE_SIZE]).unwrap();
        nonce.increment();
        assert_eq!(nonce.counter(), 1);
        // Session bytes are untouched.
        assert_eq!(nonce.session(), &[0u8; NONCE_SIZE - 4]);

        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut nonce = Nonce::from_bytes(&bytes).unwrap();
        nonce.increment();
        assert_eq!(nonce.counter(), 0);
    }

    #[test]
    fn merge_takes_one_half_from_each() {
        let lower = Nonce::from_bytes(&[0xaau8; NONCE_SIZE]).unwrap();
        let higher = Nonce::from_bytes(&[0xbbu8; NONCE_SIZE]).unwrap();
        let merged = Nonce::merge(&lower, &higher);

        assert_eq!(&merged.as_bytes()[..12], &[0xaau8; 12]);
        assert_eq!(&merged.as_bytes()[12..], &[0xbbu8; 12]);
    }

    #[test]
    fn random_nonces_differ() {
        assert_ne!(Nonce::random(), Nonce::random());
        assert!(Nonce::from_bytes(&[0u8; 7]).is_none());
    }
}
