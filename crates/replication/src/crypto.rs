use crate::{Error, Nonce};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;

pub const KEY_SIZE: usize = 32;

/// The cluster's shared symmetric key, carried base64-encoded in
/// configuration.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_base64(encoded: &str) -> Result<SymmetricKey, Error> {
        let decoded = base64::decode(encoded.trim())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_SIZE] = decoded
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("expected {KEY_SIZE} bytes")))?;
        Ok(SymmetricKey { bytes })
    }

    pub fn to_base64(&self) -> String {
        base64::encode(self.bytes)
    }

    fn key(&self) -> &Key {
        Key::from_slice(&self.bytes)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("SymmetricKey(..)")
    }
}

/// A fresh random key, base64-encoded for operator configuration.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode(bytes)
}

pub(crate) fn encrypt(key: &SymmetricKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    XChaCha20Poly1305::new(key.key())
        .encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| Error::Crypto)
}

pub(crate) fn decrypt(key: &SymmetricKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    XChaCha20Poly1305::new(key.key())
        .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| Error::Crypto)
}
