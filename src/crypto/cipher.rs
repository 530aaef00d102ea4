//! Sealing of relay frames
//!
//! Frames exchanged with a paired wallet pass through a third-party relay.
//! They are sealed with ChaCha20-Poly1305 under the symmetric key shared
//! in the pairing URI, with the pairing topic as associated data so a frame
//! cannot be replayed into another pairing.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BridgeError, BridgeResult};

/// Size of the pairing key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key shared out of band with the wallet
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey([u8; KEY_SIZE]);

impl SymKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        SymKey(key)
    }

    /// Parse a hex encoded key
    pub fn from_hex(s: &str) -> BridgeResult<Self> {
        let mut bytes =
            hex::decode(s).map_err(|e| BridgeError::encoding("pairing.key", e.to_string()))?;
        let key: Result<[u8; KEY_SIZE], _> = bytes.as_slice().try_into();
        bytes.zeroize();
        key.map(SymKey)
            .map_err(|_| BridgeError::encoding("pairing.key", "expected 32 bytes"))
    }

    /// Hex form, for embedding in a pairing URI
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymKey(..)")
    }
}

/// Frame sealing operations
pub struct Cipher;

impl Cipher {
    /// Seal a frame
    ///
    /// Returns: nonce || ciphertext || tag
    pub fn seal(key: &SymKey, plaintext: &[u8], aad: &[u8]) -> BridgeResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new((&key.0).into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| BridgeError::encoding("frame", "sealing failed"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Open a sealed frame
    ///
    /// The AAD must match what was used when sealing.
    pub fn open(key: &SymKey, sealed: &[u8], aad: &[u8]) -> BridgeResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(BridgeError::encoding("frame", "sealed frame too short"));
        }

        let cipher = ChaCha20Poly1305::new((&key.0).into());
        let (nonce, encrypted) = sealed.split_at(NONCE_SIZE);

        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: encrypted, aad })
            .map_err(|_| BridgeError::encoding("frame", "authentication tag mismatch"))
    }
}
