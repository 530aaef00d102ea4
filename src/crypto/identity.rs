//! Public keys, principals and account identifiers
//!
//! The private key never exists in this process. What the bridge holds is
//! the signer's public key, from which the self-authenticating principal
//! and the ledger account identifier are derived without network access.

use ed25519_dalek::Verifier as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

use crate::error::{BridgeError, BridgeResult};

/// Size of a raw Ed25519 public key
pub const ED25519_KEY_SIZE: usize = 32;

/// Size of a raw uncompressed secp256k1 public key
pub const SECP256K1_KEY_SIZE: usize = 65;

/// Size of a signature returned by the signer
pub const SIGNATURE_SIZE: usize = 64;

/// Max principal length in bytes
pub const MAX_PRINCIPAL_LEN: usize = 29;

/// SubjectPublicKeyInfo prefix for secp256k1 keys
const SECP256K1_DER_PREFIX: [u8; 23] = [
    0x30, 0x56, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05,
    0x2b, 0x81, 0x04, 0x00, 0x0a, 0x03, 0x42, 0x00,
];

/// SubjectPublicKeyInfo prefix for Ed25519 keys
const ED25519_DER_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Principal class suffix for self-authenticating ids
const SELF_AUTHENTICATING_TAG: u8 = 0x02;

/// Principal class suffix for the anonymous id
const ANONYMOUS_TAG: u8 = 0x04;

const ACCOUNT_DOMAIN_SEPARATOR: &[u8] = b"\x0Aaccount-id";

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Public key of the remote signer
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicKey {
    /// Uncompressed SEC1 point, leading 0x04
    Secp256k1([u8; SECP256K1_KEY_SIZE]),
    /// Raw Ed25519 key
    Ed25519([u8; ED25519_KEY_SIZE]),
}

impl PublicKey {
    /// Create from raw or DER bytes
    ///
    /// 65 and 33 byte inputs are secp256k1 SEC1 points, 32 bytes is Ed25519,
    /// and a known SubjectPublicKeyInfo prefix is stripped first.
    pub fn from_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        if let Some(raw) = bytes.strip_prefix(&SECP256K1_DER_PREFIX[..]) {
            return Self::secp256k1(raw);
        }
        if let Some(raw) = bytes.strip_prefix(&ED25519_DER_PREFIX[..]) {
            return Self::ed25519(raw);
        }

        match bytes.len() {
            SECP256K1_KEY_SIZE | 33 => Self::secp256k1(bytes),
            ED25519_KEY_SIZE => Self::ed25519(bytes),
            other => Err(BridgeError::encoding(
                "publicKey",
                format!("unsupported key length {other}"),
            )),
        }
    }

    fn secp256k1(bytes: &[u8]) -> BridgeResult<Self> {
        let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| BridgeError::encoding("publicKey", "invalid secp256k1 point"))?;
        let point = key.to_encoded_point(false);
        let mut raw = [0u8; SECP256K1_KEY_SIZE];
        raw.copy_from_slice(point.as_bytes());
        Ok(PublicKey::Secp256k1(raw))
    }

    fn ed25519(bytes: &[u8]) -> BridgeResult<Self> {
        let raw: [u8; ED25519_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| BridgeError::encoding("publicKey", "invalid Ed25519 key length"))?;
        Ok(PublicKey::Ed25519(raw))
    }

    /// Create from a hex encoded raw key
    pub fn from_hex(s: &str) -> BridgeResult<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| BridgeError::encoding("publicKey", e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw key bytes
    pub fn raw(&self) -> &[u8] {
        match self {
            PublicKey::Secp256k1(raw) => raw,
            PublicKey::Ed25519(raw) => raw,
        }
    }

    /// DER encoded SubjectPublicKeyInfo
    pub fn to_der(&self) -> Vec<u8> {
        let prefix: &[u8] = match self {
            PublicKey::Secp256k1(_) => &SECP256K1_DER_PREFIX,
            PublicKey::Ed25519(_) => &ED25519_DER_PREFIX,
        };
        let mut der = Vec::with_capacity(prefix.len() + self.raw().len());
        der.extend_from_slice(prefix);
        der.extend_from_slice(self.raw());
        der
    }

    /// Convert raw key to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.raw())
    }

    /// Principal owned by this key
    pub fn principal(&self) -> Principal {
        Principal::self_authenticating(&self.to_der())
    }

    /// Verify a signature produced by the remote signer
    ///
    /// Ed25519 signs the message directly; secp256k1 is ECDSA over its
    /// SHA-256 digest.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> BridgeResult<()> {
        if signature.len() != SIGNATURE_SIZE {
            return Err(BridgeError::encoding(
                "senderSignature",
                format!("expected {SIGNATURE_SIZE} bytes, got {}", signature.len()),
            ));
        }
        let failed = || BridgeError::encoding("senderSignature", "signature verification failed");

        match self {
            PublicKey::Ed25519(raw) => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(raw).map_err(|_| failed())?;
                let sig = ed25519_dalek::Signature::from_slice(signature).map_err(|_| failed())?;
                key.verify(message, &sig).map_err(|_| failed())
            }
            PublicKey::Secp256k1(raw) => {
                let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(raw).map_err(|_| failed())?;
                let sig = k256::ecdsa::Signature::from_slice(signature).map_err(|_| failed())?;
                key.verify(message, &sig).map_err(|_| failed())
            }
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PublicKey::Secp256k1(_) => "Secp256k1",
            PublicKey::Ed25519(_) => "Ed25519",
        };
        write!(f, "PublicKey::{kind}({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Network-wide identity, also used for canister ids
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal(Vec<u8>);

/// Canister ids share the principal format
pub type CanisterId = Principal;

impl Principal {
    /// The management canister, `aaaaa-aa`
    pub fn management_canister() -> Self {
        Principal(Vec::new())
    }

    /// The anonymous principal, `2vxsx-fae`
    pub fn anonymous() -> Self {
        Principal(vec![ANONYMOUS_TAG])
    }

    /// Create from raw bytes without validation
    pub fn from_slice(bytes: &[u8]) -> Self {
        Principal(bytes.to_vec())
    }

    /// Create from raw bytes
    pub fn try_from_slice(bytes: &[u8]) -> BridgeResult<Self> {
        if bytes.len() > MAX_PRINCIPAL_LEN {
            return Err(BridgeError::encoding(
                "principal",
                format!("{} bytes exceeds {MAX_PRINCIPAL_LEN}", bytes.len()),
            ));
        }
        Ok(Principal(bytes.to_vec()))
    }

    /// Principal derived from a DER encoded public key
    pub fn self_authenticating(der_public_key: &[u8]) -> Self {
        let mut bytes: Vec<u8> = Sha224::digest(der_public_key).to_vec();
        bytes.push(SELF_AUTHENTICATING_TAG);
        Principal(bytes)
    }

    /// Raw bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Textual form, checksummed and dash-grouped
    pub fn to_text(&self) -> String {
        let mut bytes = crc32fast::hash(&self.0).to_be_bytes().to_vec();
        bytes.extend_from_slice(&self.0);

        let encoded = base32_encode(&bytes);
        let mut text = String::with_capacity(encoded.len() + encoded.len() / 5);
        for (i, c) in encoded.chars().enumerate() {
            if i > 0 && i % 5 == 0 {
                text.push('-');
            }
            text.push(c);
        }
        text
    }

    /// Parse the textual form, validating the checksum
    pub fn from_text(text: &str) -> BridgeResult<Self> {
        let invalid = |reason: &str| BridgeError::encoding("principal", reason.to_string());

        let compact: String = text.chars().filter(|c| *c != '-').collect();
        let decoded = base32_decode(&compact.to_ascii_lowercase())
            .ok_or_else(|| invalid("not base32"))?;
        if decoded.len() < 4 {
            return Err(invalid("too short"));
        }

        let (checksum, bytes) = decoded.split_at(4);
        if crc32fast::hash(bytes).to_be_bytes() != checksum {
            return Err(invalid("checksum mismatch"));
        }

        let principal = Principal::try_from_slice(bytes)?;
        if principal.to_text() != text {
            return Err(invalid("not in canonical form"));
        }
        Ok(principal)
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Principal({})", self.to_text())
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl std::str::FromStr for Principal {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Principal::from_text(s)
    }
}

impl Serialize for Principal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Principal::from_text(&s).map_err(serde::de::Error::custom)
    }
}

/// Ledger account identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId([u8; 32]);

impl AccountId {
    /// Account of a principal and numbered subaccount
    ///
    /// The subaccount number occupies the first four bytes of the
    /// otherwise zero 32-byte subaccount.
    pub fn from_principal(principal: &Principal, subaccount: u32) -> Self {
        let mut sub = [0u8; 32];
        sub[..4].copy_from_slice(&subaccount.to_be_bytes());

        let mut hasher = Sha224::new();
        hasher.update(ACCOUNT_DOMAIN_SEPARATOR);
        hasher.update(principal.as_slice());
        hasher.update(sub);
        let hash = hasher.finalize();

        let mut out = [0u8; 32];
        out[..4].copy_from_slice(&crc32fast::hash(&hash).to_be_bytes());
        out[4..].copy_from_slice(&hash);
        AccountId(out)
    }

    /// Raw 32 bytes, checksum first
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64-character hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check a hex account id's checksum
    pub fn validate_hex(s: &str) -> bool {
        let Ok(bytes) = hex::decode(s) else {
            return false;
        };
        bytes.len() == 32 && crc32fast::hash(&bytes[4..]).to_be_bytes() == bytes[..4]
    }
}

impl std::fmt::Debug for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountId({})", self.to_hex())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &b in bytes {
        buffer = (buffer << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in s.bytes() {
        let value = BASE32_ALPHABET.iter().position(|a| *a == c)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Some(out)
}
