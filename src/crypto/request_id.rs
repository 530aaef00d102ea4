//! Representation-independent request hashing
//!
//! A call body is a map of field name to value. Its RequestId is the
//! SHA-256 over the sorted concatenation of `sha256(key) ++ hash(value)`
//! pairs, so it does not depend on field order and ignores absent fields.
//! The same digest, behind [`DOMAIN_SEPARATOR`], is what the remote
//! signer signs.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::identity::Principal;
use crate::error::{BridgeError, BridgeResult};

/// Prefix prepended to a RequestId before signing
pub const DOMAIN_SEPARATOR: &[u8] = b"\x0Aic-request";

/// Size of a RequestId in bytes
pub const REQUEST_ID_SIZE: usize = 32;

/// Digest of a call body
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; REQUEST_ID_SIZE]);

impl RequestId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let arr: [u8; REQUEST_ID_SIZE] = bytes.try_into().map_err(|_| {
            BridgeError::encoding(
                "requestId",
                format!("expected {REQUEST_ID_SIZE} bytes, got {}", bytes.len()),
            )
        })?;
        Ok(RequestId(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_SIZE] {
        &self.0
    }

    /// Bytes the remote authority signs: domain separator then digest
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(DOMAIN_SEPARATOR.len() + REQUEST_ID_SIZE);
        payload.extend_from_slice(DOMAIN_SEPARATOR);
        payload.extend_from_slice(&self.0);
        payload
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A value that can appear in a hashed request body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HashValue {
    /// UTF-8 text
    Text(String),
    /// Unsigned integer
    Nat(u128),
    /// Signed integer; only non-negative values are hashable
    Int(i128),
    /// Arbitrary precision unsigned integer, big-endian magnitude
    BigNat(Vec<u8>),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered list
    List(Vec<HashValue>),
    /// Principal or canister id, hashed over its raw bytes
    Principal(Principal),
    /// Nested map, hashed with the same algorithm as the body
    Map(Vec<(String, Option<HashValue>)>),
}

impl From<&str> for HashValue {
    fn from(value: &str) -> Self {
        HashValue::Text(value.to_string())
    }
}

impl From<String> for HashValue {
    fn from(value: String) -> Self {
        HashValue::Text(value)
    }
}

impl From<u64> for HashValue {
    fn from(value: u64) -> Self {
        HashValue::Nat(value.into())
    }
}

impl From<Vec<u8>> for HashValue {
    fn from(value: Vec<u8>) -> Self {
        HashValue::Bytes(value)
    }
}

impl From<Principal> for HashValue {
    fn from(value: Principal) -> Self {
        HashValue::Principal(value)
    }
}

/// SHA-256 of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Unsigned LEB128 encoding
pub fn leb128(mut n: u128) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Unsigned LEB128 of a big-endian magnitude of any length
fn leb128_big(magnitude: &[u8]) -> Vec<u8> {
    // Little-endian bit stream, then 7-bit groups
    let le: Vec<u8> = magnitude.iter().rev().copied().collect();
    let significant_bits = le
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i * 8 + (8 - le[i].leading_zeros() as usize))
        .unwrap_or(0);

    if significant_bits == 0 {
        return vec![0];
    }

    let groups = significant_bits.div_ceil(7);
    let mut out = Vec::with_capacity(groups);
    for g in 0..groups {
        let mut byte = 0u8;
        for bit in 0..7 {
            let idx = g * 7 + bit;
            if idx < le.len() * 8 && le[idx / 8] & (1 << (idx % 8)) != 0 {
                byte |= 1 << bit;
            }
        }
        if g + 1 < groups {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

/// Hash one value at the given field path
pub fn hash_value(value: &HashValue, path: &str) -> BridgeResult<[u8; 32]> {
    match value {
        HashValue::Text(s) => Ok(sha256(s.as_bytes())),
        HashValue::Nat(n) => Ok(sha256(&leb128(*n))),
        HashValue::Int(n) => {
            let n = u128::try_from(*n).map_err(|_| {
                BridgeError::encoding(path, "negative integers have no unsigned LEB128 form")
            })?;
            Ok(sha256(&leb128(n)))
        }
        HashValue::BigNat(magnitude) => Ok(sha256(&leb128_big(magnitude))),
        HashValue::Bytes(bytes) => Ok(sha256(bytes)),
        HashValue::List(items) => {
            let mut concatenated = Vec::with_capacity(items.len() * 32);
            for (i, item) in items.iter().enumerate() {
                concatenated.extend_from_slice(&hash_value(item, &format!("{path}[{i}]"))?);
            }
            Ok(sha256(&concatenated))
        }
        HashValue::Principal(p) => Ok(sha256(p.as_slice())),
        HashValue::Map(entries) => {
            hash_entries(entries.iter().map(|(k, v)| (k.as_str(), v.as_ref())), path)
        }
    }
}

/// Byte-lexicographic order with shorter inputs first
fn compare(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn hash_entries<'a>(
    entries: impl Iterator<Item = (&'a str, Option<&'a HashValue>)>,
    prefix: &str,
) -> BridgeResult<[u8; 32]> {
    let mut hashed = Vec::new();
    for (key, value) in entries {
        let Some(value) = value else { continue };
        let path = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        };
        hashed.push((sha256(key.as_bytes()), hash_value(value, &path)?));
    }

    hashed.sort_by(|(k1, _), (k2, _)| compare(k1, k2));

    let mut concatenated = Vec::with_capacity(hashed.len() * 64);
    for (k, v) in &hashed {
        concatenated.extend_from_slice(k);
        concatenated.extend_from_slice(v);
    }
    Ok(sha256(&concatenated))
}

/// Compute the RequestId of a request body
///
/// Fields whose value is `None` are dropped before hashing.
pub fn request_id_of<'a, I>(body: I) -> BridgeResult<RequestId>
where
    I: IntoIterator<Item = (&'a str, Option<HashValue>)>,
{
    let body: Vec<(&str, Option<HashValue>)> = body.into_iter().collect();
    hash_entries(body.iter().map(|(k, v)| (*k, v.as_ref())), "").map(RequestId)
}

/// Convert a JSON value into a hashable value
///
/// `null` is treated as absent. Booleans and non-integer numbers have no
/// hash representation.
pub fn from_json(value: &Value, path: &str) -> BridgeResult<Option<HashValue>> {
    let converted = match value {
        Value::Null => return Ok(None),
        Value::String(s) => HashValue::Text(s.clone()),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                HashValue::Nat(u.into())
            } else if let Some(i) = n.as_i64() {
                HashValue::Int(i.into())
            } else {
                return Err(BridgeError::encoding(path, "non-integer number"));
            }
        }
        Value::Bool(_) => return Err(BridgeError::encoding(path, "unsupported type bool")),
        Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{path}[{i}]");
                match from_json(item, &item_path)? {
                    Some(v) => list.push(v),
                    None => return Err(BridgeError::encoding(item_path, "null list element")),
                }
            }
            HashValue::List(list)
        }
        Value::Object(fields) => {
            let mut entries = Vec::with_capacity(fields.len());
            for (k, v) in fields {
                let field_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                entries.push((k.clone(), from_json(v, &field_path)?));
            }
            HashValue::Map(entries)
        }
    };
    Ok(Some(converted))
}

/// Compute the RequestId of a JSON object body
pub fn request_id_of_json(body: &Value) -> BridgeResult<RequestId> {
    match from_json(body, "")? {
        Some(HashValue::Map(entries)) => {
            hash_entries(entries.iter().map(|(k, v)| (k.as_str(), v.as_ref())), "")
                .map(RequestId)
        }
        _ => Err(BridgeError::encoding("", "request body must be an object")),
    }
}
