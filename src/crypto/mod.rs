//! Cryptographic building blocks for the bridge
//!
//! - `request_id`: representation-independent hashing of call bodies
//! - `identity`: signer public keys, principals and account identifiers
//! - `cipher`: ChaCha20-Poly1305 sealing of relay frames
//!
//! No private key material is handled here. Signatures come from the
//! remote authority and are only ever verified.

pub mod cipher;
pub mod identity;
pub mod request_id;

// Re-export commonly used types
pub use cipher::{Cipher, SymKey};
pub use identity::{AccountId, CanisterId, Principal, PublicKey};
pub use request_id::{
    hash_value, request_id_of, request_id_of_json, HashValue, RequestId, DOMAIN_SEPARATOR,
};
