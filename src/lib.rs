//! # Plug Bridge
//!
//! In-page bridge between a web application and an out-of-process
//! Internet Computer signer (a browser extension or a paired mobile
//! wallet). The private key never enters this process.
//!
//! ## Features
//!
//! - **Request ids**: representation-independent hashing of call bodies
//! - **Whitelist gate**: calls outside the granted canisters never leave
//! - **Agent proxy**: call, query and read-state as round trips to the signer
//! - **Sessions**: connect, resume, refresh and disconnect
//! - **Batches**: one approval for an ordered, chained list of calls
//! - **Pluggable transport**: in-memory for tests, pairing relay for wallets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plug_bridge::{BridgeConfig, Provider};
//! use plug_bridge::transport::RelayTransport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayTransport::pair("wss://bridge.plugwallet.ooo").await?;
//! println!("Scan to pair: {}", relay.pairing().to_uri());
//! relay.wait_for_wallet().await?;
//!
//! let provider = Provider::new(Arc::new(relay), BridgeConfig::default());
//! let key = provider.request_connect(None).await?;
//! println!("Connected as {}", key.principal());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  PROVIDER                   │
//! │   connect | balances | transfers | batches  │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             SESSION & AGENT LAYER           │
//! │  SessionManager | BridgeAgent | Delegate    │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │  RequestId | Principal | ChaCha20-Poly1305  │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │     RpcClient | Memory | Pairing relay      │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod auth;
pub mod batch;
pub mod config;
pub mod crypto;
pub mod error;
pub mod provider;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use agent::{Agent, BridgeAgent, InterfaceRegistry};
pub use auth::{AuthorizationDelegate, SignInfo, SignedEnvelope};
pub use batch::{BatchOutcome, Transaction};
pub use config::{BridgeConfig, DomainMetadata};
pub use crypto::{AccountId, Principal, PublicKey, RequestId};
pub use error::{BridgeError, BridgeResult};
pub use provider::Provider;
pub use session::{Session, SessionManager};
