//! Transport layer abstraction
//!
//! A transport is a duplex request/response channel to the signing
//! authority. Backends are interchangeable:
//! - In-memory pair with a scripted authority (for testing)
//! - Pairing relay over WebSocket (for a paired mobile wallet)
//!
//! # Design
//!
//! Requests are a closed [`Command`] vocabulary rather than free-form
//! handler names. Deadlines and failure notification live in
//! [`RpcClient`], so backends only move requests and responses.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::auth::SignInfo;
use crate::config::DomainMetadata;
use crate::error::{BridgeError, BridgeResult};

pub mod relay;
pub mod rpc;

pub use relay::{PairingUri, RelayTransport};
pub use rpc::RpcClient;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Deadline elapsed before the authority answered
    #[error("Request Timeout: {handler} after {after_ms}ms")]
    Timeout {
        /// Wire name of the handler
        handler: &'static str,
        /// Deadline that elapsed
        after_ms: u64,
    },

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The authority answered with an error
    #[error("Remote error {code}: {message}")]
    Remote {
        /// JSON-RPC style error code
        code: i64,
        /// Message from the authority
        message: String,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Per-call transport options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallConfig {
    /// Deadline in milliseconds; 0 waits forever
    pub timeout_ms: u64,
    /// Backend-specific routing target
    pub target: String,
}

impl CallConfig {
    /// Config with a deadline and no target
    pub fn with_timeout(timeout_ms: u64) -> Self {
        CallConfig {
            timeout_ms,
            target: String::new(),
        }
    }
}

/// Update call parameters, as sent to the authority
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArgs {
    /// Target canister (text form)
    pub canister_id: String,
    /// Method to call
    pub method_name: String,
    /// Encoded arguments, base64
    pub arg: String,
    /// Effective canister for management calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_canister_id: Option<String>,
}

/// Query parameters, as sent to the authority
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryArgs {
    /// Target canister (text form)
    pub canister_id: String,
    /// Method to query
    pub method_name: String,
    /// Encoded arguments, base64
    pub arg: String,
}

/// Read-state parameters, as sent to the authority
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStateArgs {
    /// Canister whose state tree is read
    pub canister_id: String,
    /// Path segments, each base64
    pub paths: Vec<String>,
}

/// Everything the bridge can ask of the signing authority
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Ask the user to connect and whitelist canisters
    RequestConnect {
        /// Requesting site
        metadata: DomainMetadata,
        /// Canisters to pre-approve
        whitelist: Vec<String>,
        /// How long the approval prompt stays open
        timeout_ms: u64,
    },
    /// Confirm (or widen) the whitelist of an existing grant
    VerifyWhitelist {
        /// Requesting site
        metadata: DomainMetadata,
        /// Canisters that must be approved
        whitelist: Vec<String>,
    },
    /// Fetch an already-granted connection without prompting
    GetConnectionData {
        /// Site url
        url: String,
    },
    /// Whether the site holds a grant
    IsConnected {
        /// Site url
        url: String,
    },
    /// Submit an update call
    RequestCall {
        /// Requesting site
        metadata: DomainMetadata,
        /// Call parameters
        call: CallArgs,
        /// Batch correlation token, if part of a batch
        batch_tx_id: Option<String>,
        /// Decoded arguments for display
        decoded_args: Option<Value>,
    },
    /// Run a query call
    RequestQuery {
        /// Query parameters
        query: QueryArgs,
    },
    /// Read a certificate from the state tree
    RequestReadState {
        /// Read-state parameters
        read_state: ReadStateArgs,
    },
    /// Sign a request id
    RequestSign {
        /// Domain separator followed by the request id
        payload: Vec<u8>,
        /// What is being signed
        sign_info: SignInfo,
    },
    /// Approve a batch of transactions at once
    BatchTransactions {
        /// Requesting site
        metadata: DomainMetadata,
        /// One entry per transaction
        sign_infos: Vec<SignInfo>,
    },
    /// Revoke the site's grant
    Disconnect {
        /// Site url
        url: String,
    },
    /// Tell the authority a request timed out
    HandleTimeout {
        /// Requesting site
        metadata: DomainMetadata,
        /// Failure description
        message: String,
    },
    /// Tell the authority a request failed
    HandleError {
        /// Requesting site
        metadata: DomainMetadata,
        /// Failure description
        message: String,
    },
    /// Ask the authority for the session principal
    GetPrincipal {
        /// Site url
        url: String,
    },
    /// Token balances of an account
    RequestBalance {
        /// Requesting site
        metadata: DomainMetadata,
        /// Subaccount index, default account when absent
        subaccount: Option<u32>,
    },
    /// ICP transfer
    RequestTransfer {
        /// Requesting site
        metadata: DomainMetadata,
        /// Transfer parameters
        params: Value,
    },
    /// Burn XTC into cycles
    RequestBurnXtc {
        /// Requesting site
        metadata: DomainMetadata,
        /// Burn parameters
        params: Value,
    },
    /// ICNS names of the session principal
    GetIcnsInfo {
        /// Requesting site
        metadata: DomainMetadata,
    },
    /// Add a token to the wallet
    RequestImportToken {
        /// Requesting site
        metadata: DomainMetadata,
        /// Token parameters
        params: Value,
    },
    /// Sign an arbitrary message
    RequestSignMessage {
        /// Requesting site
        metadata: DomainMetadata,
        /// Message bytes
        message: Vec<u8>,
    },
}

impl Command {
    /// Wire name of the handler
    pub fn method(&self) -> &'static str {
        match self {
            Command::RequestConnect { .. } => "requestConnect",
            Command::VerifyWhitelist { .. } => "verifyWhitelist",
            Command::GetConnectionData { .. } => "getConnectionData",
            Command::IsConnected { .. } => "isConnected",
            Command::RequestCall { .. } => "requestCall",
            Command::RequestQuery { .. } => "requestQuery",
            Command::RequestReadState { .. } => "requestReadState",
            Command::RequestSign { .. } => "requestSign",
            Command::BatchTransactions { .. } => "batchTransactions",
            Command::Disconnect { .. } => "disconnect",
            Command::HandleTimeout { .. } => "handleTimeout",
            Command::HandleError { .. } => "handleError",
            Command::GetPrincipal { .. } => "getPrincipal",
            Command::RequestBalance { .. } => "requestBalance",
            Command::RequestTransfer { .. } => "requestTransfer",
            Command::RequestBurnXtc { .. } => "requestBurnXTC",
            Command::GetIcnsInfo { .. } => "getICNSInfo",
            Command::RequestImportToken { .. } => "requestImportToken",
            Command::RequestSignMessage { .. } => "requestSignMessage",
        }
    }

    /// Positional arguments, as the authority expects them
    pub fn params(&self) -> Vec<Value> {
        match self {
            Command::RequestConnect {
                metadata,
                whitelist,
                timeout_ms,
            } => vec![json!(metadata), json!(whitelist), json!(timeout_ms)],
            Command::VerifyWhitelist {
                metadata,
                whitelist,
            } => vec![json!(metadata), json!(whitelist)],
            Command::GetConnectionData { url }
            | Command::IsConnected { url }
            | Command::Disconnect { url }
            | Command::GetPrincipal { url } => vec![json!(url)],
            Command::RequestCall {
                metadata,
                call,
                batch_tx_id,
                decoded_args,
            } => vec![
                json!(metadata),
                json!(call),
                json!(batch_tx_id.clone().unwrap_or_default()),
                decoded_args.clone().unwrap_or(Value::Null),
            ],
            Command::RequestQuery { query } => vec![json!(query)],
            Command::RequestReadState { read_state } => vec![json!(read_state)],
            Command::RequestSign { payload, sign_info } => {
                vec![json!(encode_bytes(payload)), json!(sign_info)]
            }
            Command::BatchTransactions {
                metadata,
                sign_infos,
            } => vec![json!(metadata), json!(sign_infos)],
            Command::HandleTimeout { metadata, message }
            | Command::HandleError { metadata, message } => {
                vec![json!(metadata), json!(message)]
            }
            Command::RequestBalance {
                metadata,
                subaccount,
            } => vec![json!(metadata), json!(subaccount)],
            Command::RequestTransfer { metadata, params }
            | Command::RequestBurnXtc { metadata, params }
            | Command::RequestImportToken { metadata, params } => {
                vec![json!(metadata), params.clone()]
            }
            Command::GetIcnsInfo { metadata } => vec![json!(metadata)],
            Command::RequestSignMessage { metadata, message } => {
                vec![json!(metadata), json!(encode_bytes(message))]
            }
        }
    }

    /// Whether the authority prompts the user for this command
    pub fn requires_approval(&self) -> bool {
        match self {
            Command::RequestConnect { .. }
            | Command::RequestTransfer { .. }
            | Command::RequestBurnXtc { .. }
            | Command::BatchTransactions { .. }
            | Command::RequestImportToken { .. }
            | Command::RequestSignMessage { .. } => true,
            Command::RequestCall { batch_tx_id, .. } => batch_tx_id.is_none(),
            Command::RequestSign { sign_info, .. } => !sign_info.pre_approve,
            Command::VerifyWhitelist { .. }
            | Command::GetConnectionData { .. }
            | Command::IsConnected { .. }
            | Command::RequestQuery { .. }
            | Command::RequestReadState { .. }
            | Command::Disconnect { .. }
            | Command::HandleTimeout { .. }
            | Command::HandleError { .. }
            | Command::GetPrincipal { .. }
            | Command::RequestBalance { .. }
            | Command::GetIcnsInfo { .. } => false,
        }
    }
}

/// Abstract transport trait
///
/// All backends implement this trait. A backend only moves a command to
/// the authority and its answer back; deadlines are applied by
/// [`RpcClient`]. Calls may be issued concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Readiness hook; calling it again is a no-op
    async fn start(&self) -> TransportResult<()>;

    /// Send a command and wait for its answer
    async fn call(&self, command: &Command, config: &CallConfig) -> TransportResult<Value>;
}

/// Encode bytes for crossing the transport boundary
pub fn encode_bytes(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode bytes that crossed the transport boundary
///
/// Accepts base64 text, an array of byte values, or an object of
/// index to byte value (a serialized typed array).
pub fn decode_bytes(value: &Value, path: &str) -> BridgeResult<Vec<u8>> {
    let byte = |v: &Value| {
        v.as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| BridgeError::encoding(path, "expected byte values"))
    };

    match value {
        Value::String(s) => BASE64
            .decode(s.trim())
            .map_err(|e| BridgeError::encoding(path, e.to_string())),
        Value::Array(items) => items.iter().map(byte).collect(),
        Value::Object(fields) => {
            let mut indexed = Vec::with_capacity(fields.len());
            for (k, v) in fields {
                let idx: usize = k
                    .parse()
                    .map_err(|_| BridgeError::encoding(path, "expected byte indices"))?;
                indexed.push((idx, byte(v)?));
            }
            indexed.sort_by_key(|(idx, _)| *idx);
            Ok(indexed.into_iter().map(|(_, b)| b).collect())
        }
        _ => Err(BridgeError::encoding(path, "expected binary payload")),
    }
}

/// In-memory transport for testing
///
/// A [`MemoryTransport`] hands every command to a paired
/// [`MemoryAuthority`], which scripts the signer's answers.
pub mod memory {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::{mpsc, oneshot};

    type Reply = oneshot::Sender<TransportResult<Value>>;

    /// Create a connected transport and authority
    pub fn create_pair() -> (MemoryTransport, MemoryAuthority) {
        let (tx, rx) = mpsc::channel(100);
        let log = DispatchLog::default();

        let transport = MemoryTransport {
            tx,
            log: log.clone(),
        };
        let authority = MemoryAuthority { rx, log };

        (transport, authority)
    }

    /// Commands seen by a memory transport, in dispatch order
    #[derive(Clone, Default)]
    pub struct DispatchLog(Arc<Mutex<Vec<Command>>>);

    impl DispatchLog {
        fn push(&self, command: Command) {
            self.0
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(command);
        }

        /// Snapshot of every dispatched command
        pub fn commands(&self) -> Vec<Command> {
            self.0
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }

        /// Wire names of every dispatched command
        pub fn methods(&self) -> Vec<&'static str> {
            self.commands().iter().map(Command::method).collect()
        }

        /// Number of dispatches so far
        pub fn len(&self) -> usize {
            self.commands().len()
        }

        /// Whether nothing has been dispatched
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    /// In-memory transport endpoint
    pub struct MemoryTransport {
        tx: mpsc::Sender<(Command, Reply)>,
        log: DispatchLog,
    }

    impl MemoryTransport {
        /// Handle on the dispatch log
        pub fn dispatch_log(&self) -> DispatchLog {
            self.log.clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn start(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn call(&self, command: &Command, _config: &CallConfig) -> TransportResult<Value> {
            self.log.push(command.clone());

            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send((command.clone(), reply_tx))
                .await
                .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))?;

            reply_rx.await.map_err(|_| TransportError::Disconnected)?
        }
    }

    /// Answer an authority script gives for one command
    pub enum Scripted {
        /// Reply with this result
        Reply(TransportResult<Value>),
        /// Reply with this result after a delay
        Delayed(std::time::Duration, TransportResult<Value>),
        /// Never reply
        Hang,
    }

    impl From<Value> for Scripted {
        fn from(value: Value) -> Self {
            Scripted::Reply(Ok(value))
        }
    }

    impl From<TransportError> for Scripted {
        fn from(err: TransportError) -> Self {
            Scripted::Reply(Err(err))
        }
    }

    /// Scripted signing authority on the far side of a memory transport
    pub struct MemoryAuthority {
        rx: mpsc::Receiver<(Command, Reply)>,
        log: DispatchLog,
    }

    impl MemoryAuthority {
        /// Handle on the dispatch log
        pub fn dispatch_log(&self) -> DispatchLog {
            self.log.clone()
        }

        /// Answer commands with `script` until the transport is dropped
        pub fn serve<F>(mut self, mut script: F) -> tokio::task::JoinHandle<()>
        where
            F: FnMut(&Command) -> Scripted + Send + 'static,
        {
            tokio::spawn(async move {
                let mut parked = Vec::new();
                while let Some((command, reply)) = self.rx.recv().await {
                    match script(&command) {
                        Scripted::Reply(result) => {
                            let _ = reply.send(result);
                        }
                        Scripted::Delayed(delay, result) => {
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = reply.send(result);
                            });
                        }
                        Scripted::Hang => parked.push(reply),
                    }
                }
            })
        }
    }
}
