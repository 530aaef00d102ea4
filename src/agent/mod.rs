//! Agent proxy
//!
//! Turns the three agent primitives into round trips to the signing
//! authority. Nothing here talks HTTP: the authority submits to the
//! network and hands back the outcome. No retries happen at this layer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::auth::{AuthorizationDelegate, CallContent, RequestType, SignedEnvelope};
use crate::config::is_mainnet_host;
use crate::crypto::{CanisterId, Principal, RequestId};
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{
    decode_bytes, encode_bytes, CallArgs, CallConfig, Command, QueryArgs, ReadStateArgs, RpcClient,
};

/// Typed interface of a canister, used to show decoded arguments
pub trait ArgDecoder: Send + Sync {
    /// Decode the arguments of a method call; `None` when unknown
    fn decode_args(&self, method_name: &str, arg: &[u8]) -> Option<Value>;
}

/// Interfaces registered per canister
#[derive(Clone, Default)]
pub struct InterfaceRegistry {
    decoders: Arc<RwLock<HashMap<String, Arc<dyn ArgDecoder>>>>,
}

impl InterfaceRegistry {
    /// Register (or replace) the interface of a canister
    pub fn register(&self, canister_id: impl Into<String>, decoder: Arc<dyn ArgDecoder>) {
        self.decoders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(canister_id.into(), decoder);
    }

    /// Whether a canister has a registered interface
    pub fn contains(&self, canister_id: &str) -> bool {
        self.decoders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(canister_id)
    }

    /// Decode call arguments through the canister's interface
    pub fn decode(&self, canister_id: &str, method_name: &str, arg: &[u8]) -> Option<Value> {
        let decoder = self
            .decoders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(canister_id)
            .cloned()?;
        decoder.decode_args(method_name, arg)
    }
}

/// Options of an update call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallOptions {
    /// Method to call
    pub method_name: String,
    /// Encoded arguments
    pub arg: Vec<u8>,
    /// Effective canister for management calls
    pub effective_canister_id: Option<CanisterId>,
}

/// Fields of a query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryFields {
    /// Method to query
    pub method_name: String,
    /// Encoded arguments
    pub arg: Vec<u8>,
}

/// Outcome of a submitted update call
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitResponse {
    /// Request id assigned by the authority
    pub request_id: RequestId,
    /// Rest of the authority's answer
    pub response: Value,
}

/// Outcome of a query, rejections passed through unchanged
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResponse {
    /// The canister replied
    Replied {
        /// Encoded reply
        arg: Vec<u8>,
    },
    /// The canister rejected the query
    Rejected {
        /// Reject code
        reject_code: u64,
        /// Reject message
        reject_message: String,
    },
}

/// Certificate read from the state tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadStateResponse {
    /// CBOR encoded certificate
    pub certificate: Vec<u8>,
}

/// The three agent primitives
#[async_trait]
pub trait Agent: Send + Sync {
    /// Submit an update call
    async fn call(&self, canister_id: &CanisterId, options: CallOptions)
        -> BridgeResult<SubmitResponse>;

    /// Run a query
    async fn query(&self, canister_id: &CanisterId, fields: QueryFields)
        -> BridgeResult<QueryResponse>;

    /// Read paths from the state tree
    async fn read_state(
        &self,
        canister_id: &CanisterId,
        paths: Vec<Vec<u8>>,
    ) -> BridgeResult<ReadStateResponse>;
}

#[derive(Deserialize)]
struct RemoteError {
    message: String,
}

#[derive(Deserialize)]
struct QueryReply {
    arg: Value,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RawQueryResponse {
    Replied {
        reply: QueryReply,
    },
    Rejected {
        #[serde(default)]
        reject_code: u64,
        #[serde(default)]
        reject_message: String,
    },
}

/// Agent whose identity lives in the remote authority
#[derive(Clone)]
pub struct BridgeAgent {
    rpc: RpcClient,
    delegate: Arc<AuthorizationDelegate>,
    registry: InterfaceRegistry,
    host: String,
    timeout_ms: u64,
    batch_token: Option<String>,
}

impl BridgeAgent {
    /// Create an agent over a delegate
    pub fn new(
        rpc: RpcClient,
        delegate: AuthorizationDelegate,
        registry: InterfaceRegistry,
        host: impl Into<String>,
    ) -> Self {
        BridgeAgent {
            rpc,
            delegate: Arc::new(delegate),
            registry,
            host: host.into(),
            timeout_ms: 0,
            batch_token: None,
        }
    }

    /// Deadline for every round trip; 0 waits forever
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Agent whose calls belong to an approved batch
    pub fn with_batch_token(&self, token: impl Into<String>) -> Self {
        let delegate = self.delegate.as_ref().clone().with_pre_approve(true);
        BridgeAgent {
            delegate: Arc::new(delegate),
            batch_token: Some(token.into()),
            ..self.clone()
        }
    }

    /// Batch correlation token, if any
    pub fn batch_token(&self) -> Option<&str> {
        self.batch_token.as_deref()
    }

    /// Network host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the host serves the main network
    ///
    /// Other hosts would need their root key fetched; that fetch is done
    /// by the authority, which owns all network access.
    pub fn is_mainnet(&self) -> bool {
        is_mainnet_host(&self.host)
    }

    /// Principal the agent acts as
    pub fn get_principal(&self) -> &Principal {
        self.delegate.get_principal()
    }

    /// Authorization delegate
    pub fn delegate(&self) -> &AuthorizationDelegate {
        &self.delegate
    }

    /// Have the authority sign a request body
    pub async fn sign(&self, content: CallContent) -> BridgeResult<SignedEnvelope> {
        self.delegate.authorize_and_sign(content).await
    }

    fn config(&self) -> CallConfig {
        CallConfig::with_timeout(self.timeout_ms)
    }
}

/// Fail on an `{error: {message}}` answer
fn check_remote_error(result: &Value) -> BridgeResult<()> {
    match result.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(error) => {
            let message = serde_json::from_value::<RemoteError>(error.clone())
                .map(|e| e.message)
                .unwrap_or_else(|_| error.to_string());
            Err(BridgeError::RemoteCall(message))
        }
    }
}

#[async_trait]
impl Agent for BridgeAgent {
    async fn call(
        &self,
        canister_id: &CanisterId,
        options: CallOptions,
    ) -> BridgeResult<SubmitResponse> {
        let canister_text = canister_id.to_text();
        self.delegate.authorize(&canister_text, RequestType::Call)?;

        let decoded_args = self
            .registry
            .decode(&canister_text, &options.method_name, &options.arg);
        debug!(
            canister_id = %canister_text,
            method = %options.method_name,
            arg_len = options.arg.len(),
            batched = self.batch_token.is_some(),
            "submitting call"
        );

        let command = Command::RequestCall {
            metadata: self.rpc.metadata().clone(),
            call: CallArgs {
                canister_id: canister_text,
                method_name: options.method_name,
                arg: encode_bytes(&options.arg),
                effective_canister_id: options.effective_canister_id.map(|id| id.to_text()),
            },
            batch_tx_id: self.batch_token.clone(),
            decoded_args,
        };
        let mut result = self.rpc.call_with(command, self.config()).await?;
        check_remote_error(&result)?;

        let encoded = result
            .as_object_mut()
            .and_then(|fields| fields.remove("requestId"))
            .ok_or_else(|| BridgeError::encoding("requestId", "missing from response"))?;
        let request_id = RequestId::from_bytes(&decode_bytes(&encoded, "requestId")?)?;

        Ok(SubmitResponse {
            request_id,
            response: result,
        })
    }

    async fn query(
        &self,
        canister_id: &CanisterId,
        fields: QueryFields,
    ) -> BridgeResult<QueryResponse> {
        let canister_text = canister_id.to_text();
        self.delegate.authorize(&canister_text, RequestType::Query)?;
        debug!(canister_id = %canister_text, method = %fields.method_name, "running query");

        let command = Command::RequestQuery {
            query: QueryArgs {
                canister_id: canister_text,
                method_name: fields.method_name,
                arg: encode_bytes(&fields.arg),
            },
        };
        let result = self.rpc.call_with(command, self.config()).await?;
        check_remote_error(&result)?;

        match serde_json::from_value::<RawQueryResponse>(result)
            .map_err(|e| BridgeError::encoding("status", e.to_string()))?
        {
            RawQueryResponse::Replied { reply } => Ok(QueryResponse::Replied {
                arg: decode_bytes(&reply.arg, "reply.arg")?,
            }),
            RawQueryResponse::Rejected {
                reject_code,
                reject_message,
            } => Ok(QueryResponse::Rejected {
                reject_code,
                reject_message,
            }),
        }
    }

    async fn read_state(
        &self,
        canister_id: &CanisterId,
        paths: Vec<Vec<u8>>,
    ) -> BridgeResult<ReadStateResponse> {
        let canister_text = canister_id.to_text();
        self.delegate
            .authorize(&canister_text, RequestType::ReadState)?;
        debug!(canister_id = %canister_text, paths = paths.len(), "reading state");

        let command = Command::RequestReadState {
            read_state: ReadStateArgs {
                canister_id: canister_text,
                paths: paths.iter().map(|p| encode_bytes(p)).collect(),
            },
        };
        let result = self.rpc.call_with(command, self.config()).await?;
        check_remote_error(&result)?;

        let certificate = result
            .get("certificate")
            .ok_or_else(|| BridgeError::encoding("certificate", "missing from response"))?;
        Ok(ReadStateResponse {
            certificate: decode_bytes(certificate, "certificate")?,
        })
    }
}

impl std::fmt::Debug for BridgeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeAgent")
            .field("host", &self.host)
            .field("principal", self.get_principal())
            .field("batch_token", &self.batch_token)
            .finish()
    }
}
