//! Authorization delegate
//!
//! Holds the signer's public key and the canister whitelist granted for
//! the session. Every outbound call passes the whitelist gate before
//! anything is dispatched; signing is one round trip to the remote
//! authority with the domain-separated request id as payload.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::InterfaceRegistry;
use crate::crypto::{request_id_of, HashValue, Principal, PublicKey, RequestId};
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{decode_bytes, encode_bytes, CallConfig, Command, RpcClient};

/// Default lifetime of a signed request
pub const INGRESS_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Kind of request being authorized
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// State-changing call
    Call,
    /// Read-only query
    Query,
    /// Certificate read from the state tree
    ReadState,
}

impl RequestType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Call => "call",
            RequestType::Query => "query",
            RequestType::ReadState => "read_state",
        }
    }
}

/// Metadata shown to the remote signer alongside a signing request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInfo {
    /// Method being called
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    /// `call`, `query`, `read_state`, or `unknown` for batch entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    /// Target canister (text form)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canister_id: Option<String>,
    /// Caller principal (text form)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Encoded arguments, base64
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Arguments decoded through a registered interface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_arguments: Option<Value>,
    /// Already approved as part of a batch
    #[serde(default)]
    pub pre_approve: bool,
}

impl SignInfo {
    /// Describe one transaction of a batch for its approval prompt
    pub fn for_transaction(
        canister_id: &str,
        method_name: &str,
        sender: &Principal,
        arguments: &[u8],
        decoded_arguments: Option<Value>,
    ) -> Self {
        SignInfo {
            method_name: Some(method_name.to_string()),
            request_type: Some("unknown".to_string()),
            canister_id: Some(canister_id.to_string()),
            sender: Some(sender.to_text()),
            arguments: Some(encode_bytes(arguments)),
            decoded_arguments,
            pre_approve: false,
        }
    }
}

/// Body of a request, as hashed into its request id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContent {
    /// Kind of request
    pub request_type: RequestType,
    /// Target canister
    pub canister_id: Principal,
    /// Method name, for calls and queries
    pub method_name: Option<String>,
    /// Encoded arguments, for calls and queries
    pub arg: Option<Vec<u8>>,
    /// Caller principal
    pub sender: Principal,
    /// Expiry in nanoseconds since the epoch
    pub ingress_expiry: u64,
    /// Optional nonce
    pub nonce: Option<Vec<u8>>,
    /// State tree paths, for read-state
    pub paths: Option<Vec<Vec<Vec<u8>>>>,
}

impl CallContent {
    /// Update call body
    pub fn call(canister_id: Principal, method_name: &str, arg: Vec<u8>, sender: Principal) -> Self {
        Self::method(RequestType::Call, canister_id, method_name, arg, sender)
    }

    /// Query body
    pub fn query(canister_id: Principal, method_name: &str, arg: Vec<u8>, sender: Principal) -> Self {
        Self::method(RequestType::Query, canister_id, method_name, arg, sender)
    }

    /// Read-state body
    pub fn read_state(canister_id: Principal, paths: Vec<Vec<Vec<u8>>>, sender: Principal) -> Self {
        CallContent {
            request_type: RequestType::ReadState,
            canister_id,
            method_name: None,
            arg: None,
            sender,
            ingress_expiry: ingress_expiry_after(INGRESS_EXPIRY),
            nonce: None,
            paths: Some(paths),
        }
    }

    fn method(
        request_type: RequestType,
        canister_id: Principal,
        method_name: &str,
        arg: Vec<u8>,
        sender: Principal,
    ) -> Self {
        CallContent {
            request_type,
            canister_id,
            method_name: Some(method_name.to_string()),
            arg: Some(arg),
            sender,
            ingress_expiry: ingress_expiry_after(INGRESS_EXPIRY),
            nonce: None,
            paths: None,
        }
    }

    /// Set the expiry
    pub fn with_ingress_expiry(mut self, ingress_expiry: u64) -> Self {
        self.ingress_expiry = ingress_expiry;
        self
    }

    /// Fields of the hashed body
    ///
    /// Read-state bodies do not carry a canister id; it only routes the
    /// request.
    pub fn fields(&self) -> Vec<(&'static str, Option<HashValue>)> {
        let canister_id = match self.request_type {
            RequestType::ReadState => None,
            _ => Some(HashValue::Principal(self.canister_id.clone())),
        };
        let paths = self.paths.as_ref().map(|paths| {
            HashValue::List(
                paths
                    .iter()
                    .map(|path| {
                        HashValue::List(path.iter().cloned().map(HashValue::Bytes).collect())
                    })
                    .collect(),
            )
        });

        vec![
            ("request_type", Some(self.request_type.as_str().into())),
            ("canister_id", canister_id),
            ("method_name", self.method_name.clone().map(HashValue::Text)),
            ("arg", self.arg.clone().map(HashValue::Bytes)),
            ("sender", Some(HashValue::Principal(self.sender.clone()))),
            ("ingress_expiry", Some(self.ingress_expiry.into())),
            ("nonce", self.nonce.clone().map(HashValue::Bytes)),
            ("paths", paths),
        ]
    }

    /// Request id of this body
    pub fn request_id(&self) -> BridgeResult<RequestId> {
        request_id_of(self.fields())
    }
}

/// Expiry timestamp `after` from now, in nanoseconds since the epoch
pub fn ingress_expiry_after(after: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from((now + after).as_nanos()).unwrap_or(u64::MAX)
}

/// A request body with the remote signer's signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// Signed body
    pub content: CallContent,
    /// Request id the signature covers
    pub request_id: RequestId,
    /// DER encoded public key of the signer
    pub sender_pubkey: Vec<u8>,
    /// Signature over the domain separator and request id
    pub sender_sig: Vec<u8>,
}

impl SignedEnvelope {
    /// Check the signature against the body and the sender key
    pub fn verify(&self) -> BridgeResult<()> {
        if self.content.request_id()? != self.request_id {
            return Err(BridgeError::encoding("content", "request id mismatch"));
        }
        let public_key = PublicKey::from_bytes(&self.sender_pubkey)?;
        if public_key.principal() != self.content.sender {
            return Err(BridgeError::encoding(
                "content.sender",
                "sender is not owned by the signing key",
            ));
        }
        public_key.verify(&self.request_id.signing_payload(), &self.sender_sig)
    }
}

/// Gatekeeper and signer front for one session grant
///
/// The whitelist is fixed for the lifetime of a delegate; a wider grant
/// produces a new delegate.
#[derive(Clone)]
pub struct AuthorizationDelegate {
    public_key: PublicKey,
    whitelist: BTreeSet<String>,
    rpc: RpcClient,
    registry: InterfaceRegistry,
    timeout_ms: u64,
    pre_approve: bool,
    principal: OnceLock<Principal>,
}

impl AuthorizationDelegate {
    /// Create a delegate for a granted key and whitelist
    pub fn new<I, S>(
        public_key: PublicKey,
        whitelist: I,
        rpc: RpcClient,
        registry: InterfaceRegistry,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AuthorizationDelegate {
            public_key,
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            rpc,
            registry,
            timeout_ms: 0,
            pre_approve: false,
            principal: OnceLock::new(),
        }
    }

    /// Deadline for signing round trips; 0 waits forever
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Mark signing requests as already approved
    pub fn with_pre_approve(mut self, pre_approve: bool) -> Self {
        self.pre_approve = pre_approve;
        self
    }

    /// Signer public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Granted canisters
    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    /// Whether a canister is in the grant
    pub fn is_whitelisted(&self, canister_id: &str) -> bool {
        self.whitelist.contains(canister_id)
    }

    /// Principal of the signer, derived once from the public key
    pub fn get_principal(&self) -> &Principal {
        self.principal.get_or_init(|| self.public_key.principal())
    }

    /// Whitelist gate
    ///
    /// Read-state requests are exempt; everything else must target a
    /// granted canister.
    pub fn authorize(&self, canister_id: &str, request_type: RequestType) -> BridgeResult<()> {
        if request_type == RequestType::ReadState || self.is_whitelisted(canister_id) {
            return Ok(());
        }
        warn!(
            canister_id,
            request_type = request_type.as_str(),
            "refusing request to canister outside whitelist"
        );
        Err(BridgeError::Authorization {
            canister_id: canister_id.to_string(),
        })
    }

    /// Gate, hash and have the remote authority sign a request body
    pub async fn authorize_and_sign(&self, content: CallContent) -> BridgeResult<SignedEnvelope> {
        let canister_id = content.canister_id.to_text();
        self.authorize(&canister_id, content.request_type)?;

        let request_id = content.request_id()?;
        debug!(
            request_id = %&request_id.to_hex()[..16],
            canister_id = %canister_id,
            "requesting signature"
        );

        let sign_info = self.sign_info(&content, canister_id);
        let response = self
            .rpc
            .call_with(
                Command::RequestSign {
                    payload: request_id.signing_payload(),
                    sign_info,
                },
                CallConfig::with_timeout(self.timeout_ms),
            )
            .await?;
        let sender_sig = decode_bytes(&response, "senderSignature")?;

        Ok(SignedEnvelope {
            content,
            request_id,
            sender_pubkey: self.public_key.to_der(),
            sender_sig,
        })
    }

    fn sign_info(&self, content: &CallContent, canister_id: String) -> SignInfo {
        let decoded_arguments = match (&content.method_name, &content.arg) {
            (Some(method), Some(arg)) => self.registry.decode(&canister_id, method, arg),
            _ => None,
        };

        SignInfo {
            method_name: content.method_name.clone(),
            request_type: Some(content.request_type.as_str().to_string()),
            canister_id: Some(canister_id),
            sender: Some(content.sender.to_text()),
            arguments: content.arg.as_deref().map(encode_bytes),
            decoded_arguments,
            pre_approve: self.pre_approve,
        }
    }
}

impl std::fmt::Debug for AuthorizationDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationDelegate")
            .field("public_key", &self.public_key)
            .field("whitelist", &self.whitelist)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ArgDecoder;
    use crate::config::DomainMetadata;
    use crate::transport::memory::{self, DispatchLog, MemoryAuthority, Scripted};
    use crate::transport::TransportError;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;
    use std::sync::Arc;

    const GRANTED: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn delegate(registry: InterfaceRegistry) -> (AuthorizationDelegate, DispatchLog, MemoryAuthority) {
        let (transport, authority) = memory::create_pair();
        let log = transport.dispatch_log();
        let rpc = RpcClient::new(
            Arc::new(transport),
            DomainMetadata::new("https://dapp.test", "Dapp"),
        );
        let public_key = PublicKey::Ed25519(signing_key().verifying_key().to_bytes());
        let delegate = AuthorizationDelegate::new(public_key, [GRANTED], rpc, registry);
        (delegate, log, authority)
    }

    fn signing_authority(cmd: &Command) -> Scripted {
        match cmd {
            Command::RequestSign { payload, .. } => {
                let sig = signing_key().sign(payload);
                json!(sig.to_bytes().to_vec()).into()
            }
            _ => TransportError::InvalidData("unexpected".into()).into(),
        }
    }

    fn granted() -> Principal {
        Principal::from_text(GRANTED).unwrap()
    }

    #[tokio::test]
    async fn test_unlisted_canister_is_refused_without_dispatch() {
        let (delegate, log, authority) = delegate(InterfaceRegistry::default());
        authority.serve(signing_authority);

        let content = CallContent::call(
            Principal::management_canister(),
            "raw_rand",
            vec![],
            delegate.get_principal().clone(),
        );
        let err = delegate.authorize_and_sign(content).await.unwrap_err();

        assert_eq!(
            err,
            BridgeError::Authorization {
                canister_id: "aaaaa-aa".into()
            }
        );
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_read_state_is_exempt_from_whitelist() {
        let (delegate, log, authority) = delegate(InterfaceRegistry::default());
        authority.serve(signing_authority);

        let content = CallContent::read_state(
            Principal::management_canister(),
            vec![vec![b"time".to_vec()]],
            delegate.get_principal().clone(),
        );
        let envelope = delegate.authorize_and_sign(content).await.unwrap();

        envelope.verify().unwrap();
        assert_eq!(log.methods(), vec!["requestSign"]);
    }

    #[tokio::test]
    async fn test_signed_envelope_verifies() {
        let (delegate, log, authority) = delegate(InterfaceRegistry::default());
        authority.serve(signing_authority);

        let content = CallContent::call(
            granted(),
            "transfer",
            b"DIDL\x00\x00".to_vec(),
            delegate.get_principal().clone(),
        );
        let envelope = delegate.authorize_and_sign(content).await.unwrap();

        envelope.verify().unwrap();
        assert_eq!(envelope.sender_pubkey, delegate.public_key().to_der());

        let commands = log.commands();
        let Command::RequestSign { payload, sign_info } = &commands[0] else {
            panic!("expected requestSign");
        };
        assert_eq!(payload, &envelope.request_id.signing_payload());
        assert_eq!(sign_info.canister_id.as_deref(), Some(GRANTED));
        assert_eq!(sign_info.request_type.as_deref(), Some("call"));
        assert_eq!(sign_info.arguments.as_deref(), Some("RElETAAA"));
        assert!(sign_info.decoded_arguments.is_none());
    }

    #[tokio::test]
    async fn test_tampered_envelope_fails_verification() {
        let (delegate, _log, authority) = delegate(InterfaceRegistry::default());
        authority.serve(signing_authority);

        let content =
            CallContent::call(granted(), "transfer", vec![1], delegate.get_principal().clone());
        let mut envelope = delegate.authorize_and_sign(content).await.unwrap();
        envelope.content.arg = Some(vec![2]);

        assert!(envelope.verify().is_err());
    }

    #[tokio::test]
    async fn test_declined_signature_is_user_rejection() {
        let (delegate, _log, authority) = delegate(InterfaceRegistry::default());
        authority.serve(|_| {
            TransportError::Remote {
                code: 4001,
                message: "declined".into(),
            }
            .into()
        });

        let content = CallContent::call(granted(), "transfer", vec![], delegate.get_principal().clone());
        let err = delegate.authorize_and_sign(content).await.unwrap_err();
        assert!(err.is_user_rejection());
    }

    #[tokio::test]
    async fn test_registered_interface_decodes_arguments() {
        struct Echo;
        impl ArgDecoder for Echo {
            fn decode_args(&self, method_name: &str, arg: &[u8]) -> Option<Value> {
                Some(json!({"method": method_name, "len": arg.len()}))
            }
        }

        let registry = InterfaceRegistry::default();
        registry.register(GRANTED, Arc::new(Echo));
        let (delegate, log, authority) = delegate(registry);
        authority.serve(signing_authority);

        let content =
            CallContent::call(granted(), "transfer", vec![0; 3], delegate.get_principal().clone());
        delegate.authorize_and_sign(content).await.unwrap();

        let commands = log.commands();
        let Command::RequestSign { sign_info, .. } = &commands[0] else {
            panic!("expected requestSign");
        };
        assert_eq!(
            sign_info.decoded_arguments,
            Some(json!({"method": "transfer", "len": 3}))
        );
    }

    #[test]
    fn test_principal_is_cached_and_key_derived() {
        let (delegate, log, _authority) = delegate(InterfaceRegistry::default());
        let first = delegate.get_principal().clone();
        assert_eq!(&first, delegate.get_principal());
        assert_eq!(first, delegate.public_key().principal());
        assert!(log.is_empty());
    }

    #[test]
    fn test_sign_info_skips_absent_fields() {
        let info = SignInfo {
            method_name: Some("greet".into()),
            ..SignInfo::default()
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"methodName": "greet", "preApprove": false})
        );
    }

    #[test]
    fn test_read_state_body_omits_canister_id() {
        let sender = Principal::anonymous();
        let a = CallContent::read_state(granted(), vec![], sender.clone()).with_ingress_expiry(1);
        let b = CallContent::read_state(Principal::management_canister(), vec![], sender)
            .with_ingress_expiry(1);
        assert_eq!(a.request_id().unwrap(), b.request_id().unwrap());
    }
}
