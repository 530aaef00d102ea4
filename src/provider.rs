//! Wallet provider facade
//!
//! What a dapp talks to. Owns the authority client, the session manager
//! and the registered canister interfaces, and forwards wallet features
//! (balances, transfers, ICNS) that need no local logic beyond shaping
//! their parameters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::agent::{ArgDecoder, BridgeAgent, InterfaceRegistry};
use crate::batch::{BatchExecutor, BatchOutcome, Transaction};
use crate::config::BridgeConfig;
use crate::crypto::{AccountId, Principal, PublicKey};
use crate::error::{BridgeError, BridgeResult};
use crate::session::{ConnectParams, Session, SessionManager};
use crate::transport::{decode_bytes, Command, RpcClient, Transport};

/// Wallet extension version this provider speaks to
pub const EXTENSION_VERSION: &str = "0.4.5";

/// Provider and extension versions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Versions {
    /// This crate
    pub provider: &'static str,
    /// Wallet extension
    pub extension: &'static str,
}

/// Creation time of a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStamp {
    /// Nanoseconds since the epoch
    pub timestamp_nanos: u64,
}

/// Transfer options, amounts in e8s
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOpts {
    /// Fee
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    /// Memo
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<u64>,
    /// Subaccount to send from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_subaccount: Option<u32>,
    /// Creation time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_time: Option<TimeStamp>,
}

/// ICP transfer, amount in e8s
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransferParams {
    /// Recipient principal or account id
    pub to: String,
    /// Amount
    pub amount: u64,
    /// Options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opts: Option<SendOpts>,
}

/// XTC burn into a canister's cycles
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBurnXtcParams {
    /// Canister receiving the cycles
    pub to: String,
    /// Amount
    pub amount: u64,
}

/// Token to add to the wallet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTokenParams {
    /// Token canister
    pub canister_id: String,
    /// Token standard, such as `DIP20` or `EXT`
    pub standard: String,
    /// Logo url
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
}

/// ICNS names of the session principal
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcnsInfo {
    /// Owned names
    #[serde(default)]
    pub names: Vec<String>,
    /// Name the principal resolves to
    #[serde(default)]
    pub reverse_resolved_name: Option<String>,
}

/// The dapp-facing provider
pub struct Provider {
    rpc: RpcClient,
    sessions: SessionManager,
    registry: InterfaceRegistry,
    config: BridgeConfig,
}

impl Provider {
    /// Provider over a transport to the authority
    pub fn new(transport: Arc<dyn Transport>, config: BridgeConfig) -> Self {
        let rpc = RpcClient::new(transport, config.metadata.clone());
        let registry = InterfaceRegistry::default();
        let sessions = SessionManager::new(rpc.clone(), registry.clone());
        Provider {
            rpc,
            sessions,
            registry,
            config,
        }
    }

    /// Start the transport and resume an existing grant
    pub async fn init(&self) -> BridgeResult<Option<Arc<Session>>> {
        self.rpc.start().await?;
        if !self.is_connected().await? {
            return Ok(None);
        }
        self.sessions.get_connection_data().await
    }

    /// Session manager
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Current session, if any
    pub fn session(&self) -> Option<Arc<Session>> {
        self.sessions.current()
    }

    /// Provider and extension versions
    pub fn versions(&self) -> Versions {
        Versions {
            provider: env!("CARGO_PKG_VERSION"),
            extension: EXTENSION_VERSION,
        }
    }

    /// Whether the site holds a grant
    pub async fn is_connected(&self) -> BridgeResult<bool> {
        let answer = self
            .rpc
            .call(Command::IsConnected {
                url: self.config.metadata.url.clone(),
            })
            .await?;
        Ok(answer.as_bool().unwrap_or(false))
    }

    /// Ask the user to connect; `None` uses the configured parameters
    pub async fn request_connect(&self, params: Option<ConnectParams>) -> BridgeResult<PublicKey> {
        let params = params.unwrap_or_else(|| ConnectParams::from(&self.config));
        self.sessions.request_connect(params).await
    }

    /// Revoke the grant
    pub async fn disconnect(&self) -> BridgeResult<()> {
        self.sessions.disconnect().await
    }

    /// Principal of the user
    ///
    /// Local when a session exists; otherwise asked of the authority.
    pub async fn get_principal(&self) -> BridgeResult<Principal> {
        if let Some(session) = self.sessions.current() {
            return Ok(session.principal.clone());
        }
        let answer = self
            .rpc
            .call(Command::GetPrincipal {
                url: self.config.metadata.url.clone(),
            })
            .await?;
        match answer.as_str() {
            Some(text) => Principal::from_text(text),
            None => Err(BridgeError::encoding("principal", "expected principal text")),
        }
    }

    /// Agent whose grant covers `whitelist`
    pub async fn create_agent<I, S>(&self, whitelist: I) -> BridgeResult<BridgeAgent>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.sessions.current().is_none() {
            self.sessions.get_connection_data().await?;
        }
        let session = self.sessions.extend_whitelist(whitelist).await?;
        Ok(session.agent.clone())
    }

    /// Register the interface of a canister
    pub fn register_interface<D>(&self, canister_id: impl Into<String>, interface: Arc<D>)
    where
        D: ArgDecoder + 'static,
    {
        self.registry.register(canister_id, interface);
    }

    /// Approve and run a batch
    pub async fn batch_transactions(
        &self,
        transactions: Vec<Transaction>,
    ) -> BridgeResult<BatchOutcome> {
        BatchExecutor::new(&self.sessions, &self.rpc)
            .execute(transactions)
            .await
    }

    /// Token balances of an account
    ///
    /// Raw `value` fields are dropped; the formatted amounts remain.
    pub async fn request_balance(&self, subaccount: Option<u32>) -> BridgeResult<Vec<Value>> {
        let answer = self
            .rpc
            .call(Command::RequestBalance {
                metadata: self.config.metadata.clone(),
                subaccount,
            })
            .await?;
        let Value::Array(balances) = answer else {
            return Err(BridgeError::encoding("balances", "expected a list"));
        };
        Ok(balances
            .into_iter()
            .map(|mut balance| {
                if let Some(fields) = balance.as_object_mut() {
                    fields.remove("value");
                }
                balance
            })
            .collect())
    }

    /// Ask the user to approve an ICP transfer
    pub async fn request_transfer(&self, params: RequestTransferParams) -> BridgeResult<Value> {
        if Principal::from_text(&params.to).is_err() && !AccountId::validate_hex(&params.to) {
            return Err(BridgeError::encoding(
                "to",
                "neither a principal nor an account id",
            ));
        }
        info!(amount = params.amount, "requesting transfer");
        self.rpc
            .call(Command::RequestTransfer {
                metadata: self.config.metadata.clone(),
                params: serde_json::to_value(params)?,
            })
            .await
    }

    /// Ask the user to burn XTC into a canister's cycles
    pub async fn request_burn_xtc(&self, params: RequestBurnXtcParams) -> BridgeResult<Value> {
        Principal::from_text(&params.to)?;
        self.rpc
            .call(Command::RequestBurnXtc {
                metadata: self.config.metadata.clone(),
                params: serde_json::to_value(params)?,
            })
            .await
    }

    /// ICNS names of the user
    pub async fn get_icns_info(&self) -> BridgeResult<IcnsInfo> {
        let answer = self
            .rpc
            .call(Command::GetIcnsInfo {
                metadata: self.config.metadata.clone(),
            })
            .await?;
        if answer.is_null() {
            return Ok(IcnsInfo::default());
        }
        serde_json::from_value(answer).map_err(|e| BridgeError::encoding("icns", e.to_string()))
    }

    /// Ask the user to add a token to the wallet
    pub async fn request_import_token(&self, params: ImportTokenParams) -> BridgeResult<Value> {
        Principal::from_text(&params.canister_id)?;
        self.rpc
            .call(Command::RequestImportToken {
                metadata: self.config.metadata.clone(),
                params: serde_json::to_value(params)?,
            })
            .await
    }

    /// Ask the user to sign an arbitrary message
    pub async fn request_sign_message(&self, message: &[u8]) -> BridgeResult<Vec<u8>> {
        let answer = self
            .rpc
            .call(Command::RequestSignMessage {
                metadata: self.config.metadata.clone(),
                message: message.to_vec(),
            })
            .await?;
        decode_bytes(&answer, "signature")
    }
}
