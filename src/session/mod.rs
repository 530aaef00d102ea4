//! Session lifecycle
//!
//! The [`SessionManager`] is the single owner of the current
//! [`Connection`] and [`Session`]. Each transition builds a fresh session
//! value and swaps it in whole; readers get an `Arc` snapshot that never
//! changes underneath them.
//!
//! ```text
//! Disconnected ──request_connect──▶ Connecting ──▶ Connected
//!      ▲                                             │   │
//!      └──────────────── disconnect ─────────────────┘   │
//!                                   update_connection ───▶ Reconnecting
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::{BridgeAgent, InterfaceRegistry};
use crate::auth::AuthorizationDelegate;
use crate::config::{BridgeConfig, DEFAULT_HOST, DEFAULT_TIMEOUT_MS};
use crate::crypto::{AccountId, Principal, PublicKey};
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{decode_bytes, Command, RpcClient};

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No grant
    Disconnected,
    /// Approval requested
    Connecting,
    /// Session established
    Connected,
    /// Refreshing after an out-of-band change
    Reconnecting,
}

/// Parameters of a granted connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Network host
    pub host: String,
    /// Granted canisters
    pub whitelist: BTreeSet<String>,
    /// Approval timeout
    pub timeout_ms: u64,
    /// Signer public key
    pub public_key: PublicKey,
}

/// Identity and agent of an established connection
#[derive(Clone, Debug)]
pub struct Session {
    /// Principal of the signer
    pub principal: Principal,
    /// Default ledger account of the principal
    pub account_id: AccountId,
    /// Agent bound to the grant
    pub agent: BridgeAgent,
    /// Grant the session was derived from
    pub connection: Connection,
}

/// Connect request parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    /// Canisters to request
    pub whitelist: Vec<String>,
    /// Network host
    pub host: String,
    /// Approval timeout; 0 waits forever
    pub timeout_ms: u64,
}

impl Default for ConnectParams {
    fn default() -> Self {
        ConnectParams {
            whitelist: Vec::new(),
            host: DEFAULT_HOST.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl From<&BridgeConfig> for ConnectParams {
    fn from(config: &BridgeConfig) -> Self {
        ConnectParams {
            whitelist: config.whitelist.clone(),
            host: config.host.clone(),
            timeout_ms: config.timeout_ms,
        }
    }
}

/// Host callbacks for session changes
///
/// Registered explicitly with [`SessionManager::subscribe`].
pub trait SessionObserver: Send + Sync {
    /// A new session was installed, or the session was cleared
    fn on_session_changed(&self, _session: Option<&Session>) {}

    /// A reactive refresh failed
    fn on_refresh_failed(&self, _error: &BridgeError) {}
}

/// Grant as reported by `getConnectionData`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantedConnection {
    #[serde(default)]
    public_key: Option<Value>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

struct State {
    status: SessionStatus,
    session: Option<Arc<Session>>,
    /// Bumped each time the session is installed or cleared
    generation: u64,
}

/// Owner of the connection and session
pub struct SessionManager {
    rpc: RpcClient,
    registry: InterfaceRegistry,
    state: RwLock<State>,
    connect_lock: tokio::sync::Mutex<()>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

/// Parse the public key an authority grants
///
/// Hex text is the usual form; raw byte arrays are accepted too.
pub fn parse_public_key(value: &Value) -> BridgeResult<PublicKey> {
    match value {
        Value::String(hex) => PublicKey::from_hex(hex),
        Value::Object(fields) if fields.contains_key("publicKey") => {
            parse_public_key(&fields["publicKey"])
        }
        Value::Null | Value::Bool(_) => Err(BridgeError::encoding("publicKey", "no key granted")),
        other => PublicKey::from_bytes(&decode_bytes(other, "publicKey")?),
    }
}

impl SessionManager {
    /// Create a manager with no session
    pub fn new(rpc: RpcClient, registry: InterfaceRegistry) -> Self {
        SessionManager {
            rpc,
            registry,
            state: RwLock::new(State {
                status: SessionStatus::Disconnected,
                session: None,
                generation: 0,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.read_state().status
    }

    /// Current session, if any
    pub fn current(&self) -> Option<Arc<Session>> {
        self.read_state().session.clone()
    }

    /// Current session, or a state error
    pub fn require_session(&self) -> BridgeResult<Arc<Session>> {
        self.current()
            .ok_or_else(|| BridgeError::State("no established session".to_string()))
    }

    /// Resume an already granted connection without prompting
    ///
    /// Fails with a state error when the session is replaced or cleared
    /// while the authority is answering.
    pub async fn get_connection_data(&self) -> BridgeResult<Option<Arc<Session>>> {
        let generation = self.generation();
        self.resume(generation).await
    }

    async fn resume(&self, generation: u64) -> BridgeResult<Option<Arc<Session>>> {
        let url = self.rpc.metadata().url.clone();
        let answer = self.rpc.call(Command::GetConnectionData { url }).await?;
        if answer.is_null() {
            debug!("no granted connection to resume");
            return Ok(None);
        }

        let granted: GrantedConnection = serde_json::from_value(answer)
            .map_err(|e| BridgeError::encoding("connection", e.to_string()))?;
        let Some(public_key) = granted.public_key.as_ref() else {
            debug!("no granted connection to resume");
            return Ok(None);
        };

        let connection = Connection {
            host: granted.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            whitelist: granted.whitelist.into_iter().collect(),
            timeout_ms: granted.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            public_key: parse_public_key(public_key)?,
        };
        self.install(connection, Some(generation)).map(Some)
    }

    /// Ask the user to connect
    ///
    /// Replaces the connection wholesale, including its whitelist.
    /// Concurrent calls are serialised.
    pub async fn request_connect(&self, params: ConnectParams) -> BridgeResult<PublicKey> {
        let _guard = self.connect_lock.lock().await;
        let generation = self.generation();
        let previous = self.set_status(SessionStatus::Connecting);

        info!(canisters = params.whitelist.len(), host = %params.host, "requesting connection");
        let answer = self
            .rpc
            .call(Command::RequestConnect {
                metadata: self.rpc.metadata().clone(),
                whitelist: params.whitelist.clone(),
                timeout_ms: params.timeout_ms,
            })
            .await;

        let public_key = match answer.and_then(|value| parse_public_key(&value)) {
            Ok(key) => key,
            Err(e) => {
                self.restore_status(generation, previous);
                return Err(e);
            }
        };

        self.install(
            Connection {
                host: params.host,
                whitelist: params.whitelist.into_iter().collect(),
                timeout_ms: params.timeout_ms,
                public_key,
            },
            None,
        )?;
        Ok(public_key)
    }

    /// Revoke the grant and clear the session
    ///
    /// The local session is cleared even when the authority cannot be
    /// reached.
    pub async fn disconnect(&self) -> BridgeResult<()> {
        let url = self.rpc.metadata().url.clone();
        let result = self.rpc.call(Command::Disconnect { url }).await;

        {
            let mut state = self.write_state();
            state.session = None;
            state.status = SessionStatus::Disconnected;
            state.generation += 1;
        }
        info!("session cleared");
        self.notify_changed(None);

        result.map(|_| ())
    }

    /// Refresh after the authority changed state out of band
    ///
    /// Never fails; errors go to the observers.
    pub async fn update_connection(&self) {
        let generation = self.generation();
        let previous = self.set_status(SessionStatus::Reconnecting);

        let result = self.resume(generation).await;
        if self.generation() != generation {
            debug!("session changed during refresh, result dropped");
            return;
        }

        match result {
            Ok(Some(_)) => {}
            Ok(None) => {
                let had_session = {
                    let mut state = self.write_state();
                    if state.generation != generation {
                        return;
                    }
                    state.generation += 1;
                    state.status = SessionStatus::Disconnected;
                    state.session.take().is_some()
                };
                if had_session {
                    info!("grant revoked out of band");
                    self.notify_changed(None);
                }
            }
            Err(e) => {
                warn!(error = %e, "session refresh failed");
                self.restore_status(generation, previous);
                for observer in self.observers() {
                    observer.on_refresh_failed(&e);
                }
            }
        }
    }

    /// Widen the grant to cover more canisters
    ///
    /// The whitelist becomes the union of the current grant and
    /// `canisters`; nothing is asked when it already covers them. A
    /// grant answered after the session was replaced or cleared is
    /// dropped with a state error.
    pub async fn extend_whitelist<I, S>(&self, canisters: I) -> BridgeResult<Arc<Session>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (session, generation) = {
            let state = self.read_state();
            let session = state
                .session
                .clone()
                .ok_or_else(|| BridgeError::State("no established session".to_string()))?;
            (session, state.generation)
        };
        let mut whitelist = session.connection.whitelist.clone();
        let before = whitelist.len();
        whitelist.extend(canisters.into_iter().map(Into::into));
        if whitelist.len() == before {
            return Ok(session);
        }

        debug!(canisters = whitelist.len(), "widening whitelist");
        let answer = self
            .rpc
            .call(Command::VerifyWhitelist {
                metadata: self.rpc.metadata().clone(),
                whitelist: whitelist.iter().cloned().collect(),
            })
            .await?;
        let public_key = parse_public_key(&answer)?;

        self.install(
            Connection {
                whitelist,
                public_key,
                ..session.connection.clone()
            },
            Some(generation),
        )
    }

    /// Swap in a session derived from `connection`
    ///
    /// With `expected`, the swap only happens if no other transition
    /// landed since that generation was read.
    fn install(&self, connection: Connection, expected: Option<u64>) -> BridgeResult<Arc<Session>> {
        let session = Arc::new(self.derive_session(connection));
        {
            let mut state = self.write_state();
            if expected.is_some_and(|generation| generation != state.generation) {
                warn!("session changed while awaiting the authority, grant dropped");
                return Err(BridgeError::State(
                    "session changed while the request was in flight".to_string(),
                ));
            }
            state.generation += 1;
            state.session = Some(session.clone());
            state.status = SessionStatus::Connected;
        }
        info!(principal = %session.principal, "session established");
        self.notify_changed(Some(&session));
        Ok(session)
    }

    fn derive_session(&self, connection: Connection) -> Session {
        let delegate = AuthorizationDelegate::new(
            connection.public_key,
            connection.whitelist.iter().cloned(),
            self.rpc.clone(),
            self.registry.clone(),
        )
        .with_timeout(connection.timeout_ms);
        let principal = delegate.get_principal().clone();
        let account_id = AccountId::from_principal(&principal, 0);
        let agent = BridgeAgent::new(
            self.rpc.clone(),
            delegate,
            self.registry.clone(),
            connection.host.clone(),
        )
        .with_timeout(connection.timeout_ms);

        Session {
            principal,
            account_id,
            agent,
            connection,
        }
    }

    fn set_status(&self, status: SessionStatus) -> SessionStatus {
        std::mem::replace(&mut self.write_state().status, status)
    }

    fn restore_status(&self, generation: u64, status: SessionStatus) {
        let mut state = self.write_state();
        if state.generation == generation {
            state.status = status;
        }
    }

    fn generation(&self) -> u64 {
        self.read_state().generation
    }

    fn notify_changed(&self, session: Option<&Session>) {
        for observer in self.observers() {
            observer.on_session_changed(session);
        }
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainMetadata;
    use crate::transport::memory::{self, DispatchLog, MemoryAuthority, Scripted};
    use crate::transport::TransportError;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const A: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";
    const B: &str = "qoctq-giaaa-aaaaa-aaaea-cai";
    const C: &str = "rrkah-fqaaa-aaaaa-aaaaq-cai";

    fn key_hex() -> String {
        hex::encode([3u8; 32])
    }

    fn manager() -> (Arc<SessionManager>, DispatchLog, MemoryAuthority) {
        let (transport, authority) = memory::create_pair();
        let log = transport.dispatch_log();
        let rpc = RpcClient::new(
            Arc::new(transport),
            DomainMetadata::new("https://dapp.test", "Dapp"),
        );
        let manager = SessionManager::new(rpc, InterfaceRegistry::default());
        (Arc::new(manager), log, authority)
    }

    fn granting(cmd: &Command) -> Scripted {
        match cmd {
            Command::RequestConnect { .. } | Command::VerifyWhitelist { .. } => {
                json!(key_hex()).into()
            }
            Command::Disconnect { .. } => json!(null).into(),
            _ => TransportError::InvalidData("unexpected".into()).into(),
        }
    }

    fn params(whitelist: &[&str]) -> ConnectParams {
        ConnectParams {
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            host: "https://testhost".into(),
            timeout_ms: 0,
        }
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<Option<Principal>>>,
        failures: Mutex<Vec<BridgeError>>,
    }

    impl SessionObserver for Recorder {
        fn on_session_changed(&self, session: Option<&Session>) {
            self.changes
                .lock()
                .unwrap()
                .push(session.map(|s| s.principal.clone()));
        }

        fn on_refresh_failed(&self, error: &BridgeError) {
            self.failures.lock().unwrap().push(error.clone());
        }
    }

    #[tokio::test]
    async fn test_connect_derives_principal_from_key_alone() {
        let (manager, log, authority) = manager();
        authority.serve(granting);

        let key = manager.request_connect(params(&["aaaaa-aa"])).await.unwrap();
        let session = manager.require_session().unwrap();

        assert_eq!(key, PublicKey::from_hex(&key_hex()).unwrap());
        assert_eq!(session.principal, key.principal());
        assert_eq!(session.agent.get_principal(), &key.principal());
        assert_eq!(session.account_id, AccountId::from_principal(&key.principal(), 0));
        assert_eq!(session.connection.host, "https://testhost");
        assert_eq!(manager.status(), SessionStatus::Connected);
        assert_eq!(log.methods(), vec!["requestConnect"]);
    }

    #[tokio::test]
    async fn test_whitelist_grows_by_union() {
        let (manager, log, authority) = manager();
        authority.serve(granting);

        manager.request_connect(params(&[A, B])).await.unwrap();
        let session = manager.extend_whitelist([B, C]).await.unwrap();

        let expected: BTreeSet<String> = [A, B, C].iter().map(|s| s.to_string()).collect();
        assert!(session.connection.whitelist.is_superset(&expected));
        assert!(session.agent.delegate().is_whitelisted(C));

        let commands = log.commands();
        let Command::VerifyWhitelist { whitelist, .. } = &commands[1] else {
            panic!("expected verifyWhitelist");
        };
        assert_eq!(whitelist.len(), 3);
    }

    #[tokio::test]
    async fn test_covered_whitelist_asks_nothing() {
        let (manager, log, authority) = manager();
        authority.serve(granting);

        manager.request_connect(params(&[A, B])).await.unwrap();
        manager.extend_whitelist([A]).await.unwrap();
        assert_eq!(log.methods(), vec!["requestConnect"]);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_whitelist() {
        let (manager, _log, authority) = manager();
        authority.serve(granting);

        manager.request_connect(params(&[A, B])).await.unwrap();
        manager.request_connect(params(&[C])).await.unwrap();

        let session = manager.require_session().unwrap();
        assert_eq!(session.connection.whitelist.len(), 1);
        assert!(session.connection.whitelist.contains(C));
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let (manager, _log, authority) = manager();
        authority.serve(granting);
        let recorder = Arc::new(Recorder::default());
        manager.subscribe(recorder.clone());

        manager.request_connect(params(&[A])).await.unwrap();
        manager.disconnect().await.unwrap();

        assert_eq!(manager.status(), SessionStatus::Disconnected);
        assert!(matches!(
            manager.require_session(),
            Err(BridgeError::State(_))
        ));
        let changes = recorder.changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[1].is_none());
    }

    #[tokio::test]
    async fn test_rejected_connect_keeps_prior_state() {
        let (manager, _log, authority) = manager();
        authority.serve(|_| {
            TransportError::Remote {
                code: 4001,
                message: "declined".into(),
            }
            .into()
        });

        let err = manager.request_connect(params(&[A])).await.unwrap_err();
        assert!(err.is_user_rejection());
        assert_eq!(manager.status(), SessionStatus::Disconnected);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_resume_granted_connection() {
        let (manager, log, authority) = manager();
        authority.serve(|cmd| match cmd {
            Command::GetConnectionData { url } if url == "https://dapp.test" => json!({
                "publicKey": key_hex(),
                "host": "https://testhost",
                "whitelist": [A],
                "timeout": 5000
            })
            .into(),
            _ => json!(null).into(),
        });

        let session = manager.get_connection_data().await.unwrap().unwrap();
        assert_eq!(session.connection.timeout_ms, 5000);
        assert!(session.connection.whitelist.contains(A));
        assert_eq!(log.methods(), vec!["getConnectionData"]);
    }

    #[tokio::test]
    async fn test_no_grant_to_resume() {
        let (manager, _log, authority) = manager();
        authority.serve(|_| json!(null).into());

        assert!(manager.get_connection_data().await.unwrap().is_none());
        assert_eq!(manager.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_refresh_failure_reaches_observer() {
        let (manager, _log, authority) = manager();
        authority.serve(|_| TransportError::Disconnected.into());
        let recorder = Arc::new(Recorder::default());
        manager.subscribe(recorder.clone());

        manager.update_connection().await;

        assert_eq!(manager.status(), SessionStatus::Disconnected);
        assert_eq!(recorder.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_drops_revoked_grant() {
        let (manager, _log, authority) = manager();
        authority.serve(|cmd| match cmd {
            Command::RequestConnect { .. } => json!(key_hex()).into(),
            _ => json!(null).into(),
        });

        manager.request_connect(params(&[A])).await.unwrap();
        manager.update_connection().await;

        assert!(manager.current().is_none());
        assert_eq!(manager.status(), SessionStatus::Disconnected);
    }

    fn slow_widening(cmd: &Command) -> Scripted {
        match cmd {
            Command::VerifyWhitelist { .. } => {
                Scripted::Delayed(Duration::from_millis(100), Ok(json!(key_hex())))
            }
            other => granting(other),
        }
    }

    #[tokio::test]
    async fn test_widening_answered_after_disconnect_is_dropped() {
        let (manager, _log, authority) = manager();
        authority.serve(slow_widening);

        manager.request_connect(params(&["aaaaa-aa"])).await.unwrap();
        let widening = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.extend_whitelist([A]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.disconnect().await.unwrap();

        let result = widening.await.unwrap();
        assert!(matches!(result, Err(BridgeError::State(_))));
        assert_eq!(manager.status(), SessionStatus::Disconnected);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_widening_answered_after_reconnect_keeps_new_grant() {
        let (manager, _log, authority) = manager();
        authority.serve(slow_widening);

        manager.request_connect(params(&["aaaaa-aa"])).await.unwrap();
        let widening = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.extend_whitelist([A]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.request_connect(params(&[C])).await.unwrap();

        let result = widening.await.unwrap();
        assert!(matches!(result, Err(BridgeError::State(_))));

        let session = manager.require_session().unwrap();
        let expected: BTreeSet<String> = [C.to_string()].into_iter().collect();
        assert_eq!(session.connection.whitelist, expected);
        assert_eq!(manager.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_refresh_answered_after_disconnect_is_dropped() {
        let (manager, _log, authority) = manager();
        authority.serve(|cmd| match cmd {
            Command::GetConnectionData { .. } => Scripted::Delayed(
                Duration::from_millis(100),
                Ok(json!({ "publicKey": key_hex(), "whitelist": [A] })),
            ),
            other => granting(other),
        });
        let recorder = Arc::new(Recorder::default());
        manager.subscribe(recorder.clone());

        manager.request_connect(params(&[A])).await.unwrap();
        let refresh = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.update_connection().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.disconnect().await.unwrap();
        refresh.await.unwrap();

        assert!(manager.current().is_none());
        assert_eq!(manager.status(), SessionStatus::Disconnected);
        assert!(recorder.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_serialised() {
        let (manager, log, authority) = manager();
        let mut first = true;
        authority.serve(move |_| {
            if std::mem::take(&mut first) {
                Scripted::Hang
            } else {
                json!(key_hex()).into()
            }
        });

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request_connect(params(&[A])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second =
            tokio::time::timeout(Duration::from_millis(50), manager.request_connect(params(&[B])))
                .await;
        assert!(second.is_err());
        assert_eq!(log.methods(), vec!["requestConnect"]);
        assert_eq!(manager.status(), SessionStatus::Connecting);
        pending.abort();
    }
}
