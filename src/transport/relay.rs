//! Pairing relay transport for a mobile wallet
//!
//! The dapp opens a topic on a relay server and shows a pairing URI
//! (usually as a QR code). The wallet scans it, joins the topic, and from
//! then on both sides exchange JSON-RPC frames sealed with the key from
//! the URI. The relay only ever sees ciphertext.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{CallConfig, Command, Transport, TransportError, TransportResult};
use crate::crypto::{Cipher, SymKey};

/// Scheme of pairing URIs
pub const PAIRING_SCHEME: &str = "plug-bridge";

/// Wallet-side method that answers whether a whitelist is already granted
pub const ALL_WHITELISTED_METHOD: &str = "allWhiteListed";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<TransportResult<Value>>>>>;

/// Frames exchanged with the relay server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum RelayFrame {
    /// Open a new pairing topic
    CreateTopic,
    /// Topic opened
    TopicCreated { topic: String },
    /// Join an existing topic
    JoinTopic { topic: String },
    /// Joined a topic
    Joined { topic: String, peer_count: usize },
    /// The other side joined
    PeerJoined,
    /// The other side left
    PeerLeft,
    /// Publish a sealed payload to the other side
    Publish { data: String },
    /// Sealed payload from the other side
    Message { data: String },
    /// Relay error
    Error { message: String },
    /// Keepalive
    Ping,
    /// Keepalive response
    Pong,
}

/// JSON-RPC request carried inside a sealed frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequestFrame {
    /// Correlation id
    pub id: u64,
    /// Protocol version, always "2.0"
    pub jsonrpc: String,
    /// Wallet method
    pub method: String,
    /// Positional params
    pub params: Vec<Value>,
}

/// JSON-RPC error body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
}

/// JSON-RPC response carried inside a sealed frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponseFrame {
    /// Correlation id of the request
    pub id: u64,
    /// Result on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponseFrame {
    fn into_result(self) -> TransportResult<Value> {
        match self.error {
            Some(err) => Err(TransportError::Remote {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Everything a wallet needs to join a pairing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    /// Relay topic
    pub topic: String,
    /// Relay server url
    pub relay_url: String,
    /// Frame sealing key
    pub key: SymKey,
}

impl PairingUri {
    /// Format as `plug-bridge:<topic>?relay=<url>&key=<hex>`
    pub fn to_uri(&self) -> String {
        format!(
            "{PAIRING_SCHEME}:{}?relay={}&key={}",
            self.topic,
            self.relay_url,
            self.key.to_hex()
        )
    }

    /// Parse a pairing URI
    pub fn parse(uri: &str) -> TransportResult<Self> {
        let invalid = |reason: &str| TransportError::InvalidData(format!("pairing uri: {reason}"));

        let rest = uri
            .strip_prefix(PAIRING_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| invalid("wrong scheme"))?;
        let (topic, query) = rest.split_once('?').ok_or_else(|| invalid("missing query"))?;
        if topic.is_empty() {
            return Err(invalid("missing topic"));
        }

        let mut relay_url = None;
        let mut key = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("relay", v)) => relay_url = Some(v.to_string()),
                Some(("key", v)) => {
                    key = Some(SymKey::from_hex(v).map_err(|e| invalid(&e.to_string()))?)
                }
                _ => {}
            }
        }

        Ok(PairingUri {
            topic: topic.to_string(),
            relay_url: relay_url.ok_or_else(|| invalid("missing relay"))?,
            key: key.ok_or_else(|| invalid("missing key"))?,
        })
    }

    /// Seal a JSON-RPC message for publishing
    pub fn seal<T: Serialize>(&self, message: &T) -> TransportResult<String> {
        let json =
            serde_json::to_vec(message).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let sealed = Cipher::seal(&self.key, &json, self.topic.as_bytes())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(BASE64.encode(sealed))
    }

    /// Open a published JSON-RPC message
    pub fn open<T: for<'de> Deserialize<'de>>(&self, data: &str) -> TransportResult<T> {
        let sealed = BASE64
            .decode(data)
            .map_err(|e| TransportError::InvalidData(e.to_string()))?;
        let json = Cipher::open(&self.key, &sealed, self.topic.as_bytes())
            .map_err(|e| TransportError::InvalidData(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| TransportError::InvalidData(e.to_string()))
    }
}

/// Transport to a wallet paired through a relay server
pub struct RelayTransport {
    pairing: PairingUri,
    /// Socket until `start` hands it to the reader task
    handshake: Mutex<Option<WsStream>>,
    writer: Arc<Mutex<Option<SplitSink<WsStream, Message>>>>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    peer_connected: Arc<AtomicBool>,
}

impl RelayTransport {
    /// Connect to a relay server and open a pairing topic
    pub async fn pair(relay_url: &str) -> TransportResult<Self> {
        let (mut ws, _) = connect_async(relay_url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        send_frame(&mut ws, &RelayFrame::CreateTopic).await?;
        let topic = loop {
            match receive_frame(&mut ws).await? {
                RelayFrame::TopicCreated { topic } => break topic,
                RelayFrame::Error { message } => {
                    return Err(TransportError::ConnectionFailed(message))
                }
                _ => continue,
            }
        };
        info!(%topic, "pairing topic opened");

        Ok(RelayTransport {
            pairing: PairingUri {
                topic,
                relay_url: relay_url.to_string(),
                key: SymKey::generate(),
            },
            handshake: Mutex::new(Some(ws)),
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(true)),
            peer_connected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pairing details to show the wallet
    pub fn pairing(&self) -> &PairingUri {
        &self.pairing
    }

    /// Wait until the wallet joins the topic
    ///
    /// Must be called before [`Transport::start`].
    pub async fn wait_for_wallet(&self) -> TransportResult<()> {
        if self.peer_connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut guard = self.handshake.lock().await;
        let ws = guard.as_mut().ok_or(TransportError::Disconnected)?;
        loop {
            match receive_frame(ws).await? {
                RelayFrame::PeerJoined => {
                    self.peer_connected.store(true, Ordering::Release);
                    info!(topic = %self.pairing.topic, "wallet joined pairing");
                    return Ok(());
                }
                RelayFrame::Error { message } => {
                    return Err(TransportError::ConnectionFailed(message))
                }
                _ => continue,
            }
        }
    }

    /// Whether both the relay socket and the wallet are present
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.peer_connected.load(Ordering::Acquire)
    }

    /// Send one JSON-RPC request and wait for its response
    ///
    /// Fails with `Disconnected` while no wallet is in the topic.
    async fn request(&self, method: &str, params: Vec<Value>) -> TransportResult<Value> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RpcRequestFrame {
            id,
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        let data = self.pairing.seal(&frame)?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _entry = PendingEntry {
            pending: self.pending.clone(),
            id,
        };
        // The wallet may have left between the check and the insert
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => send_frame(sink, &RelayFrame::Publish { data }).await,
                None => Err(TransportError::Disconnected),
            }
        };
        sent?;

        debug!(id, method, "published request");
        rx.await.map_err(|_| TransportError::Disconnected)?
    }

    /// `verifyWhitelist` without a prompt when the wallet already approved
    async fn verify_whitelist(&self, params: Vec<Value>) -> TransportResult<Value> {
        let answer = self.request(ALL_WHITELISTED_METHOD, params.clone()).await?;
        let all_whitelisted = answer
            .get("allWhiteListed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if all_whitelisted {
            if let Some(public_key) = answer.get("publicKey") {
                return Ok(public_key.clone());
            }
        }

        info!("awaiting whitelist approval on paired wallet");
        self.request("verifyWhitelist", params).await
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn start(&self) -> TransportResult<()> {
        let Some(ws) = self.handshake.lock().await.take() else {
            return Ok(());
        };

        let (sink, stream) = ws.split();
        *self.writer.lock().await = Some(sink);

        tokio::spawn(read_loop(
            stream,
            self.pairing.clone(),
            self.writer.clone(),
            self.pending.clone(),
            self.connected.clone(),
            self.peer_connected.clone(),
        ));
        Ok(())
    }

    async fn call(&self, command: &Command, _config: &CallConfig) -> TransportResult<Value> {
        self.start().await?;

        let method = command.method();
        if command.requires_approval() {
            info!(method, "awaiting approval on paired wallet");
        }

        match command {
            Command::VerifyWhitelist { .. } => self.verify_whitelist(command.params()).await,
            _ => self.request(method, command.params()).await,
        }
    }
}

/// Route sealed responses to their waiting callers
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pairing: PairingUri,
    writer: Arc<Mutex<Option<SplitSink<WsStream, Message>>>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    peer_connected: Arc<AtomicBool>,
) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "invalid relay frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                if let Some(sink) = writer.lock().await.as_mut() {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(error = %e, "relay socket error");
                break;
            }
            Some(Ok(_)) => continue,
        };

        match frame {
            RelayFrame::Message { data } => match pairing.open::<RpcResponseFrame>(&data) {
                Ok(response) => {
                    let id = response.id;
                    let waiter = lock_pending(&pending).remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response.into_result());
                        }
                        None => debug!(id, "response for unknown request"),
                    }
                }
                Err(e) => warn!(error = %e, "dropping unreadable wallet frame"),
            },
            RelayFrame::PeerJoined => peer_connected.store(true, Ordering::Release),
            RelayFrame::PeerLeft => {
                info!(topic = %pairing.topic, "wallet left pairing");
                peer_connected.store(false, Ordering::Release);
                fail_pending(&pending);
            }
            RelayFrame::Ping => {
                if let Some(sink) = writer.lock().await.as_mut() {
                    let _ = send_frame(sink, &RelayFrame::Pong).await;
                }
            }
            RelayFrame::Error { message } => warn!(%message, "relay error"),
            _ => {}
        }
    }

    connected.store(false, Ordering::Release);
    peer_connected.store(false, Ordering::Release);
    fail_pending(&pending);
}

fn fail_pending(pending: &Pending) {
    for (_, tx) in lock_pending(pending).drain() {
        let _ = tx.send(Err(TransportError::Disconnected));
    }
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<TransportResult<Value>>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a request's waiter however the wait ends, including when the
/// caller's deadline drops the future
struct PendingEntry {
    pending: Pending,
    id: u64,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

/// Send a relay protocol frame
async fn send_frame<S>(sink: &mut S, frame: &RelayFrame) -> TransportResult<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json =
        serde_json::to_string(frame).map_err(|e| TransportError::SendFailed(e.to_string()))?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// Receive a relay protocol frame during the handshake
async fn receive_frame(ws: &mut WsStream) -> TransportResult<RelayFrame> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| TransportError::InvalidData(e.to_string()));
            }
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Disconnected),
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainMetadata;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn pairing() -> PairingUri {
        PairingUri {
            topic: "K3F9QZ".into(),
            relay_url: "wss://relay.test".into(),
            key: SymKey::generate(),
        }
    }

    #[test]
    fn test_relay_frame_wire_format() {
        let json = serde_json::to_string(&RelayFrame::Publish {
            data: "AAEC".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"Publish","data":{"data":"AAEC"}}"#);

        let parsed: RelayFrame =
            serde_json::from_str(r#"{"type":"Joined","data":{"topic":"T","peer_count":2}}"#)
                .unwrap();
        assert_eq!(
            parsed,
            RelayFrame::Joined {
                topic: "T".into(),
                peer_count: 2
            }
        );
    }

    #[test]
    fn test_pairing_uri_roundtrip() {
        let pairing = pairing();
        let uri = pairing.to_uri();
        assert!(uri.starts_with("plug-bridge:K3F9QZ?relay=wss://relay.test&key="));
        assert_eq!(PairingUri::parse(&uri).unwrap(), pairing);
    }

    #[test]
    fn test_pairing_uri_rejects_malformed() {
        assert!(PairingUri::parse("wc:abc?relay=x&key=00").is_err());
        assert!(PairingUri::parse("plug-bridge:abc?relay=x").is_err());
        assert!(PairingUri::parse("plug-bridge:?relay=x&key=00").is_err());
    }

    #[test]
    fn test_sealed_request_opens_on_wallet_side() {
        let dapp = pairing();
        let wallet = PairingUri::parse(&dapp.to_uri()).unwrap();

        let request = RpcRequestFrame {
            id: 7,
            jsonrpc: "2.0".into(),
            method: "requestCall".into(),
            params: vec![json!({"canisterId": "aaaaa-aa"})],
        };
        let opened: RpcRequestFrame = wallet.open(&dapp.seal(&request).unwrap()).unwrap();
        assert_eq!(opened, request);

        let mut other = pairing();
        other.topic = "OTHER".into();
        assert!(other
            .open::<RpcRequestFrame>(&dapp.seal(&request).unwrap())
            .is_err());
    }

    #[test]
    fn test_response_error_maps_to_remote() {
        let response: RpcResponseFrame = serde_json::from_value(json!({
            "id": 3,
            "error": {"code": 4001, "message": "declined"}
        }))
        .unwrap();
        assert_eq!(
            response.into_result(),
            Err(TransportError::Remote {
                code: 4001,
                message: "declined".into()
            })
        );

        let response: RpcResponseFrame =
            serde_json::from_value(json!({"id": 4, "result": "pk"})).unwrap();
        assert_eq!(response.into_result(), Ok(json!("pk")));
    }

    /// Relay server and wallet in one, on a loopback socket
    struct FakeWallet {
        ws: WebSocketStream<TcpStream>,
        pairing: PairingUri,
    }

    impl FakeWallet {
        async fn next_frame(&mut self) -> RelayFrame {
            loop {
                if let Message::Text(text) = self.ws.next().await.unwrap().unwrap() {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }

        async fn next_request(&mut self) -> RpcRequestFrame {
            match self.next_frame().await {
                RelayFrame::Publish { data } => self.pairing.open(&data).unwrap(),
                other => panic!("expected publish, got {other:?}"),
            }
        }

        async fn reply(&mut self, id: u64, result: Value) {
            let response = RpcResponseFrame {
                id,
                result: Some(result),
                error: None,
            };
            let data = self.pairing.seal(&response).unwrap();
            send_frame(&mut self.ws, &RelayFrame::Message { data })
                .await
                .unwrap();
        }

        async fn leave(&mut self) {
            send_frame(&mut self.ws, &RelayFrame::PeerLeft).await.unwrap();
        }
    }

    async fn paired() -> (Arc<RelayTransport>, FakeWallet) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected createTopic");
            };
            assert_eq!(
                serde_json::from_str::<RelayFrame>(&text).unwrap(),
                RelayFrame::CreateTopic
            );
            send_frame(
                &mut ws,
                &RelayFrame::TopicCreated {
                    topic: "LOOPBACK".into(),
                },
            )
            .await
            .unwrap();
            ws
        });

        let transport = RelayTransport::pair(&url).await.unwrap();
        let mut wallet = FakeWallet {
            ws: relay.await.unwrap(),
            pairing: transport.pairing().clone(),
        };
        send_frame(&mut wallet.ws, &RelayFrame::PeerJoined)
            .await
            .unwrap();
        transport.wait_for_wallet().await.unwrap();
        transport.start().await.unwrap();
        (Arc::new(transport), wallet)
    }

    fn verify_whitelist() -> Command {
        Command::VerifyWhitelist {
            metadata: DomainMetadata::new("https://dapp.test", "Dapp"),
            whitelist: vec!["aaaaa-aa".into()],
        }
    }

    #[tokio::test]
    async fn test_responses_route_by_id() {
        let (transport, mut wallet) = paired().await;

        let first = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("first", vec![]).await })
        };
        let a = wallet.next_request().await;
        let second = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("second", vec![]).await })
        };
        let b = wallet.next_request().await;
        assert_eq!((a.method.as_str(), b.method.as_str()), ("first", "second"));
        assert_ne!(a.id, b.id);

        wallet.reply(b.id, json!("for second")).await;
        wallet.reply(a.id, json!("for first")).await;

        assert_eq!(second.await.unwrap(), Ok(json!("for second")));
        assert_eq!(first.await.unwrap(), Ok(json!("for first")));
        assert!(lock_pending(&transport.pending).is_empty());
    }

    #[tokio::test]
    async fn test_wallet_leaving_fails_pending_calls() {
        let (transport, mut wallet) = paired().await;

        let waiting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("requestTransfer", vec![]).await })
        };
        wallet.next_request().await;
        wallet.leave().await;

        assert_eq!(waiting.await.unwrap(), Err(TransportError::Disconnected));
        assert!(!transport.is_connected());

        let after = tokio::time::timeout(
            Duration::from_millis(500),
            transport.request("requestBalance", vec![]),
        )
        .await
        .expect("call after the wallet left must not wait");
        assert_eq!(after, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_dropped_call_releases_its_waiter() {
        let (transport, mut wallet) = paired().await;

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), transport.request("slow", vec![]))
                .await;
        assert!(timed_out.is_err());
        wallet.next_request().await;
        assert!(lock_pending(&transport.pending).is_empty());
    }

    #[tokio::test]
    async fn test_granted_whitelist_skips_prompt() {
        let (transport, mut wallet) = paired().await;

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call(&verify_whitelist(), &CallConfig::default())
                    .await
            })
        };
        let check = wallet.next_request().await;
        assert_eq!(check.method, ALL_WHITELISTED_METHOD);
        assert_eq!(check.params[1], json!(["aaaaa-aa"]));
        wallet
            .reply(check.id, json!({"allWhiteListed": true, "publicKey": "pk"}))
            .await;

        assert_eq!(call.await.unwrap(), Ok(json!("pk")));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), wallet.next_frame())
                .await
                .is_err(),
            "no prompt expected"
        );
    }

    #[tokio::test]
    async fn test_ungranted_whitelist_prompts() {
        let (transport, mut wallet) = paired().await;

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call(&verify_whitelist(), &CallConfig::default())
                    .await
            })
        };
        let check = wallet.next_request().await;
        wallet
            .reply(check.id, json!({"allWhiteListed": false}))
            .await;

        let prompt = wallet.next_request().await;
        assert_eq!(prompt.method, "verifyWhitelist");
        wallet.reply(prompt.id, json!("pk")).await;

        assert_eq!(call.await.unwrap(), Ok(json!("pk")));
    }
}
