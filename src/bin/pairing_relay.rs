//! Pairing relay server
//!
//! Lets a dapp and a mobile wallet find each other. The dapp opens a
//! topic, the wallet joins it from the pairing URI, and the relay passes
//! sealed frames between them without being able to read them.
//!
//! Frames a dapp publishes before the wallet arrives are held in a small
//! per-topic buffer and delivered when the wallet joins.
//!
//! Usage:
//!   pairing-relay [--port 8765] [--host 0.0.0.0] [--max-pending 32]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use plug_bridge::transport::relay::RelayFrame;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

const TOPIC_LEN: usize = 8;
const TOPIC_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Pairing relay server
#[derive(Parser)]
#[command(name = "pairing-relay")]
#[command(about = "WebSocket relay pairing dapps with mobile wallets")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Frames held per topic until the second peer joins
    #[arg(long, default_value = "32")]
    max_pending: usize,
}

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// What happens inside a topic
#[derive(Clone, Debug)]
enum RoomEvent {
    Joined { from: u64 },
    Left { from: u64 },
    Frame { from: u64, data: String },
}

#[derive(Default)]
struct Occupancy {
    peers: usize,
    /// Frames published while alone
    pending: VecDeque<String>,
}

/// A topic shared by at most two peers
struct Room {
    topic: String,
    tx: broadcast::Sender<RoomEvent>,
    occupancy: Mutex<Occupancy>,
}

impl Room {
    fn new(topic: String) -> Self {
        let (tx, _) = broadcast::channel(100);
        Room {
            topic,
            tx,
            occupancy: Mutex::new(Occupancy::default()),
        }
    }
}

struct RelayState {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    max_pending: usize,
}

impl RelayState {
    fn new(max_pending: usize) -> Self {
        RelayState {
            rooms: RwLock::new(HashMap::new()),
            max_pending,
        }
    }

    async fn create_room(&self) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        let topic = loop {
            let mut rng = rand::thread_rng();
            let topic: String = (0..TOPIC_LEN)
                .map(|_| TOPIC_ALPHABET[rng.gen_range(0..TOPIC_ALPHABET.len())] as char)
                .collect();
            if !rooms.contains_key(&topic) {
                break topic;
            }
        };

        let room = Arc::new(Room::new(topic.clone()));
        rooms.insert(topic.clone(), room.clone());
        info!(%topic, "topic created");
        room
    }

    async fn get_room(&self, topic: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(topic).cloned()
    }

    async fn remove_if_empty(&self, topic: &str) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(topic) {
            Some(room) => room.occupancy.lock().await.peers == 0,
            None => false,
        };
        if empty {
            rooms.remove(topic);
            info!(%topic, "topic removed");
        }
    }
}

async fn send_frame(write: &mut Sink, frame: &RelayFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = write.send(Message::Text(json)).await;
        }
        Err(e) => warn!(error = %e, "failed to encode frame"),
    }
}

async fn send_error(write: &mut Sink, message: &str) {
    send_frame(
        write,
        &RelayFrame::Error {
            message: message.to_string(),
        },
    )
    .await;
}

/// Peer state for one connection
struct Peer {
    id: u64,
    room: Option<Arc<Room>>,
    events: Option<broadcast::Receiver<RoomEvent>>,
}

impl Peer {
    async fn enter(&mut self, room: Arc<Room>) {
        self.events = Some(room.tx.subscribe());
        let _ = room.tx.send(RoomEvent::Joined { from: self.id });
        self.room = Some(room);
    }

    async fn next_event(&mut self) -> Option<RoomEvent> {
        match &mut self.events {
            Some(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "peer lagging, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            None => std::future::pending().await,
        }
    }
}

async fn handle_frame(frame: RelayFrame, peer: &mut Peer, write: &mut Sink, state: &RelayState) {
    match frame {
        RelayFrame::CreateTopic => {
            if peer.room.is_some() {
                return send_error(write, "Already in a topic").await;
            }
            let room = state.create_room().await;
            room.occupancy.lock().await.peers = 1;
            let topic = room.topic.clone();
            peer.enter(room).await;
            send_frame(write, &RelayFrame::TopicCreated { topic }).await;
        }

        RelayFrame::JoinTopic { topic } => {
            if peer.room.is_some() {
                return send_error(write, "Already in a topic").await;
            }
            let Some(room) = state.get_room(&topic).await else {
                return send_error(write, "Topic not found").await;
            };

            let (peer_count, pending) = {
                let mut occupancy = room.occupancy.lock().await;
                if occupancy.peers >= 2 {
                    drop(occupancy);
                    return send_error(write, "Topic is full").await;
                }
                occupancy.peers += 1;
                (occupancy.peers, std::mem::take(&mut occupancy.pending))
            };

            peer.enter(room).await;
            send_frame(write, &RelayFrame::Joined { topic, peer_count }).await;
            for data in pending {
                send_frame(write, &RelayFrame::Message { data }).await;
            }
            info!(peer_count, "peer joined topic");
        }

        RelayFrame::Publish { data } => {
            let Some(room) = &peer.room else {
                return send_error(write, "Not in a topic").await;
            };

            let mut occupancy = room.occupancy.lock().await;
            if occupancy.peers < 2 {
                if occupancy.pending.len() >= state.max_pending {
                    occupancy.pending.pop_front();
                    warn!(topic = %room.topic, "pending buffer full, oldest frame dropped");
                }
                occupancy.pending.push_back(data);
            } else {
                drop(occupancy);
                let _ = room.tx.send(RoomEvent::Frame {
                    from: peer.id,
                    data,
                });
            }
        }

        RelayFrame::Ping => send_frame(write, &RelayFrame::Pong).await,

        other => debug!(?other, "ignoring client frame"),
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<RelayState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    info!(%addr, "connection opened");

    let (mut write, mut read) = ws_stream.split();
    let mut peer = Peer {
        id: rand::random(),
        room: None,
        events: None,
    };

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(frame) => handle_frame(frame, &mut peer, &mut write, &state).await,
                    Err(e) => warn!(%addr, error = %e, "invalid frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    error!(%addr, error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },

            event = peer.next_event() => match event {
                Some(RoomEvent::Joined { from }) if from != peer.id => {
                    send_frame(&mut write, &RelayFrame::PeerJoined).await;
                }
                Some(RoomEvent::Left { from }) if from != peer.id => {
                    send_frame(&mut write, &RelayFrame::PeerLeft).await;
                }
                Some(RoomEvent::Frame { from, data }) if from != peer.id => {
                    send_frame(&mut write, &RelayFrame::Message { data }).await;
                }
                Some(_) => {}
                None => peer.events = None,
            },
        }
    }

    info!(%addr, "connection closed");
    if let Some(room) = peer.room.take() {
        {
            let mut occupancy = room.occupancy.lock().await;
            occupancy.peers = occupancy.peers.saturating_sub(1);
        }
        let _ = room.tx.send(RoomEvent::Left { from: peer.id });
        let topic = room.topic.clone();
        drop(room);
        state.remove_if_empty(&topic).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pairing_relay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr).await?;
    info!("pairing relay listening on ws://{}", addr);
    info!("topics hold two peers; up to {} frames wait for the second", args.max_pending);

    let state = Arc::new(RelayState::new(args.max_pending));

    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, addr, state.clone()));
    }
}
