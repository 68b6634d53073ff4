//! Sync Server (component C8, §4.6): accepts `/sync/{room}` WebSocket
//! connections, resolves each to a room, and fans out SYNC/AWARENESS
//! traffic between the peers sharing that room.
//!
//! Each connection is accepted off a plain `TcpListener` and spawned as
//! its own task; each room is owned exclusively by a single actor task,
//! reached only through an mpsc command channel — no lock needed because
//! there is only ever one writer. That actor owns a [`MemDocument`] and
//! [`Awareness`] instance and a map of connected peers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response};

use kvsync_crdt::{Awareness, CrdtDoc, MemDocument, Origin};
use kvsync_proto::websocket::{
    build_handshake_response, extract_room, validate_handshake, HandshakeResult, WebSocketConfig,
};
use kvsync_proto::{Frame, FrameTransport, SyncMessage, SyncSubType};

use crate::config::Config;
use crate::error::RoomError;
use crate::telemetry::SyncTraceContext;

/// Identifies one accepted connection for the lifetime of its socket.
/// Stands in for the "weakly-referenced map keyed by the connection
/// object" of §4.6: Rust has no ambient weak-reference registry, so state
/// is instead keyed by this id in an explicit map with deletion on close
/// (§9 "WeakMap of connection → state").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

fn next_connection_id() -> ConnectionId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Commands a connection task sends into its room's actor.
enum RoomCommand {
    Join {
        connection_id: ConnectionId,
        outbound: mpsc::Sender<Frame>,
        reply: oneshot::Sender<JoinInfo>,
    },
    Sync {
        connection_id: ConnectionId,
        message: SyncMessage,
    },
    Awareness {
        connection_id: ConnectionId,
        payload: Vec<u8>,
    },
    QueryAwareness {
        connection_id: ConnectionId,
    },
    Leave {
        connection_id: ConnectionId,
    },
}

/// What the room actor hands back on `Join`: the frames the caller must
/// send once its socket is confirmed ready (§4.6 "after the socket is
/// confirmed ready ... send SYNC step-1 and ... the current awareness
/// state bundle").
struct JoinInfo {
    step1: Vec<u8>,
    awareness_bundle: Option<Vec<u8>>,
}

/// State owned by exactly one room actor task. No field here is ever
/// touched from outside that task, so nothing needs to be `Sync`.
struct RoomActor {
    name: String,
    doc: MemDocument,
    awareness: Awareness,
    connections: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    controlled_client_ids: HashMap<ConnectionId, HashSet<u64>>,
    registry: Arc<RoomRegistry>,
}

impl RoomActor {
    /// `retain_history` disables GC on the room's Document when the room is
    /// configured to keep full revision history (§4.8 point 1).
    fn spawn(
        name: String,
        retain_history: bool,
        registry: Arc<RoomRegistry>,
    ) -> mpsc::Sender<RoomCommand> {
        let (tx, rx) = mpsc::channel(256);
        let doc = MemDocument::new(name.clone(), !retain_history);
        let actor = RoomActor {
            name,
            doc,
            awareness: Awareness::new(),
            connections: HashMap::new(),
            controlled_client_ids: HashMap::new(),
            registry,
        };
        crate::metrics::ACTIVE_ROOMS.inc();
        tokio::spawn(actor.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
            if self.connections.is_empty() {
                // §4.6 "if the room is now empty, drop both the room set
                // and the awareness". The in-memory document goes with it
                // too: with no persistence backend configured it is only
                // ever a cache of state the persistence port would
                // otherwise rehydrate on the next connection.
                self.registry.rooms.remove(&self.name);
                crate::metrics::ACTIVE_ROOMS.dec();
                break;
            }
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                connection_id,
                outbound,
                reply,
            } => {
                self.connections.insert(connection_id, outbound);
                let awareness_bundle = if self.awareness.is_empty() {
                    None
                } else {
                    let ids: Vec<u64> = self.awareness.get_states().into_keys().collect();
                    Some(self.awareness.encode_update(&ids))
                };
                let _ = reply.send(JoinInfo {
                    step1: self.doc.encode_state_as_update(),
                    awareness_bundle,
                });
            }
            RoomCommand::Sync {
                connection_id,
                message,
            } => self.handle_sync(connection_id, message).await,
            RoomCommand::Awareness {
                connection_id,
                payload,
            } => self.handle_awareness(connection_id, payload).await,
            RoomCommand::QueryAwareness { connection_id } => {
                if self.awareness.is_empty() {
                    return;
                }
                let ids: Vec<u64> = self.awareness.get_states().into_keys().collect();
                let bundle = self.awareness.encode_update(&ids);
                self.send_to(connection_id, Frame::Awareness(bundle)).await;
            }
            RoomCommand::Leave { connection_id } => self.handle_leave(connection_id).await,
        }
    }

    async fn handle_sync(&mut self, connection_id: ConnectionId, message: SyncMessage) {
        let origin = Origin::new(connection_id.0);
        match message.sub_type {
            SyncSubType::Step1 => {
                // The client just told us "what it already has" (a state
                // vector in a real CRDT engine). `MemDocument` has no
                // vector representation to diff against, so the reply is
                // simply our full current state, sent only if we have
                // anything at all (§4.6 "send the reply only if the
                // encoder wrote more than the single prefix byte").
                let bundle = self.doc.encode_state_as_update();
                if !bundle.is_empty() {
                    self.send_to(
                        connection_id,
                        Frame::Sync(SyncMessage::new(SyncSubType::Step2, bundle)),
                    )
                    .await;
                }
            }
            SyncSubType::Step2 | SyncSubType::Update => {
                let changed = self.doc.apply_update(&message.payload, origin);
                if changed {
                    self.broadcast_except(
                        connection_id,
                        Frame::Sync(SyncMessage::new(SyncSubType::Update, message.payload)),
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_awareness(&mut self, connection_id: ConnectionId, payload: Vec<u8>) {
        let origin = Origin::new(connection_id.0);
        let changed = self.awareness.apply_update_detailed(&payload, origin);
        let controlled = self.controlled_client_ids.entry(connection_id).or_default();
        for (client_id, present) in &changed {
            if *present {
                controlled.insert(*client_id);
            } else {
                controlled.remove(client_id);
            }
        }
        if !changed.is_empty() {
            self.broadcast_except(connection_id, Frame::Awareness(payload))
                .await;
        }
    }

    async fn handle_leave(&mut self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
        if let Some(ids) = self.controlled_client_ids.remove(&connection_id) {
            if !ids.is_empty() {
                let ids: Vec<u64> = ids.into_iter().collect();
                self.awareness.remove_states(&ids, Origin::LOCAL);
                let removal = self.awareness.encode_update(&ids);
                self.broadcast_except(connection_id, Frame::Awareness(removal))
                    .await;
            }
        }
    }

    async fn send_to(&self, connection_id: ConnectionId, frame: Frame) {
        if let Some(sender) = self.connections.get(&connection_id) {
            if sender.send(frame.clone()).await.is_ok() {
                record_frame_sent(&frame);
            }
        }
    }

    async fn broadcast_except(&self, exclude: ConnectionId, frame: Frame) {
        let _span = crate::telemetry::create_broadcast_span(&self.name, self.connections.len());
        for (id, sender) in &self.connections {
            if *id == exclude {
                continue;
            }
            if sender.send(frame.clone()).await.is_ok() {
                record_frame_sent(&frame);
            }
        }
    }
}

/// Credits the frames-sent/bytes-sent counters for one frame queued onto a
/// connection's outbound channel (§1 "counters ... for ... frames,
/// bytes sent/received").
fn record_frame_sent(frame: &Frame) {
    crate::metrics::FRAMES_SENT.inc();
    crate::metrics::BYTES_SENT.inc_by(frame.encode().len() as u64);
}

/// Resolves room names to a running [`RoomActor`], lazily starting one on
/// first connection and letting it tear itself down when empty.
///
/// Room *names* are fixed at startup from `config.rooms` — this is the
/// "injected lookup" of §4.6 that decides whether a room exists at all
/// (closing unknown ones with 4004). The per-room connection/awareness
/// bookkeeping is ephemeral and created independently of that, matching
/// the glossary's "Awareness ... is not persisted; cleared on disconnect".
pub struct RoomRegistry {
    /// Room name -> `retain_history` (§4.8 point 1). Empty allows any room
    /// name, same as before; `retain_history` defaults to `false` for rooms
    /// looked up this way (only reachable from tests, which don't care).
    known_rooms: HashMap<String, bool>,
    rooms: DashMap<String, mpsc::Sender<RoomCommand>>,
}

impl RoomRegistry {
    fn new(known_rooms: HashMap<String, bool>) -> Arc<Self> {
        Arc::new(Self {
            known_rooms,
            rooms: DashMap::new(),
        })
    }

    fn get_or_create(self: &Arc<Self>, room: &str) -> Option<mpsc::Sender<RoomCommand>> {
        if !self.known_rooms.is_empty() && !self.known_rooms.contains_key(room) {
            return None;
        }
        if let Some(sender) = self.rooms.get(room) {
            return Some(sender.clone());
        }
        let retain_history = self.known_rooms.get(room).copied().unwrap_or(false);
        let sender = RoomActor::spawn(room.to_string(), retain_history, self.clone());
        self.rooms.insert(room.to_string(), sender.clone());
        Some(sender)
    }
}

/// Clone stashed by the handshake callback so the connection handler can
/// read the validated room and origin after `accept_hdr_async` returns.
#[derive(Default, Clone)]
struct ExtractedHandshake {
    room: Option<String>,
    origin: Option<String>,
}

struct HandshakeCallback {
    config: WebSocketConfig,
    extracted: Arc<Mutex<ExtractedHandshake>>,
}

impl Callback for HandshakeCallback {
    fn on_request(
        self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ErrorResponse> {
        let room = extract_room(request.uri().path());
        let result = validate_handshake(request, &self.config);
        let origin = match &result {
            HandshakeResult::Accept { origin } => origin.clone(),
            HandshakeResult::Reject { .. } => None,
        };
        *self.extracted.lock().unwrap() = ExtractedHandshake { room, origin };

        match &result {
            HandshakeResult::Accept { .. } => {
                let custom = build_handshake_response(&result, &self.config)?;
                let mut merged = response;
                for (name, value) in custom.headers() {
                    merged.headers_mut().insert(name.clone(), value.clone());
                }
                Ok(merged)
            }
            HandshakeResult::Reject { reason, .. } => {
                Err(ErrorResponse::new(Some(reason.clone())))
            }
        }
    }
}

/// The Sync Server: binds a TCP listener and speaks the sync protocol on
/// every accepted connection (§4.6, §6 "URL path `/sync/{room}`").
pub struct SyncServer {
    listener: TcpListener,
    ws_config: WebSocketConfig,
    registry: Arc<RoomRegistry>,
}

impl SyncServer {
    /// Bind the configured listen address.
    pub async fn bind(config: &Config) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen.address).await?;
        tracing::info!(address = %config.listen.address, "sync server listening");
        let ws_config = WebSocketConfig {
            allowed_origins: config.listen.allowed_origins.clone(),
            require_origin: config.listen.require_origin,
            enable_cors: true,
        };
        let known_rooms: HashMap<String, bool> = config
            .rooms
            .iter()
            .map(|(name, room_config)| (name.clone(), room_config.retain_history))
            .collect();
        Ok(Self {
            listener,
            ws_config,
            registry: RoomRegistry::new(known_rooms),
        })
    }

    /// Accept connections until the process is shut down.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let ws_config = self.ws_config.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, addr, ws_config, registry).await
                        {
                            tracing::debug!(%addr, error = %err, "sync connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to accept sync connection");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ws_config: WebSocketConfig,
    registry: Arc<RoomRegistry>,
) -> Result<(), RoomError> {
    let extracted = Arc::new(Mutex::new(ExtractedHandshake::default()));
    let callback = HandshakeCallback {
        config: ws_config,
        extracted: extracted.clone(),
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::debug!(%addr, error = %err, "websocket handshake failed");
            return Ok(());
        }
    };
    let handshake = extracted.lock().unwrap().clone();
    let mut transport = FrameTransport::new(ws_stream);

    let Some(room) = handshake.room else {
        let _ = transport.close(4004, "Room not found: (no room in path)".to_string()).await;
        return Ok(());
    };

    let Some(room_tx) = registry.get_or_create(&room) else {
        crate::metrics::UNKNOWN_ROOM_CLOSED.inc();
        let reason = format!("Room not found: {room}");
        let _ = transport.close(4004, reason.clone()).await;
        return Err(RoomError::NotFound(room));
    };

    let connection_id = next_connection_id();
    let span = SyncTraceContext::new()
        .with_room(room.clone())
        .with_connection_id(connection_id.0)
        .with_origin(connection_id.0)
        .into_span();
    let _enter = span.enter();
    crate::metrics::OPEN_CONNECTIONS.inc();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);
    let (reply_tx, reply_rx) = oneshot::channel();
    if room_tx
        .send(RoomCommand::Join {
            connection_id,
            outbound: outbound_tx,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        crate::metrics::OPEN_CONNECTIONS.dec();
        return Err(RoomError::Send("room actor gone".to_string()));
    }

    if let Ok(join_info) = reply_rx.await {
        transport
            .send(&Frame::Sync(SyncMessage::new(
                SyncSubType::Step1,
                join_info.step1,
            )))
            .await?;
        if let Some(bundle) = join_info.awareness_bundle {
            transport.send(&Frame::Awareness(bundle)).await?;
        }
    }

    let result = run_connection_loop(&mut transport, &mut outbound_rx, &room_tx, connection_id).await;

    let _ = room_tx.send(RoomCommand::Leave { connection_id }).await;
    crate::metrics::OPEN_CONNECTIONS.dec();
    result
}

/// Pumps frames in both directions until the socket closes: inbound
/// frames are turned into room commands, outbound frames queued by the
/// room actor (broadcasts, query-awareness replies) are written back out.
async fn run_connection_loop(
    transport: &mut FrameTransport<TcpStream>,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    room_tx: &mpsc::Sender<RoomCommand>,
    connection_id: ConnectionId,
) -> Result<(), RoomError> {
    loop {
        tokio::select! {
            biased;

            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => transport.send(&frame).await?,
                    None => return Ok(()),
                }
            }
            incoming = transport.recv() => {
                match incoming? {
                    None => return Ok(()),
                    Some(Frame::Sync(message)) => {
                        crate::metrics::BYTES_RECEIVED.inc_by(message.payload.len() as u64);
                        let _ = room_tx
                            .send(RoomCommand::Sync { connection_id, message })
                            .await;
                    }
                    Some(Frame::Awareness(payload)) => {
                        crate::metrics::BYTES_RECEIVED.inc_by(payload.len() as u64);
                        let _ = room_tx
                            .send(RoomCommand::Awareness { connection_id, payload })
                            .await;
                    }
                    Some(Frame::QueryAwareness) => {
                        let _ = room_tx
                            .send(RoomCommand::QueryAwareness { connection_id })
                            .await;
                    }
                    Some(Frame::Auth(_)) => {
                        // Reserved (§4.5); nothing to do with it yet.
                    }
                }
            }
        }
    }
}
