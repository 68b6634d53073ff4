//! Sync Client Provider (component C9, §4.7): a long-lived outbound peer
//! that dials a `/sync/{room}` endpoint, runs the same handshake the Sync
//! Server expects, and forwards local document updates upstream tagged
//! with itself as origin.
//!
//! An outbound connection that reconnects with backoff and re-registers
//! on every successful dial: a background task owns the socket, a watch
//! channel exposes readiness, and a shutdown signal tears the task down
//! from outside.
//!
//! Runs on a [`tokio::task::LocalSet`] rather than the default multi-thread
//! executor: the CRDT document and awareness table this client shares with
//! the rest of the workspace are `Rc`/`RefCell`-based, single-threaded
//! cooperative objects by design (§5 "Scheduling model"), so the reconnect
//! task is spawned with `spawn_local` and never crosses an OS thread.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};

use kvsync_crdt::{Awareness, CrdtDoc, MemDocument, Origin};
use kvsync_proto::{Frame, FrameTransport, SyncMessage, SyncSubType};

use crate::config::ReconnectConfig;

/// A reconnecting outbound sync peer bound to one room on one remote
/// server (§4.7).
pub struct SyncClient {
    url: String,
    origin: Origin,
    doc: Rc<MemDocument>,
    awareness: Rc<Awareness>,
    reconnect: ReconnectConfig,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    shutdown: Rc<Notify>,
    shutting_down: Rc<Cell<bool>>,
}

impl SyncClient {
    /// Construct a client for `url` (expected to end in `/sync/{room}`),
    /// sharing `doc` and `awareness` with the rest of the workspace so
    /// local writes flow out and remote ones flow in through the same
    /// in-memory objects the application reads.
    pub fn new(
        url: String,
        origin: Origin,
        doc: Rc<MemDocument>,
        awareness: Rc<Awareness>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            url,
            origin,
            doc,
            awareness,
            reconnect,
            synced_tx,
            synced_rx,
            shutdown: Rc::new(Notify::new()),
            shutting_down: Rc::new(Cell::new(false)),
        }
    }

    /// Start the reconnect loop in the background, on the current
    /// `LocalSet`. Returns immediately; readiness is reported through
    /// [`Self::when_synced`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a `LocalSet` context (see
    /// [`tokio::task::spawn_local`]).
    pub fn connect(&self) {
        let url = self.url.clone();
        let origin = self.origin;
        let doc = self.doc.clone();
        let awareness = self.awareness.clone();
        let initial_ms = self.reconnect.initial_ms;
        let max_ms = self.reconnect.max_ms;
        let synced_tx = self.synced_tx.clone();
        let shutdown = self.shutdown.clone();
        let shutting_down = self.shutting_down.clone();

        tokio::task::spawn_local(async move {
            let mut backoff_ms = initial_ms;
            loop {
                if shutting_down.get() {
                    return;
                }
                let _ = synced_tx.send(false);
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => return,
                    result = connect_and_run(&url, origin, &doc, &awareness, &synced_tx, &shutdown) => {
                        match result {
                            Ok(()) => return, // shutdown requested mid-session
                            Err(err) => {
                                tracing::debug!(%url, error = %err, "sync client disconnected, will retry");
                                crate::metrics::record_error("sync_client_disconnect");
                            }
                        }
                    }
                }
                if shutting_down.get() {
                    return;
                }
                let sleep = jittered_backoff(backoff_ms);
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => return,
                    _ = tokio::time::sleep(sleep) => {}
                }
                backoff_ms = (backoff_ms.saturating_mul(2)).min(max_ms);
            }
        });
    }

    /// Resolves once the first sync handshake round-trip has completed.
    /// Re-resolves after every successful reconnect; callers that just
    /// want "synced at least once" should only poll it the first time.
    pub async fn when_synced(&self) {
        let mut rx = self.synced_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Tear down the reconnect loop and close the active socket, if any.
    /// Idempotent: a second call is a harmless no-op (§4.8 "destroy is
    /// idempotent" applies equally to this collaborator).
    pub fn destroy(&self) {
        if self.shutting_down.replace(true) {
            return;
        }
        self.shutdown.notify_waiters();
    }
}

/// Exponential backoff with full jitter: `uniform(0, min(cap, base *
/// 2^attempt))`. Bounded and storm-avoiding per the open question in §9 —
/// decided here as initial 200ms doubling to a 30s cap (both configurable
/// via [`ReconnectConfig`]).
fn jittered_backoff(capped_ms: u64) -> Duration {
    let upper = capped_ms.max(1);
    let jittered = rand::thread_rng().gen_range(0..=upper);
    Duration::from_millis(jittered)
}

/// Dial, perform the sync handshake, and pump frames until the socket
/// closes or shutdown is requested. `Ok(())` means shutdown was
/// requested; any transport error is a disconnect to retry.
async fn connect_and_run(
    url: &str,
    origin: Origin,
    doc: &Rc<MemDocument>,
    awareness: &Rc<Awareness>,
    synced_tx: &watch::Sender<bool>,
    shutdown: &Rc<Notify>,
) -> kvsync_proto::Result<()> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| kvsync_proto::ProtocolError::Io(std::io::Error::other(e.to_string())))?;
    let mut transport = FrameTransport::new_client(ws_stream);

    // §4.5 handshake: reply to the server's step-1 with our own step-2 and
    // step-1 as soon as the first frame arrives, below.
    let local_state = doc.encode_state_as_update();

    let (outbound_tx, mut outbound_rx, doc_sub) = doc_observer_channel(doc, origin);

    // The `Awareness::observe` callback type must be `Send` (it shares the
    // signature used by the Sync Server's room actor), so it cannot
    // capture the `Rc<Awareness>` needed to re-encode changed ids. Forward
    // bare `(ids, origin)` pairs instead and do the encode in the loop
    // below, which already holds `awareness` locally.
    let (awareness_changed_tx, mut awareness_changed_rx) =
        tokio::sync::mpsc::channel::<(Vec<u64>, Origin)>(256);
    let awareness_sub = awareness.observe(Box::new(move |ids, change_origin| {
        let _ = awareness_changed_tx.try_send((ids.to_vec(), change_origin));
    }));

    let result = run_client_loop(
        &mut transport,
        doc,
        awareness,
        origin,
        local_state,
        &mut outbound_rx,
        &mut awareness_changed_rx,
        synced_tx,
        shutdown,
    )
    .await;

    awareness.unobserve(awareness_sub);
    doc.unobserve_updates(doc_sub);
    result
}

/// Wire up a channel that receives this peer's own document updates so
/// they can be forwarded upstream, tagged with `origin` so the server's
/// echo suppression (and our own awareness relay above) can recognize
/// them as locally produced. The subscription must be dropped by the
/// caller once the connection ends, or it outlives the reconnect attempt
/// and leaks into the next one.
fn doc_observer_channel(
    doc: &Rc<MemDocument>,
    origin: Origin,
) -> (
    tokio::sync::mpsc::Sender<Frame>,
    tokio::sync::mpsc::Receiver<Frame>,
    kvsync_crdt::document::SubscriptionId,
) {
    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let forward_tx = tx.clone();
    let sub = doc.observe_updates(Box::new(move |bytes, update_origin| {
        // Echo suppression: don't relay back an update that was itself
        // applied because it came from this same remote connection.
        if update_origin == origin {
            return;
        }
        let _ = forward_tx.try_send(Frame::Sync(SyncMessage::new(
            SyncSubType::Update,
            bytes.to_vec(),
        )));
    }));
    (tx, rx, sub)
}

#[allow(clippy::too_many_arguments)]
async fn run_client_loop(
    transport: &mut FrameTransport<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    doc: &Rc<MemDocument>,
    awareness: &Rc<Awareness>,
    origin: Origin,
    local_state: Vec<u8>,
    outbound_rx: &mut tokio::sync::mpsc::Receiver<Frame>,
    awareness_changed_rx: &mut tokio::sync::mpsc::Receiver<(Vec<u64>, Origin)>,
    synced_tx: &watch::Sender<bool>,
    shutdown: &Rc<Notify>,
) -> kvsync_proto::Result<()> {
    let mut handshaked = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => return Ok(()),

            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => transport.send(&frame).await?,
                    None => return Err(kvsync_proto::ProtocolError::Io(
                        std::io::Error::other("local update channel closed"),
                    )),
                }
            }

            changed = awareness_changed_rx.recv() => {
                match changed {
                    Some((ids, change_origin)) if change_origin != origin => {
                        transport
                            .send(&Frame::Awareness(awareness.encode_update(&ids)))
                            .await?;
                    }
                    Some(_) => {}
                    None => return Err(kvsync_proto::ProtocolError::Io(
                        std::io::Error::other("awareness change channel closed"),
                    )),
                }
            }

            incoming = transport.recv() => {
                match incoming? {
                    None => return Err(kvsync_proto::ProtocolError::Io(
                        std::io::Error::other("remote closed connection"),
                    )),
                    Some(Frame::Sync(message)) => {
                        match message.sub_type {
                            SyncSubType::Step1 => {
                                // Server told us what it has; reply with
                                // our own state plus our own step-1 so it
                                // can diff against us too (§4.5).
                                if !local_state.is_empty() {
                                    transport
                                        .send(&Frame::Sync(SyncMessage::new(
                                            SyncSubType::Step2,
                                            local_state.clone(),
                                        )))
                                        .await?;
                                }
                                transport
                                    .send(&Frame::Sync(SyncMessage::new(
                                        SyncSubType::Step1,
                                        doc.encode_state_as_update(),
                                    )))
                                    .await?;
                                if !handshaked {
                                    handshaked = true;
                                    let _ = synced_tx.send(true);
                                }
                            }
                            SyncSubType::Step2 | SyncSubType::Update => {
                                doc.apply_update(&message.payload, origin);
                                if !handshaked {
                                    handshaked = true;
                                    let _ = synced_tx.send(true);
                                }
                            }
                        }
                    }
                    Some(Frame::Awareness(payload)) => {
                        awareness.apply_update(&payload, origin);
                    }
                    Some(Frame::QueryAwareness) => {
                        // The client side has no peers to answer on behalf
                        // of; nothing to do.
                    }
                    Some(Frame::Auth(_)) => {
                        // Reserved (§4.5); nothing to do with it yet.
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_never_exceeds_the_cap() {
        for _ in 0..100 {
            let d = jittered_backoff(500);
            assert!(d.as_millis() <= 500);
        }
    }

    #[test]
    fn jittered_backoff_of_zero_is_zero_or_one() {
        let d = jittered_backoff(0);
        assert!(d.as_millis() <= 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let doc = Rc::new(MemDocument::new("test-room", true));
                let awareness = Rc::new(Awareness::new());
                let client = SyncClient::new(
                    "ws://127.0.0.1:1/sync/none".to_string(),
                    Origin::new(1),
                    doc,
                    awareness,
                    ReconnectConfig {
                        initial_ms: 1,
                        max_ms: 2,
                    },
                );
                client.destroy();
                client.destroy();
                assert!(client.shutting_down.get());
            })
            .await;
    }

    #[tokio::test]
    async fn when_synced_does_not_resolve_before_first_handshake() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let doc = Rc::new(MemDocument::new("test-room", true));
                let awareness = Rc::new(Awareness::new());
                let client = SyncClient::new(
                    "ws://127.0.0.1:1/sync/none".to_string(),
                    Origin::new(1),
                    doc,
                    awareness,
                    ReconnectConfig {
                        initial_ms: 1,
                        max_ms: 2,
                    },
                );
                let synced =
                    tokio::time::timeout(Duration::from_millis(20), client.when_synced()).await;
                assert!(synced.is_err(), "when_synced resolved without a server");
            })
            .await;
    }
}
