//! End-to-end tests of the Sync Protocol (C7-C9) over real WebSocket
//! connections against a spawned `kvsyncd` process, the way the reference
//! daemon's own integration suite drives real sockets rather than the
//! internal room-actor API.

mod common;

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use kvsync_crdt::{Awareness, Origin};
use kvsync_proto::{Frame, FrameTransport, SyncMessage, SyncSubType};

use common::server::TestServer;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn recv_frame<S>(transport: &mut FrameTransport<S>) -> Frame
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    timeout(RECV_TIMEOUT, transport.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("transport error")
        .expect("connection closed unexpectedly")
}

/// S6: awareness presence roundtrip. P1 advertises state for client id
/// 101; P2 observes it. P1 disconnects; P2 observes the removal.
#[tokio::test]
async fn s6_awareness_presence_roundtrip() {
    let server = TestServer::spawn(17_801, &["presence"])
        .await
        .expect("server failed to start");
    let url = server.sync_url("presence");

    let (ws1, _) = connect_async(&url).await.expect("p1 connect failed");
    let mut p1 = FrameTransport::new_client(ws1);
    let step1 = recv_frame(&mut p1).await;
    assert!(matches!(
        step1,
        Frame::Sync(SyncMessage { sub_type: SyncSubType::Step1, ref payload }) if payload.is_empty()
    ));

    let (ws2, _) = connect_async(&url).await.expect("p2 connect failed");
    let mut p2 = FrameTransport::new_client(ws2);
    let step1_p2 = recv_frame(&mut p2).await;
    assert!(matches!(
        step1_p2,
        Frame::Sync(SyncMessage { sub_type: SyncSubType::Step1, .. })
    ));

    let outgoing = Awareness::new();
    outgoing.set_local_state(101, b"alice".to_vec(), Origin::LOCAL);
    let update = outgoing.encode_update(&[101]);
    p1.send(&Frame::Awareness(update))
        .await
        .expect("send awareness failed");

    let decoder = Awareness::new();
    let received = recv_frame(&mut p2).await;
    let Frame::Awareness(bytes) = received else {
        panic!("expected an awareness frame, got {received:?}");
    };
    let changed = decoder.apply_update_detailed(&bytes, Origin::new(999));
    assert_eq!(changed, vec![(101, true)]);
    assert_eq!(decoder.get_states().get(&101), Some(&b"alice".to_vec()));

    // P1 disconnects; the room actor removes the client ids it controlled.
    drop(p1);

    let removal = recv_frame(&mut p2).await;
    let Frame::Awareness(bytes) = removal else {
        panic!("expected a removal awareness frame, got {removal:?}");
    };
    let changed = decoder.apply_update_detailed(&bytes, Origin::new(999));
    assert_eq!(changed, vec![(101, false)]);
    assert!(decoder.get_states().get(&101).is_none());
}

/// S7: connecting to a room not in `config.rooms` gets the socket closed
/// with code 4004 and a reason naming the room.
#[tokio::test]
async fn s7_unknown_room_closes_with_4004() {
    let server = TestServer::spawn(17_802, &["blog"])
        .await
        .expect("server failed to start");
    let url = server.sync_url("no-such-room");

    let (mut ws, _) = connect_async(&url).await.expect("websocket upgrade failed");

    let message = timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended without a close frame")
        .expect("websocket error");

    match message {
        WsMessage::Close(Some(close_frame)) => {
            assert_eq!(u16::from(close_frame.code), 4004);
            assert!(close_frame.reason.starts_with("Room not found:"));
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

/// A SYNC update broadcasts to every other connection sharing the room but
/// never back to the connection that sent it (echo suppression, §4.6).
#[tokio::test]
async fn sync_update_broadcasts_except_sender() {
    let server = TestServer::spawn(17_803, &["blog"])
        .await
        .expect("server failed to start");
    let url = server.sync_url("blog");

    let (ws1, _) = connect_async(&url).await.expect("p1 connect failed");
    let mut p1 = FrameTransport::new_client(ws1);
    let _ = recv_frame(&mut p1).await; // initial step-1

    let (ws2, _) = connect_async(&url).await.expect("p2 connect failed");
    let mut p2 = FrameTransport::new_client(ws2);
    let _ = recv_frame(&mut p2).await; // initial step-1

    p1.send(&Frame::Sync(SyncMessage::new(
        SyncSubType::Update,
        b"row-upsert-1".to_vec(),
    )))
    .await
    .expect("send update failed");

    let forwarded = recv_frame(&mut p2).await;
    assert_eq!(
        forwarded,
        Frame::Sync(SyncMessage::new(SyncSubType::Update, b"row-upsert-1".to_vec()))
    );

    // P1 never sees its own update echoed back. A second, distinguishable
    // update confirms p1's queue only ever contained the step-1 handshake.
    p2.send(&Frame::Sync(SyncMessage::new(
        SyncSubType::Update,
        b"row-upsert-2".to_vec(),
    )))
    .await
    .expect("send update failed");
    let echoed_to_p1 = recv_frame(&mut p1).await;
    assert_eq!(
        echoed_to_p1,
        Frame::Sync(SyncMessage::new(SyncSubType::Update, b"row-upsert-2".to_vec()))
    );
}
