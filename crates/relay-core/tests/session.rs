//! End-to-end session behaviour over the in-memory transport.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::unix_timestamp;
use std::collections::HashSet;
use std::time::Duration;
use tenvis_relay_core::{
    Hub, HubConfig, HubHandle, Session, SessionConfig, SessionError, SessionState,
};
use tenvis_relay_transport::memory::{self, MemoryPeer};
use tenvis_relay_transport::{TransportError, TungsteniteConnection, WireFrame};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    peer: MemoryPeer,
    task: JoinHandle<Result<(), SessionError>>,
    state: watch::Receiver<SessionState>,
}

async fn connect(hub: &HubHandle, config: SessionConfig, buffer: usize) -> Client {
    let (conn, peer) = memory::pair_with_buffer(buffer);
    let session = Session::new(hub.clone(), config);
    let mut state = session.state();
    let task = tokio::spawn(session.run(Box::new(conn)));
    state
        .wait_for(|s| *s == SessionState::Active)
        .await
        .expect("session dropped before becoming active");
    Client { peer, task, state }
}

async fn connect_default(hub: &HubHandle) -> Client {
    connect(hub, SessionConfig::default(), 1024).await
}

async fn next_text(peer: &mut MemoryPeer) -> Bytes {
    loop {
        match timeout(WAIT, peer.recv()).await.expect("timed out") {
            Some(WireFrame::Text(data)) => return data,
            Some(WireFrame::Ping(_)) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn ping_gets_one_pong_only_for_sender() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut a = connect_default(&hub).await;
    let mut b = connect_default(&hub).await;

    let before = unix_timestamp();
    a.peer
        .send_text(r#"{"type":"ping","payload":"ignored"}"#)
        .await
        .unwrap();

    let pong: serde_json::Value = serde_json::from_slice(&next_text(&mut a.peer).await).unwrap();
    assert_eq!(pong["type"], "pong");
    assert!(pong["payload"].as_i64().unwrap() >= before);

    // Prove ordering with a broadcast: b sees it first, with no pong ahead of it.
    a.peer
        .send_text(r#"{"type":"broadcast","payload":1}"#)
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut b.peer).await,
        Bytes::from_static(br#"{"type":"broadcast","payload":1}"#)
    );
    assert_eq!(
        next_text(&mut a.peer).await,
        Bytes::from_static(br#"{"type":"broadcast","payload":1}"#)
    );
    assert!(a.peer.try_recv().is_none());
}

#[tokio::test]
async fn broadcast_is_relayed_verbatim_to_everyone() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_default(&hub).await);
    }

    let frame = r#"{ "type": "broadcast", "payload": {"text": "héllo", "n": [1, 2]} }"#;
    clients[0].peer.send_text(frame).await.unwrap();

    for client in clients.iter_mut() {
        assert_eq!(next_text(&mut client.peer).await, Bytes::from(frame));
    }
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_dropped() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut a = connect_default(&hub).await;

    a.peer.send_text("this is not json").await.unwrap();
    a.peer
        .send_text(r#"{"type":"subscribe","payload":"x"}"#)
        .await
        .unwrap();
    a.peer.send_text(r#"{"type":"ping"}"#).await.unwrap();

    let pong: serde_json::Value = serde_json::from_slice(&next_text(&mut a.peer).await).unwrap();
    assert_eq!(pong["type"], "pong");
    assert_eq!(*a.state.borrow(), SessionState::Active);
    assert_eq!(hub.client_count().await.unwrap(), 1);
}

#[tokio::test]
async fn oversized_frame_closes_only_its_session() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let config = SessionConfig {
        max_frame_size: 64,
        ..SessionConfig::default()
    };
    let mut big = connect(&hub, config.clone(), 1024).await;
    let mut other = connect(&hub, config, 1024).await;

    let oversized = format!(r#"{{"type":"broadcast","payload":"{}"}}"#, "x".repeat(128));
    big.peer.send_text(&oversized).await.unwrap();

    let result = timeout(WAIT, big.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::Protocol(_))));
    assert_eq!(*big.state.borrow(), SessionState::Closed);
    assert_eq!(timeout(WAIT, big.peer.recv()).await.unwrap(), Some(WireFrame::Close));

    // Nothing was relayed and the other session still works.
    assert_eq!(hub.client_count().await.unwrap(), 1);
    other.peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
    let pong: serde_json::Value =
        serde_json::from_slice(&next_text(&mut other.peer).await).unwrap();
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn transport_error_ends_session() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let client = connect_default(&hub).await;

    client
        .peer
        .inject_error(TransportError::ReceiveFailed("connection reset".into()))
        .await
        .unwrap();

    let result = timeout(WAIT, client.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test]
async fn peer_close_frame_ends_session_cleanly() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut client = connect_default(&hub).await;

    client.peer.send(WireFrame::Close).await.unwrap();

    let result = timeout(WAIT, client.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(client.peer.recv().await, Some(WireFrame::Close));
    assert_eq!(client.peer.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn idle_peer_times_out() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let config = SessionConfig {
        ping_interval: Duration::from_secs(54),
        idle_timeout: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let mut client = connect(&hub, config, 1024).await;

    // The keepalive ping goes unanswered.
    assert_eq!(client.peer.recv().await, Some(WireFrame::Ping(Bytes::new())));

    let result = client.task.await.unwrap();
    assert!(matches!(result, Err(SessionError::IdleTimeout(_))));
    assert_eq!(client.peer.recv().await, Some(WireFrame::Close));
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn pongs_keep_session_alive() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let config = SessionConfig {
        ping_interval: Duration::from_secs(54),
        idle_timeout: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let mut client = connect(&hub, config, 1024).await;

    for _ in 0..5 {
        assert_eq!(client.peer.recv().await, Some(WireFrame::Ping(Bytes::new())));
        client.peer.send(WireFrame::Pong(Bytes::new())).await.unwrap();
    }

    assert_eq!(*client.state.borrow(), SessionState::Active);
    assert!(!client.task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_tears_down_stalled_writer() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    // One frame fits in the pipe and the peer never reads or pongs.
    let client = connect(&hub, SessionConfig::default(), 1).await;

    // The keepalive ping at 54s fills the pipe, so this broadcast blocks the writer.
    time::sleep(Duration::from_secs(55)).await;
    client
        .peer
        .send_text(r#"{"type":"broadcast","payload":"stuck"}"#)
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(600), client.task)
        .await
        .expect("session never finished")
        .unwrap();
    assert!(matches!(result, Err(SessionError::IdleTimeout(_))));
    assert_eq!(*client.state.borrow(), SessionState::Closed);
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_queue_on_pong_drops_sender() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let config = SessionConfig {
        queue_capacity: 1,
        ..SessionConfig::default()
    };
    // The peer never reads: one pong sits in the pipe, one blocks the writer,
    // one fills the queue and the next cannot be queued.
    let client = connect(&hub, config, 1).await;

    for _ in 0..8 {
        // Fails once the session has dropped its read half.
        if client.peer.send_text(r#"{"type":"ping"}"#).await.is_err() {
            break;
        }
    }

    let result = timeout(Duration::from_secs(600), client.task)
        .await
        .expect("session never finished")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(*client.state.borrow(), SessionState::Closed);
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test]
async fn session_runs_over_tungstenite() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_hub = hub.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = TungsteniteConnection::accept(stream).await.unwrap();
        Session::new(server_hub, SessionConfig::default())
            .run(Box::new(conn))
            .await
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let pong: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(pong["type"], "pong");

    ws.close(None).await.unwrap();
    assert!(timeout(WAIT, server).await.unwrap().unwrap().is_ok());
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test]
async fn slow_consumer_is_evicted() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut fast = connect_default(&hub).await;
    // Never read: one frame fits in the pipe, two in the queue.
    let slow_config = SessionConfig {
        queue_capacity: 2,
        ..SessionConfig::default()
    };
    let slow = connect(&hub, slow_config, 1).await;

    for i in 0..20 {
        fast.peer
            .send_text(&format!(r#"{{"type":"broadcast","payload":{}}}"#, i))
            .await
            .unwrap();
    }
    for _ in 0..20 {
        next_text(&mut fast.peer).await;
    }

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.clients, 1);

    // Once the slow peer catches up it sees what was queued, then a close.
    let mut slow_peer = slow.peer;
    let mut frames = Vec::new();
    while let Some(frame) = timeout(WAIT, slow_peer.recv()).await.unwrap() {
        frames.push(frame);
    }
    assert_eq!(frames.last(), Some(&WireFrame::Close));
    assert!(frames.len() < 20);
    assert!(timeout(WAIT, slow.task).await.unwrap().unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_reach_consistent_registry() {
    const SESSIONS: usize = 16;
    const PER_SESSION: usize = 5;

    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut clients = Vec::new();
    for _ in 0..SESSIONS {
        clients.push(connect_default(&hub).await);
    }
    assert_eq!(hub.client_count().await.unwrap(), SESSIONS);

    // Every session broadcasts concurrently and receives each broadcast once.
    let mut readers = Vec::new();
    for (n, client) in clients.into_iter().enumerate() {
        let Client { mut peer, task, .. } = client;
        let reader = tokio::spawn(async move {
            for i in 0..PER_SESSION {
                peer.send_text(&format!(
                    r#"{{"type":"broadcast","payload":"{}-{}"}}"#,
                    n, i
                ))
                .await
                .unwrap();
            }
            let mut seen = HashSet::new();
            for _ in 0..SESSIONS * PER_SESSION {
                assert!(seen.insert(next_text(&mut peer).await));
            }
            assert!(peer.try_recv().is_none());
            peer
        });
        readers.push((n, reader, task));
    }

    let mut peers = Vec::new();
    for (n, reader, task) in readers {
        peers.push((n, reader.await.unwrap(), task));
    }

    // Odd sessions hang up while even ones keep broadcasting.
    let mut leaving = Vec::new();
    let mut staying = Vec::new();
    for (n, peer, task) in peers {
        if n % 2 == 1 {
            drop(peer);
            leaving.push(task);
        } else {
            peer.send_text(&format!(r#"{{"type":"broadcast","payload":"{}-last"}}"#, n))
                .await
                .unwrap();
            staying.push(peer);
        }
    }

    for task in leaving {
        // A leaver may fail writing a late broadcast to its dropped peer.
        let _ = timeout(WAIT, task).await.unwrap().unwrap();
    }

    for peer in staying.iter_mut() {
        let mut seen = HashSet::new();
        for _ in 0..SESSIONS / 2 {
            assert!(seen.insert(next_text(peer).await));
        }
    }

    assert_eq!(hub.client_count().await.unwrap(), SESSIONS / 2);
}
