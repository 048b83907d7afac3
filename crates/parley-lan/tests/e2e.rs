//! End-to-end tests over real sockets: server and clients each run their
//! own event loop thread, exactly as embedders use them.

use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use parley_lan::{LanClient, LanClientConfig, LanServer, LanServerConfig};
use parley_shared::crypto::sha256_hex;
use parley_shared::Frame;

const TOKEN: &str = "e2e-token";

fn test_server(dir: &Path) -> LanServer {
    let config = LanServerConfig {
        port: 0,
        bind_addr: "127.0.0.1".to_string(),
        server_name: "E2E".to_string(),
        token: TOKEN.to_string(),
        db_path: Some(dir.join("chat.db")),
        transfer_dir: Some(dir.join("transfers")),
        enable_beacon: false,
    };
    let mut server = LanServer::new(config).expect("server builds");
    assert!(server.start(), "server starts");
    server
}

struct EventLog {
    rx: Receiver<Frame>,
}

impl EventLog {
    /// Wait until a frame matching `pred` arrives, or panic after `wait`.
    fn wait_for(&self, wait: Duration, pred: impl Fn(&Frame) -> bool) -> Frame {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for frame");
            match self.rx.recv_timeout(remaining) {
                Ok(frame) if pred(&frame) => return frame,
                Ok(_) => continue,
                Err(e) => panic!("timed out waiting for frame: {e}"),
            }
        }
    }
}

fn test_client(username: &str, token: &str, dir: &Path) -> (LanClient, EventLog) {
    let (tx, rx): (Sender<Frame>, Receiver<Frame>) = channel();
    let client = LanClient::new(
        LanClientConfig::new(username, token, dir.join(format!("dl-{username}"))),
        std::sync::Arc::new(move |frame| {
            let _ = tx.send(frame);
        }),
    );
    (client, EventLog { rx })
}

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn scenario_a_create_join_history() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());

    let (mut alice, alice_events) = test_client("alice", TOKEN, dir.path());
    assert!(alice.connect("127.0.0.1", server.port()));

    alice.create_room("Lab", "secret", true, "");
    let created = alice_events.wait_for(WAIT, |f| f.kind == "m.room.created");
    let room_id = created.content["room_id"].as_str().unwrap().to_string();

    // Creator joins their own room and is admin immediately.
    alice.join_room(&room_id, "secret");
    alice_events.wait_for(WAIT, |f| f.kind == "m.room.joined");
    alice.send_message(&room_id, "hello");
    alice_events.wait_for(WAIT, |f| {
        f.kind == "m.room.message" && f.content["body"] == "hello"
    });

    let (mut bob, bob_events) = test_client("bob", TOKEN, dir.path());
    assert!(bob.connect("127.0.0.1", server.port()));
    bob.join_room(&room_id, "secret");

    let joined = bob_events.wait_for(WAIT, |f| f.kind == "m.room.joined");
    let history = joined.content["history"].as_array().unwrap();
    assert_eq!(
        history.last().unwrap()["content"]["body"],
        "hello",
        "history replay ends with the latest message"
    );

    assert_eq!(server.peer_count(), 2);
}

#[test]
fn scenario_b_file_relay_rehashes_to_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());

    let (mut alice, alice_events) = test_client("alice", TOKEN, dir.path());
    let (mut bob, bob_events) = test_client("bob", TOKEN, dir.path());
    assert!(alice.connect("127.0.0.1", server.port()));
    assert!(bob.connect("127.0.0.1", server.port()));

    alice.create_room("Files", "pw", true, "");
    let created = alice_events.wait_for(WAIT, |f| f.kind == "m.room.created");
    let room_id = created.content["room_id"].as_str().unwrap().to_string();
    bob.join_room(&room_id, "pw");
    bob_events.wait_for(WAIT, |f| f.kind == "m.room.joined");

    // 10 MB of non-trivial data.
    let payload: Vec<u8> = (0..10 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();
    let checksum = sha256_hex(&payload);
    let src = dir.path().join("big.bin");
    std::fs::write(&src, &payload).unwrap();

    assert!(alice.send_file(&room_id, &src));
    let stored = bob_events.wait_for(Duration::from_secs(60), |f| f.kind == "m.room.file");
    assert_eq!(stored.content["checksum"], checksum);
    let file_id = stored.content["file_id"].as_str().unwrap().to_string();

    bob.download_file(&room_id, &file_id);
    let received = bob_events.wait_for(Duration::from_secs(60), |f| f.kind == "m.file.received");
    assert_eq!(received.content["checksum"], checksum);
    assert_eq!(received.content["checksum_ok"], true);

    let saved = std::fs::read(received.content["path"].as_str().unwrap()).unwrap();
    assert_eq!(sha256_hex(&saved), checksum);
}

#[test]
fn scenario_c_origin_blacklisted_before_challenge() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());
    let port = server.port();

    // Five failed handshakes from this origin.
    for i in 0..5 {
        let (mut bad, _events) = test_client(&format!("bad{i}"), "wrong-token", dir.path());
        assert!(!bad.connect("127.0.0.1", port), "bad token must be refused");
    }

    // The sixth attempt is refused at the transport level: the socket is
    // dropped before any challenge is issued.
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let challenge_seen = runtime.block_on(async move {
        use futures::StreamExt;
        let url = format!("ws://127.0.0.1:{port}");
        let connect = tokio::time::timeout(
            Duration::from_secs(3),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await;
        match connect {
            Ok(Ok((mut ws, _))) => {
                // If the upgrade raced through, no challenge may follow.
                matches!(
                    tokio::time::timeout(Duration::from_secs(2), ws.next()).await,
                    Ok(Some(Ok(msg))) if msg.is_text()
                )
            }
            _ => false,
        }
    });
    assert!(!challenge_seen, "blacklisted origin must never see a challenge");
}

#[test]
fn duplicate_username_is_refused_and_first_session_survives() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());

    let (mut first, first_events) = test_client("carol", TOKEN, dir.path());
    assert!(first.connect("127.0.0.1", server.port()));

    let (mut imposter, _events) = test_client("carol", TOKEN, dir.path());
    assert!(!imposter.connect("127.0.0.1", server.port()));

    // The original session is untouched and still works.
    assert!(first.is_connected());
    first.create_room("Mine", "pw", true, "");
    first_events.wait_for(WAIT, |f| f.kind == "m.room.created");
    assert_eq!(server.peer_count(), 1);
}

#[test]
fn rate_limited_message_is_rejected_and_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());

    let (mut alice, alice_events) = test_client("alice", TOKEN, dir.path());
    assert!(alice.connect("127.0.0.1", server.port()));
    alice.create_room("Fast", "pw", true, "");
    let created = alice_events.wait_for(WAIT, |f| f.kind == "m.room.created");
    let room_id = created.content["room_id"].as_str().unwrap().to_string();

    for i in 0..30 {
        alice.send_message(&room_id, &format!("burst {i}"));
    }
    let rejected = alice_events.wait_for(WAIT, |f| {
        f.kind == "m.error" && f.content["code"] == "M_RATE_LIMITED"
    });
    assert_eq!(rejected.content["code"], "M_RATE_LIMITED");

    // Once the limiter trips, at most the ceiling's worth of messages made
    // it into history.
    let (mut bob, bob_events) = test_client("bob", TOKEN, dir.path());
    assert!(bob.connect("127.0.0.1", server.port()));
    bob.join_room(&room_id, "pw");
    let joined = bob_events.wait_for(WAIT, |f| f.kind == "m.room.joined");
    let history = joined.content["history"].as_array().unwrap();
    let burst_count = history
        .iter()
        .filter(|ev| ev["type"] == "m.room.message")
        .count();
    assert!(burst_count < 30, "rate-limited messages must not reach history");
}

#[test]
fn wrong_room_password_gets_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());

    let (mut alice, alice_events) = test_client("alice", TOKEN, dir.path());
    assert!(alice.connect("127.0.0.1", server.port()));
    alice.create_room("Locked", "right", true, "");
    let created = alice_events.wait_for(WAIT, |f| f.kind == "m.room.created");
    let room_id = created.content["room_id"].as_str().unwrap().to_string();

    let (mut bob, bob_events) = test_client("bob", TOKEN, dir.path());
    assert!(bob.connect("127.0.0.1", server.port()));
    bob.join_room(&room_id, "wrong");
    let reply = bob_events.wait_for(WAIT, |f| f.kind == "m.error");
    assert_eq!(reply.content["code"], "M_FORBIDDEN");
}

#[test]
fn broadcast_text_reaches_connected_clients() {
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(dir.path());

    let (mut alice, alice_events) = test_client("alice", TOKEN, dir.path());
    assert!(alice.connect("127.0.0.1", server.port()));

    server.broadcast_text("transcript: hello room");
    let mirrored = alice_events.wait_for(WAIT, |f| {
        f.kind == "m.room.message" && f.sender.as_deref() == Some("[server]")
    });
    assert_eq!(mirrored.content["body"], "transcript: hello room");
}
