//! Host/joiner tests over loopback. No Tor daemon is involved: non-onion
//! hosts dial directly, which is exactly what these tests exercise.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parley_p2p::{HostedRoom, JoinCredentials, P2pError, RoomAddress, RoomConnection, RoomHost};
use parley_shared::crypto::{hash_room_password, make_salt, sha256_hex};
use parley_shared::identity::{Identity, SessionKey};
use parley_shared::types::{make_room_id, now_ms};
use parley_shared::{Frame, Realm};

const WAIT: Duration = Duration::from_secs(10);

struct EventLog {
    rx: Receiver<Frame>,
}

impl EventLog {
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

fn event_log() -> (parley_p2p::EventCallback, EventLog) {
    let (tx, rx) = channel();
    (
        Arc::new(move |frame| {
            let _ = tx.send(frame);
        }),
        EventLog { rx },
    )
}

fn sample_room(password: &str) -> HostedRoom {
    let salt = make_salt();
    let password_hash = if password.is_empty() {
        String::new()
    } else {
        hash_room_password(password, &salt)
    };
    HostedRoom {
        room_id: make_room_id(Realm::P2p),
        name: "Hidden Lab".to_string(),
        creator: "host".to_string(),
        password_hash,
        password_salt: salt,
        public: true,
        created_at: now_ms(),
        topic: "quiet".to_string(),
        host_onion: String::new(),
        members: HashMap::from([("host".to_string(), "did:parley:host".to_string())]),
    }
}

fn credentials(username: &str, password: &str) -> JoinCredentials {
    let identity = Identity::generate();
    let session = SessionKey::generate();
    JoinCredentials {
        username: username.to_string(),
        did: identity.public_id(),
        session_pubkey: session.public_hex(),
        auth_token: identity.auth_token(&session),
        room_password: password.to_string(),
    }
}

fn address_of(host: &RoomHost) -> RoomAddress {
    RoomAddress::parse(&format!("127.0.0.1:{}/{}", host.port(), host.room_id())).unwrap()
}

#[test]
fn join_and_message_round_trip() {
    let (host_cb, host_events) = event_log();
    let mut host = RoomHost::new(sample_room("pw"), "host", host_cb);
    assert!(host.start(0));

    let (alice_cb, alice_events) = event_log();
    let conn = RoomConnection::connect(address_of(&host), credentials("alice", "pw"), alice_cb)
        .expect("join succeeds");
    assert!(conn.is_connected());
    assert_eq!(conn.room_name(), "Hidden Lab");
    // Membership snapshot from the handshake includes the host.
    assert!(conn
        .members()
        .iter()
        .any(|m| m["username"] == "host"));

    host_events.wait_for(WAIT, |f| {
        f.kind == "m.member.join" && f.content["username"] == "alice"
    });

    conn.send(&Frame::new(
        "c.message",
        serde_json::json!({ "body": "hello over the overlay", "sig": "" }),
    ));
    // Host UI sees the message; the sender receives the broadcast echo.
    let seen = host_events.wait_for(WAIT, |f| f.kind == "m.room.message");
    assert_eq!(seen.content["body"], "hello over the overlay");
    assert_eq!(seen.sender.as_deref(), Some("alice"));
    alice_events.wait_for(WAIT, |f| f.kind == "m.room.message");

    assert_eq!(host.peer_count(), 1);
}

#[test]
fn wrong_password_is_rejected() {
    let (host_cb, _events) = event_log();
    let mut host = RoomHost::new(sample_room("right"), "host", host_cb);
    assert!(host.start(0));

    let (cb, _log) = event_log();
    let result = RoomConnection::connect(address_of(&host), credentials("bob", "wrong"), cb);
    match result {
        Err(P2pError::Rejected(reason)) => assert!(reason.contains("wrong_password")),
        other => panic!("expected wrong_password rejection, got {other:?}"),
    }
    assert_eq!(host.peer_count(), 0);
}

#[test]
fn same_name_different_identity_is_refused() {
    let (host_cb, _events) = event_log();
    let mut host = RoomHost::new(sample_room(""), "host", host_cb);
    assert!(host.start(0));

    let (cb1, _log1) = event_log();
    let first = RoomConnection::connect(address_of(&host), credentials("carol", ""), cb1)
        .expect("first join succeeds");

    let (cb2, _log2) = event_log();
    let result = RoomConnection::connect(address_of(&host), credentials("carol", ""), cb2);
    match result {
        Err(P2pError::Rejected(reason)) => assert!(reason.contains("username_taken")),
        other => panic!("expected username_taken rejection, got {other:?}"),
    }

    // The original session is untouched.
    assert!(first.is_connected());
    assert_eq!(host.peer_count(), 1);
}

#[test]
fn same_identity_reconnect_evicts_stale_session() {
    let (host_cb, host_events) = event_log();
    let mut host = RoomHost::new(sample_room(""), "host", host_cb);
    assert!(host.start(0));

    let creds = credentials("dave", "");
    let (cb1, _log1) = event_log();
    let _first = RoomConnection::connect(address_of(&host), creds.clone(), cb1)
        .expect("first join succeeds");
    host_events.wait_for(WAIT, |f| f.kind == "m.member.join");

    let (cb2, _log2) = event_log();
    let second = RoomConnection::connect(address_of(&host), creds, cb2)
        .expect("same identity reconnects transparently");
    assert!(second.is_connected());

    // Exactly one live connection for this member remains.
    let deadline = Instant::now() + WAIT;
    while host.peer_count() != 1 {
        assert!(Instant::now() < deadline, "stale session was not evicted");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(host
        .members()
        .iter()
        .any(|(username, _)| username == "dave"));
}

#[test]
fn file_relay_reaches_other_members_with_checksum() {
    let (host_cb, _host_events) = event_log();
    let mut host = RoomHost::new(sample_room(""), "host", host_cb);
    assert!(host.start(0));

    let (alice_cb, _alice_events) = event_log();
    let alice = RoomConnection::connect(address_of(&host), credentials("alice", ""), alice_cb)
        .expect("alice joins");
    let (bob_cb, bob_events) = event_log();
    let _bob = RoomConnection::connect(address_of(&host), credentials("bob", ""), bob_cb)
        .expect("bob joins");

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let checksum = sha256_hex(&payload);
    assert!(alice.send_file_bytes("data.bin", payload.clone()));

    let begin = bob_events.wait_for(WAIT, |f| f.kind == "m.file.begin");
    assert_eq!(begin.content["checksum"], checksum);
    let file_id = begin.content["file_id"].as_str().unwrap().to_string();

    let mut assembled = Vec::new();
    loop {
        let frame = bob_events.wait_for(WAIT, |f| {
            (f.kind == "m.file.chunk" || f.kind == "m.file.end")
                && f.content["file_id"] == file_id.as_str()
        });
        if frame.kind == "m.file.end" {
            assert_eq!(frame.content["cs_ok"], true);
            break;
        }
        let chunk = frame.content["data"].as_str().unwrap();
        use base64::Engine;
        assembled.extend(
            base64::engine::general_purpose::STANDARD
                .decode(chunk)
                .unwrap(),
        );
    }
    assert_eq!(sha256_hex(&assembled), checksum);
}
