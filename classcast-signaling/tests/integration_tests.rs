//! End-to-end tests for the ClassCast signaling server
//!
//! These tests drive the server over real WebSocket connections:
//! - Joining, roster announcements and leaving
//! - Offer relay between teacher and student
//! - Structured rejections
//! - Disconnect cleanup and session stop

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use classcast_core::{ClassroomConfig, ConnectionKey, Role, SessionId};
use classcast_signaling::{
    ClientMessage, Envelope, LeaveReason, ServerEnvelope, ServerMessage, SessionRegistry,
    SignalingRelay, SignalingServer, Target,
};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestClient {
    write: futures::stream::SplitSink<WsStream, Message>,
    read: futures::stream::SplitStream<WsStream>,
    participant: String,
    seq: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr, participant: &str) -> Self {
        let url = format!("ws://127.0.0.1:{}", addr.port());
        let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(&url))
            .await
            .expect("WebSocket connection timeout")
            .expect("WebSocket handshake failed");
        let (write, read) = ws_stream.split();
        Self {
            write,
            read,
            participant: participant.to_string(),
            seq: 0,
        }
    }

    async fn send(&mut self, target: Target, message: ClientMessage) {
        self.seq += 1;
        let envelope = Envelope {
            session_id: "class-1".into(),
            sender: self.participant.as_str().into(),
            target,
            seq: self.seq,
            message,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        timeout(Duration::from_secs(5), self.write.send(Message::Text(json)))
            .await
            .expect("Send timeout")
            .unwrap();
    }

    async fn recv(&mut self) -> ServerEnvelope {
        loop {
            match timeout(Duration::from_secs(5), self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return serde_json::from_str(&text).expect("Server sent invalid JSON");
                }
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
                other => panic!("Expected a text frame, got: {:?}", other),
            }
        }
    }
}

async fn start_test_server() -> (Arc<SessionRegistry>, SocketAddr) {
    let registry = Arc::new(SessionRegistry::new(ClassroomConfig::default()));
    let session_id = registry
        .create_session_with_id("class-1".into(), "teacher".into())
        .unwrap();
    registry.start(&session_id).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Arc::new(SignalingRelay::new(Arc::clone(&registry)));
    let server = SignalingServer::new(addr, relay);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (registry, addr)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition not met in time");
}

#[tokio::test]
async fn test_join_announces_roster() {
    let (_registry, addr) = start_test_server().await;

    let mut teacher = TestClient::connect(addr, "teacher").await;
    teacher
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Teacher })
        .await;
    let ack = teacher.recv().await;
    assert_eq!(ack.seq, 1);
    assert!(ack.from.is_none());
    match ack.message {
        ServerMessage::Joined { participant_id, peers, .. } => {
            assert_eq!(participant_id.as_str(), "teacher");
            assert!(peers.is_empty());
        }
        other => panic!("Expected Joined, got: {:?}", other),
    }

    let mut student = TestClient::connect(addr, "ana").await;
    student
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Student })
        .await;
    match student.recv().await.message {
        ServerMessage::Joined { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].participant_id.as_str(), "teacher");
            assert_eq!(peers[0].role, Role::Teacher);
        }
        other => panic!("Expected Joined, got: {:?}", other),
    }

    match teacher.recv().await.message {
        ServerMessage::Joined { participant_id, role, .. } => {
            assert_eq!(participant_id.as_str(), "ana");
            assert_eq!(role, Role::Student);
        }
        other => panic!("Expected Joined, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_offer_is_relayed_with_sender_metadata() {
    let (_registry, addr) = start_test_server().await;
    let mut teacher = TestClient::connect(addr, "teacher").await;
    let mut student = TestClient::connect(addr, "ana").await;

    teacher
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Teacher })
        .await;
    teacher.recv().await;
    student
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Student })
        .await;
    student.recv().await;
    teacher.recv().await;

    teacher
        .send(
            Target::Participant("ana".into()),
            ClientMessage::Offer {
                payload: json!({"sdp": "v=0 o=- 1 1 IN IP4 0.0.0.0"}),
            },
        )
        .await;

    let relayed = student.recv().await;
    assert_eq!(relayed.from.as_ref().map(|p| p.as_str()), Some("teacher"));
    assert_eq!(relayed.seq, 2);
    match relayed.message {
        ServerMessage::Offer { payload } => {
            assert_eq!(payload["sdp"], "v=0 o=- 1 1 IN IP4 0.0.0.0");
        }
        other => panic!("Expected Offer, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_message_before_join_is_rejected() {
    let (_registry, addr) = start_test_server().await;
    let mut client = TestClient::connect(addr, "ana").await;

    client.send(Target::Broadcast, ClientMessage::FloorRequest).await;
    match client.recv().await.message {
        ServerMessage::Rejected { error_code, seq, .. } => {
            assert_eq!(error_code, "INVALID_STATE");
            assert_eq!(seq, Some(1));
        }
        other => panic!("Expected Rejected, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_json_is_rejected() {
    let (_registry, addr) = start_test_server().await;
    let mut client = TestClient::connect(addr, "ana").await;

    client
        .write
        .send(Message::Text("{\"type\": \"teleport\"}".to_string()))
        .await
        .unwrap();
    match client.recv().await.message {
        ServerMessage::Rejected { error_code, .. } => assert_eq!(error_code, "INVALID_MESSAGE"),
        other => panic!("Expected Rejected, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_removes_participant() {
    let (registry, addr) = start_test_server().await;
    let mut teacher = TestClient::connect(addr, "teacher").await;
    teacher
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Teacher })
        .await;
    teacher.recv().await;

    let mut student = TestClient::connect(addr, "ana").await;
    student
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Student })
        .await;
    student.recv().await;
    teacher.recv().await;

    drop(student);

    match teacher.recv().await.message {
        ServerMessage::Left { participant_id, reason } => {
            assert_eq!(participant_id.as_str(), "ana");
            assert_eq!(reason, LeaveReason::Disconnected);
        }
        other => panic!("Expected Left, got: {:?}", other),
    }
    let key = ConnectionKey::new("class-1".into(), "ana".into());
    wait_for(|| registry.connection(&key).is_none()).await;
}

#[tokio::test]
async fn test_stop_notifies_connected_participants() {
    let (registry, addr) = start_test_server().await;
    let mut student = TestClient::connect(addr, "ana").await;
    student
        .send(Target::Broadcast, ClientMessage::Join { role: Role::Student })
        .await;
    student.recv().await;

    let session_id = SessionId::new("class-1");
    assert!(registry.stop(&session_id).unwrap());
    match student.recv().await.message {
        ServerMessage::SessionStopped { .. } => {}
        other => panic!("Expected SessionStopped, got: {:?}", other),
    }

    // Traffic after the stop is dropped silently
    student.send(Target::Broadcast, ClientMessage::FloorRequest).await;
    let silence = timeout(Duration::from_millis(200), student.read.next()).await;
    assert!(silence.is_err() || matches!(silence, Ok(None) | Ok(Some(Ok(Message::Close(_))))));
}
