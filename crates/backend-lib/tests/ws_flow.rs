// ============================
// crates/backend-lib/tests/ws_flow.rs
// ============================
//! End-to-end session flows through the public API: join, draw relay,
//! paging, chat, and teardown, driven the same way the transport loop
//! drives a live connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use backend_lib::ai::{ModelError, VisionModel};
use backend_lib::config::Settings;
use backend_lib::validation;
use backend_lib::websocket::SessionHandler;
use backend_lib::AppState;
use sketchsync_common::{ClientMessage, DrawEvent, ServerMessage};

struct NoopModel;

#[async_trait]
impl VisionModel for NoopModel {
    async fn generate(&self, _: &str, _: &[u8], _: &str) -> Result<String, ModelError> {
        Ok("ok".to_string())
    }
}

struct TestClient {
    handler: SessionHandler<NoopModel>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl TestClient {
    fn connect(state: &Arc<AppState<NoopModel>>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        TestClient {
            handler: SessionHandler::new(Arc::clone(state), Uuid::new_v4(), tx),
            rx,
        }
    }

    /// Validate and dispatch, the way the transport loop does.
    fn send(&mut self, state: &AppState<NoopModel>, msg: ClientMessage) -> Option<ServerMessage> {
        validation::validate_client_message(&msg, &state.settings).expect("valid test message");
        self.handler.handle_message(msg)
    }

    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

fn join(room: &str, user: &str) -> ClientMessage {
    ClientMessage::JoinRoom {
        room_id: room.to_string(),
        user_id: Some(user.to_string()),
    }
}

fn segment(room: &str, sender: &str, x: f64) -> ClientMessage {
    ClientMessage::Draw(DrawEvent {
        room_id: room.to_string(),
        sender_id: sender.to_string(),
        x,
        y: 50.0,
        prev_x: x - 1.0,
        prev_y: 50.0,
        color: "#224466".to_string(),
        line_width: 3.0,
        page: 0,
        is_erasing: None,
        stroke_id: Some(format!("{sender}-stroke")),
        hand_gesture: None,
    })
}

#[tokio::test]
async fn test_full_whiteboard_session() {
    let state = Arc::new(AppState::new(NoopModel, Settings::default()));
    let mut alice = TestClient::connect(&state);
    let mut bob = TestClient::connect(&state);

    alice.send(&state, join("lesson-1", "alice"));
    bob.send(&state, join("lesson-1", "bob"));
    alice.drain();

    // strokes relay in arrival order with stroke boundaries intact
    for x in [10.0, 11.0, 12.0] {
        alice.send(&state, segment("lesson-1", "alice", x));
    }
    alice.send(
        &state,
        ClientMessage::EndStroke {
            room_id: "lesson-1".to_string(),
            stroke_id: "alice-stroke".to_string(),
            page: 0,
        },
    );

    let seen = bob.drain();
    assert_eq!(seen.len(), 4);
    let xs: Vec<f64> = seen
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Draw(b) => Some(b.event.x),
            _ => None,
        })
        .collect();
    assert_eq!(xs, vec![10.0, 11.0, 12.0]);
    assert!(matches!(seen[3], ServerMessage::EndStroke { .. }));

    // paging: bob adds a page, both sides converge on the same list
    let first_page = state.registry.initial_state("lesson-1").unwrap()[0].id.clone();
    bob.send(
        &state,
        ClientMessage::AddPage {
            room_id: "lesson-1".to_string(),
            page_id: first_page,
            image_data: "data:image/png;base64,aGVsbG8=".to_string(),
        },
    );
    let alice_view = alice.drain();
    let bob_view = bob.drain();
    let pages_of = |msgs: &[ServerMessage]| match msgs.last() {
        Some(ServerMessage::FullPageUpdate { pages, .. }) => pages.clone(),
        other => panic!("expected page update, got {other:?}"),
    };
    assert_eq!(pages_of(&alice_view), pages_of(&bob_view));
    assert_eq!(pages_of(&bob_view).len(), 2);

    // a refreshing client can reconstruct the room from the targeted seed
    let reply = alice
        .send(
            &state,
            ClientMessage::RequestInitialState {
                room_id: "lesson-1".to_string(),
            },
        )
        .unwrap();
    let ServerMessage::InitialState { pages, .. } = reply else {
        panic!("expected initial state");
    };
    assert_eq!(pages.len(), 2);

    // chat is stamped by the server and ordered
    for body in ["first", "second"] {
        alice.send(
            &state,
            ClientMessage::ChatMessage {
                room_id: "lesson-1".to_string(),
                username: "alice".to_string(),
                message: body.to_string(),
            },
        );
    }
    let stamps: Vec<i64> = bob
        .drain()
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ChatMessage { timestamp, .. } => Some(*timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(stamps.len(), 2);
    assert!(stamps[0] < stamps[1]);

    // both leave, room and fan-out state are fully reclaimed
    alice.handler.teardown();
    bob.handler.teardown();
    assert!(!state.registry.contains("lesson-1"));
    assert_eq!(state.registry.room_count(), 0);
    assert_eq!(state.clients.len(), 0);
    assert_eq!(state.presence.participants("lesson-1"), 0);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let state = Arc::new(AppState::new(NoopModel, Settings::default()));
    let mut alice = TestClient::connect(&state);
    let mut bob = TestClient::connect(&state);

    alice.send(&state, join("room-a", "alice"));
    bob.send(&state, join("room-b", "bob"));

    alice.send(&state, segment("room-a", "alice", 20.0));
    assert!(bob.drain().is_empty());

    // one room's teardown leaves the other untouched
    alice.handler.teardown();
    assert!(!state.registry.contains("room-a"));
    assert!(state.registry.contains("room-b"));
}

#[tokio::test]
async fn test_invalid_messages_never_reach_the_room() {
    let state = Arc::new(AppState::new(NoopModel, Settings::default()));

    let out_of_bounds = ClientMessage::Draw(DrawEvent {
        x: 1_000_000.0,
        ..match segment("lesson-1", "alice", 10.0) {
            ClientMessage::Draw(ev) => ev,
            _ => unreachable!(),
        }
    });
    assert!(validation::validate_client_message(&out_of_bounds, &state.settings).is_err());

    let bad_room = ClientMessage::ChatMessage {
        room_id: "no spaces allowed".to_string(),
        username: "alice".to_string(),
        message: "hi".to_string(),
    };
    assert!(validation::validate_client_message(&bad_room, &state.settings).is_err());
}
