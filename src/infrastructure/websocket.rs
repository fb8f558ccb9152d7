//! WebSocket handler for GM and player connections
//!
//! A connection joins one session at a time. Once joined, two forwarders run
//! beside the read loop: one pushes the viewer's filtered event stream, the
//! other pushes snapshot changes. Commands are answered only on failure; their
//! effects arrive through the forwarders like everyone else's.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::application::dto::{CharacterBindingDto, SessionSnapshot};
use crate::application::services::{JoinRequest, SessionError};
use crate::domain::entities::{EventRecord, Participant, SceneUpdate};
use crate::domain::value_objects::{RollVisibility, SessionId, UserId};
use crate::infrastructure::state::AppState;

/// Messages from GM and player clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join (or rejoin) a session
    JoinSession {
        session_id: String,
        user_id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        character: Option<CharacterBindingDto>,
        /// Sequence of the last event this client saw; replay resumes after it
        #[serde(default)]
        last_seen_seq: Option<u64>,
    },
    /// Chat line, or a whisper when `recipient` is set
    SendMessage {
        text: String,
        #[serde(default)]
        recipient: Option<String>,
    },
    RollDice {
        notation: String,
        #[serde(default)]
        visibility: RollVisibility,
    },
    /// GM: begin turns with this order
    StartTurn { order: Vec<String> },
    AdvanceTurn,
    PauseTurn,
    ResumeTurn,
    SkipParticipant { user_id: String },
    /// GM: halt the rotation without ending the session
    StopTurns,
    SetScene { scene: SceneUpdate },
    EndSession,
    Heartbeat,
}

/// Messages to GM and player clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    SessionJoined {
        participant: Participant,
        snapshot: SessionSnapshot,
    },
    Event { record: EventRecord },
    Snapshot { snapshot: SessionSnapshot },
    Error { code: String, message: String },
    Pong,
}

impl ServerMessage {
    fn error(err: &SessionError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// The session a connection is attached to, with its forwarders
struct Attachment {
    session_id: SessionId,
    user_id: UserId,
    forwarders: Vec<JoinHandle<()>>,
}

impl Attachment {
    /// Stop forwarding and mark the participant offline
    async fn detach(self, state: &AppState) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        match state
            .coordinator
            .leave_session(self.session_id, &self.user_id)
            .await
        {
            Ok(()) => {}
            Err(SessionError::SessionEnded(_)) | Err(SessionError::SessionNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, user_id = %self.user_id, error = %e, "Failed to mark participant offline");
            }
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    tracing::info!("New WebSocket connection established");

    // Spawn a task to forward messages from the channel to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize server message: {}", e),
            }
        }
    });

    let mut attachment: Option<Attachment> = None;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    if let Some(response) = handle_message(msg, &state, &mut attachment, &tx).await {
                        if tx.send(response).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse message: {}", e);
                    let error = ServerMessage::Error {
                        code: "PARSE_ERROR".to_string(),
                        message: format!("Invalid message format: {}", e),
                    };
                    if tx.send(error).is_err() {
                        break;
                    }
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket connection closed by client");
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    if let Some(attachment) = attachment.take() {
        tracing::info!(session_id = %attachment.session_id, user_id = %attachment.user_id, "Client disconnected from session");
        attachment.detach(&state).await;
    }
    send_task.abort();

    tracing::info!("WebSocket connection terminated");
}

async fn handle_message(
    msg: ClientMessage,
    state: &AppState,
    attachment: &mut Option<Attachment>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<ServerMessage> {
    if let ClientMessage::Heartbeat = msg {
        return Some(ServerMessage::Pong);
    }

    if let ClientMessage::JoinSession {
        session_id,
        user_id,
        display_name,
        character,
        last_seen_seq,
    } = msg
    {
        let Some(session_id) = SessionId::parse(&session_id) else {
            return Some(invalid("Invalid session ID"));
        };
        let character = match character.map(CharacterBindingDto::into_binding) {
            Some(None) => return Some(invalid("Invalid character ID")),
            Some(binding) => binding,
            None => None,
        };
        if let Some(previous) = attachment.take() {
            previous.detach(state).await;
        }
        let request = JoinRequest {
            display_name: display_name.unwrap_or_else(|| user_id.clone()),
            user_id: UserId::new(user_id),
            character,
        };
        return match join(state, session_id, request, last_seen_seq, tx).await {
            Ok(joined) => {
                *attachment = Some(joined);
                None
            }
            Err(e) => Some(ServerMessage::error(&e)),
        };
    }

    let Some(current) = attachment.as_ref() else {
        return Some(ServerMessage::Error {
            code: "NOT_JOINED".to_string(),
            message: "Join a session first".to_string(),
        });
    };

    match dispatch(msg, state, current.session_id, &current.user_id).await {
        Ok(()) => None,
        Err(e) => {
            tracing::debug!(session_id = %current.session_id, user_id = %current.user_id, error = %e, "Command rejected");
            Some(ServerMessage::error(&e))
        }
    }
}

fn invalid(message: &str) -> ServerMessage {
    ServerMessage::error(&SessionError::InvalidRequest(message.to_string()))
}

/// Join, reply with the snapshot, then start the forwarders
async fn join(
    state: &AppState,
    session_id: SessionId,
    request: JoinRequest,
    last_seen_seq: Option<u64>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<Attachment, SessionError> {
    let user_id = request.user_id.clone();
    let coordinator = &state.coordinator;

    let participant = coordinator.join_session(session_id, request).await?;
    let (snapshot, mut events) = coordinator.resync(session_id, &user_id, last_seen_seq).await?;
    let mut snapshots = coordinator.watch_snapshots(session_id).await?;
    snapshots.borrow_and_update();

    // Replies ahead of the forwarders, so the snapshot precedes any replay
    let _ = tx.send(ServerMessage::SessionJoined {
        participant,
        snapshot: snapshot.as_ref().clone(),
    });

    let event_forwarder = {
        let tx = tx.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            while let Some(record) = events.next().await {
                if tx.send(ServerMessage::Event { record }).is_err() {
                    tracing::debug!(session_id = %session_id, user_id = %user_id, "Event delivery stopped, connection gone");
                    return;
                }
            }
        })
    };

    let snapshot_forwarder = {
        let tx = tx.clone();
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().as_ref().clone();
                if tx.send(ServerMessage::Snapshot { snapshot }).is_err() {
                    return;
                }
            }
        })
    };

    Ok(Attachment {
        session_id,
        user_id,
        forwarders: vec![event_forwarder, snapshot_forwarder],
    })
}

async fn dispatch(
    msg: ClientMessage,
    state: &AppState,
    session_id: SessionId,
    user_id: &UserId,
) -> Result<(), SessionError> {
    let coordinator = &state.coordinator;
    match msg {
        ClientMessage::SendMessage { text, recipient } => {
            coordinator
                .send_message(session_id, user_id, &text, recipient.map(UserId::new))
                .await?;
        }
        ClientMessage::RollDice {
            notation,
            visibility,
        } => {
            coordinator
                .roll_dice(session_id, user_id, &notation, visibility)
                .await?;
        }
        ClientMessage::StartTurn { order } => {
            let order = order.into_iter().map(UserId::new).collect();
            coordinator.start_turn(session_id, user_id, order).await?;
        }
        ClientMessage::AdvanceTurn => {
            coordinator.advance_turn(session_id, user_id).await?;
        }
        ClientMessage::PauseTurn => {
            coordinator.pause_turn(session_id, user_id).await?;
        }
        ClientMessage::ResumeTurn => {
            coordinator.resume_turn(session_id, user_id).await?;
        }
        ClientMessage::SkipParticipant { user_id: target } => {
            coordinator
                .skip_participant(session_id, user_id, &UserId::new(target))
                .await?;
        }
        ClientMessage::StopTurns => {
            coordinator.stop_turns(session_id, user_id).await?;
        }
        ClientMessage::SetScene { scene } => {
            coordinator.set_scene(session_id, user_id, scene).await?;
        }
        ClientMessage::EndSession => {
            coordinator.end_session(session_id, user_id).await?;
        }
        ClientMessage::JoinSession { .. } | ClientMessage::Heartbeat => {}
    }
    Ok(())
}
