use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use animus_core::AppError;
use animus_types::events::{
    DashboardBots, DashboardData, GatewayCommand, GatewayEvent,
};
use animus_types::models::User;

use crate::GatewayState;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How many public bots the dashboard aggregate carries.
const DASHBOARD_PUBLIC_LIMIT: u32 = 10;
/// How many of the user's own bots count as "recent".
const DASHBOARD_RECENT_LIMIT: usize = 5;

/// The only per-connection state: the identity bound by `authenticate` or
/// `guest-login`. Everything else lives in the shared services.
type Identity = Arc<RwLock<Option<User>>>;

/// Handle a single WebSocket connection. Connections start unauthenticated;
/// every domain command is rejected with AUTH_REQUIRED until an identity is
/// bound. Re-authenticating simply rebinds (used for token refresh).
pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    info!("Client connected: {}", conn_id);

    let identity: Identity = Arc::new(RwLock::new(None));

    // Direct replies to this client go through this channel; the send task
    // owns the socket sink.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let mut broadcast_rx = state.dispatcher.subscribe();

    let pong_received = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward replies + broadcasts to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = reply_rx.recv() => {
                    let Some(event) = result else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    // The originator already received a direct reply.
                    if msg.origin == conn_id {
                        continue;
                    }
                    let text = serde_json::to_string(&msg.event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, std::sync::atomic::Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client. Commands for this connection run to
    // completion in order; a slow collaborator call stalls only this loop.
    let state_recv = state.clone();
    let identity_recv = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&state_recv, conn_id, &identity_recv, &reply_tx, cmd)
                            .await;
                    }
                    Err(e) => {
                        let snippet: String = text.chars().take(200).collect();
                        warn!("{} bad command: {} -- raw: {}", conn_id, e, snippet);
                        let _ = reply_tx.send(GatewayEvent::Error(
                            AppError::Validation("Malformed request payload".into()).payload(),
                        ));
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, std::sync::atomic::Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("Client disconnected: {}", conn_id);
}

/// Dispatch one inbound event to the owning service and push the response
/// event(s) back through `reply`. All failures become structured `error`
/// events; nothing else crosses the transport.
async fn handle_command(
    state: &GatewayState,
    conn_id: Uuid,
    identity: &Identity,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Authenticate { token } => {
            match state.auth.verify_token(&token).await {
                Ok(user) => {
                    info!("User authenticated: {} ({})", user.username, conn_id);
                    bind_identity(identity, &user);
                    let _ = reply.send(GatewayEvent::Authenticated(user.clone()));
                    send_dashboard(state, reply, user).await;
                }
                Err(e) => {
                    warn!("{} authentication failed: {}", conn_id, e);
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }

        GatewayCommand::GuestLogin => match state.auth.guest_login().await {
            Ok((_token, user)) => {
                info!("Guest authenticated: {} ({})", user.username, conn_id);
                bind_identity(identity, &user);
                let _ = reply.send(GatewayEvent::Authenticated(user.clone()));
                send_dashboard(state, reply, user).await;
            }
            Err(e) => {
                let _ = reply.send(GatewayEvent::Error(e.payload()));
            }
        },

        GatewayCommand::GeneratePrompt(request) => {
            let Some(user) = require_user(identity, reply) else { return };
            match state.registry.generate(user.id, &request).await {
                Ok(persona) => {
                    if persona.is_public {
                        state
                            .dispatcher
                            .broadcast(conn_id, GatewayEvent::DigitalHumanUpdated(persona.clone()));
                    }
                    let _ = reply.send(GatewayEvent::PromptGenerated(persona));
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }

        GatewayCommand::SaveDigitalHuman(persona) => {
            let Some(user) = require_user(identity, reply) else { return };
            match state.registry.save(user.id, persona).await {
                Ok(saved) => {
                    if saved.is_public {
                        state
                            .dispatcher
                            .broadcast(conn_id, GatewayEvent::DigitalHumanUpdated(saved.clone()));
                    }
                    let _ = reply.send(GatewayEvent::DigitalHumanSaved(saved));
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }

        GatewayCommand::UpdateDigitalHuman(persona) => {
            let Some(user) = require_user(identity, reply) else { return };
            match state.registry.update(user.id, persona).await {
                Ok(updated) => {
                    if updated.is_public {
                        state
                            .dispatcher
                            .broadcast(conn_id, GatewayEvent::DigitalHumanUpdated(updated.clone()));
                    }
                    let _ = reply.send(GatewayEvent::DigitalHumanUpdated(updated));
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }

        GatewayCommand::DeleteDigitalHuman(id) => {
            let Some(user) = require_user(identity, reply) else { return };
            let was_public = match state.registry.get(id).await {
                Ok(found) => found.map(|p| p.is_public).unwrap_or(false),
                Err(_) => false,
            };
            match state.registry.delete(user.id, id).await {
                Ok(()) => {
                    if was_public {
                        state
                            .dispatcher
                            .broadcast(conn_id, GatewayEvent::DigitalHumanDeleted(id));
                    }
                    let _ = reply.send(GatewayEvent::DigitalHumanDeleted(id));
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload_with_code("DELETE_ERROR")));
                }
            }
        }

        GatewayCommand::SendMessage(request) => {
            let Some(user) = require_user(identity, reply) else { return };
            // Server-held history is authoritative; request.chat_history is
            // deliberately ignored.
            match state
                .chat
                .post_user_message(user.id, request.digital_human_id, &request.message)
                .await
            {
                Ok(message) => {
                    let _ = reply.send(GatewayEvent::MessageReceived(message));
                }
                Err(e) => {
                    // Send failures surface as MESSAGE_ERROR, the code this
                    // event's handler switches on; only bad input keeps its
                    // validation code.
                    let payload = match e {
                        AppError::Validation(_) => e.payload(),
                        _ => e.payload_with_code("MESSAGE_ERROR"),
                    };
                    let _ = reply.send(GatewayEvent::Error(payload));
                }
            }
        }

        GatewayCommand::JoinChat(digital_human_id) => {
            let Some(user) = require_user(identity, reply) else { return };
            match state.chat.get_history(user.id, digital_human_id).await {
                Ok(history) => {
                    let count = history.len();
                    for message in history {
                        let _ = reply.send(GatewayEvent::MessageReceived(message));
                    }
                    info!(
                        "Sent {} historical messages to {} ({})",
                        count, user.username, conn_id
                    );
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }

        GatewayCommand::ClearHistory(digital_human_id) => {
            let Some(user) = require_user(identity, reply) else { return };
            match state.chat.clear_history(user.id, digital_human_id).await {
                Ok(()) => {
                    let _ = reply.send(GatewayEvent::HistoryCleared(digital_human_id));
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }

        GatewayCommand::GetDashboardData => {
            let Some(user) = require_user(identity, reply) else { return };
            send_dashboard(state, reply, user).await;
        }

        GatewayCommand::LoadDigitalHumans => {
            let Some(user) = require_user(identity, reply) else { return };
            match state.registry.list_for_user(user.id).await {
                Ok(bots) => {
                    let _ = reply.send(GatewayEvent::DigitalHumans(bots));
                }
                Err(e) => {
                    let _ = reply.send(GatewayEvent::Error(e.payload()));
                }
            }
        }
    }
}

fn bind_identity(identity: &Identity, user: &User) {
    *identity.write().expect("identity lock poisoned") = Some(user.clone());
}

/// Returns the bound user, or pushes an AUTH_REQUIRED error and returns None.
fn require_user(identity: &Identity, reply: &mpsc::UnboundedSender<GatewayEvent>) -> Option<User> {
    let user = identity.read().expect("identity lock poisoned").clone();
    if user.is_none() {
        let _ = reply.send(GatewayEvent::Error(AppError::AuthRequired.payload()));
    }
    user
}

/// Aggregate read backing the dashboard view, shaped the way the client
/// consumes it: own bots, top public bots, and a recent slice.
async fn send_dashboard(
    state: &GatewayState,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
    user: User,
) {
    match build_dashboard(state, user).await {
        Ok(data) => {
            let _ = reply.send(GatewayEvent::DashboardData(data));
        }
        Err(e) => {
            let _ = reply.send(GatewayEvent::Error(e.payload_with_code("DASHBOARD_ERROR")));
        }
    }
}

async fn build_dashboard(state: &GatewayState, user: User) -> Result<DashboardData, AppError> {
    let user_bots = state.registry.list_for_user(user.id).await?;
    let public_bots = state.registry.list_public(DASHBOARD_PUBLIC_LIMIT).await?;
    let chat_sessions = state.chat.sessions_for_user(user.id).await?;

    let recent_bots = user_bots
        .iter()
        .take(DASHBOARD_RECENT_LIMIT)
        .cloned()
        .collect();

    Ok(DashboardData {
        user,
        digital_humans: DashboardBots {
            user_bots,
            public_bots,
            recent_bots,
        },
        chat_sessions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use animus_core::{AuthService, ChatRouter, PersonaRegistry};
    use animus_db::Database;
    use animus_engine::template::TemplateEngine;
    use animus_types::api::GenerateRequest;
    use crate::dispatcher::Dispatcher;

    fn gateway() -> GatewayState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(PersonaRegistry::new(db.clone(), Arc::new(TemplateEngine)));
        let chat = Arc::new(ChatRouter::new(db.clone(), registry.clone()));
        GatewayState {
            auth: Arc::new(AuthService::new(db, "test-secret".into())),
            registry,
            chat,
            dispatcher: Dispatcher::new(),
        }
    }

    fn connection() -> (
        Uuid,
        Identity,
        mpsc::UnboundedSender<GatewayEvent>,
        mpsc::UnboundedReceiver<GatewayEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), Arc::new(RwLock::new(None)), tx, rx)
    }

    async fn authenticate(
        state: &GatewayState,
        conn_id: Uuid,
        identity: &Identity,
        tx: &mpsc::UnboundedSender<GatewayEvent>,
        rx: &mut mpsc::UnboundedReceiver<GatewayEvent>,
    ) -> User {
        let (token, _) = state
            .auth
            .register("alice", "alice@x.com", "pw123456")
            .await
            .unwrap();
        handle_command(state, conn_id, identity, tx, GatewayCommand::Authenticate { token })
            .await;

        let user = match rx.recv().await.unwrap() {
            GatewayEvent::Authenticated(user) => user,
            other => panic!("expected authenticated, got {:?}", other),
        };
        // Authentication auto-sends the dashboard.
        assert!(matches!(
            rx.recv().await.unwrap(),
            GatewayEvent::DashboardData(_)
        ));
        user
    }

    #[tokio::test]
    async fn domain_events_require_identity() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();

        handle_command(&state, conn_id, &identity, &tx, GatewayCommand::GetDashboardData).await;

        match rx.recv().await.unwrap() {
            GatewayEvent::Error(payload) => assert_eq!(payload.code, "AUTH_REQUIRED"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_token_yields_auth_error() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();

        handle_command(
            &state,
            conn_id,
            &identity,
            &tx,
            GatewayCommand::Authenticate { token: "garbage".into() },
        )
        .await;

        match rx.recv().await.unwrap() {
            GatewayEvent::Error(payload) => assert_eq!(payload.code, "AUTH_ERROR"),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(identity.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn generate_then_join_chat_replays_history() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();
        authenticate(&state, conn_id, &identity, &tx, &mut rx).await;

        handle_command(
            &state,
            conn_id,
            &identity,
            &tx,
            GatewayCommand::GeneratePrompt(GenerateRequest {
                description: "a cheerful tutor".into(),
                personality: None,
                domain: None,
                special_instructions: None,
                is_public: None,
            }),
        )
        .await;

        let persona = match rx.recv().await.unwrap() {
            GatewayEvent::PromptGenerated(p) => p,
            other => panic!("expected prompt-generated, got {:?}", other),
        };

        handle_command(
            &state,
            conn_id,
            &identity,
            &tx,
            GatewayCommand::SendMessage(animus_types::events::ChatRequest {
                message: "hello".into(),
                digital_human_id: persona.id,
                chat_history: vec![],
            }),
        )
        .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            GatewayEvent::MessageReceived(_)
        ));

        handle_command(&state, conn_id, &identity, &tx, GatewayCommand::JoinChat(persona.id))
            .await;

        // Oldest first: the user's turn, then the assistant reply.
        match rx.recv().await.unwrap() {
            GatewayEvent::MessageReceived(m) => assert_eq!(m.content, "hello"),
            other => panic!("expected message-received, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            GatewayEvent::MessageReceived(_)
        ));
    }

    #[tokio::test]
    async fn public_updates_are_broadcast_to_other_connections() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();
        authenticate(&state, conn_id, &identity, &tx, &mut rx).await;

        let mut other_rx = state.dispatcher.subscribe();

        handle_command(
            &state,
            conn_id,
            &identity,
            &tx,
            GatewayCommand::GeneratePrompt(GenerateRequest {
                description: "a public helper".into(),
                personality: None,
                domain: None,
                special_instructions: None,
                is_public: Some(true),
            }),
        )
        .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            GatewayEvent::PromptGenerated(_)
        ));

        let broadcast = other_rx.recv().await.unwrap();
        assert_eq!(broadcast.origin, conn_id);
        assert!(matches!(
            broadcast.event,
            GatewayEvent::DigitalHumanUpdated(_)
        ));
    }

    #[tokio::test]
    async fn reauthentication_rebinds_identity() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();
        let first = authenticate(&state, conn_id, &identity, &tx, &mut rx).await;

        let (token, second) = state.auth.guest_login().await.unwrap();
        handle_command(&state, conn_id, &identity, &tx, GatewayCommand::Authenticate { token })
            .await;

        match rx.recv().await.unwrap() {
            GatewayEvent::Authenticated(user) => {
                assert_eq!(user.id, second.id);
                assert_ne!(user.id, first.id);
            }
            other => panic!("expected authenticated, got {:?}", other),
        }
        assert_eq!(identity.read().unwrap().as_ref().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn join_chat_with_unknown_bot_reports_not_found() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();
        authenticate(&state, conn_id, &identity, &tx, &mut rx).await;

        handle_command(&state, conn_id, &identity, &tx, GatewayCommand::JoinChat(Uuid::new_v4()))
            .await;

        match rx.recv().await.unwrap() {
            GatewayEvent::Error(payload) => assert_eq!(payload.code, "NOT_FOUND"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_message_failures_use_the_message_code() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();
        authenticate(&state, conn_id, &identity, &tx, &mut rx).await;

        handle_command(
            &state,
            conn_id,
            &identity,
            &tx,
            GatewayCommand::SendMessage(animus_types::events::ChatRequest {
                message: "hello".into(),
                digital_human_id: Uuid::new_v4(),
                chat_history: vec![],
            }),
        )
        .await;

        match rx.recv().await.unwrap() {
            GatewayEvent::Error(payload) => assert_eq!(payload.code, "MESSAGE_ERROR"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_errors_use_the_delete_code() {
        let state = gateway();
        let (conn_id, identity, tx, mut rx) = connection();
        authenticate(&state, conn_id, &identity, &tx, &mut rx).await;

        handle_command(
            &state,
            conn_id,
            &identity,
            &tx,
            GatewayCommand::DeleteDigitalHuman(Uuid::new_v4()),
        )
        .await;

        match rx.recv().await.unwrap() {
            GatewayEvent::Error(payload) => assert_eq!(payload.code, "DELETE_ERROR"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
