use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use classchat_types::api::Claims;
use classchat_types::events::{CommandFrame, GatewayCommand, GatewayEvent, UserRef};

use crate::messaging::{Ack, Messenger};
use crate::store::ChatStore;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Authenticated user bound to a connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: UserRef,
    pub username: String,
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            user: UserRef {
                id: claims.sub,
                name: claims.name,
                avatar_url: None,
            },
            username: claims.username,
        }
    }
}

/// Validate a JWT and return its claims.
pub fn decode_token(token: &str, jwt_secret: &str) -> Option<Claims> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Handle a WebSocket whose token was already checked at the HTTP upgrade.
pub async fn handle_connection_authenticated<S: ChatStore>(
    socket: WebSocket,
    messenger: Messenger<S>,
    session: Session,
) {
    let (sender, receiver) = socket.split();
    info!("{} ({}) connected to gateway (pre-authenticated)", session.username, session.user.id);
    run_connection_loop(sender, receiver, messenger, session).await;
}

/// Handle a WebSocket that authenticates with an IDENTIFY command first.
pub async fn handle_connection<S: ChatStore>(
    socket: WebSocket,
    messenger: Messenger<S>,
    jwt_secret: String,
) {
    let (sender, mut receiver) = socket.split();

    let session = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(session) => session,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", session.username, session.user.id);
    run_connection_loop(sender, receiver, messenger, session).await;
}

async fn run_connection_loop<S: ChatStore>(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    messenger: Messenger<S>,
    session: Session,
) {
    let user_id = session.user.id;
    let dispatcher = messenger.dispatcher().clone();

    let ready = GatewayEvent::Ready {
        user_id,
        username: session.username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (conn_id, mut conn_rx) = dispatcher.register_connection(user_id).await;
    // Conversation subscriptions finish in the background
    let _bootstrap = messenger.bootstrap_session(conn_id, user_id).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward channel traffic + acks -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = conn_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
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

    // Read commands from client
    let recv_session = session.clone();
    let recv_messenger = messenger.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<CommandFrame>(&text) {
                    Ok(frame) => handle_command(&recv_messenger, conn_id, &recv_session, frame),
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_session.username,
                            recv_session.user.id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
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

    dispatcher.unregister_connection(conn_id).await;
    info!("{} ({}) disconnected from gateway", session.username, user_id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Session> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(CommandFrame {
                    command: GatewayCommand::Identify { token },
                    ..
                }) = serde_json::from_str::<CommandFrame>(&text)
                {
                    return decode_token(&token, jwt_secret).map(Session::from);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

/// Each command runs in its own task: a client that disconnects mid-send
/// does not cancel the send.
fn handle_command<S: ChatStore>(
    messenger: &Messenger<S>,
    conn_id: Uuid,
    session: &Session,
    frame: CommandFrame,
) {
    let ack = Ack::new(messenger.dispatcher().clone(), conn_id, frame.ack);

    match frame.command {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::NewMessage(incoming) => {
            let sender = resolve_sender(session, incoming.sender.as_ref());
            let draft = incoming.into_draft();
            let messenger = messenger.clone();
            tokio::spawn(async move {
                messenger.send_message(&sender, draft, &ack).await;
            });
        }

        GatewayCommand::CreateNewMessage(incoming) => {
            let sender = resolve_sender(session, incoming.sender.as_ref());
            let draft = incoming.into_draft();
            info!(
                "{} ({}) starting conversation with {} receivers",
                session.username,
                session.user.id,
                draft.receivers.len()
            );
            let messenger = messenger.clone();
            tokio::spawn(async move {
                messenger.create_conversation_and_send(&sender, draft, &ack).await;
            });
        }
    }
}

/// The sender is always the session user. A `sender` object on the wire can
/// only fill in presentation fields the token does not carry.
fn resolve_sender(session: &Session, claimed: Option<&UserRef>) -> UserRef {
    let mut sender = session.user.clone();
    match claimed {
        Some(claimed) if claimed.id == sender.id => {
            if sender.name.is_empty() {
                sender.name = claimed.name.clone();
            }
            sender.avatar_url = claimed.avatar_url.clone();
        }
        Some(claimed) => {
            warn!(
                "{} ({}) sent a message claiming to be {}; ignoring",
                session.username, session.user.id, claimed.id
            );
        }
        None => {}
    }
    sender
}
