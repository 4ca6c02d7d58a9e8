use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use classchat_db::models::{MessageRow, ParticipantRow, parse_timestamp};
use classchat_types::api::{Claims, ConversationSummary};
use classchat_types::events::{AttachmentPayload, MessagePayload, UserRef};
use classchat_types::models::{ConversationType, DEFAULT_GROUP_NAME};

use crate::auth::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// `createdAt` of the oldest message on the previous page.
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

/// Conversations the caller participates in, newest first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();

    let (rows, participant_rows) = tokio::task::spawn_blocking(move || {
        let rows = db.get_conversations_for_user(&uid)?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let participants = db.get_participants(&ids)?;
        Ok::<_, anyhow::Error>((rows, participants))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("Failed to list conversations for {}: {}", claims.sub, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mut by_conversation: HashMap<String, Vec<UserRef>> = HashMap::new();
    for row in participant_rows {
        let conversation_id = row.conversation_id.clone();
        if let Some(user) = participant_ref(row) {
            by_conversation.entry(conversation_id).or_default().push(user);
        }
    }

    let summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .filter_map(|row| {
            let Some(kind) = ConversationType::parse(&row.kind) else {
                warn!("Corrupt kind '{}' on conversation '{}'", row.kind, row.id);
                return None;
            };
            let participants = by_conversation.remove(&row.id).unwrap_or_default();
            Some(ConversationSummary {
                id: parse_or_nil(&row.id, "conversation id"),
                kind,
                conversation_name: conversation_name(kind, row.name.as_deref(), &participants, claims.sub),
                classroom_id: row.classroom_id.as_deref().and_then(|c| c.parse().ok()),
                participants,
                created_at: parse_timestamp(&row.created_at).unwrap_or_default(),
            })
        })
        .collect();

    Ok(Json(summaries))
}

/// Message history of one conversation. Only participants may read it.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let limit = query.limit.min(200);
    let before = query.before;

    let rows = tokio::task::spawn_blocking(move || {
        if db
            .get_conversation(&cid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_none()
        {
            return Err(StatusCode::NOT_FOUND);
        }
        if !db
            .is_participant(&cid, &uid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        {
            return Err(StatusCode::FORBIDDEN);
        }
        db.get_messages(&cid, limit, before).map_err(|e| {
            error!("Failed to load messages for {}: {}", cid, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    let messages: Vec<MessagePayload> = rows.into_iter().map(message_payload).collect();
    Ok(Json(messages))
}

/// Groups show their stored name; a single thread shows the other person.
fn conversation_name(
    kind: ConversationType,
    stored: Option<&str>,
    participants: &[UserRef],
    viewer: Uuid,
) -> String {
    match kind {
        ConversationType::Group => stored.unwrap_or(DEFAULT_GROUP_NAME).to_string(),
        ConversationType::Single => participants
            .iter()
            .find(|p| p.id != viewer)
            .map(|p| p.name.clone())
            .unwrap_or_default(),
    }
}

fn participant_ref(row: ParticipantRow) -> Option<UserRef> {
    match row.user_id.parse() {
        Ok(id) => Some(UserRef {
            id,
            name: row.display_name,
            avatar_url: row.avatar_url,
        }),
        Err(e) => {
            warn!("Corrupt user_id '{}' in conversation '{}': {}", row.user_id, row.conversation_id, e);
            None
        }
    }
}

fn parse_or_nil(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::nil()
    })
}

fn message_payload(row: MessageRow) -> MessagePayload {
    let created_at = parse_timestamp(&row.created_at).unwrap_or_else(|| {
        warn!("Corrupt created_at '{}' on message '{}'", row.created_at, row.id);
        chrono::DateTime::default()
    });

    MessagePayload {
        id: Some(parse_or_nil(&row.id, "message id")),
        sender: UserRef {
            id: parse_or_nil(&row.sender_id, "sender_id"),
            name: row.sender_name,
            avatar_url: row.sender_avatar_url,
        },
        message: row.body,
        conversation_id: parse_or_nil(&row.conversation_id, "conversation_id"),
        can_reply: row.can_reply,
        attachment: row.attachment.map(|a| AttachmentPayload {
            id: a.id.parse().ok(),
            file_name: a.file_name,
            mime_type: a.mime_type,
            size: u64::try_from(a.size).unwrap_or_default(),
            url: a.url,
        }),
        created_at,
    }
}
