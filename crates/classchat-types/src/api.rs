use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::UserRef;
use crate::models::ConversationType;

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the gateway handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    /// Display name other participants see.
    pub name: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    /// Group name, or the other participant's name for single threads.
    pub conversation_name: String,
    pub classroom_id: Option<Uuid>,
    pub participants: Vec<UserRef>,
    pub created_at: DateTime<Utc>,
}
