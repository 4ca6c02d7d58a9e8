use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ConversationType;

/// A user as seen on the wire: sender of a message or receiver of a new conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Attachment metadata sent alongside a message. `id` is empty until the
/// server has persisted the attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
}

/// Message body of an inbound `NEW_MESSAGE` or `CREATE_NEW_MESSAGE` exactly as
/// clients send it. Older clients put the text under `messageText`, newer ones
/// under `message`; [`IncomingMessage::into_draft`] folds both into one body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    #[serde(default)]
    pub sender: Option<UserRef>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_text: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub can_reply: Option<bool>,
    #[serde(default)]
    pub attachment: Option<AttachmentPayload>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classroom_id: Option<Uuid>,
    #[serde(default)]
    pub receivers: Vec<UserRef>,
}

/// Canonical form of an inbound message after the compatibility mapping.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub body: String,
    pub conversation_id: Option<Uuid>,
    pub classroom_id: Option<Uuid>,
    pub receivers: Vec<UserRef>,
    pub can_reply: bool,
    pub attachment: Option<AttachmentPayload>,
    pub created_at: Option<DateTime<Utc>>,
}

impl IncomingMessage {
    /// `message` wins over `messageText`; an unset `canReply` means `true`,
    /// an explicit `false` is kept.
    pub fn into_draft(self) -> MessageDraft {
        let body = self.message.or(self.message_text).unwrap_or_default();
        MessageDraft {
            body,
            conversation_id: self.conversation_id,
            classroom_id: self.classroom_id,
            receivers: self.receivers,
            can_reply: self.can_reply.unwrap_or(true),
            attachment: self.attachment,
            created_at: self.created_at,
        }
    }
}

/// Outbound message. `id` is absent in the provisional copy handed back in
/// the sender's ack and present in every broadcast copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub sender: UserRef,
    pub message: String,
    pub conversation_id: Uuid,
    pub can_reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
}

/// Conversation as shipped inside `FIRST_TIME_MESSAGE`. For single threads the
/// name is the other participant's name, so each side gets its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: Uuid,
    #[serde(rename = "conversation_name")]
    pub conversation_name: String,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub creator_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classroom_id: Option<Uuid>,
    pub participants: Vec<UserRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckErrorCode {
    Validation,
    Unauthorized,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub code: AckErrorCode,
    pub message: String,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message was appended to a conversation the client is subscribed to
    NewMessage(MessagePayload),

    /// First message of a conversation the client has not seen yet
    FirstTimeMessage {
        new_msg: MessagePayload,
        new_convo: ConversationPayload,
    },

    /// Reply to a client command that carried an `ack` id
    Ack {
        ack: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AckError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessagePayload>,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Send a message into an existing conversation
    NewMessage(IncomingMessage),

    /// Start a conversation with one or more receivers and send its first message
    CreateNewMessage(IncomingMessage),
}

/// A command plus the optional ack id the client wants its reply tagged with.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandFrame {
    #[serde(flatten)]
    pub command: GatewayCommand,
    #[serde(default)]
    pub ack: Option<u64>,
}
