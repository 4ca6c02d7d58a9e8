//! Persistence seams the messaging core talks to. They are synchronous
//! because the SQLite backend is; the core runs them on the blocking pool.

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use classchat_db::Database;
use classchat_db::models::format_timestamp;
use classchat_types::events::AttachmentPayload;

pub struct NewMessage {
    pub sender_id: Uuid,
    pub conversation_id: Uuid,
    pub body: String,
    pub attachment_id: Option<Uuid>,
    pub can_reply: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StoredMessage {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

pub trait ConversationStore {
    fn conversation_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool>;

    fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;

    fn find_single_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        classroom_id: Option<Uuid>,
    ) -> Result<Option<Uuid>>;

    /// Returns (conversation_id, created). `created` is false when another
    /// request created the pair's conversation first.
    fn insert_or_fetch_single_conversation(
        &self,
        creator_id: Uuid,
        other_id: Uuid,
        classroom_id: Option<Uuid>,
    ) -> Result<(Uuid, bool)>;

    fn create_group_conversation(
        &self,
        creator_id: Uuid,
        participant_ids: &[Uuid],
        classroom_id: Option<Uuid>,
        name: &str,
    ) -> Result<Uuid>;

    /// The subset of `user_ids` with no account.
    fn unknown_users(&self, user_ids: &[Uuid]) -> Result<Vec<Uuid>>;
}

pub trait MessageStore {
    fn insert_message(&self, message: &NewMessage) -> Result<StoredMessage>;
}

pub trait AttachmentResolver {
    /// Persist attachment metadata and return its durable id.
    fn persist_attachment(&self, uploader_id: Uuid, attachment: &AttachmentPayload) -> Result<Uuid>;
}

/// Everything the messaging core needs from persistence.
pub trait ChatStore:
    ConversationStore + MessageStore + AttachmentResolver + Send + Sync + 'static
{
}

impl<T> ChatStore for T where
    T: ConversationStore + MessageStore + AttachmentResolver + Send + Sync + 'static
{
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id in store: {}", raw))
}

impl ConversationStore for Database {
    fn conversation_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Database::conversation_ids_for_user(self, &user_id.to_string())?
            .iter()
            .map(|id| parse_id(id))
            .collect()
    }

    fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool> {
        Ok(self.get_conversation(&conversation_id.to_string())?.is_some())
    }

    fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        Database::is_participant(self, &conversation_id.to_string(), &user_id.to_string())
    }

    fn find_single_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        classroom_id: Option<Uuid>,
    ) -> Result<Option<Uuid>> {
        let classroom = classroom_id.map(|id| id.to_string());
        Database::find_single_conversation(
            self,
            &user_a.to_string(),
            &user_b.to_string(),
            classroom.as_deref(),
        )?
        .map(|id| parse_id(&id))
        .transpose()
    }

    fn insert_or_fetch_single_conversation(
        &self,
        creator_id: Uuid,
        other_id: Uuid,
        classroom_id: Option<Uuid>,
    ) -> Result<(Uuid, bool)> {
        let classroom = classroom_id.map(|id| id.to_string());
        let (id, created) = Database::insert_or_fetch_single_conversation(
            self,
            &Uuid::new_v4().to_string(),
            &creator_id.to_string(),
            &other_id.to_string(),
            classroom.as_deref(),
        )?;
        Ok((parse_id(&id)?, created))
    }

    fn create_group_conversation(
        &self,
        creator_id: Uuid,
        participant_ids: &[Uuid],
        classroom_id: Option<Uuid>,
        name: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let participants: Vec<String> = participant_ids.iter().map(Uuid::to_string).collect();
        let classroom = classroom_id.map(|id| id.to_string());
        Database::create_group_conversation(
            self,
            &id.to_string(),
            &creator_id.to_string(),
            &participants,
            classroom.as_deref(),
            name,
        )?;
        Ok(id)
    }

    fn unknown_users(&self, user_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut unknown = Vec::new();
        for id in user_ids {
            if self.get_user_by_id(&id.to_string())?.is_none() {
                unknown.push(*id);
            }
        }
        Ok(unknown)
    }
}

impl MessageStore for Database {
    fn insert_message(&self, message: &NewMessage) -> Result<StoredMessage> {
        let id = Uuid::new_v4();
        // Stored with microseconds; the broadcast copy must match what history returns
        let created_at = Utc::now().trunc_subsecs(6);
        let attachment_id = message.attachment_id.map(|id| id.to_string());
        Database::insert_message(
            self,
            &id.to_string(),
            &message.conversation_id.to_string(),
            &message.sender_id.to_string(),
            &message.body,
            attachment_id.as_deref(),
            message.can_reply,
            &format_timestamp(&created_at),
        )?;
        Ok(StoredMessage { id, created_at })
    }
}

impl AttachmentResolver for Database {
    fn persist_attachment(&self, uploader_id: Uuid, attachment: &AttachmentPayload) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let size = i64::try_from(attachment.size).context("attachment size out of range")?;
        self.insert_attachment(
            &id.to_string(),
            &uploader_id.to_string(),
            &attachment.file_name,
            &attachment.mime_type,
            size,
            &attachment.url,
        )?;
        Ok(id)
    }
}
