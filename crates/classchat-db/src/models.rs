//! Database row types. These map directly to SQLite rows and stay independent
//! of the wire types in classchat-types.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub password: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub creator_id: String,
    pub classroom_id: Option<String>,
    pub name: Option<String>,
    pub created_at: String,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

pub struct AttachmentRow {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
    pub url: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub body: String,
    pub can_reply: bool,
    pub attachment: Option<AttachmentRow>,
    pub created_at: String,
}

/// Parse a stored timestamp. Rows written by the server carry RFC 3339;
/// column defaults from SQLite look like `YYYY-MM-DD HH:MM:SS` without a zone.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
}

/// Canonical stored form: RFC 3339, always six fractional digits and `Z`.
/// Fixed width so that text comparison in SQL orders like time.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
