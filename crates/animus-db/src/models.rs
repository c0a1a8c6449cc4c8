//! Database row types mapping directly to SQLite rows.
//! Distinct from the animus-types wire models to keep the DB layer
//! independent; conversion helpers live here because the timestamp and
//! rules-JSON encodings are storage details.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use animus_types::models::{ChatMessage, ChatSession, Persona, Role, User};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub is_guest: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct PersonaRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    /// JSON-encoded array of rule strings.
    pub rules: String,
    pub personality: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub is_public: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub digital_human_id: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_session_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// Timestamps are stored as RFC 3339 text. A row that fails to parse is
/// corrupt; log it and fall back to the epoch rather than dropping the row.
pub fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}': {}", raw, e);
        DateTime::default()
    })
}

fn parse_id(raw: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}': {}", raw, e);
        Uuid::default()
    })
}

impl UserRow {
    pub fn into_model(self) -> User {
        User {
            id: parse_id(&self.id),
            username: self.username,
            email: self.email,
            is_guest: self.is_guest,
            created_at: parse_ts(&self.created_at),
        }
    }
}

impl PersonaRow {
    pub fn into_model(self) -> Persona {
        let rules: Vec<String> = serde_json::from_str(&self.rules).unwrap_or_else(|e| {
            warn!("Corrupt rules on persona '{}': {}", self.id, e);
            Vec::new()
        });
        Persona {
            id: parse_id(&self.id),
            owner_id: parse_id(&self.user_id),
            name: self.name,
            prompt: self.prompt,
            rules,
            personality: self.personality,
            temperature: self.temperature,
            max_tokens: self.max_tokens.max(0) as u32,
            is_public: self.is_public,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        }
    }
}

impl SessionRow {
    pub fn into_model(self) -> ChatSession {
        ChatSession {
            id: parse_id(&self.id),
            user_id: parse_id(&self.user_id),
            digital_human_id: parse_id(&self.digital_human_id),
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        }
    }
}

impl MessageRow {
    pub fn into_model(self, digital_human_id: Uuid) -> ChatMessage {
        let role = Role::parse(&self.role).unwrap_or_else(|| {
            // The CHECK constraint makes this unreachable for rows we wrote.
            warn!("Corrupt role '{}' on message '{}'", self.role, self.id);
            Role::Assistant
        });
        ChatMessage {
            id: parse_id(&self.id),
            digital_human_id,
            role,
            content: self.content,
            timestamp: parse_ts(&self.timestamp),
        }
    }
}
