use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::GenerateRequest;
use crate::models::{ChatMessage, ChatSession, Persona, User};

/// Commands sent FROM client TO server over the WebSocket.
/// Wire format is `{"type": "<kebab-case name>", "data": ...}`, matching the
/// event names the web client emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Bind (or rebind) an identity to this connection.
    Authenticate { token: String },

    /// Create a throwaway guest account and bind it to this connection.
    GuestLogin,

    /// Ask the generation collaborator for a new persona.
    GeneratePrompt(GenerateRequest),

    /// Explicitly save a persona (create or overwrite, owner only).
    SaveDigitalHuman(Persona),

    /// Update an existing persona (owner only).
    UpdateDigitalHuman(Persona),

    /// Delete a persona and its chat history (owner only).
    DeleteDigitalHuman(Uuid),

    /// Post a chat message to a persona and get its reply.
    SendMessage(ChatRequest),

    /// Open a conversation: replays the stored history, oldest first.
    JoinChat(Uuid),

    /// Drop all stored messages for the caller's session with this persona.
    ClearHistory(Uuid),

    /// Aggregate read backing the dashboard view.
    GetDashboardData,

    /// List the caller's own personas.
    LoadDigitalHumans,
}

/// Payload of `send-message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub digital_human_id: Uuid,
    /// Client-held copy of the conversation. Server-side history is
    /// authoritative; this is accepted and ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<serde_json::Value>,
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    Authenticated(User),
    PromptGenerated(Persona),
    DigitalHumanSaved(Persona),
    DigitalHumanUpdated(Persona),
    DigitalHumanDeleted(Uuid),
    MessageReceived(ChatMessage),
    DigitalHumans(Vec<Persona>),
    DashboardData(DashboardData),
    HistoryCleared(Uuid),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

/// Aggregate payload for the dashboard view, shaped the way the client
/// consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub user: User,
    pub digital_humans: DashboardBots,
    pub chat_sessions: Vec<ChatSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardBots {
    pub user_bots: Vec<Persona>,
    pub public_bots: Vec<Persona>,
    pub recent_bots: Vec<Persona>,
}
