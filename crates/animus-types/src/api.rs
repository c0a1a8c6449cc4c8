use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::User;

// -- JWT Claims --

/// JWT claims shared by the REST auth endpoints and the WebSocket gateway.
/// Canonical definition lives here to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

/// Envelope returned by all /api/auth endpoints, matching what the client
/// already parses: `{success, token?, user?, message?}`.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthResponse {
    pub fn ok(token: Option<String>, user: User) -> Self {
        Self {
            success: true,
            token,
            user: Some(user),
            message: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            token: None,
            user: None,
            message: Some(message.into()),
        }
    }
}

// -- Persona generation --

/// Input to the persona generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub description: String,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

// -- Health --

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_personas: usize,
}
