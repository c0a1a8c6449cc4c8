use animus_types::events::ErrorPayload;
use thiserror::Error;

/// Domain error taxonomy. Every failure that reaches the gateway is turned
/// into an `error` event carrying the display message plus a stable code the
/// client switches on. No raw error ever crosses the transport.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("User not authenticated")]
    AuthRequired,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("A user with this username or email already exists")]
    DuplicateUser,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("User not found")]
    UserNotFound,

    #[error("Permission denied: you can only modify your own digital humans")]
    PermissionDenied,

    #[error("Digital human not found")]
    NotFound,

    #[error("Failed to generate digital human: {0}")]
    Generation(String),

    #[error("Failed to process message: {0}")]
    Message(String),

    #[error("{0}")]
    Validation(String),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthRequired => "AUTH_REQUIRED",
            AppError::InvalidCredentials
            | AppError::DuplicateUser
            | AppError::InvalidToken
            | AppError::UserNotFound => "AUTH_ERROR",
            AppError::PermissionDenied => "PERMISSION_DENIED",
            AppError::NotFound => "NOT_FOUND",
            AppError::Generation(_) => "GENERATION_ERROR",
            AppError::Message(_) => "MESSAGE_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Structured payload for the gateway's `error` event. Internal errors
    /// keep their details server-side.
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            code: self.code().to_string(),
        }
    }

    /// Same payload, but with the code an event handler wants to report
    /// (e.g. DELETE_ERROR, DASHBOARD_ERROR).
    pub fn payload_with_code(&self, code: &str) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            code: code.to_string(),
        }
    }
}
