use axum::{Json, extract::State, http::StatusCode};
use tracing::warn;

use animus_core::AppError;
use animus_types::api::{AuthResponse, LoginRequest, RegisterRequest, VerifyRequest};

use crate::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<AuthResponse>) {
    match state
        .auth
        .register(&req.username, &req.email, &req.password)
        .await
    {
        Ok((token, user)) => (StatusCode::CREATED, Json(AuthResponse::ok(Some(token), user))),
        Err(e) => failure(e),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> (StatusCode, Json<AuthResponse>) {
    match state.auth.login(&req.email, &req.password).await {
        Ok((token, user)) => (StatusCode::OK, Json(AuthResponse::ok(Some(token), user))),
        Err(e) => failure(e),
    }
}

/// Token check for returning clients; on success the current user record is
/// returned without minting a new token.
pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> (StatusCode, Json<AuthResponse>) {
    match state.auth.verify_token(&req.token).await {
        Ok(user) => (StatusCode::OK, Json(AuthResponse::ok(None, user))),
        Err(e) => failure(e),
    }
}

pub async fn guest(State(state): State<AppState>) -> (StatusCode, Json<AuthResponse>) {
    match state.auth.guest_login().await {
        Ok((token, user)) => (StatusCode::OK, Json(AuthResponse::ok(Some(token), user))),
        Err(e) => failure(e),
    }
}

fn failure(e: AppError) -> (StatusCode, Json<AuthResponse>) {
    let status = match e {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::DuplicateUser => StatusCode::CONFLICT,
        AppError::InvalidCredentials | AppError::InvalidToken | AppError::UserNotFound => {
            StatusCode::UNAUTHORIZED
        }
        _ => {
            warn!("Auth endpoint failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(AuthResponse::err(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppStateInner;
    use animus_core::{AuthService, PersonaRegistry};
    use animus_db::Database;
    use animus_engine::template::TemplateEngine;
    use std::sync::Arc;

    fn state() -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Arc::new(AppStateInner {
            auth: Arc::new(AuthService::new(db.clone(), "test-secret".into())),
            registry: Arc::new(PersonaRegistry::new(db, Arc::new(TemplateEngine))),
        })
    }

    fn register_req() -> RegisterRequest {
        RegisterRequest {
            username: "alice".into(),
            email: "alice@x.com".into(),
            password: "pw123456".into(),
        }
    }

    #[tokio::test]
    async fn register_returns_created_with_token() {
        let state = state();
        let (status, Json(body)) = register(State(state), Json(register_req())).await;

        assert_eq!(status, StatusCode::CREATED);
        assert!(body.success);
        assert!(body.token.is_some());
        assert_eq!(body.user.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn duplicate_register_conflicts() {
        let state = state();
        register(State(state.clone()), Json(register_req())).await;

        let (status, Json(body)) = register(State(state), Json(register_req())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.success);
        assert!(body.message.is_some());
    }

    #[tokio::test]
    async fn login_rejects_bad_password() {
        let state = state();
        register(State(state.clone()), Json(register_req())).await;

        let (status, Json(body)) = login(
            State(state),
            Json(LoginRequest {
                email: "alice@x.com".into(),
                password: "wrongpassword".into(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn verify_round_trips_a_fresh_token() {
        let state = state();
        let (_, Json(body)) = register(State(state.clone()), Json(register_req())).await;
        let token = body.token.unwrap();

        let (status, Json(body)) =
            verify(State(state), Json(VerifyRequest { token })).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert!(body.token.is_none());
        assert_eq!(body.user.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn guest_login_mints_a_guest_account() {
        let state = state();
        let (status, Json(body)) = guest(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert!(body.token.is_some());
        assert!(body.user.unwrap().is_guest);
    }
}
