use axum::{Json, extract::State};

use animus_types::api::HealthResponse;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_personas: state.registry.active_count(),
    })
}
