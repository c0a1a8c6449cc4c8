pub mod auth;
pub mod health;

use std::sync::Arc;

use animus_core::{AuthService, PersonaRegistry};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub auth: Arc<AuthService>,
    pub registry: Arc<PersonaRegistry>,
}
