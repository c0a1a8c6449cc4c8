pub mod connection;
pub mod dispatcher;

use std::sync::Arc;

use animus_core::{AuthService, ChatRouter, PersonaRegistry};
use dispatcher::Dispatcher;

/// Everything a connection handler needs. Domain state lives in the services;
/// the only per-connection state is the bound identity inside the handler.
#[derive(Clone)]
pub struct GatewayState {
    pub auth: Arc<AuthService>,
    pub registry: Arc<PersonaRegistry>,
    pub chat: Arc<ChatRouter>,
    pub dispatcher: Dispatcher,
}
