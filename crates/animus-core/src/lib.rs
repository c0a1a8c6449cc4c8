pub mod auth;
pub mod chat;
pub mod error;
pub mod registry;

pub use auth::AuthService;
pub use chat::ChatRouter;
pub use error::AppError;
pub use registry::PersonaRegistry;

use error::AppError as E;

/// Run blocking DB work off the async runtime (rusqlite calls hold a mutex).
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, E>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| E::Internal(anyhow::anyhow!("spawn_blocking join error: {e}")))?
        .map_err(E::Internal)
}
