use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use animus_db::Database;
use animus_db::models::MessageRow;
use animus_types::models::{ChatMessage, ChatSession, Persona, Role};

use crate::error::AppError;
use crate::registry::PersonaRegistry;
use crate::run_blocking;

/// Per-session in-memory history bound. Trimming is a display/context
/// optimization only; the store keeps the full log.
const HISTORY_CACHE_LIMIT: usize = 50;

/// How many recent messages the response collaborator sees.
const CONTEXT_WINDOW: usize = 10;

/// The reply appended when the collaborator fails. The conversation log must
/// never contain a user message with no reply, so this is absorbed here
/// instead of surfacing as a transport error.
pub const FALLBACK_REPLY: &str =
    "Sorry, I encountered an error while processing your message. Please try again.";

/// Routes chat messages between users and personas: session lookup, history
/// caching, and response dispatch.
pub struct ChatRouter {
    db: Arc<Database>,
    registry: Arc<PersonaRegistry>,
    /// session id -> recent messages, oldest first. Read-through,
    /// write-through; rebuildable from the store at any time.
    histories: RwLock<HashMap<Uuid, Vec<ChatMessage>>>,
}

impl ChatRouter {
    pub fn new(db: Arc<Database>, registry: Arc<PersonaRegistry>) -> Self {
        Self {
            db,
            registry,
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent session lookup. Uniqueness of the (user, persona) pair is
    /// enforced by the store's unique constraint, so concurrent calls cannot
    /// create duplicates.
    pub async fn get_or_create_session(
        &self,
        user_id: Uuid,
        digital_human_id: Uuid,
    ) -> Result<ChatSession, AppError> {
        let db = self.db.clone();
        let uid = user_id.to_string();
        let dhid = digital_human_id.to_string();
        let candidate = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let row =
            run_blocking(move || db.get_or_create_session(&candidate, &uid, &dhid, &now)).await?;
        Ok(row.into_model())
    }

    /// Append the user's message, ask the persona for a reply, append and
    /// return it. Collaborator failure degrades to `FALLBACK_REPLY`.
    pub async fn post_user_message(
        &self,
        user_id: Uuid,
        digital_human_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        if text.trim().is_empty() {
            return Err(AppError::Validation("Message must not be empty".into()));
        }

        let persona = self
            .registry
            .get(digital_human_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let session = self
            .get_or_create_session(user_id, digital_human_id)
            .await?;
        self.ensure_cached(&session).await?;

        // The new turn goes to the collaborator as `message`; the context
        // carries only the turns before it, so nothing is sent twice.
        let context = self.context_window(session.id);

        self.append_message(&session, Role::User, text.to_string())
            .await?;

        let reply = self.generate_reply(&persona, text, &context).await;

        let assistant = self
            .append_message(&session, Role::Assistant, reply)
            .await?;
        info!(
            "Processed message for {} in session {}",
            persona.name, session.id
        );
        Ok(assistant)
    }

    /// Stored history for the caller's conversation with this persona,
    /// oldest first, served from the cache once populated.
    pub async fn get_history(
        &self,
        user_id: Uuid,
        digital_human_id: Uuid,
    ) -> Result<Vec<ChatMessage>, AppError> {
        self.registry
            .get(digital_human_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let session = self
            .get_or_create_session(user_id, digital_human_id)
            .await?;
        self.ensure_cached(&session).await?;

        Ok(self
            .histories
            .read()
            .expect("history cache poisoned")
            .get(&session.id)
            .cloned()
            .unwrap_or_default())
    }

    /// Drop all messages for the caller's session, in the store and the cache.
    pub async fn clear_history(
        &self,
        user_id: Uuid,
        digital_human_id: Uuid,
    ) -> Result<(), AppError> {
        self.registry
            .get(digital_human_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let session = self
            .get_or_create_session(user_id, digital_human_id)
            .await?;

        let db = self.db.clone();
        let sid = session.id.to_string();
        run_blocking(move || db.delete_messages(&sid)).await?;

        self.histories
            .write()
            .expect("history cache poisoned")
            .remove(&session.id);
        info!("History cleared for session {}", session.id);
        Ok(())
    }

    /// The user's chat sessions, most recently active first.
    pub async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<ChatSession>, AppError> {
        let db = self.db.clone();
        let uid = user_id.to_string();
        let rows = run_blocking(move || db.sessions_for_user(&uid)).await?;
        Ok(rows.into_iter().map(|r| r.into_model()).collect())
    }

    /// Persist one turn and mirror it into the cache.
    async fn append_message(
        &self,
        session: &ChatSession,
        role: Role,
        content: String,
    ) -> Result<ChatMessage, AppError> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            digital_human_id: session.digital_human_id,
            role,
            content,
            timestamp: Utc::now(),
        };

        let db = self.db.clone();
        let row = MessageRow {
            id: message.id.to_string(),
            chat_session_id: session.id.to_string(),
            role: role.as_str().to_string(),
            content: message.content.clone(),
            timestamp: message.timestamp.to_rfc3339(),
        };
        run_blocking(move || db.insert_message(&row)).await?;

        let mut histories = self.histories.write().expect("history cache poisoned");
        let history = histories.entry(session.id).or_default();
        history.push(message.clone());
        if history.len() > HISTORY_CACHE_LIMIT {
            let excess = history.len() - HISTORY_CACHE_LIMIT;
            history.drain(..excess);
        }

        Ok(message)
    }

    /// Populate the cache from the store on first access.
    async fn ensure_cached(&self, session: &ChatSession) -> Result<(), AppError> {
        if self
            .histories
            .read()
            .expect("history cache poisoned")
            .contains_key(&session.id)
        {
            return Ok(());
        }

        let db = self.db.clone();
        let sid = session.id.to_string();
        let rows = run_blocking(move || db.messages_for_session(&sid)).await?;

        let dh_id = session.digital_human_id;
        let mut messages: Vec<ChatMessage> =
            rows.into_iter().map(|r| r.into_model(dh_id)).collect();
        if messages.len() > HISTORY_CACHE_LIMIT {
            let excess = messages.len() - HISTORY_CACHE_LIMIT;
            messages.drain(..excess);
        }

        self.histories
            .write()
            .expect("history cache poisoned")
            .entry(session.id)
            .or_insert(messages);
        Ok(())
    }

    fn context_window(&self, session_id: Uuid) -> Vec<ChatMessage> {
        let histories = self.histories.read().expect("history cache poisoned");
        let Some(history) = histories.get(&session_id) else {
            return Vec::new();
        };
        let start = history.len().saturating_sub(CONTEXT_WINDOW);
        history[start..].to_vec()
    }

    async fn generate_reply(
        &self,
        persona: &Persona,
        text: &str,
        context: &[ChatMessage],
    ) -> String {
        match self.registry.engine().respond(persona, text, context).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Response generation failed for {}: {}", persona.id, e);
                FALLBACK_REPLY.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use animus_db::models::UserRow;
    use animus_engine::template::TemplateEngine;
    use animus_engine::{EngineError, GeneratedPersona, PersonaEngine};
    use animus_types::api::GenerateRequest;
    use async_trait::async_trait;

    struct FailingEngine;

    #[async_trait]
    impl PersonaEngine for FailingEngine {
        async fn generate(&self, _: &GenerateRequest) -> Result<GeneratedPersona, EngineError> {
            Ok(GeneratedPersona {
                name: "Broken".into(),
                prompt: "You are broken.".into(),
                rules: vec![],
                personality: "absent".into(),
            })
        }

        async fn respond(
            &self,
            _: &Persona,
            _: &str,
            _: &[ChatMessage],
        ) -> Result<String, EngineError> {
            Err(EngineError::Request("simulated outage".into()))
        }
    }

    struct RecordingEngine {
        calls: std::sync::Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PersonaEngine for RecordingEngine {
        async fn generate(&self, _: &GenerateRequest) -> Result<GeneratedPersona, EngineError> {
            Ok(GeneratedPersona {
                name: "Recorder".into(),
                prompt: "You take notes.".into(),
                rules: vec![],
                personality: "attentive".into(),
            })
        }

        async fn respond(
            &self,
            _: &Persona,
            message: &str,
            context: &[ChatMessage],
        ) -> Result<String, EngineError> {
            self.calls.lock().unwrap().push((
                message.to_string(),
                context.iter().map(|m| m.content.clone()).collect(),
            ));
            Ok("noted".into())
        }
    }

    async fn setup(
        engine: Arc<dyn PersonaEngine>,
    ) -> (Arc<Database>, Arc<PersonaRegistry>, ChatRouter, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(PersonaRegistry::new(db.clone(), engine));
        let router = ChatRouter::new(db.clone(), registry.clone());

        let user_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        db.create_user(&UserRow {
            id: user_id.to_string(),
            username: "alice".into(),
            email: Some("alice@x.com".into()),
            password_hash: Some("hash".into()),
            is_guest: false,
            created_at: now.clone(),
            updated_at: now,
        })
        .unwrap();

        let persona = registry
            .generate(
                user_id,
                &GenerateRequest {
                    description: "a cheerful tutor".into(),
                    personality: None,
                    domain: None,
                    special_instructions: None,
                    is_public: None,
                },
            )
            .await
            .unwrap();

        (db, registry, router, user_id, persona.id)
    }

    #[tokio::test]
    async fn first_message_creates_session_and_gets_one_reply() {
        let (_db, _registry, router, user_id, persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        let reply = router
            .post_user_message(user_id, persona_id, "hello")
            .await
            .unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert!(!reply.content.is_empty());

        let history = router.get_history(user_id, persona_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, Role::Assistant);

        let sessions = router.sessions_for_user(user_id).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn collaborator_failure_yields_the_fallback_reply() {
        let (_db, _registry, router, user_id, persona_id) = setup(Arc::new(FailingEngine)).await;

        let reply = router
            .post_user_message(user_id, persona_id, "hello")
            .await
            .unwrap();
        assert_eq!(reply.content, FALLBACK_REPLY);

        // The user's turn is still in the log, followed by exactly one reply.
        let history = router.get_history(user_id, persona_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn collaborator_context_holds_prior_turns_only() {
        let engine = RecordingEngine::new();
        let (_db, _registry, router, user_id, persona_id) = setup(engine.clone()).await;

        router
            .post_user_message(user_id, persona_id, "first")
            .await
            .unwrap();
        router
            .post_user_message(user_id, persona_id, "second")
            .await
            .unwrap();

        // The live turn travels as `message`, never inside the context, so
        // the collaborator sees each turn exactly once.
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls[0].0, "first");
        assert!(calls[0].1.is_empty());
        assert_eq!(calls[1].0, "second");
        assert_eq!(calls[1].1, vec!["first".to_string(), "noted".to_string()]);
    }

    #[tokio::test]
    async fn history_paths_reject_unknown_bots() {
        let (_db, _registry, router, user_id, _persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        let err = router.get_history(user_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        let err = router
            .clear_history(user_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn unknown_persona_is_rejected() {
        let (_db, _registry, router, user_id, _persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        let err = router
            .post_user_message(user_id, Uuid::new_v4(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (_db, _registry, router, user_id, persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        let err = router
            .post_user_message(user_id, persona_id, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn history_is_ordered_and_clearable() {
        let (_db, _registry, router, user_id, persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        for i in 0..3 {
            router
                .post_user_message(user_id, persona_id, &format!("message {i}"))
                .await
                .unwrap();
        }

        let history = router.get_history(user_id, persona_id).await.unwrap();
        assert_eq!(history.len(), 6);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }

        router.clear_history(user_id, persona_id).await.unwrap();
        assert!(router.get_history(user_id, persona_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_trims_to_fifty_but_store_keeps_everything() {
        let (db, _registry, router, user_id, persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        // 30 round trips = 60 messages, over the 50-message cache bound.
        for i in 0..30 {
            router
                .post_user_message(user_id, persona_id, &format!("message {i}"))
                .await
                .unwrap();
        }

        let cached = router.get_history(user_id, persona_id).await.unwrap();
        assert_eq!(cached.len(), HISTORY_CACHE_LIMIT);
        // The most recent turn survives the trim.
        assert_eq!(cached.last().unwrap().role, Role::Assistant);

        let session = router
            .get_or_create_session(user_id, persona_id)
            .await
            .unwrap();
        let stored = db.messages_for_session(&session.id.to_string()).unwrap();
        assert_eq!(stored.len(), 60);
    }

    #[tokio::test]
    async fn concurrent_session_creation_yields_one_row() {
        let (_db, _registry, router, user_id, persona_id) =
            setup(Arc::new(TemplateEngine)).await;
        let router = Arc::new(router);

        let a = {
            let router = router.clone();
            tokio::spawn(async move { router.get_or_create_session(user_id, persona_id).await })
        };
        let b = {
            let router = router.clone();
            tokio::spawn(async move { router.get_or_create_session(user_id, persona_id).await })
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn cache_rebuilds_from_the_store() {
        let (db, registry, router, user_id, persona_id) =
            setup(Arc::new(TemplateEngine)).await;

        router
            .post_user_message(user_id, persona_id, "remember this")
            .await
            .unwrap();

        // A fresh router over the same store sees the same history.
        let fresh = ChatRouter::new(db, registry);
        let history = fresh.get_history(user_id, persona_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "remember this");
    }
}
