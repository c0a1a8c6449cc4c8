use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use animus_db::{Database, PersonaWrite};
use animus_db::models::PersonaRow;
use animus_engine::PersonaEngine;
use animus_types::api::GenerateRequest;
use animus_types::models::Persona;

use crate::error::AppError;
use crate::run_blocking;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// In-memory mirror of active persona definitions over the store.
/// Read-through on miss, overwrite on write, no eviction. The store stays
/// the single source of truth and the cache can be dropped at any time.
pub struct PersonaRegistry {
    db: Arc<Database>,
    engine: Arc<dyn PersonaEngine>,
    cache: RwLock<HashMap<Uuid, Persona>>,
}

impl PersonaRegistry {
    pub fn new(db: Arc<Database>, engine: Arc<dyn PersonaEngine>) -> Self {
        Self {
            db,
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Warm the cache from the store at startup.
    pub async fn preload(&self) -> Result<usize, AppError> {
        let db = self.db.clone();
        let rows = run_blocking(move || db.all_personas()).await?;

        let mut cache = self.cache.write().expect("persona cache poisoned");
        for row in rows {
            let persona = row.into_model();
            cache.insert(persona.id, persona);
        }
        let count = cache.len();
        drop(cache);

        info!("Loaded {} digital humans into memory", count);
        Ok(count)
    }

    /// Ask the collaborator for a persona definition, then persist and cache
    /// it. Collaborator failures are reported to the caller, never retried.
    pub async fn generate(
        &self,
        owner_id: Uuid,
        request: &GenerateRequest,
    ) -> Result<Persona, AppError> {
        let generated = self
            .engine
            .generate(request)
            .await
            .map_err(|e| AppError::Generation(e.to_string()))?;

        let now = Utc::now();
        let persona = Persona {
            id: Uuid::new_v4(),
            owner_id,
            name: generated.name,
            prompt: generated.prompt,
            rules: generated.rules,
            personality: generated.personality,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            is_public: request.is_public.unwrap_or(false),
            created_at: now,
            updated_at: now,
        };

        let db = self.db.clone();
        let row = to_row(&persona);
        run_blocking(move || db.insert_persona(&row)).await?;

        self.cache_put(persona.clone());
        info!("Digital human generated: {} ({})", persona.name, persona.id);
        Ok(persona)
    }

    /// Explicit save: create if new, overwrite if the caller owns it.
    pub async fn save(&self, caller_id: Uuid, incoming: Persona) -> Result<Persona, AppError> {
        validate(&incoming)?;

        let db = self.db.clone();
        let mut row = to_row(&incoming);
        row.user_id = caller_id.to_string();
        row.updated_at = Utc::now().to_rfc3339();
        let id = row.id.clone();
        let caller = caller_id.to_string();

        let outcome = run_blocking(move || db.save_persona(&row, &caller)).await?;
        match outcome {
            PersonaWrite::Done => self.reload(incoming.id).await?.ok_or(AppError::NotFound),
            PersonaWrite::NotOwner => Err(AppError::PermissionDenied),
            // save_persona never reports NotFound; a missing row is an insert.
            PersonaWrite::NotFound => Err(AppError::Internal(anyhow::anyhow!(
                "unexpected NotFound saving persona {id}"
            ))),
        }
    }

    /// Update an existing persona. The ownership check happens inside the
    /// store's write path, atomically with the update itself.
    pub async fn update(&self, caller_id: Uuid, incoming: Persona) -> Result<Persona, AppError> {
        validate(&incoming)?;

        let db = self.db.clone();
        let mut row = to_row(&incoming);
        row.updated_at = Utc::now().to_rfc3339();
        let caller = caller_id.to_string();

        let outcome = run_blocking(move || db.update_persona(&row, &caller)).await?;
        match outcome {
            PersonaWrite::Done => self.reload(incoming.id).await?.ok_or(AppError::NotFound),
            PersonaWrite::NotFound => Err(AppError::NotFound),
            PersonaWrite::NotOwner => Err(AppError::PermissionDenied),
        }
    }

    /// Delete a persona; cascades to its chat sessions and messages.
    pub async fn delete(&self, caller_id: Uuid, id: Uuid) -> Result<(), AppError> {
        let db = self.db.clone();
        let id_str = id.to_string();
        let caller = caller_id.to_string();

        let outcome = run_blocking(move || db.delete_persona(&id_str, &caller)).await?;
        match outcome {
            PersonaWrite::Done => {
                self.cache
                    .write()
                    .expect("persona cache poisoned")
                    .remove(&id);
                info!("Digital human deleted: {}", id);
                Ok(())
            }
            PersonaWrite::NotFound => Err(AppError::NotFound),
            PersonaWrite::NotOwner => Err(AppError::PermissionDenied),
        }
    }

    /// Cache-first lookup, reading through to the store on a miss.
    pub async fn get(&self, id: Uuid) -> Result<Option<Persona>, AppError> {
        if let Some(hit) = self
            .cache
            .read()
            .expect("persona cache poisoned")
            .get(&id)
            .cloned()
        {
            return Ok(Some(hit));
        }
        self.reload(id).await
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Persona>, AppError> {
        let db = self.db.clone();
        let uid = user_id.to_string();
        let rows = run_blocking(move || db.personas_for_user(&uid)).await?;
        Ok(rows.into_iter().map(PersonaRow::into_model).collect())
    }

    pub async fn list_public(&self, limit: u32) -> Result<Vec<Persona>, AppError> {
        let db = self.db.clone();
        let rows = run_blocking(move || db.public_personas(limit)).await?;
        Ok(rows.into_iter().map(PersonaRow::into_model).collect())
    }

    /// The response-generation collaborator, shared with the chat router.
    pub fn engine(&self) -> &Arc<dyn PersonaEngine> {
        &self.engine
    }

    /// Number of personas currently cached. Health endpoint fodder.
    pub fn active_count(&self) -> usize {
        self.cache.read().expect("persona cache poisoned").len()
    }

    /// Fetch the authoritative row from the store and refresh the cache.
    async fn reload(&self, id: Uuid) -> Result<Option<Persona>, AppError> {
        let db = self.db.clone();
        let id_str = id.to_string();
        let Some(row) = run_blocking(move || db.get_persona(&id_str)).await? else {
            return Ok(None);
        };
        let persona = row.into_model();
        self.cache_put(persona.clone());
        Ok(Some(persona))
    }

    fn cache_put(&self, persona: Persona) {
        self.cache
            .write()
            .expect("persona cache poisoned")
            .insert(persona.id, persona);
    }
}

fn validate(persona: &Persona) -> Result<(), AppError> {
    if persona.name.trim().is_empty() {
        return Err(AppError::Validation("Name must not be empty".into()));
    }
    if !(0.0..=1.0).contains(&persona.temperature) {
        return Err(AppError::Validation(
            "Temperature must be between 0.0 and 1.0".into(),
        ));
    }
    if persona.max_tokens == 0 {
        return Err(AppError::Validation(
            "Max response length must be positive".into(),
        ));
    }
    Ok(())
}

fn to_row(persona: &Persona) -> PersonaRow {
    PersonaRow {
        id: persona.id.to_string(),
        user_id: persona.owner_id.to_string(),
        name: persona.name.clone(),
        prompt: persona.prompt.clone(),
        rules: serde_json::to_string(&persona.rules).unwrap_or_else(|_| "[]".into()),
        personality: persona.personality.clone(),
        temperature: persona.temperature,
        max_tokens: persona.max_tokens as i64,
        is_public: persona.is_public,
        created_at: persona.created_at.to_rfc3339(),
        updated_at: persona.updated_at.to_rfc3339(),
    }
}
