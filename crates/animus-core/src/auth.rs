use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::info;
use uuid::Uuid;

use animus_db::Database;
use animus_db::models::UserRow;
use animus_types::api::Claims;
use animus_types::models::User;

use crate::error::AppError;
use crate::run_blocking;

const TOKEN_LIFETIME_DAYS: i64 = 7;

/// Credential checks, token issuance, token verification.
pub struct AuthService {
    db: Arc<Database>,
    jwt_secret: String,
}

impl AuthService {
    pub fn new(db: Arc<Database>, jwt_secret: String) -> Self {
        Self { db, jwt_secret }
    }

    /// Create an account and hand back a signed token for it.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(String, User), AppError> {
        if username.len() < 3 || username.len() > 32 {
            return Err(AppError::Validation(
                "Username must be 3-32 characters".into(),
            ));
        }
        if !email.contains('@') {
            return Err(AppError::Validation("Invalid email address".into()));
        }
        if password.len() < 8 {
            return Err(AppError::Validation(
                "Password must be at least 8 characters".into(),
            ));
        }

        let db = self.db.clone();
        let username = username.to_string();
        let email = email.to_string();
        let password = password.to_string();

        // Argon2 hashing is CPU-bound; keep it off the async threads along
        // with the insert.
        let row = run_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            let password_hash = Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
                .to_string();

            let now = Utc::now().to_rfc3339();
            let row = UserRow {
                id: Uuid::new_v4().to_string(),
                username,
                email: Some(email),
                password_hash: Some(password_hash),
                is_guest: false,
                created_at: now.clone(),
                updated_at: now,
            };
            let created = db.create_user(&row)?;
            Ok((created, row))
        })
        .await
        .and_then(|(created, row)| {
            if created {
                Ok(row)
            } else {
                Err(AppError::DuplicateUser)
            }
        })?;

        let user = row.into_model();
        let token = self.create_token(&user)?;
        info!("Registered user {} ({})", user.username, user.id);
        Ok((token, user))
    }

    /// Unknown email and wrong password both collapse to InvalidCredentials
    /// so login failures never reveal which accounts exist.
    pub async fn login(&self, email: &str, password: &str) -> Result<(String, User), AppError> {
        let db = self.db.clone();
        let email = email.to_string();
        let password = password.to_string();

        let row = run_blocking(move || {
            let Some(row) = db.get_user_by_email(&email)? else {
                return Ok(None);
            };
            // Guests have no credential hash and cannot log in with a password.
            let Some(hash) = row.password_hash.as_deref() else {
                return Ok(None);
            };
            let parsed = PasswordHash::new(hash)
                .map_err(|e| anyhow::anyhow!("stored hash unparseable: {e}"))?;
            if Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_err()
            {
                return Ok(None);
            }
            Ok(Some(row))
        })
        .await?
        .ok_or(AppError::InvalidCredentials)?;

        let user = row.into_model();
        let token = self.create_token(&user)?;
        info!("User {} ({}) logged in", user.username, user.id);
        Ok((token, user))
    }

    /// Validate a token and return the *current* user record: a fresh read,
    /// not whatever was embedded at signing time.
    pub async fn verify_token(&self, token: &str) -> Result<User, AppError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::InvalidToken)?
        .claims;

        let db = self.db.clone();
        let id = claims.sub.to_string();
        let row = run_blocking(move || db.get_user_by_id(&id))
            .await?
            .ok_or(AppError::UserNotFound)?;

        Ok(row.into_model())
    }

    /// Create a throwaway account for unauthenticated trial use. Always
    /// succeeds; the generated username is unique by construction.
    pub async fn guest_login(&self) -> Result<(String, User), AppError> {
        let id = Uuid::new_v4();
        let username = format!("guest_{}", &id.simple().to_string()[..8]);

        let db = self.db.clone();
        let now = Utc::now().to_rfc3339();
        let row = UserRow {
            id: id.to_string(),
            username,
            email: None,
            password_hash: None,
            is_guest: true,
            created_at: now.clone(),
            updated_at: now,
        };

        let row = run_blocking(move || {
            if !db.create_user(&row)? {
                anyhow::bail!("guest username collision for {}", row.username);
            }
            Ok(row)
        })
        .await?;

        let user = row.into_model();
        let token = self.create_token(&user)?;
        info!("Guest user {} ({}) created", user.username, user.id);
        Ok((token, user))
    }

    fn create_token(&self, user: &User) -> Result<String, AppError> {
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            exp: (Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token signing failed: {e}")))
    }
}
