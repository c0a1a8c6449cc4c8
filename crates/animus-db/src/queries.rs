use crate::Database;
use crate::models::{MessageRow, PersonaRow, SessionRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Outcome of an owner-gated persona write. The ownership check runs inside
/// the same connection lock as the write, so there is no window where another
/// caller can slip in between check and mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaWrite {
    Done,
    NotFound,
    NotOwner,
}

impl Database {
    // -- Users --

    /// Insert a user unless the username or email is already taken.
    /// Returns false on a duplicate. Check and insert share one lock hold,
    /// backed by the UNIQUE constraints as the last line of defense.
    pub fn create_user(&self, row: &UserRow) -> Result<bool> {
        self.with_conn(|conn| {
            let taken: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM users
                     WHERE username = ?1 OR (?2 IS NOT NULL AND email = ?2)",
                    params![row.username, row.email],
                    |r| r.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO users (id, username, email, password_hash, is_guest, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.username,
                    row.email,
                    row.password_hash,
                    row.is_guest,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            Ok(true)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, email, password_hash, is_guest, created_at, updated_at
                 FROM users WHERE email = ?1",
            )?;
            Ok(stmt.query_row([email], map_user).optional()?)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, email, password_hash, is_guest, created_at, updated_at
                 FROM users WHERE id = ?1",
            )?;
            Ok(stmt.query_row([id], map_user).optional()?)
        })
    }

    // -- Digital humans --

    pub fn insert_persona(&self, row: &PersonaRow) -> Result<()> {
        self.with_conn(|conn| {
            insert_persona(conn, row)?;
            Ok(())
        })
    }

    /// Explicit save: creates the persona if it does not exist, overwrites it
    /// if the caller owns it, refuses otherwise.
    pub fn save_persona(&self, row: &PersonaRow, caller_id: &str) -> Result<PersonaWrite> {
        self.with_conn(|conn| {
            match persona_owner(conn, &row.id)? {
                None => {
                    insert_persona(conn, row)?;
                    Ok(PersonaWrite::Done)
                }
                Some(owner) if owner == caller_id => {
                    update_persona_fields(conn, row)?;
                    Ok(PersonaWrite::Done)
                }
                Some(_) => Ok(PersonaWrite::NotOwner),
            }
        })
    }

    /// Update an existing persona, owner only.
    pub fn update_persona(&self, row: &PersonaRow, caller_id: &str) -> Result<PersonaWrite> {
        self.with_conn(|conn| {
            match persona_owner(conn, &row.id)? {
                None => Ok(PersonaWrite::NotFound),
                Some(owner) if owner == caller_id => {
                    update_persona_fields(conn, row)?;
                    Ok(PersonaWrite::Done)
                }
                Some(_) => Ok(PersonaWrite::NotOwner),
            }
        })
    }

    /// Delete a persona and cascade to its chat sessions and messages.
    /// Owner check and the three deletes run in one transaction.
    pub fn delete_persona(&self, id: &str, caller_id: &str) -> Result<PersonaWrite> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let outcome = match persona_owner(&tx, id)? {
                None => PersonaWrite::NotFound,
                Some(owner) if owner != caller_id => PersonaWrite::NotOwner,
                Some(_) => {
                    tx.execute(
                        "DELETE FROM chat_messages WHERE chat_session_id IN
                         (SELECT id FROM chat_sessions WHERE digital_human_id = ?1)",
                        [id],
                    )?;
                    tx.execute("DELETE FROM chat_sessions WHERE digital_human_id = ?1", [id])?;
                    tx.execute("DELETE FROM digital_humans WHERE id = ?1", [id])?;
                    PersonaWrite::Done
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    pub fn get_persona(&self, id: &str) -> Result<Option<PersonaRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{PERSONA_SELECT} WHERE id = ?1"))?;
            Ok(stmt.query_row([id], map_persona).optional()?)
        })
    }

    pub fn personas_for_user(&self, user_id: &str) -> Result<Vec<PersonaRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{PERSONA_SELECT} WHERE user_id = ?1 ORDER BY updated_at DESC"
            ))?;
            let rows = stmt
                .query_map([user_id], map_persona)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn public_personas(&self, limit: u32) -> Result<Vec<PersonaRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{PERSONA_SELECT} WHERE is_public = 1 ORDER BY updated_at DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map([limit], map_persona)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Every persona in the store, newest-updated first. Used to warm the
    /// registry cache at startup.
    pub fn all_personas(&self) -> Result<Vec<PersonaRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{PERSONA_SELECT} ORDER BY updated_at DESC"))?;
            let rows = stmt
                .query_map([], map_persona)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Chat sessions --

    /// Idempotent get-or-create for the one session per (user, persona) pair.
    /// The upsert rides on the UNIQUE(user_id, digital_human_id) constraint,
    /// so concurrent callers can never produce two rows.
    pub fn get_or_create_session(
        &self,
        candidate_id: &str,
        user_id: &str,
        digital_human_id: &str,
        now: &str,
    ) -> Result<SessionRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, user_id, digital_human_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id, digital_human_id)
                 DO UPDATE SET updated_at = excluded.updated_at",
                params![candidate_id, user_id, digital_human_id, now],
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, user_id, digital_human_id, created_at, updated_at
                 FROM chat_sessions WHERE user_id = ?1 AND digital_human_id = ?2",
            )?;
            Ok(stmt.query_row([user_id, digital_human_id], map_session)?)
        })
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, digital_human_id, created_at, updated_at
                 FROM chat_sessions WHERE user_id = ?1 ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Chat messages --

    pub fn insert_message(&self, row: &MessageRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, chat_session_id, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.id, row.chat_session_id, row.role, row.content, row.timestamp],
            )?;
            Ok(())
        })
    }

    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_session_id, role, content, timestamp
                 FROM chat_messages WHERE chat_session_id = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt
                .query_map([session_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_messages(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chat_messages WHERE chat_session_id = ?1",
                [session_id],
            )?;
            Ok(())
        })
    }
}

const PERSONA_SELECT: &str = "SELECT id, user_id, name, prompt, rules, personality, temperature,
            max_tokens, is_public, created_at, updated_at FROM digital_humans";

fn persona_owner(conn: &Connection, id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT user_id FROM digital_humans WHERE id = ?1", [id], |r| {
            r.get(0)
        })
        .optional()?)
}

fn insert_persona(conn: &Connection, row: &PersonaRow) -> Result<()> {
    conn.execute(
        "INSERT INTO digital_humans
         (id, user_id, name, prompt, rules, personality, temperature, max_tokens, is_public, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            row.id,
            row.user_id,
            row.name,
            row.prompt,
            row.rules,
            row.personality,
            row.temperature,
            row.max_tokens,
            row.is_public,
            row.created_at,
            row.updated_at
        ],
    )?;
    Ok(())
}

/// Overwrites the mutable fields only; owner and created_at stay put.
fn update_persona_fields(conn: &Connection, row: &PersonaRow) -> Result<()> {
    conn.execute(
        "UPDATE digital_humans
         SET name = ?2, prompt = ?3, rules = ?4, personality = ?5, temperature = ?6,
             max_tokens = ?7, is_public = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            row.id,
            row.name,
            row.prompt,
            row.rules,
            row.personality,
            row.temperature,
            row.max_tokens,
            row.is_public,
            row.updated_at
        ],
    )?;
    Ok(())
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_guest: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_persona(row: &Row<'_>) -> rusqlite::Result<PersonaRow> {
    Ok(PersonaRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        prompt: row.get(3)?,
        rules: row.get(4)?,
        personality: row.get(5)?,
        temperature: row.get(6)?,
        max_tokens: row.get(7)?,
        is_public: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        digital_human_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
    })
}
