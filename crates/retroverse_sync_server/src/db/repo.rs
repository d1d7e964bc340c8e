use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use retroverse_core::User;
use retroverse_core::util::generate_token;
use rusqlite::{Connection, OptionalExtension, params};

/// User repository for the API-token users table
#[derive(Clone)]
pub struct UserRepo {
    conn: Arc<Mutex<Connection>>,
}

fn roles_to_text(roles: &[&str]) -> String {
    roles.join(",")
}

fn user_from_parts(id: String, roles: &str) -> User {
    roles
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .fold(User::new(id), |user, role| user.with_role(role))
}

impl UserRepo {
    /// Create a new UserRepo with the given connection
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Create a user with a fresh API token (returns the token)
    pub fn create_user(&self, user_id: &str, roles: &[&str]) -> Result<String, rusqlite::Error> {
        let token = generate_token(32);
        self.upsert_user(user_id, &token, roles)?;
        Ok(token)
    }

    /// Create or update a user with a known API token
    pub fn upsert_user(&self, user_id: &str, token: &str, roles: &[&str]) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, api_token, roles, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET api_token = excluded.api_token, roles = excluded.roles",
            params![user_id, token, roles_to_text(roles), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Resolve an API token to its user, recording the access
    pub fn validate_token(&self, token: &str) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock();
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT id, roles FROM users WHERE api_token = ?",
                [token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, roles)) = found else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE users SET last_seen_at = ? WHERE id = ?",
            params![Utc::now().timestamp(), id],
        )?;
        Ok(Some(user_from_parts(id, &roles)))
    }

    /// Count registered users
    pub fn user_count(&self) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
