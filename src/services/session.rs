//! Session and WS-ticket management.
//!
//! ARCHITECTURE
//! ============
//! The main application owns login and writes session tokens. This service
//! only validates them, and trades a valid session for a one-time
//! short-lived ticket that the browser passes on the chat socket upgrade
//! (`/ws/group/{id}/?ticket=...`), so cookies never travel in a WS URL.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; this favors replay safety over reconnect convenience.

use std::fmt::Write;

use rand::Rng;
use sqlx::PgPool;

use crate::event::Identity;

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a short-lived 16-byte hex WS ticket.
#[must_use]
pub(crate) fn generate_ws_ticket() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

// =============================================================================
// STORE
// =============================================================================

/// Session validation and ticket exchange. Enables mocking in tests.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve a session token to the logged-in identity.
    ///
    /// # Errors
    ///
    /// Returns a database error if the lookup fails.
    async fn validate_session(&self, token: &str) -> Result<Option<Identity>, sqlx::Error>;

    /// Mint a one-time WS ticket for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the insert fails.
    async fn issue_ticket(&self, user_id: i64) -> Result<String, sqlx::Error>;

    /// Consume a WS ticket atomically, returning its identity if still valid.
    ///
    /// # Errors
    ///
    /// Returns a database error if the delete fails.
    async fn consume_ticket(&self, ticket: &str) -> Result<Option<Identity>, sqlx::Error>;
}

/// `PostgreSQL`-backed store over the `sessions`, `ws_tickets`, and `users` tables.
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionStore for PgSessionStore {
    async fn validate_session(&self, token: &str) -> Result<Option<Identity>, sqlx::Error> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r"SELECT u.id, u.username
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, username)| Identity { user_id, username }))
    }

    async fn issue_ticket(&self, user_id: i64) -> Result<String, sqlx::Error> {
        // Unconsumed tickets are otherwise never removed.
        sqlx::query("DELETE FROM ws_tickets WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        let ticket = generate_ws_ticket();
        sqlx::query("INSERT INTO ws_tickets (ticket, user_id) VALUES ($1, $2)")
            .bind(&ticket)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(ticket)
    }

    async fn consume_ticket(&self, ticket: &str) -> Result<Option<Identity>, sqlx::Error> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r"DELETE FROM ws_tickets t
              USING users u
              WHERE t.ticket = $1 AND t.expires_at > now() AND u.id = t.user_id
              RETURNING u.id, u.username",
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, username)| Identity { user_id, username }))
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
