//! Group directory: the chat core's view of groups and memberships.
//!
//! SYSTEM CONTEXT
//! ==============
//! Groups and memberships are created by the main BrewBuddies application.
//! The chat service only reads them: does the group exist, and is this user
//! in it. The creator of a group always counts as a member.

use sqlx::PgPool;

use crate::event::GroupId;

/// Row returned from group lookups.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
}

/// Read-only access to groups and memberships. Enables mocking in tests.
#[async_trait::async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Resolve a group by ID.
    ///
    /// # Errors
    ///
    /// Returns a database error if the lookup fails.
    async fn find_group(&self, group_id: GroupId) -> Result<Option<GroupRecord>, sqlx::Error>;

    /// Whether `user_id` is a member (or the creator) of `group_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the lookup fails.
    async fn is_member(&self, group_id: GroupId, user_id: i64) -> Result<bool, sqlx::Error>;
}

/// `PostgreSQL`-backed directory over the `groups` and `group_members` tables.
pub struct PgGroupDirectory {
    pool: PgPool,
}

impl PgGroupDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GroupDirectory for PgGroupDirectory {
    async fn find_group(&self, group_id: GroupId) -> Result<Option<GroupRecord>, sqlx::Error> {
        let row = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, name)| GroupRecord { id, name }))
    }

    async fn is_member(&self, group_id: GroupId, user_id: i64) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2
            ) OR EXISTS(
                SELECT 1 FROM groups WHERE id = $1 AND creator_id = $2
            )",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }
}
