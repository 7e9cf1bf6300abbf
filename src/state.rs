//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the group broker (the only shared mutable structure), the
//! session store used to authenticate socket upgrades, and chat config.
//! Collaborators sit behind traits so tests can swap in in-memory fakes.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::ChatConfig;
use crate::services::broker::{BrokerPolicy, GroupBroker};
use crate::services::groups::{GroupDirectory, PgGroupDirectory};
use crate::services::session::{PgSessionStore, SessionStore};

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub broker: GroupBroker,
    pub sessions: Arc<dyn SessionStore>,
    pub chat: Arc<ChatConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(directory: Arc<dyn GroupDirectory>, sessions: Arc<dyn SessionStore>, chat: ChatConfig) -> Self {
        let broker = GroupBroker::new(directory, BrokerPolicy::from(&chat));
        Self { broker, sessions, chat: Arc::new(chat) }
    }

    /// Wire the `PostgreSQL`-backed collaborators onto one pool.
    #[must_use]
    pub fn from_pool(pool: PgPool, chat: ChatConfig) -> Self {
        Self::new(
            Arc::new(PgGroupDirectory::new(pool.clone())),
            Arc::new(PgSessionStore::new(pool)),
            chat,
        )
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use crate::event::{GroupId, Identity};
    use crate::services::groups::GroupRecord;

    /// In-memory group directory. `fail` makes every lookup error out.
    #[derive(Default)]
    pub struct StaticGroupDirectory {
        pub groups: HashMap<GroupId, String>,
        pub members: HashSet<(GroupId, i64)>,
        pub fail: bool,
    }

    impl StaticGroupDirectory {
        #[must_use]
        pub fn with_group(mut self, group_id: GroupId, name: &str, members: &[i64]) -> Self {
            self.groups.insert(group_id, name.to_owned());
            for user_id in members {
                self.members.insert((group_id, *user_id));
            }
            self
        }
    }

    #[async_trait::async_trait]
    impl GroupDirectory for StaticGroupDirectory {
        async fn find_group(&self, group_id: GroupId) -> Result<Option<GroupRecord>, sqlx::Error> {
            if self.fail {
                return Err(sqlx::Error::PoolTimedOut);
            }
            Ok(self
                .groups
                .get(&group_id)
                .map(|name| GroupRecord { id: group_id, name: name.clone() }))
        }

        async fn is_member(&self, group_id: GroupId, user_id: i64) -> Result<bool, sqlx::Error> {
            if self.fail {
                return Err(sqlx::Error::PoolTimedOut);
            }
            Ok(self.members.contains(&(group_id, user_id)))
        }
    }

    /// In-memory session store. Tickets are single use, like the real one.
    #[derive(Default)]
    pub struct StaticSessionStore {
        pub sessions: HashMap<String, Identity>,
        pub tickets: Mutex<HashMap<String, Identity>>,
    }

    impl StaticSessionStore {
        #[must_use]
        pub fn with_session(mut self, token: &str, identity: Identity) -> Self {
            self.sessions.insert(token.to_owned(), identity);
            self
        }

        #[must_use]
        pub fn with_ticket(self, ticket: &str, identity: Identity) -> Self {
            self.tickets
                .lock()
                .expect("ticket mutex should lock")
                .insert(ticket.to_owned(), identity);
            self
        }
    }

    #[async_trait::async_trait]
    impl SessionStore for StaticSessionStore {
        async fn validate_session(&self, token: &str) -> Result<Option<Identity>, sqlx::Error> {
            Ok(self.sessions.get(token).cloned())
        }

        async fn issue_ticket(&self, user_id: i64) -> Result<String, sqlx::Error> {
            let identity = self
                .sessions
                .values()
                .find(|identity| identity.user_id == user_id)
                .cloned()
                .ok_or(sqlx::Error::RowNotFound)?;
            let ticket = format!("ticket-{user_id}-{}", uuid::Uuid::new_v4().simple());
            self.tickets
                .lock()
                .expect("ticket mutex should lock")
                .insert(ticket.clone(), identity);
            Ok(ticket)
        }

        async fn consume_ticket(&self, ticket: &str) -> Result<Option<Identity>, sqlx::Error> {
            Ok(self
                .tickets
                .lock()
                .expect("ticket mutex should lock")
                .remove(ticket))
        }
    }

    #[must_use]
    pub fn alice() -> Identity {
        Identity::new(1, "alice")
    }

    #[must_use]
    pub fn bob() -> Identity {
        Identity::new(2, "bob")
    }

    #[must_use]
    pub fn carol() -> Identity {
        Identity::new(3, "carol")
    }

    /// Directory with group 5 (alice, bob) and group 7 (carol).
    #[must_use]
    pub fn tasting_directory() -> StaticGroupDirectory {
        StaticGroupDirectory::default()
            .with_group(5, "Stout Society", &[alice().user_id, bob().user_id])
            .with_group(7, "Cider Circle", &[carol().user_id])
    }

    /// Test `AppState` over the tasting directory and the given session store.
    #[must_use]
    pub fn test_app_state_with(sessions: StaticSessionStore, chat: ChatConfig) -> AppState {
        AppState::new(Arc::new(tasting_directory()), Arc::new(sessions), chat)
    }

    /// Test `AppState` with tickets `alice`, `bob`, `carol` and default config.
    #[must_use]
    pub fn test_app_state() -> AppState {
        let sessions = StaticSessionStore::default()
            .with_ticket("alice", alice())
            .with_ticket("bob", bob())
            .with_ticket("carol", carol());
        test_app_state_with(sessions, ChatConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_state_starts_with_empty_broker() {
        let state = test_helpers::test_app_state();
        let stats = state.broker.stats().await;
        assert_eq!(stats.groups, 0);
        assert_eq!(stats.connections, 0);
    }

    #[tokio::test]
    async fn clones_share_one_registry() {
        let state = test_helpers::test_app_state();
        let clone = state.clone();
        let closed = clone.broker.close_all().await;
        assert_eq!(closed, 0);

        // Closing through the clone is visible through the first handle.
        let mut conn = crate::services::broker::Connection::new(test_helpers::alice());
        let permit = state
            .broker
            .authorize(5, &test_helpers::alice())
            .await
            .expect("alice may join group 5");
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        assert!(state.broker.attach(&mut conn, permit, tx).await.is_err());
    }
}
