//! Server-side browser sessions.
//!
//! A session is an opaque random id handed to the browser in a cookie; the
//! authoritative record lives in the state store under `session:{id}` and
//! expires with its TTL. Nothing about the user is stored client-side.

use crate::store::{StateStore, StoreError};
use crate::utils::random_token;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const SESSION_PREFIX: &str = "session:";

/// Name of the browser cookie carrying the session id.
pub const SESSION_COOKIE: &str = "sso_session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    /// When the user authenticated, i.e. the `auth_time` of ID tokens minted
    /// under this session.
    pub created_at: i64,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Create a session for `user_id` and return its opaque id.
    pub fn create(&self, user_id: &str) -> Result<String, StoreError> {
        let session_id = random_token();
        let record = SessionRecord {
            user_id: user_id.to_string(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store.put(&session_key(&session_id), value, self.ttl)?;
        Ok(session_id)
    }

    /// Look up a session id. `Ok(None)` means "not logged in" (absent or
    /// expired); store failures stay errors so callers fail closed.
    pub fn validate(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let Some(raw) = self.store.get(&session_key(session_id))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::error!(error = %e, "corrupt session record, treating as absent");
                self.store.delete(&session_key(session_id))?;
                Ok(None)
            }
        }
    }

    pub fn destroy(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.delete(&session_key(session_id))
    }

    /// Destroy every session belonging to `user_id` ("log out everywhere").
    pub fn destroy_all(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut destroyed = 0;
        for (key, raw) in self.store.scan_prefix(SESSION_PREFIX)? {
            let owned_by_user = serde_json::from_str::<SessionRecord>(&raw)
                .map(|record| record.user_id == user_id)
                .unwrap_or(false);
            if owned_by_user {
                self.store.delete(&key)?;
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    /// Issue a fresh session id for `user_id`, destroying the browser's
    /// previous session if it carried one. Run on every privilege change
    /// (login) against session fixation.
    pub fn regenerate(
        &self,
        previous: Option<&str>,
        user_id: &str,
    ) -> Result<String, StoreError> {
        if let Some(old) = previous {
            self.store.delete(&session_key(old))?;
        }
        self.create(user_id)
    }
}

fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn create_then_validate() {
        let sessions = manager();
        let sid = sessions.create("user-1").unwrap();
        let record = sessions.validate(&sid).unwrap().unwrap();
        assert_eq!(record.user_id, "user-1");
    }

    #[test]
    fn destroy_invalidates() {
        let sessions = manager();
        let sid = sessions.create("user-1").unwrap();
        sessions.destroy(&sid).unwrap();
        assert!(sessions.validate(&sid).unwrap().is_none());
    }

    #[test]
    fn unknown_session_is_none_not_error() {
        let sessions = manager();
        assert!(sessions.validate("nope").unwrap().is_none());
    }

    #[test]
    fn destroy_all_only_hits_the_given_user() {
        let sessions = manager();
        let a1 = sessions.create("alice").unwrap();
        let a2 = sessions.create("alice").unwrap();
        let b = sessions.create("bob").unwrap();

        let destroyed = sessions.destroy_all("alice").unwrap();
        assert_eq!(destroyed, 2);
        assert!(sessions.validate(&a1).unwrap().is_none());
        assert!(sessions.validate(&a2).unwrap().is_none());
        assert!(sessions.validate(&b).unwrap().is_some());
    }

    #[test]
    fn regenerate_swaps_the_id_and_invalidates_the_old_one() {
        let sessions = manager();
        let old = sessions.create("user-1").unwrap();
        let new = sessions.regenerate(Some(&old), "user-1").unwrap();
        assert_ne!(old, new);
        assert!(sessions.validate(&old).unwrap().is_none());
        assert_eq!(sessions.validate(&new).unwrap().unwrap().user_id, "user-1");
    }

    #[test]
    fn regenerate_without_a_previous_session_just_creates_one() {
        let sessions = manager();
        let sid = sessions.regenerate(None, "user-1").unwrap();
        assert_eq!(sessions.validate(&sid).unwrap().unwrap().user_id, "user-1");
    }

    #[test]
    fn sessions_expire_with_their_ttl() {
        let sessions =
            SessionManager::new(Arc::new(MemoryStore::new()), Duration::from_millis(10));
        let sid = sessions.create("user-1").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(sessions.validate(&sid).unwrap().is_none());
    }
}
