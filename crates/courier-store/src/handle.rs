//! Shared handle for using one [`Database`] from many async tasks.

use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Cloneable handle around the process-wide database connection.
///
/// SQLite calls are synchronous and fast, so callers take the lock, run
/// one operation, and release it before the next await point. The lock
/// must never be held across an await.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Database>>,
}

impl StoreHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run one store operation under the lock.
    pub fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&db)
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chat;

    #[test]
    fn clones_see_the_same_database() {
        let handle = StoreHandle::new(Database::open_in_memory().unwrap());
        let other = handle.clone();

        let chat = Chat::new("shared".into(), serde_json::Map::new());
        handle.with(|db| db.create_chat(&chat)).unwrap();

        let fetched = other.with(|db| db.get_chat(&chat.id)).unwrap();
        assert_eq!(fetched.name, "shared");
    }
}
