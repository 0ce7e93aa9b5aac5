//! Shared access to the SQLite handle.
//!
//! The store is synchronous. Handlers and the worker take the lock for one
//! short burst of queries and release it before any `.await`.

use std::sync::{Arc, Mutex, MutexGuard};

use mailwave_store::Database;

use crate::error::ServerError;

#[derive(Clone)]
pub struct SharedDb(Arc<Mutex<Database>>);

impl SharedDb {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Database>, ServerError> {
        self.0
            .lock()
            .map_err(|_| ServerError::Internal("database lock poisoned".into()))
    }

    /// Run `f` with the lock held.
    pub fn with<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Database) -> mailwave_store::Result<T>,
    {
        let mut guard = self.lock()?;
        Ok(f(&mut guard)?)
    }
}
