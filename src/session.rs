//! Session cache in front of the durable store
//!
//! Each active session is a `SessionContext` behind its own async mutex, so
//! two queries on the same session serialize while different sessions
//! proceed independently. On a cache miss the context is rebuilt from the
//! `SessionStore`.

use crate::dataset::Dataset;
use crate::error::{InsightError, Result};
use crate::store::{validate_session_id, SessionRecord, SessionStore, StoredDataset, StoredMessage};
use crate::vault::EntityMap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Working state of one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// `None` until a dataset has been uploaded
    pub entity_map: Option<EntityMap>,
    /// Masked dataset; shared read-only with executors
    pub dataset: Option<Arc<Dataset>>,
    pub filename: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            title: title.into(),
            created_at: Utc::now(),
            entity_map: None,
            dataset: None,
            filename: None,
        }
    }

    /// Snapshot as a persistable record
    pub fn to_record(&self) -> SessionRecord {
        let dataset = match (&self.filename, &self.dataset) {
            (Some(filename), Some(dataset)) => Some(StoredDataset {
                filename: filename.clone(),
                dataset: dataset.as_ref().clone(),
            }),
            _ => None,
        };
        SessionRecord {
            session_id: self.session_id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            entity_map: self.entity_map.clone(),
            dataset,
        }
    }
}

impl From<SessionRecord> for SessionContext {
    fn from(record: SessionRecord) -> Self {
        let (filename, dataset) = match record.dataset {
            Some(stored) => (Some(stored.filename), Some(Arc::new(stored.dataset))),
            None => (None, None),
        };
        Self {
            session_id: record.session_id,
            title: record.title,
            created_at: record.created_at,
            entity_map: record.entity_map,
            dataset,
            filename,
        }
    }
}

/// Shared handle to one session's state
pub type SessionHandle = Arc<Mutex<SessionContext>>;

/// Process-wide registry of active sessions
pub struct SessionCache {
    store: Arc<dyn SessionStore>,
    active: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Register a new session and persist it immediately
    pub async fn create(&self, context: SessionContext) -> Result<SessionHandle> {
        self.store.save(&context.to_record())?;
        let id = context.session_id.clone();
        let handle = Arc::new(Mutex::new(context));
        self.active.write().await.insert(id.clone(), handle.clone());
        tracing::info!(session = %id, "Session created");
        Ok(handle)
    }

    /// Fetch an active session, recovering it from the store on a miss
    pub async fn open(&self, session_id: &str) -> Result<SessionHandle> {
        validate_session_id(session_id)?;

        if let Some(handle) = self.active.read().await.get(session_id) {
            return Ok(handle.clone());
        }

        let record = self
            .store
            .load(session_id)?
            .ok_or_else(|| InsightError::SessionNotFound(session_id.to_string()))?;

        let mut active = self.active.write().await;
        // Another task may have recovered it while the store was read
        let handle = active
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionContext::from(record))))
            .clone();
        tracing::debug!(session = %session_id, "Session recovered from store");
        Ok(handle)
    }

    /// Write the session's current state to the store
    pub fn persist(&self, context: &SessionContext) -> Result<()> {
        self.store.save(&context.to_record())
    }

    /// Persist the context and append `messages` to its log
    ///
    /// Call with the session lock held. Returns `false` without writing
    /// anything when the session was deleted while the caller held it.
    pub async fn commit(&self, context: &SessionContext, messages: &[StoredMessage]) -> Result<bool> {
        if !self.active.read().await.contains_key(&context.session_id) {
            tracing::debug!(session = %context.session_id, "Session deleted in flight, nothing committed");
            return Ok(false);
        }
        self.store.save(&context.to_record())?;
        for message in messages {
            self.store.append_message(&context.session_id, message)?;
        }
        Ok(true)
    }

    pub fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<()> {
        self.store.append_message(session_id, message)
    }

    pub fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        validate_session_id(session_id)?;
        self.store.messages(session_id)
    }

    /// Drop the session from the cache and the store
    ///
    /// Waits for a query holding the session to finish before removing
    /// the stored record.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let removed = self.active.write().await.remove(session_id);
        let _in_flight = match &removed {
            Some(handle) => Some(handle.lock().await),
            None => None,
        };
        let cached = removed.is_some();
        let stored = self.store.delete(session_id)?;
        if cached || stored {
            tracing::info!(session = %session_id, "Session deleted");
        }
        Ok(cached || stored)
    }

    /// Number of sessions currently held in memory
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    fn cache() -> (Arc<MemorySessionStore>, SessionCache) {
        let store = Arc::new(MemorySessionStore::default());
        let cache = SessionCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn test_create_persists() {
        let (store, cache) = cache();
        cache.create(SessionContext::new("s1", "t")).await.unwrap();
        assert!(store.load("s1").unwrap().is_some());
        assert_eq!(cache.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_recovers_from_store() {
        let (store, cache) = cache();
        let mut record = SessionRecord::new("s1", "sales.csv");
        let mut map = EntityMap::new();
        map.assign("COUN", "France");
        record.entity_map = Some(map.clone());
        store.save(&record).unwrap();

        let handle = cache.open("s1").await.unwrap();
        let ctx = handle.lock().await;
        assert_eq!(ctx.entity_map.as_ref(), Some(&map));
    }

    #[tokio::test]
    async fn test_open_unknown_session() {
        let (_store, cache) = cache();
        assert!(matches!(
            cache.open("nope").await,
            Err(InsightError::SessionNotFound(_))
        ));
        assert!(matches!(
            cache.open("../bad").await,
            Err(InsightError::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_same_handle_for_same_session() {
        let (_store, cache) = cache();
        let a = cache.create(SessionContext::new("s1", "t")).await.unwrap();
        let b = cache.open("s1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_persist_then_reopen_after_delete_from_cache() {
        let (store, cache) = cache();
        let handle = cache.create(SessionContext::new("s1", "t")).await.unwrap();
        {
            let mut ctx = handle.lock().await;
            let mut map = EntityMap::new();
            map.assign("CITY", "Paris");
            ctx.entity_map = Some(map);
            cache.persist(&ctx).unwrap();
        }

        let fresh = SessionCache::new(store);
        let ctx = fresh.open("s1").await.unwrap();
        let ctx = ctx.lock().await;
        assert_eq!(
            ctx.entity_map.as_ref().and_then(|m| m.original("<CITY_1>")),
            Some("Paris")
        );
    }

    #[tokio::test]
    async fn test_commit_skips_deleted_session() {
        let (store, cache) = cache();
        let handle = cache.create(SessionContext::new("s1", "t")).await.unwrap();
        assert!(cache.delete("s1").await.unwrap());

        let ctx = handle.lock().await;
        let committed = cache
            .commit(&ctx, &[StoredMessage::new(crate::store::Role::User, "late")])
            .await
            .unwrap();
        assert!(!committed);
        assert!(store.load("s1").unwrap().is_none());
        assert!(store.messages("s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_in_flight_query() {
        let (store, cache) = cache();
        let cache = Arc::new(cache);
        let handle = cache.create(SessionContext::new("s1", "t")).await.unwrap();
        let ctx = handle.lock().await;

        let deleting = tokio::spawn({
            let cache = cache.clone();
            async move { cache.delete("s1").await }
        });
        while cache.active_count().await > 0 {
            tokio::task::yield_now().await;
        }
        assert!(store.load("s1").unwrap().is_some(), "record kept while locked");
        assert!(!cache.commit(&ctx, &[]).await.unwrap());
        drop(ctx);

        assert!(deleting.await.unwrap().unwrap());
        assert!(store.load("s1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, cache) = cache();
        cache.create(SessionContext::new("s1", "t")).await.unwrap();
        assert!(cache.delete("s1").await.unwrap());
        assert!(store.load("s1").unwrap().is_none());
        assert!(!cache.delete("s1").await.unwrap());
    }
}
