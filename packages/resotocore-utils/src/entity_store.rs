use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use resotocore_types::{EntityDocument, Revision};
use thiserror::Error;
use tracing::instrument;

/// Mirrors the "entity store" contract of Section 6: documents carry
/// `_key`/`_rev`; a stale or missing revision on update is distinguishable
/// from every other failure so callers can retry or fall back to insert.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityStoreError {
    #[error("document {0} not found")]
    NotFound(String),
    #[error("stale revision for document {key}: expected {expected}, found {found}")]
    StaleRevision {
        key: String,
        expected: Revision,
        found: Revision,
    },
    #[error("collection {0:?} type mismatch")]
    TypeMismatch(Collection),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Subscribers,
    RunningTasks,
    Jobs,
    Configs,
    ConfigValidation,
    ConfigsModel,
    Test(&'static str),
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Subscribers => "subscribers",
            Collection::RunningTasks => "running_tasks",
            Collection::Jobs => "jobs",
            Collection::Configs => "configs",
            Collection::ConfigValidation => "config_validation",
            Collection::ConfigsModel => "configs_model",
            Collection::Test(name) => name,
        }
    }
}

#[derive(Copy, Clone)]
pub struct CollectionHandle<V> {
    collection: Collection,
    _marker: PhantomData<V>,
}

impl<V> CollectionHandle<V> {
    pub const fn new(collection: Collection) -> Self {
        Self {
            collection,
            _marker: PhantomData,
        }
    }

    pub const fn collection(&self) -> Collection {
        self.collection
    }
}

impl<V> fmt::Debug for CollectionHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("collection", &self.collection)
            .finish()
    }
}

/// The seam a persistent backend (e.g. a real document database) would
/// implement in place of [`InMemoryCollection`] without callers changing.
#[async_trait]
pub trait EntityCollection<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<EntityDocument<V>>, EntityStoreError>;
    async fn insert(&self, key: &str, value: V) -> Result<EntityDocument<V>, EntityStoreError>;
    async fn update(
        &self,
        key: &str,
        expected_rev: Revision,
        value: V,
    ) -> Result<EntityDocument<V>, EntityStoreError>;
    async fn delete(&self, key: &str) -> Result<Option<EntityDocument<V>>, EntityStoreError>;
    async fn keys(&self) -> Result<Vec<String>, EntityStoreError>;
    async fn all(&self) -> Result<Vec<EntityDocument<V>>, EntityStoreError>;
    async fn insert_many(
        &self,
        docs: Vec<(String, V)>,
        overwrite: bool,
    ) -> Result<(), EntityStoreError>;
    async fn truncate(&self) -> Result<(), EntityStoreError>;
}

type AnyMap = Arc<dyn Any + Send + Sync>;

/// Type-erased per-collection storage, one concurrent map per [`Collection`],
/// generalizing the table-handle-over-map idiom with revisions.
#[derive(Clone, Default)]
pub struct EntityStore {
    collections: Arc<DashMap<Collection, AnyMap>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(DashMap::new()),
        }
    }

    #[instrument(skip(self), fields(collection = ?handle.collection()))]
    pub fn collection<V>(
        &self,
        handle: &CollectionHandle<V>,
    ) -> Result<InMemoryCollection<V>, EntityStoreError>
    where
        V: Clone + Send + Sync + 'static,
    {
        Ok(InMemoryCollection {
            map: self.collection_map(handle)?,
        })
    }

    fn collection_map<V>(
        &self,
        handle: &CollectionHandle<V>,
    ) -> Result<Arc<DashMap<String, EntityDocument<V>>>, EntityStoreError>
    where
        V: Clone + Send + Sync + 'static,
    {
        match self.collections.entry(handle.collection()) {
            Entry::Occupied(entry) => entry
                .get()
                .clone()
                .downcast::<DashMap<String, EntityDocument<V>>>()
                .map_err(|_| EntityStoreError::TypeMismatch(handle.collection())),
            Entry::Vacant(entry) => {
                let map: Arc<DashMap<String, EntityDocument<V>>> = Arc::new(DashMap::new());
                entry.insert(map.clone());
                Ok(map)
            }
        }
    }
}

pub struct InMemoryCollection<V> {
    map: Arc<DashMap<String, EntityDocument<V>>>,
}

#[async_trait]
impl<V> EntityCollection<V> for InMemoryCollection<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<EntityDocument<V>>, EntityStoreError> {
        Ok(self.map.get(key).map(|v| v.clone()))
    }

    async fn insert(&self, key: &str, value: V) -> Result<EntityDocument<V>, EntityStoreError> {
        let doc = EntityDocument::new(key, value);
        self.map.insert(key.to_string(), doc.clone());
        Ok(doc)
    }

    async fn update(
        &self,
        key: &str,
        expected_rev: Revision,
        value: V,
    ) -> Result<EntityDocument<V>, EntityStoreError> {
        match self.map.get(key) {
            None => Err(EntityStoreError::NotFound(key.to_string())),
            Some(existing) if existing.rev != expected_rev => Err(EntityStoreError::StaleRevision {
                key: key.to_string(),
                expected: expected_rev,
                found: existing.rev,
            }),
            Some(existing) => {
                let doc = EntityDocument {
                    key: key.to_string(),
                    rev: existing.rev.next(),
                    value,
                };
                self.map.insert(key.to_string(), doc.clone());
                Ok(doc)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<Option<EntityDocument<V>>, EntityStoreError> {
        Ok(self.map.remove(key).map(|(_, v)| v))
    }

    async fn keys(&self) -> Result<Vec<String>, EntityStoreError> {
        Ok(self.map.iter().map(|e| e.key().clone()).collect())
    }

    async fn all(&self) -> Result<Vec<EntityDocument<V>>, EntityStoreError> {
        Ok(self.map.iter().map(|e| e.value().clone()).collect())
    }

    async fn insert_many(
        &self,
        docs: Vec<(String, V)>,
        overwrite: bool,
    ) -> Result<(), EntityStoreError> {
        for (key, value) in docs {
            if overwrite || !self.map.contains_key(&key) {
                self.map.insert(key.clone(), EntityDocument::new(key, value));
            }
        }
        Ok(())
    }

    async fn truncate(&self) -> Result<(), EntityStoreError> {
        self.map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Widget {
        value: i32,
    }

    #[tokio::test]
    async fn insert_then_update_requires_current_revision() {
        let store = EntityStore::new();
        let handle: CollectionHandle<Widget> = CollectionHandle::new(Collection::Test("widgets"));
        let collection = store.collection(&handle).unwrap();

        let inserted = collection.insert("a", Widget { value: 1 }).await.unwrap();
        assert_eq!(inserted.rev, Revision::INITIAL);

        let updated = collection
            .update("a", inserted.rev, Widget { value: 2 })
            .await
            .unwrap();
        assert_eq!(updated.rev, Revision::INITIAL.next());

        // stale revision now rejected
        let err = collection
            .update("a", inserted.rev, Widget { value: 3 })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EntityStoreError::StaleRevision {
                key: "a".to_string(),
                expected: Revision::INITIAL,
                found: Revision::INITIAL.next(),
            }
        );
    }

    #[tokio::test]
    async fn update_missing_document_reports_not_found() {
        let store = EntityStore::new();
        let handle: CollectionHandle<Widget> = CollectionHandle::new(Collection::Test("missing"));
        let collection = store.collection(&handle).unwrap();

        let err = collection
            .update("ghost", Revision::INITIAL, Widget { value: 1 })
            .await
            .unwrap_err();
        assert_eq!(err, EntityStoreError::NotFound("ghost".to_string()));

        // caller's documented fallback: insert after NotFound
        let inserted = collection.insert("ghost", Widget { value: 1 }).await.unwrap();
        assert_eq!(inserted.rev, Revision::INITIAL);
    }

    #[tokio::test]
    async fn truncate_clears_collection() {
        let store = EntityStore::new();
        let handle: CollectionHandle<Widget> = CollectionHandle::new(Collection::Test("trunc"));
        let collection = store.collection(&handle).unwrap();
        collection.insert("a", Widget { value: 1 }).await.unwrap();
        collection.insert("b", Widget { value: 2 }).await.unwrap();
        assert_eq!(collection.keys().await.unwrap().len(), 2);

        collection.truncate().await.unwrap();
        assert!(collection.all().await.unwrap().is_empty());
    }
}
