use resotocore_types::{DescriptorId, TaskDescriptor};
use resotocore_utils::{Collection, CollectionHandle, EntityCollection, EntityStore, EntityStoreError};
use thiserror::Error;
use tracing::instrument;

const JOBS: CollectionHandle<TaskDescriptor> = CollectionHandle::new(Collection::Jobs);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorStoreError {
    #[error("descriptor {0} not found")]
    NotFound(DescriptorId),
    #[error("optimistic locking failed for descriptor {0}")]
    OptimisticLockingFailed(DescriptorId),
    #[error("entity store: {0}")]
    Store(#[from] EntityStoreError),
}

/// Persisted definitions of workflows and jobs. Administrators mutate
/// descriptors only through this store; running instances hold their own
/// snapshot and never observe a later edit.
#[derive(Clone)]
pub struct DescriptorStore {
    store: EntityStore,
}

impl DescriptorStore {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    fn collection(&self) -> Result<impl EntityCollection<TaskDescriptor>, DescriptorStoreError> {
        Ok(self.store.collection(&JOBS)?)
    }

    #[instrument(skip(self, descriptor), fields(subsys = "DescriptorStore"))]
    pub async fn put(&self, descriptor: TaskDescriptor) -> Result<TaskDescriptor, DescriptorStoreError> {
        let collection = self.collection()?;
        let key = descriptor.id.as_ref().to_string();
        match collection.get(&key).await? {
            Some(existing) => {
                let doc = collection
                    .update(&key, existing.rev, descriptor)
                    .await
                    .map_err(|err| match err {
                        EntityStoreError::StaleRevision { .. } => {
                            DescriptorStoreError::OptimisticLockingFailed(existing.value.id.clone())
                        }
                        other => other.into(),
                    })?;
                Ok(doc.value)
            }
            None => Ok(collection.insert(&key, descriptor).await?.value),
        }
    }

    #[instrument(skip(self), fields(subsys = "DescriptorStore"))]
    pub async fn get(&self, id: &DescriptorId) -> Result<Option<TaskDescriptor>, DescriptorStoreError> {
        Ok(self.collection()?.get(id.as_ref()).await?.map(|doc| doc.value))
    }

    #[instrument(skip(self), fields(subsys = "DescriptorStore"))]
    pub async fn delete(&self, id: &DescriptorId) -> Result<(), DescriptorStoreError> {
        self.collection()?
            .delete(id.as_ref())
            .await?
            .ok_or_else(|| DescriptorStoreError::NotFound(id.clone()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(subsys = "DescriptorStore"))]
    pub async fn all(&self) -> Result<Vec<TaskDescriptor>, DescriptorStoreError> {
        Ok(self.collection()?.all().await?.into_iter().map(|doc| doc.value).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resotocore_types::{DescriptorKind, OnSurpass};

    fn descriptor(id: &str) -> TaskDescriptor {
        TaskDescriptor {
            id: DescriptorId::new(id).unwrap(),
            name: id.to_string(),
            steps: vec![],
            triggers: vec![],
            on_surpass: OnSurpass::Skip,
            kind: DescriptorKind::Workflow,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = DescriptorStore::new(EntityStore::new());
        store.put(descriptor("collect_all")).await.unwrap();
        let found = store
            .get(&DescriptorId::new("collect_all").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "collect_all");
    }

    #[tokio::test]
    async fn put_twice_updates_in_place() {
        let store = DescriptorStore::new(EntityStore::new());
        store.put(descriptor("collect_all")).await.unwrap();
        let mut updated = descriptor("collect_all");
        updated.on_surpass = OnSurpass::Replace;
        store.put(updated).await.unwrap();

        let found = store
            .get(&DescriptorId::new("collect_all").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.on_surpass, OnSurpass::Replace);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_descriptor_reports_not_found() {
        let store = DescriptorStore::new(EntityStore::new());
        let err = store
            .delete(&DescriptorId::new("ghost").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DescriptorStoreError::NotFound(_)));
    }
}
