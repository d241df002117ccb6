use resotocore_types::{Revision, RunningTask, RunningTaskId};
use resotocore_utils::{Collection, CollectionHandle, EntityCollection, EntityStore, EntityStoreError};
use thiserror::Error;
use tracing::instrument;

const RUNNING_TASKS: CollectionHandle<RunningTask> = CollectionHandle::new(Collection::RunningTasks);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunningTaskStoreError {
    #[error("running task {0} not found")]
    NotFound(RunningTaskId),
    #[error("optimistic locking failed for running task {0}")]
    OptimisticLockingFailed(RunningTaskId),
    #[error("entity store: {0}")]
    Store(#[from] EntityStoreError),
}

/// Persisted state of currently executing task instances. Only the current
/// position (`current_step_index`, `pending_acks`, ...) survives a restart;
/// unacknowledged messages in flight do not.
#[derive(Clone)]
pub struct RunningTaskStore {
    store: EntityStore,
}

impl RunningTaskStore {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    fn collection(&self) -> Result<impl EntityCollection<RunningTask>, RunningTaskStoreError> {
        Ok(self.store.collection(&RUNNING_TASKS)?)
    }

    #[instrument(skip(self, task), fields(subsys = "RunningTaskStore"))]
    pub async fn insert(&self, task: RunningTask) -> Result<(Revision, RunningTask), RunningTaskStoreError> {
        let key = task.id.to_string();
        let doc = self.collection()?.insert(&key, task).await?;
        Ok((doc.rev, doc.value))
    }

    #[instrument(skip(self), fields(subsys = "RunningTaskStore"))]
    pub async fn get(&self, id: &RunningTaskId) -> Result<Option<(Revision, RunningTask)>, RunningTaskStoreError> {
        Ok(self
            .collection()?
            .get(&id.to_string())
            .await?
            .map(|doc| (doc.rev, doc.value)))
    }

    #[instrument(skip(self, task), fields(subsys = "RunningTaskStore"))]
    pub async fn update(
        &self,
        expected_rev: Revision,
        task: RunningTask,
    ) -> Result<(Revision, RunningTask), RunningTaskStoreError> {
        let id = task.id;
        let key = id.to_string();
        let doc = self
            .collection()?
            .update(&key, expected_rev, task)
            .await
            .map_err(|err| match err {
                EntityStoreError::StaleRevision { .. } => RunningTaskStoreError::OptimisticLockingFailed(id),
                EntityStoreError::NotFound(_) => RunningTaskStoreError::NotFound(id),
                other => other.into(),
            })?;
        Ok((doc.rev, doc.value))
    }

    #[instrument(skip(self), fields(subsys = "RunningTaskStore"))]
    pub async fn remove(&self, id: &RunningTaskId) -> Result<(), RunningTaskStoreError> {
        self.collection()?.delete(&id.to_string()).await?;
        Ok(())
    }

    /// Rehydrates every running task on startup. Resumption point is
    /// `current_step_index`; `pending_acks` is reloaded as-is.
    #[instrument(skip(self), fields(subsys = "RunningTaskStore"))]
    pub async fn all(&self) -> Result<Vec<RunningTask>, RunningTaskStoreError> {
        Ok(self.collection()?.all().await?.into_iter().map(|doc| doc.value).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use resotocore_types::{DescriptorId, DescriptorKind, OnSurpass, TaskDescriptor};

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            id: DescriptorId::new("collect_all").unwrap(),
            name: "collect_all".to_string(),
            steps: vec![],
            triggers: vec![],
            on_surpass: OnSurpass::Skip,
            kind: DescriptorKind::Workflow,
        }
    }

    #[tokio::test]
    async fn insert_then_update_tracks_step_position() {
        let store = RunningTaskStore::new(EntityStore::new());
        let id = RunningTaskId::new();
        let task = RunningTask::new(id, descriptor(), Utc::now());
        let (initial_rev, mut task) = store.insert(task).await.unwrap();

        task.current_step_index = 1;
        let (updated_rev, task) = store.update(initial_rev, task).await.unwrap();
        assert_eq!(task.current_step_index, 1);

        // re-using the now-stale initial revision is rejected
        let err = store.update(initial_rev, task.clone()).await.unwrap_err();
        assert!(matches!(err, RunningTaskStoreError::OptimisticLockingFailed(_)));

        // the current revision still works
        store.update(updated_rev, task).await.unwrap();
    }

    #[tokio::test]
    async fn remove_then_all_reflects_deletion() {
        let store = RunningTaskStore::new(EntityStore::new());
        let id = RunningTaskId::new();
        let task = RunningTask::new(id, descriptor(), Utc::now());
        store.insert(task).await.unwrap();
        assert_eq!(store.all().await.unwrap().len(), 1);

        store.remove(&id).await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }
}
