use resotocore_types::{MessageType, Subscriber, SubscriberId, Subscription};
use resotocore_utils::{Collection, CollectionHandle, EntityCollection, EntityStore, EntityStoreError};
use thiserror::Error;
use tracing::instrument;

const SUBSCRIBERS: CollectionHandle<Subscriber> = CollectionHandle::new(Collection::Subscribers);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRegistryError {
    #[error("optimistic locking failed for subscriber {0}")]
    OptimisticLockingFailed(SubscriberId),
    #[error("subscriber {0} not found")]
    NotFound(SubscriberId),
    #[error("subscriber {0} already has a subscription for message type {1}")]
    DuplicateMessageType(SubscriberId, MessageType),
    #[error("entity store: {0}")]
    Store(#[from] EntityStoreError),
}

/// CRUD over subscribers, persisted through the entity store with
/// optimistic concurrency on each subscriber's revision.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    store: EntityStore,
}

impl SubscriptionRegistry {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    fn collection(
        &self,
    ) -> Result<impl EntityCollection<Subscriber>, SubscriptionRegistryError> {
        Ok(self.store.collection(&SUBSCRIBERS)?)
    }

    #[instrument(skip(self), fields(subsys = "SubscriptionRegistry"))]
    pub async fn register(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<Subscriber, SubscriptionRegistryError> {
        let collection = self.collection()?;
        if let Some(existing) = collection.get(subscriber_id.as_ref()).await? {
            return Ok(existing.value);
        }
        let subscriber = Subscriber::new(subscriber_id.clone());
        let doc = collection.insert(subscriber_id.as_ref(), subscriber).await?;
        Ok(doc.value)
    }

    #[instrument(skip(self), fields(subsys = "SubscriptionRegistry"))]
    pub async fn deregister(&self, subscriber_id: &SubscriberId) -> Result<(), SubscriptionRegistryError> {
        self.collection()?.delete(subscriber_id.as_ref()).await?;
        Ok(())
    }

    #[instrument(skip(self, subscription), fields(subsys = "SubscriptionRegistry"))]
    pub async fn add_subscription(
        &self,
        subscriber_id: &SubscriberId,
        subscription: Subscription,
    ) -> Result<Subscriber, SubscriptionRegistryError> {
        let collection = self.collection()?;
        let existing = collection
            .get(subscriber_id.as_ref())
            .await?
            .ok_or_else(|| SubscriptionRegistryError::NotFound(subscriber_id.clone()))?;

        if existing.value.subscriptions.contains_key(&subscription.message_type) {
            return Err(SubscriptionRegistryError::DuplicateMessageType(
                subscriber_id.clone(),
                subscription.message_type.clone(),
            ));
        }

        let mut subscriber = existing.value.clone();
        subscriber
            .subscriptions
            .insert(subscription.message_type.clone(), subscription);

        self.write_back(subscriber_id, existing.rev, subscriber).await
    }

    #[instrument(skip(self), fields(subsys = "SubscriptionRegistry"))]
    pub async fn remove_subscription(
        &self,
        subscriber_id: &SubscriberId,
        message_type: &MessageType,
    ) -> Result<Subscriber, SubscriptionRegistryError> {
        let collection = self.collection()?;
        let existing = collection
            .get(subscriber_id.as_ref())
            .await?
            .ok_or_else(|| SubscriptionRegistryError::NotFound(subscriber_id.clone()))?;

        let mut subscriber = existing.value.clone();
        subscriber.subscriptions.remove(message_type);

        self.write_back(subscriber_id, existing.rev, subscriber).await
    }

    async fn write_back(
        &self,
        subscriber_id: &SubscriberId,
        expected_rev: resotocore_types::Revision,
        subscriber: Subscriber,
    ) -> Result<Subscriber, SubscriptionRegistryError> {
        match self
            .collection()?
            .update(subscriber_id.as_ref(), expected_rev, subscriber)
            .await
        {
            Ok(doc) => Ok(doc.value),
            Err(EntityStoreError::StaleRevision { .. }) => Err(
                SubscriptionRegistryError::OptimisticLockingFailed(subscriber_id.clone()),
            ),
            Err(EntityStoreError::NotFound(_)) => {
                Err(SubscriptionRegistryError::NotFound(subscriber_id.clone()))
            }
            Err(other) => Err(other.into()),
        }
    }

    #[instrument(skip(self), fields(subsys = "SubscriptionRegistry"))]
    pub async fn all(&self) -> Result<Vec<Subscriber>, SubscriptionRegistryError> {
        Ok(self.collection()?.all().await?.into_iter().map(|doc| doc.value).collect())
    }

    /// Ordered, deterministic fan-out list: two observers of the registry
    /// compute identical results for the same message type.
    #[instrument(skip(self), fields(subsys = "SubscriptionRegistry"))]
    pub async fn subscribers_for(
        &self,
        message_type: &MessageType,
    ) -> Result<Vec<SubscriberId>, SubscriptionRegistryError> {
        let mut ids: Vec<SubscriberId> = self
            .collection()?
            .all()
            .await?
            .into_iter()
            .filter(|doc| doc.value.subscriptions.contains_key(message_type))
            .map(|doc| doc.value.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resotocore_types::Subscription;
    use std::time::Duration;

    fn sub(message_type: &str) -> Subscription {
        Subscription {
            message_type: MessageType::new(message_type).unwrap(),
            wait_for_completion: true,
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn subscribers_for_is_lexicographically_ordered() {
        let registry = SubscriptionRegistry::new(EntityStore::new());
        let ids = ["zeta", "alpha", "mid"];
        for id in ids {
            let id = SubscriberId::new(id).unwrap();
            registry.register(id.clone()).await.unwrap();
            registry.add_subscription(&id, sub("collect")).await.unwrap();
        }

        let fanout = registry
            .subscribers_for(&MessageType::new("collect").unwrap())
            .await
            .unwrap();
        assert_eq!(
            fanout,
            vec![
                SubscriberId::new("alpha").unwrap(),
                SubscriberId::new("mid").unwrap(),
                SubscriberId::new("zeta").unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_message_type_rejected() {
        let registry = SubscriptionRegistry::new(EntityStore::new());
        let id = SubscriberId::new("sub_1").unwrap();
        registry.register(id.clone()).await.unwrap();
        registry.add_subscription(&id, sub("collect")).await.unwrap();

        let err = registry.add_subscription(&id, sub("collect")).await.unwrap_err();
        assert!(matches!(err, SubscriptionRegistryError::DuplicateMessageType(_, _)));
    }

    #[tokio::test]
    async fn unregistered_subscriber_cannot_subscribe() {
        let registry = SubscriptionRegistry::new(EntityStore::new());
        let id = SubscriberId::new("ghost").unwrap();
        let err = registry.add_subscription(&id, sub("collect")).await.unwrap_err();
        assert!(matches!(err, SubscriptionRegistryError::NotFound(_)));
    }
}
