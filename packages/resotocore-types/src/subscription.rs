use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::id::{MessageType, SubscriberId};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
pub struct Subscription {
    pub message_type: MessageType,
    pub wait_for_completion: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

/// Invariant: within one subscriber, each `message_type` appears at most once.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub subscriptions: BTreeMap<MessageType, Subscription>,
}

impl Subscriber {
    pub fn new(id: SubscriberId) -> Self {
        Self {
            id,
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn subscribes_to(&self, message_type: &MessageType) -> Option<&Subscription> {
        self.subscriptions.get(message_type)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
