use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::id::WorkerTaskId;

/// Registration filter: a worker matches a task iff every filter key present
/// equals the task's attribute by exact value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
pub struct WorkerTaskDescription {
    pub name: String,
    pub filter: BTreeMap<String, Vec<String>>,
}

impl WorkerTaskDescription {
    pub fn matches(&self, name: &str, attrs: &BTreeMap<String, String>) -> bool {
        if self.name != name {
            return false;
        }
        self.filter.iter().all(|(key, allowed)| {
            attrs
                .get(key)
                .map(|value| allowed.iter().any(|a| a == value))
                .unwrap_or(false)
        })
    }
}

/// The caller-facing description of a unit of work to submit to the queue.
/// Distinct from the queue's internal `WorkerTask` so the `result_future`
/// (a runtime-only `oneshot` channel) never needs to be (de)serialized.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkerTaskSpec {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub payload: Value,
}

/// Wire envelope sent to an attached worker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct WorkerTaskEnvelope {
    pub id: WorkerTaskId,
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub data: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReply {
    Acknowledge { task_id: WorkerTaskId, result: Value },
    Error { task_id: WorkerTaskId, reason: String },
}
