use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    descriptor::TaskDescriptor,
    id::{DescriptorId, RunningTaskId, SubscriberId},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Waiting,
    InAction,
    Completed,
    Failed,
}

/// A live execution of a [`TaskDescriptor`]. The descriptor is snapshotted at
/// creation time so later edits to the descriptor do not perturb in-flight
/// executions; the running task is looked up only by id, never via a
/// back-pointer into the descriptor store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct RunningTask {
    pub id: RunningTaskId,
    pub descriptor_id: DescriptorId,
    pub descriptor_snapshot: TaskDescriptor,
    pub current_step_index: usize,
    pub step_state: StepState,
    pub pending_acks: BTreeSet<SubscriberId>,
    pub received_data: serde_json::Map<String, Value>,
    pub step_started_at: DateTime<Utc>,
    pub task_started_at: DateTime<Utc>,
}

impl RunningTask {
    pub fn new(id: RunningTaskId, descriptor: TaskDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            descriptor_id: descriptor.id.clone(),
            descriptor_snapshot: descriptor,
            current_step_index: 0,
            step_state: StepState::Waiting,
            pending_acks: BTreeSet::new(),
            received_data: serde_json::Map::new(),
            step_started_at: now,
            task_started_at: now,
        }
    }

    pub fn current_step(&self) -> Option<&crate::descriptor::Step> {
        self.descriptor_snapshot.step(self.current_step_index)
    }

    pub fn is_terminal(&self) -> bool {
        self.step_state == StepState::Failed
            || self.current_step_index >= self.descriptor_snapshot.steps.len()
    }
}
