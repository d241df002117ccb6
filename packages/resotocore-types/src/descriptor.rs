use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::id::{DescriptorId, MessageType};

/// What happens when a new instance of a descriptor would start while one
/// is already running.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OnSurpass {
    /// Drop the new trigger.
    Skip,
    /// Queue at most one deferred start; promoted once the running instance finishes.
    Wait,
    /// Terminate the running instance and start fresh.
    Replace,
    /// Allow both instances to run concurrently.
    Parallel,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBehavior {
    Continue,
    Stop,
}

/// A trigger that can start a descriptor: either an event name or a cron expression.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Event { event_name: String },
    Cron { expression: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    Event { event_name: String },
    Duration {
        #[serde(with = "duration_secs")]
        duration: Duration,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    PerformAction { message_type: MessageType },
    ExecuteCommand { command: String },
    Wait { condition: WaitCondition },
    SendMessage,
    EmitEvent,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub error_behavior: ErrorBehavior,
}

/// The Job/Workflow distinction: a Job additionally carries an optional
/// `wait` trigger that delays execution until the named event fires.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DescriptorKind {
    Workflow,
    Job { wait: Option<Trigger> },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
pub struct TaskDescriptor {
    pub id: DescriptorId,
    pub name: String,
    pub steps: Vec<Step>,
    pub triggers: Vec<Trigger>,
    pub on_surpass: OnSurpass,
    pub kind: DescriptorKind,
}

impl TaskDescriptor {
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, DescriptorKind::Job { .. })
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
