use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{MessageType, RunningTaskId, SubscriberId};

/// Everything that can flow across the message bus. `Event` is the only
/// variant producers outside the task state machine emit directly (via
/// `emit_event`); the `Action*` family is exchanged between the state
/// machine and subscribers for one `(task_id, step_name)` round.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    Event {
        event_type: String,
        payload: Value,
    },
    Action {
        message_type: MessageType,
        task_id: RunningTaskId,
        step_name: String,
        data: Value,
    },
    ActionDone {
        message_type: MessageType,
        task_id: RunningTaskId,
        step_name: String,
        subscriber_id: SubscriberId,
        data: Value,
    },
    ActionError {
        message_type: MessageType,
        task_id: RunningTaskId,
        step_name: String,
        subscriber_id: SubscriberId,
        reason: String,
    },
    ActionInfo {
        message_type: MessageType,
        task_id: RunningTaskId,
        step_name: String,
        subscriber_id: SubscriberId,
        info: String,
    },
    ActionProgress {
        message_type: MessageType,
        task_id: RunningTaskId,
        step_name: String,
        subscriber_id: SubscriberId,
        percent: u8,
    },
}

impl BusMessage {
    /// The channel a message is delivered on, for per-channel FIFO bookkeeping.
    pub fn message_type(&self) -> Option<&MessageType> {
        match self {
            BusMessage::Event { .. } => None,
            BusMessage::Action { message_type, .. }
            | BusMessage::ActionDone { message_type, .. }
            | BusMessage::ActionError { message_type, .. }
            | BusMessage::ActionInfo { message_type, .. }
            | BusMessage::ActionProgress { message_type, .. } => Some(message_type),
        }
    }
}
