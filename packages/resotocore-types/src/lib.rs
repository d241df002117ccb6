pub mod config;
pub mod descriptor;
pub mod entity;
pub mod id;
pub mod message;
pub mod running;
pub mod subscription;
pub mod worker;

pub use config::{ConfigEntity, ConfigValidation, MergeMode};
pub use descriptor::{
    DescriptorKind, ErrorBehavior, OnSurpass, Step, StepAction, TaskDescriptor, Trigger,
    WaitCondition,
};
pub use entity::{EntityDocument, Revision};
pub use id::{ConfigId, DescriptorId, MessageType, RunningTaskId, SubscriberId, WorkerId, WorkerTaskId};
pub use message::BusMessage;
pub use running::{RunningTask, StepState};
pub use subscription::{Subscriber, Subscription};
pub use worker::{WorkerReply, WorkerTaskDescription, WorkerTaskEnvelope, WorkerTaskSpec};
