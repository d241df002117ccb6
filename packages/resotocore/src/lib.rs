pub mod bus;
pub mod config_handler;
pub mod core_config;
pub mod descriptors;
pub mod http;
pub mod running_store;
pub mod scheduler;
pub mod state_machine;
pub mod subscriptions;
pub mod worker_queue;

pub use bus::{BusSubscription, MessageBus};
pub use config_handler::{
    BoolKind, ConfigError, ConfigHandler, ConfigKind, DurationKind, StructListKind, VALIDATE_CONFIG_TASK,
};
pub use core_config::{CoreConfigHandler, ExitFn, LogAndEscalate, RestartService};
pub use descriptors::{DescriptorStore, DescriptorStoreError};
pub use running_store::{RunningTaskStore, RunningTaskStoreError};
pub use scheduler::{parse_job_line, TaskHandler, TaskHandlerError};
pub use state_machine::{
    CommandExecutor, CommandOutcome, ProcessCommandExecutor, StateMachineError, TaskStateMachine,
};
pub use subscriptions::{SubscriptionRegistry, SubscriptionRegistryError};
pub use worker_queue::{WorkerHandle, WorkerQueueError, WorkerResult, WorkerTaskQueue, WorkerFailure, MAX_RETRIES};
