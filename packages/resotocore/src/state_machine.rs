use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use resotocore_types::{
    BusMessage, ErrorBehavior, MessageType, RunningTask, RunningTaskId, StepAction, StepState,
    SubscriberId, WaitCondition,
};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::bus::MessageBus;
use crate::running_store::{RunningTaskStore, RunningTaskStoreError};
use crate::subscriptions::{SubscriptionRegistry, SubscriptionRegistryError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("running task {0} not found")]
    NotFound(RunningTaskId),
    #[error("running task store: {0}")]
    Store(#[from] RunningTaskStoreError),
    #[error("subscription registry: {0}")]
    Subscriptions(#[from] SubscriptionRegistryError),
}

/// Outcome of running a command for an `ExecuteCommand` step.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Success,
    Failure(String),
}

/// The seam the `ExecuteCommand` step action runs through. Out of scope:
/// the real CLI command catalogue; only the execute-command hook is modeled.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> CommandOutcome;
}

/// Runs commands as OS subprocesses via a shell.
#[derive(Default)]
pub struct ProcessCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, command: &str) -> CommandOutcome {
        match tokio::process::Command::new("sh").arg("-c").arg(command).status().await {
            Ok(status) if status.success() => CommandOutcome::Success,
            Ok(status) => CommandOutcome::Failure(format!("exit status {status}")),
            Err(err) => CommandOutcome::Failure(err.to_string()),
        }
    }
}

/// Per-instance step execution: entering a step, consuming acknowledgements,
/// and terminal handling. Holds references to the bus and subscription
/// registry it fans actions out through, and the store it persists position
/// to; the only mutable per-instance state lives in the `RunningTaskStore`.
#[derive(Clone)]
pub struct TaskStateMachine {
    bus: MessageBus,
    subscriptions: SubscriptionRegistry,
    running: RunningTaskStore,
    command_executor: Arc<dyn CommandExecutor>,
    /// Outcomes of in-flight `ExecuteCommand` steps, reported by the
    /// spawned task that actually runs the command.
    command_outcomes: Arc<DashMap<RunningTaskId, CommandOutcome>>,
}

impl TaskStateMachine {
    pub fn new(
        bus: MessageBus,
        subscriptions: SubscriptionRegistry,
        running: RunningTaskStore,
        command_executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            bus,
            subscriptions,
            running,
            command_executor,
            command_outcomes: Arc::new(DashMap::new()),
        }
    }

    /// Creates the instance, persists it, and drives it into its first step.
    #[instrument(skip(self, descriptor_snapshot), fields(subsys = "TaskStateMachine"))]
    pub async fn start(
        &self,
        descriptor_snapshot: resotocore_types::TaskDescriptor,
    ) -> Result<RunningTaskId, StateMachineError> {
        let id = RunningTaskId::new();
        let task = RunningTask::new(id, descriptor_snapshot, Utc::now());
        let (rev, task) = self.running.insert(task).await?;
        self.bus.emit_event(
            "scheduler",
            "task_started",
            serde_json::json!({"task_id": id.to_string(), "descriptor_id": task.descriptor_id.as_ref()}),
        );
        self.enter_step(rev, task).await?;
        Ok(id)
    }

    /// Enter the current step of `task`, fanning out a `PerformAction`
    /// immediately or deferring for `ExecuteCommand`/`Wait`.
    #[instrument(skip(self, task), fields(subsys = "TaskStateMachine", task_id = %task.id))]
    async fn enter_step(
        &self,
        rev: resotocore_types::Revision,
        mut task: RunningTask,
    ) -> Result<(), StateMachineError> {
        let Some(step) = task.current_step().cloned() else {
            return self.finalize(rev, task, true).await;
        };

        task.step_started_at = Utc::now();
        task.step_state = StepState::InAction;

        match step.action {
            StepAction::PerformAction { message_type } => {
                let pending = self.subscribers_for(&message_type).await?;
                if pending.is_empty() {
                    return self.advance(rev, task).await;
                }
                task.pending_acks = pending.into_iter().collect();
                let (rev, task) = self.running.update(rev, task).await?;
                self.bus.fan_out(
                    task.pending_acks.iter().map(|s| s.as_ref()),
                    BusMessage::Action {
                        message_type,
                        task_id: task.id,
                        step_name: step.name.clone(),
                        data: serde_json::Value::Object(task.received_data.clone()),
                    },
                );
                let _ = rev;
                Ok(())
            }
            StepAction::ExecuteCommand { command } => {
                let (rev, task) = self.running.update(rev, task).await?;
                self.spawn_command(task.id, command);
                let _ = rev;
                Ok(())
            }
            StepAction::Wait { condition } => {
                task.step_state = StepState::Waiting;
                let (_, _) = self.running.update(rev, task).await?;
                // `WaitCondition::Duration` resolves purely from elapsed time
                // and is promoted by the scheduler's overdue sweep;
                // `WaitCondition::Event` resolves when a matching event
                // arrives, also observed by the scheduler.
                let _ = condition;
                Ok(())
            }
            StepAction::SendMessage | StepAction::EmitEvent => {
                self.bus.emit_event(
                    "scheduler",
                    step.name.clone(),
                    serde_json::Value::Object(task.received_data.clone()),
                );
                self.advance(rev, task).await
            }
        }
    }

    fn spawn_command(&self, task_id: RunningTaskId, command: String) {
        let executor = self.command_executor.clone();
        let outcomes = self.command_outcomes.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(&command).await;
            if let CommandOutcome::Failure(ref reason) = outcome {
                warn!("Command {command} failed: {reason}");
            }
            outcomes.insert(task_id, outcome);
        });
    }

    async fn subscribers_for(&self, message_type: &MessageType) -> Result<Vec<SubscriberId>, StateMachineError> {
        Ok(self.subscriptions.subscribers_for(message_type).await?)
    }

    /// Advances past the current step. Invoked once a step's acknowledgements
    /// are fully collected (or the step needed none).
    async fn advance(&self, rev: resotocore_types::Revision, mut task: RunningTask) -> Result<(), StateMachineError> {
        task.current_step_index += 1;
        task.pending_acks.clear();
        task.step_state = StepState::Waiting;
        let (rev, task) = self.running.update(rev, task).await?;
        self.enter_step(rev, task).await
    }

    #[instrument(skip(self), fields(subsys = "TaskStateMachine"))]
    pub async fn receive_action_done(
        &self,
        task_id: RunningTaskId,
        step_name: &str,
        subscriber_id: SubscriberId,
        data: serde_json::Value,
    ) -> Result<(), StateMachineError> {
        let Some((rev, mut task)) = self.running.get(&task_id).await? else {
            return Ok(());
        };
        if !self.matches_current_step(&task, step_name) {
            return Ok(());
        }
        task.pending_acks.remove(&subscriber_id);
        if let serde_json::Value::Object(map) = data {
            task.received_data.extend(map);
        }
        if task.pending_acks.is_empty() {
            self.advance(rev, task).await
        } else {
            self.running.update(rev, task).await?;
            Ok(())
        }
    }

    #[instrument(skip(self), fields(subsys = "TaskStateMachine"))]
    pub async fn receive_action_error(
        &self,
        task_id: RunningTaskId,
        step_name: &str,
        subscriber_id: SubscriberId,
        reason: String,
    ) -> Result<(), StateMachineError> {
        let Some((rev, mut task)) = self.running.get(&task_id).await? else {
            return Ok(());
        };
        if !self.matches_current_step(&task, step_name) {
            return Ok(());
        }
        let error_behavior = task
            .current_step()
            .map(|s| s.error_behavior)
            .unwrap_or(ErrorBehavior::Continue);

        match error_behavior {
            ErrorBehavior::Stop => {
                warn!("step {step_name} of task {task_id} failed: {reason}");
                task.step_state = StepState::Failed;
                self.finalize(rev, task, false).await
            }
            ErrorBehavior::Continue => {
                task.pending_acks.remove(&subscriber_id);
                if task.pending_acks.is_empty() {
                    self.advance(rev, task).await
                } else {
                    self.running.update(rev, task).await?;
                    Ok(())
                }
            }
        }
    }

    /// Decided open question: a subscriber evicted mid-step is treated as
    /// `ActionError("subscriber_gone")` for every step where it is pending.
    #[instrument(skip(self), fields(subsys = "TaskStateMachine"))]
    pub async fn subscriber_evicted(&self, subscriber_id: &SubscriberId) -> Result<(), StateMachineError> {
        for task in self.running.all().await? {
            if task.pending_acks.contains(subscriber_id) {
                if let Some(step) = task.current_step() {
                    let step_name = step.name.clone();
                    self.receive_action_error(
                        task.id,
                        &step_name,
                        subscriber_id.clone(),
                        "subscriber_gone".to_string(),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Called by the scheduler's periodic sweep. Expires step deadlines
    /// (idempotent: a step already advanced past its deadline is a no-op)
    /// and resolves any `ExecuteCommand` step whose command has finished.
    #[instrument(skip(self), fields(subsys = "TaskStateMachine"))]
    pub async fn tick(&self, now: chrono::DateTime<Utc>) -> Result<(), StateMachineError> {
        for task in self.running.all().await? {
            if task.step_state != StepState::InAction && task.step_state != StepState::Waiting {
                continue;
            }
            let Some(step) = task.current_step().cloned() else {
                continue;
            };

            if let Some(outcome) = self.command_outcomes.remove(&task.id).map(|(_, v)| v) {
                self.resolve_command(task.id, step.error_behavior, outcome).await?;
                continue;
            }

            let elapsed = now.signed_duration_since(task.step_started_at);
            let deadline_hit = elapsed
                .to_std()
                .map(|d| d > step.timeout)
                .unwrap_or(false);

            match &step.action {
                StepAction::Wait {
                    condition: WaitCondition::Duration { duration },
                } => {
                    if elapsed.to_std().map(|d| d >= *duration).unwrap_or(false) {
                        if let Some((rev, task)) = self.running.get(&task.id).await? {
                            self.advance(rev, task).await?;
                        }
                    }
                }
                _ if deadline_hit && task.step_state == StepState::InAction => {
                    let pending: Vec<SubscriberId> = task.pending_acks.iter().cloned().collect();
                    for subscriber_id in pending {
                        self.receive_action_error(
                            task.id,
                            &step.name,
                            subscriber_id,
                            "timeout".to_string(),
                        )
                        .await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn resolve_command(
        &self,
        task_id: RunningTaskId,
        error_behavior: ErrorBehavior,
        outcome: CommandOutcome,
    ) -> Result<(), StateMachineError> {
        let Some((rev, task)) = self.running.get(&task_id).await? else {
            return Ok(());
        };
        match outcome {
            CommandOutcome::Success => self.advance(rev, task).await,
            CommandOutcome::Failure(_) if matches!(error_behavior, ErrorBehavior::Continue) => {
                self.advance(rev, task).await
            }
            CommandOutcome::Failure(_) => {
                let mut task = task;
                task.step_state = StepState::Failed;
                self.finalize(rev, task, false).await
            }
        }
    }

    fn matches_current_step(&self, task: &RunningTask, step_name: &str) -> bool {
        task.step_state == StepState::InAction
            && task.current_step().map(|s| s.name.as_str()) == Some(step_name)
    }

    async fn finalize(
        &self,
        _rev: resotocore_types::Revision,
        task: RunningTask,
        success: bool,
    ) -> Result<(), StateMachineError> {
        self.bus.emit_event(
            "scheduler",
            "task_end",
            serde_json::json!({
                "task_id": task.id.to_string(),
                "descriptor_id": task.descriptor_id.as_ref(),
                "success": success,
            }),
        );
        self.running.remove(&task.id).await?;
        Ok(())
    }

    /// Terminates a running instance outright, used by `on_surpass=Replace`
    /// to make room for a fresh instance of the same descriptor.
    #[instrument(skip(self), fields(subsys = "TaskStateMachine"))]
    pub async fn cancel(&self, task_id: RunningTaskId) -> Result<(), StateMachineError> {
        let Some((rev, mut task)) = self.running.get(&task_id).await? else {
            return Ok(());
        };
        task.step_state = StepState::Failed;
        self.finalize(rev, task, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resotocore_types::{
        DescriptorId, DescriptorKind, ErrorBehavior, MessageType, OnSurpass, Step, StepAction, Subscription,
        TaskDescriptor,
    };
    use resotocore_utils::EntityStore;
    use std::time::Duration;

    fn machine() -> (TaskStateMachine, MessageBus, SubscriptionRegistry) {
        let bus = MessageBus::new();
        let subscriptions = SubscriptionRegistry::new(EntityStore::new());
        let running = RunningTaskStore::new(EntityStore::new());
        let machine = TaskStateMachine::new(
            bus.clone(),
            subscriptions.clone(),
            running,
            Arc::new(ProcessCommandExecutor),
        );
        (machine, bus, subscriptions)
    }

    fn single_action_step(message_type: &str) -> TaskDescriptor {
        TaskDescriptor {
            id: DescriptorId::new("collect_all").unwrap(),
            name: "collect_all".to_string(),
            steps: vec![Step {
                name: "collect".to_string(),
                action: StepAction::PerformAction {
                    message_type: MessageType::new(message_type).unwrap(),
                },
                timeout: Duration::from_secs(30),
                error_behavior: ErrorBehavior::Stop,
            }],
            triggers: vec![],
            on_surpass: OnSurpass::Skip,
            kind: DescriptorKind::Workflow,
        }
    }

    #[tokio::test]
    async fn step_with_zero_subscribers_advances_immediately() {
        let (machine, mut bus, _subs) = machine();
        let mut listener = bus.subscribe("scheduler", vec![]);
        let id = machine.start(single_action_step("collect")).await.unwrap();

        let started = listener.recv().await.unwrap();
        assert!(matches!(started, BusMessage::Event { event_type, .. } if event_type == "task_started"));
        let ended = listener.recv().await.unwrap();
        assert!(matches!(ended, BusMessage::Event { event_type, .. } if event_type == "task_end"));

        assert!(machine.running.get(&id).await.unwrap().is_none());
        let _ = bus;
    }

    #[tokio::test]
    async fn single_subscriber_ack_completes_the_instance() {
        let (machine, _bus, subs) = machine();
        let subscriber_id = resotocore_types::SubscriberId::new("sub_1").unwrap();
        subs.register(subscriber_id.clone()).await.unwrap();
        subs.add_subscription(
            &subscriber_id,
            Subscription {
                message_type: MessageType::new("collect").unwrap(),
                wait_for_completion: true,
                timeout: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();

        let id = machine.start(single_action_step("collect")).await.unwrap();
        let (_, task) = machine.running.get(&id).await.unwrap().unwrap();
        assert_eq!(task.pending_acks.len(), 1);

        machine
            .receive_action_done(id, "collect", subscriber_id, serde_json::json!({}))
            .await
            .unwrap();

        assert!(machine.running.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn late_subscriber_is_excluded_from_the_already_dispatched_round() {
        let (machine, _bus, subs) = machine();
        let sub_1 = resotocore_types::SubscriberId::new("sub_1").unwrap();
        let sub_2 = resotocore_types::SubscriberId::new("sub_2").unwrap();
        for s in [&sub_1, &sub_2] {
            subs.register(s.clone()).await.unwrap();
            subs.add_subscription(
                s,
                Subscription {
                    message_type: MessageType::new("collect").unwrap(),
                    wait_for_completion: true,
                    timeout: Duration::from_secs(30),
                },
            )
            .await
            .unwrap();
        }

        let id = machine.start(single_action_step("collect")).await.unwrap();

        // a third subscriber registers only after the round was dispatched
        let sub_3 = resotocore_types::SubscriberId::new("sub_3").unwrap();
        subs.register(sub_3.clone()).await.unwrap();
        subs.add_subscription(
            &sub_3,
            Subscription {
                message_type: MessageType::new("collect").unwrap(),
                wait_for_completion: true,
                timeout: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();

        machine
            .receive_action_done(id, "collect", sub_1, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(machine.running.get(&id).await.unwrap().is_some());

        machine
            .receive_action_done(id, "collect", sub_2, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(machine.running.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_error_behavior_fails_the_instance_on_first_error() {
        let (machine, _bus, subs) = machine();
        let subscriber_id = resotocore_types::SubscriberId::new("sub_1").unwrap();
        subs.register(subscriber_id.clone()).await.unwrap();
        subs.add_subscription(
            &subscriber_id,
            Subscription {
                message_type: MessageType::new("collect").unwrap(),
                wait_for_completion: true,
                timeout: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();

        let id = machine.start(single_action_step("collect")).await.unwrap();
        machine
            .receive_action_error(id, "collect", subscriber_id, "boom".to_string())
            .await
            .unwrap();

        assert!(machine.running.get(&id).await.unwrap().is_none());
    }
}
