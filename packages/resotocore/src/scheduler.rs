use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use resotocore_types::{
    DescriptorId, DescriptorKind, ErrorBehavior, OnSurpass, Step, StepAction, TaskDescriptor, Trigger,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::bus::MessageBus;
use crate::descriptors::{DescriptorStore, DescriptorStoreError};
use crate::running_store::{RunningTaskStore, RunningTaskStoreError};
use crate::state_machine::{StateMachineError, TaskStateMachine};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskHandlerError {
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("descriptor store: {0}")]
    Descriptor(#[from] DescriptorStoreError),
    #[error("running task store: {0}")]
    Running(#[from] RunningTaskStoreError),
    #[error("state machine: {0}")]
    StateMachine(#[from] StateMachineError),
    #[error("subscription registry: {0}")]
    Subscriptions(#[from] crate::subscriptions::SubscriptionRegistryError),
}

/// Default timeout for the single step `parse_job_line` produces, absent an
/// explicit timeout in the compact job syntax.
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// Splits the compact job syntax `"[cron] [event] : command"` apart and
/// validates the cron expression eagerly so malformed input never reaches
/// the scheduler. Exactly one of cron/event may be absent; both absent is
/// a `ParseError`, matching the source grammar's single mandatory trigger.
#[instrument(skip(line), fields(subsys = "TaskHandler"))]
pub fn parse_job_line(name: &str, line: &str) -> Result<TaskDescriptor, TaskHandlerError> {
    let (trigger_part, command) = line
        .split_once(':')
        .ok_or_else(|| TaskHandlerError::ParseError(format!("job line {line:?} is missing ':'")))?;
    let command = command.trim();
    if command.is_empty() {
        return Err(TaskHandlerError::ParseError("job command is empty".to_string()));
    }

    let tokens: Vec<&str> = trigger_part.split_whitespace().collect();
    let (trigger, wait) = match tokens.len() {
        1 => (Trigger::Event { event_name: tokens[0].to_string() }, None),
        5 => {
            let expr = tokens.join(" ");
            parse_cron_expression(&expr)?;
            (Trigger::Cron { expression: expr }, None)
        }
        6 => {
            let expr = tokens[..5].join(" ");
            parse_cron_expression(&expr)?;
            (Trigger::Cron { expression: expr }, Some(Trigger::Event { event_name: tokens[5].to_string() }))
        }
        _ => {
            return Err(TaskHandlerError::ParseError(format!(
                "job line {line:?} has an unrecognised trigger clause {trigger_part:?}"
            )))
        }
    };

    Ok(TaskDescriptor {
        id: DescriptorId::new(name).map_err(|err| TaskHandlerError::ParseError(err.to_string()))?,
        name: name.to_string(),
        steps: vec![Step {
            name: "execute".to_string(),
            action: StepAction::ExecuteCommand { command: command.to_string() },
            timeout: DEFAULT_JOB_TIMEOUT,
            error_behavior: ErrorBehavior::Continue,
        }],
        triggers: vec![trigger],
        on_surpass: OnSurpass::Skip,
        kind: DescriptorKind::Job { wait },
    })
}

/// `cron` parses a 6-field (seconds-first) expression; job lines use the
/// conventional 5-field crontab form, so a literal `0` seconds field is
/// prepended before delegating.
fn parse_cron_expression(expression: &str) -> Result<Schedule, TaskHandlerError> {
    let six_field = format!("0 {expression}");
    Schedule::from_str(&six_field)
        .map_err(|err| TaskHandlerError::ParseError(format!("invalid cron expression {expression:?}: {err}")))
}

/// Trigger evaluation, `on_surpass` arbitration, and the overdue sweep.
/// Descriptors are re-read from the [`DescriptorStore`] on every
/// evaluation rather than cached in a side index, so a concurrent edit is
/// picked up on the descriptor's very next trigger.
#[derive(Clone)]
pub struct TaskHandler {
    bus: MessageBus,
    descriptors: DescriptorStore,
    running: RunningTaskStore,
    machine: TaskStateMachine,
    subscriptions: crate::subscriptions::SubscriptionRegistry,
    /// At most one deferred successor per descriptor (`on_surpass=Wait`):
    /// queues one, not N.
    deferred: DashMap<DescriptorId, TaskDescriptor>,
    /// Jobs triggered but still waiting on their `wait` event to fire.
    pending_job_waits: DashMap<DescriptorId, TaskDescriptor>,
    last_cron_check: Mutex<HashMap<DescriptorId, DateTime<Utc>>>,
}

impl TaskHandler {
    pub fn new(
        bus: MessageBus,
        descriptors: DescriptorStore,
        running: RunningTaskStore,
        machine: TaskStateMachine,
        subscriptions: crate::subscriptions::SubscriptionRegistry,
    ) -> Self {
        Self {
            bus,
            descriptors,
            running,
            machine,
            subscriptions,
            deferred: DashMap::new(),
            pending_job_waits: DashMap::new(),
            last_cron_check: Mutex::new(HashMap::new()),
        }
    }

    /// Rehydrates running-task position on startup. The running task store
    /// already persists everything needed to resume; this just surfaces the
    /// count for observability.
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn recover(&self) -> Result<usize, TaskHandlerError> {
        let running = self.running.all().await?;
        if !running.is_empty() {
            info!("recovered {} running task instance(s)", running.len());
        }
        Ok(running.len())
    }

    /// Matches descriptors whose `EventTrigger` name equals `event_name`, and
    /// promotes any job that was only waiting on this event. A trigger
    /// firing with zero matching descriptors is a no-op.
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn handle_event(&self, event_name: &str) -> Result<(), TaskHandlerError> {
        let waiting: Vec<TaskDescriptor> = self
            .pending_job_waits
            .iter()
            .filter(|entry| matches!(&entry.value().kind, DescriptorKind::Job { wait: Some(Trigger::Event { event_name: n }) } if n == event_name))
            .map(|entry| entry.value().clone())
            .collect();
        for descriptor in waiting {
            self.pending_job_waits.remove(&descriptor.id);
            self.start_with_surpass(descriptor).await?;
        }

        for descriptor in self.descriptors.all().await? {
            let matches = descriptor
                .triggers
                .iter()
                .any(|t| matches!(t, Trigger::Event { event_name: n } if n == event_name));
            if matches {
                self.fire(descriptor).await?;
            }
        }
        Ok(())
    }

    /// Evaluates every `TimeTrigger` against `now`, firing once per elapsed
    /// schedule occurrence since the descriptor's last check.
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn check_time_triggers(&self, now: DateTime<Utc>) -> Result<(), TaskHandlerError> {
        for descriptor in self.descriptors.all().await? {
            for trigger in &descriptor.triggers {
                let Trigger::Cron { expression } = trigger else { continue };
                let Ok(schedule) = parse_cron_expression(expression) else { continue };
                let last = {
                    let mut guard = self.last_cron_check.lock().unwrap();
                    *guard.entry(descriptor.id.clone()).or_insert(now)
                };
                if let Some(next) = schedule.after(&last).take(1).next() {
                    if next <= now {
                        self.last_cron_check.lock().unwrap().insert(descriptor.id.clone(), now);
                        self.fire(descriptor.clone()).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// A trigger fired for `descriptor`: either defer to its `wait` event
    /// (Job only) or arbitrate `on_surpass` against the currently running
    /// instances.
    async fn fire(&self, descriptor: TaskDescriptor) -> Result<(), TaskHandlerError> {
        if let DescriptorKind::Job { wait: Some(_) } = &descriptor.kind {
            self.pending_job_waits.insert(descriptor.id.clone(), descriptor);
            return Ok(());
        }
        self.start_with_surpass(descriptor).await
    }

    async fn start_with_surpass(&self, descriptor: TaskDescriptor) -> Result<(), TaskHandlerError> {
        let already_running = self.count_running(&descriptor.id).await?;
        if already_running == 0 {
            self.machine.start(descriptor).await?;
            return Ok(());
        }

        match descriptor.on_surpass {
            OnSurpass::Skip => Ok(()),
            OnSurpass::Wait => {
                self.deferred.insert(descriptor.id.clone(), descriptor);
                Ok(())
            }
            OnSurpass::Replace => {
                for task in self.running.all().await? {
                    if task.descriptor_id == descriptor.id {
                        self.machine.cancel(task.id).await?;
                    }
                }
                self.machine.start(descriptor).await?;
                Ok(())
            }
            OnSurpass::Parallel => {
                self.machine.start(descriptor).await?;
                Ok(())
            }
        }
    }

    async fn count_running(&self, descriptor_id: &DescriptorId) -> Result<usize, TaskHandlerError> {
        Ok(self
            .running
            .all()
            .await?
            .into_iter()
            .filter(|t| &t.descriptor_id == descriptor_id)
            .count())
    }

    /// Forwards a subscriber's `ActionDone` reply to the state machine.
    /// Subscribers report completion through the handler rather than the
    /// state machine directly, matching the control-flow description in
    /// the system overview.
    #[instrument(skip(self, data), fields(subsys = "TaskHandler"))]
    pub async fn report_action_done(
        &self,
        task_id: resotocore_types::RunningTaskId,
        step_name: &str,
        subscriber_id: resotocore_types::SubscriberId,
        data: serde_json::Value,
    ) -> Result<(), TaskHandlerError> {
        Ok(self.machine.receive_action_done(task_id, step_name, subscriber_id, data).await?)
    }

    /// Forwards a subscriber's `ActionError` reply to the state machine.
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn report_action_error(
        &self,
        task_id: resotocore_types::RunningTaskId,
        step_name: &str,
        subscriber_id: resotocore_types::SubscriberId,
        reason: String,
    ) -> Result<(), TaskHandlerError> {
        Ok(self.machine.receive_action_error(task_id, step_name, subscriber_id, reason).await?)
    }

    /// Registers a subscriber; idempotent if already registered.
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn register_subscriber(
        &self,
        subscriber_id: resotocore_types::SubscriberId,
    ) -> Result<resotocore_types::Subscriber, TaskHandlerError> {
        Ok(self.subscriptions.register(subscriber_id).await?)
    }

    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn add_subscription(
        &self,
        subscriber_id: &resotocore_types::SubscriberId,
        subscription: resotocore_types::Subscription,
    ) -> Result<resotocore_types::Subscriber, TaskHandlerError> {
        Ok(self.subscriptions.add_subscription(subscriber_id, subscription).await?)
    }

    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn remove_subscription(
        &self,
        subscriber_id: &resotocore_types::SubscriberId,
        message_type: &resotocore_types::MessageType,
    ) -> Result<resotocore_types::Subscriber, TaskHandlerError> {
        Ok(self.subscriptions.remove_subscription(subscriber_id, message_type).await?)
    }

    pub async fn list_subscribers(&self) -> Result<Vec<resotocore_types::Subscriber>, TaskHandlerError> {
        Ok(self.subscriptions.all().await?)
    }

    /// Deregisters a subscriber and treats it as evicted mid-step for any
    /// instance currently waiting on its acknowledgement (decided open
    /// question: `ActionError("subscriber_gone")` for each such step).
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn evict_subscriber(
        &self,
        subscriber_id: &resotocore_types::SubscriberId,
    ) -> Result<(), TaskHandlerError> {
        self.machine.subscriber_evicted(subscriber_id).await?;
        self.subscriptions.deregister(subscriber_id).await?;
        Ok(())
    }

    /// Periodic sweep: expires step deadlines, garbage-collects any
    /// instance left terminal by a crash between marking failed and
    /// removal, and promotes at most one deferred `on_surpass=Wait`
    /// successor per descriptor once its predecessor has finished.
    #[instrument(skip(self), fields(subsys = "TaskHandler"))]
    pub async fn check_overdue_tasks(&self, now: DateTime<Utc>) -> Result<(), TaskHandlerError> {
        self.machine.tick(now).await?;

        for task in self.running.all().await? {
            if task.is_terminal() {
                warn!("garbage-collecting stale terminal running task {}", task.id);
                self.running.remove(&task.id).await?;
                self.bus.emit_event(
                    "scheduler",
                    "task_end",
                    serde_json::json!({"task_id": task.id.to_string(), "descriptor_id": task.descriptor_id.as_ref()}),
                );
            }
        }

        let to_promote: Vec<TaskDescriptor> = self
            .deferred
            .iter()
            .filter(|entry| entry.value().id == *entry.key())
            .map(|entry| entry.value().clone())
            .collect();
        for descriptor in to_promote {
            if self.count_running(&descriptor.id).await? == 0 {
                self.deferred.remove(&descriptor.id);
                self.machine.start(descriptor).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_and_command_only() {
        let job = parse_job_line("test", "0 5 * * sat : match t2 == \"node\" | clean").unwrap();
        assert_eq!(job.triggers, vec![Trigger::Cron { expression: "0 5 * * sat".to_string() }]);
        assert!(matches!(&job.kind, DescriptorKind::Job { wait: None }));
        assert!(matches!(&job.steps[0].action, StepAction::ExecuteCommand { command } if command == "match t2 == \"node\" | clean"));
    }

    #[test]
    fn time_event_and_command() {
        let job = parse_job_line("test", "0 5 * * sat evt : cmd").unwrap();
        assert_eq!(job.triggers, vec![Trigger::Cron { expression: "0 5 * * sat".to_string() }]);
        assert!(matches!(
            &job.kind,
            DescriptorKind::Job { wait: Some(Trigger::Event { event_name }) } if event_name == "evt"
        ));
    }

    #[test]
    fn event_and_command_only() {
        let job = parse_job_line("test", "evt : cmd").unwrap();
        assert_eq!(job.triggers, vec![Trigger::Event { event_name: "evt".to_string() }]);
        assert!(matches!(&job.kind, DescriptorKind::Job { wait: None }));
    }

    #[test]
    fn invalid_cron_expression_is_a_parse_error() {
        let err = parse_job_line("test", "0 5 invalid * sat : cmd").unwrap_err();
        assert!(matches!(err, TaskHandlerError::ParseError(_)));
    }

    #[test]
    fn missing_colon_is_a_parse_error() {
        let err = parse_job_line("test", "evt cmd").unwrap_err();
        assert!(matches!(err, TaskHandlerError::ParseError(_)));
    }
}
