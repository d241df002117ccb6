use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use resotocore_types::{ConfigEntity, RunningTask, Subscriber, Subscription, TaskDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, instrument};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config_handler::{ConfigError, ConfigHandler};
use crate::descriptors::{DescriptorStore, DescriptorStoreError};
use crate::running_store::RunningTaskStore;
use crate::scheduler::TaskHandler;
use crate::worker_queue::WorkerTaskQueue;
use resotocore_types::{ConfigId, DescriptorId, MessageType, RunningTaskId, SubscriberId, WorkerTaskSpec};

/// Routing only: every handler here delegates straight into a
/// [`ConfigHandler`]/[`DescriptorStore`]/[`TaskHandler`] method and carries
/// no business logic of its own.
#[derive(Clone)]
pub struct AppState {
    pub descriptors: DescriptorStore,
    pub running: RunningTaskStore,
    pub worker_queue: WorkerTaskQueue,
    pub config_handler: ConfigHandler,
    pub scheduler: TaskHandler,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
#[instrument(level = "debug", skip(_state))]
async fn handle_health(State(_state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[utoipa::path(get, path = "/descriptors", responses((status = 200, body = Vec<TaskDescriptor>)))]
async fn handle_list_descriptors(State(state): State<AppState>) -> Result<Json<Vec<TaskDescriptor>>, ApiError> {
    Ok(Json(state.descriptors.all().await?))
}

#[utoipa::path(get, path = "/descriptors/{id}", responses((status = 200, body = TaskDescriptor), (status = 404)))]
async fn handle_get_descriptor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDescriptor>, ApiError> {
    let id = DescriptorId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    match state.descriptors.get(&id).await? {
        Some(descriptor) => Ok(Json(descriptor)),
        None => Err(ApiError::NotFound),
    }
}

#[utoipa::path(put, path = "/descriptors/{id}", request_body = TaskDescriptor, responses((status = 200, body = TaskDescriptor)))]
async fn handle_put_descriptor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut descriptor): Json<TaskDescriptor>,
) -> Result<Json<TaskDescriptor>, ApiError> {
    descriptor.id = DescriptorId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.descriptors.put(descriptor).await?))
}

#[utoipa::path(delete, path = "/descriptors/{id}", responses((status = 204)))]
async fn handle_delete_descriptor(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = DescriptorId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state.descriptors.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(get, path = "/running", responses((status = 200, body = Vec<RunningTask>)))]
async fn handle_list_running(State(state): State<AppState>) -> Result<Json<Vec<RunningTask>>, ApiError> {
    Ok(Json(state.running.all().await?))
}

#[utoipa::path(get, path = "/config/{id}", responses((status = 200, body = ConfigEntity), (status = 404)))]
async fn handle_get_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConfigEntity>, ApiError> {
    let id = ConfigId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    match state.config_handler.get_config(&id).await? {
        Some(entity) => Ok(Json(entity)),
        None => Err(ApiError::NotFound),
    }
}

#[utoipa::path(put, path = "/config/{id}", request_body = Value, responses((status = 200, body = ConfigEntity)))]
async fn handle_put_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<ConfigEntity>, ApiError> {
    let id = ConfigId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.config_handler.put_config(id, body, true).await?))
}

#[utoipa::path(patch, path = "/config/{id}", request_body = Value, responses((status = 200, body = ConfigEntity)))]
async fn handle_patch_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Json<ConfigEntity>, ApiError> {
    let id = ConfigId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.config_handler.patch_config(id, patch).await?))
}

#[utoipa::path(delete, path = "/config/{id}", responses((status = 204)))]
async fn handle_delete_config(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = ConfigId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state.config_handler.delete_config(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(get, path = "/config/{id}/yaml", responses((status = 200, body = String), (status = 404)))]
async fn handle_config_yaml(State(state): State<AppState>, Path(id): Path<String>) -> Result<String, ApiError> {
    let id = ConfigId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    match state.config_handler.config_yaml(&id, true).await? {
        Some(yaml) => Ok(yaml),
        None => Err(ApiError::NotFound),
    }
}

#[utoipa::path(get, path = "/subscribers", responses((status = 200, body = Vec<Subscriber>)))]
async fn handle_list_subscribers(State(state): State<AppState>) -> Result<Json<Vec<Subscriber>>, ApiError> {
    Ok(Json(state.scheduler.list_subscribers().await?))
}

#[utoipa::path(put, path = "/subscribers/{id}", responses((status = 200, body = Subscriber)))]
async fn handle_register_subscriber(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Subscriber>, ApiError> {
    let id = SubscriberId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.scheduler.register_subscriber(id).await?))
}

#[utoipa::path(delete, path = "/subscribers/{id}", responses((status = 204)))]
async fn handle_evict_subscriber(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = SubscriberId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state.scheduler.evict_subscriber(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/subscribers/{id}/subscriptions",
    request_body = Subscription,
    responses((status = 200, body = Subscriber))
)]
async fn handle_add_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(subscription): Json<Subscription>,
) -> Result<Json<Subscriber>, ApiError> {
    let id = SubscriberId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.scheduler.add_subscription(&id, subscription).await?))
}

#[utoipa::path(
    delete,
    path = "/subscribers/{id}/subscriptions/{message_type}",
    responses((status = 200, body = Subscriber))
)]
async fn handle_remove_subscription(
    State(state): State<AppState>,
    Path((id, message_type)): Path<(String, String)>,
) -> Result<Json<Subscriber>, ApiError> {
    let id = SubscriberId::new(id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let message_type = MessageType::new(message_type).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.scheduler.remove_subscription(&id, &message_type).await?))
}

#[derive(Deserialize, ToSchema)]
pub struct ActionReplyRequest {
    pub task_id: RunningTaskId,
    pub step_name: String,
    pub subscriber_id: SubscriberId,
    #[serde(default)]
    pub data: Value,
}

/// A subscriber's `ActionDone` reply, forwarded to the task handler.
#[utoipa::path(post, path = "/actions/done", request_body = ActionReplyRequest, responses((status = 202)))]
async fn handle_action_done(
    State(state): State<AppState>,
    Json(req): Json<ActionReplyRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .report_action_done(req.task_id, &req.step_name, req.subscriber_id, req.data)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize, ToSchema)]
pub struct ActionErrorRequest {
    pub task_id: RunningTaskId,
    pub step_name: String,
    pub subscriber_id: SubscriberId,
    pub reason: String,
}

/// A subscriber's `ActionError` reply, forwarded to the task handler.
#[utoipa::path(post, path = "/actions/error", request_body = ActionErrorRequest, responses((status = 202)))]
async fn handle_action_error(
    State(state): State<AppState>,
    Json(req): Json<ActionErrorRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .report_action_error(req.task_id, &req.step_name, req.subscriber_id, req.reason)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize, ToSchema)]
pub struct PublishEventRequest {
    pub event_name: String,
}

/// Exercises the scheduler's event path directly, bypassing whatever would
/// otherwise emit the event.
#[utoipa::path(post, path = "/dev/events", request_body = PublishEventRequest, responses((status = 202)))]
async fn handle_publish_event(
    State(state): State<AppState>,
    Json(req): Json<PublishEventRequest>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.handle_event(&req.event_name).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize, ToSchema)]
pub struct EnqueueWorkerTaskRequest {
    pub name: String,
    #[serde(default)]
    pub attrs: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

/// Submits the task and returns immediately; the result is logged rather
/// than returned, since a debug caller has no channel to receive it over.
#[utoipa::path(post, path = "/dev/worker-tasks", request_body = EnqueueWorkerTaskRequest, responses((status = 202)))]
async fn handle_enqueue_worker_task(
    State(state): State<AppState>,
    Json(req): Json<EnqueueWorkerTaskRequest>,
) -> StatusCode {
    let spec = WorkerTaskSpec {
        name: req.name.clone(),
        attrs: req.attrs,
        payload: req.payload,
    };
    let result_rx = state
        .worker_queue
        .add_task(spec, Duration::from_secs(req.timeout_secs));
    tokio::spawn(async move {
        match result_rx.await {
            Ok(Ok(result)) => tracing::info!("worker task {} completed: {result}", req.name),
            Ok(Err(failure)) => error!("worker task {} failed: {failure}", req.name),
            Err(_) => error!("worker task {} dropped before completion", req.name),
        }
    });
    StatusCode::ACCEPTED
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handle_health,
        handle_list_descriptors,
        handle_get_descriptor,
        handle_put_descriptor,
        handle_delete_descriptor,
        handle_list_running,
        handle_get_config,
        handle_put_config,
        handle_patch_config,
        handle_delete_config,
        handle_config_yaml,
        handle_list_subscribers,
        handle_register_subscriber,
        handle_evict_subscriber,
        handle_add_subscription,
        handle_remove_subscription,
        handle_action_done,
        handle_action_error,
        handle_publish_event,
        handle_enqueue_worker_task,
    ),
    info(title = "resotocore API", description = "Task orchestration and worker coordination")
)]
pub struct ApiDoc;

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(handle_health))
        .route("/descriptors", get(handle_list_descriptors))
        .route("/descriptors/{id}", get(handle_get_descriptor))
        .route("/descriptors/{id}", put(handle_put_descriptor))
        .route("/descriptors/{id}", delete(handle_delete_descriptor))
        .route("/running", get(handle_list_running))
        .route("/config/{id}", get(handle_get_config))
        .route("/config/{id}", put(handle_put_config))
        .route("/config/{id}", patch(handle_patch_config))
        .route("/config/{id}", delete(handle_delete_config))
        .route("/config/{id}/yaml", get(handle_config_yaml))
        .route("/subscribers", get(handle_list_subscribers))
        .route("/subscribers/{id}", put(handle_register_subscriber))
        .route("/subscribers/{id}", delete(handle_evict_subscriber))
        .route("/subscribers/{id}/subscriptions", post(handle_add_subscription))
        .route("/subscribers/{id}/subscriptions/{message_type}", delete(handle_remove_subscription))
        .route("/actions/done", post(handle_action_done))
        .route("/actions/error", post(handle_action_error))
        .route("/dev/events", post(handle_publish_event))
        .route("/dev/worker-tasks", post(handle_enqueue_worker_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router, unwinding on the shared kill signal.
#[instrument(skip(state, shutdown))]
pub async fn serve(host: &str, port: u16, state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let router = make_router(state);
    let listener = tokio::net::TcpListener::bind(&format!("{host}:{port}")).await?;
    tracing::info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            tracing::debug!("HTTP server shutting down");
        })
        .await?;
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    BadRequest(String),
    Internal(String),
}

impl From<DescriptorStoreError> for ApiError {
    fn from(err: DescriptorStoreError) -> Self {
        match err {
            DescriptorStoreError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::running_store::RunningTaskStoreError> for ApiError {
    fn from(err: crate::running_store::RunningTaskStoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        let message = err.to_string();
        match err {
            ConfigError::NotFound(_) => ApiError::NotFound,
            ConfigError::Validation { .. } | ConfigError::ExternalValidation(_) => ApiError::BadRequest(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::scheduler::TaskHandlerError> for ApiError {
    fn from(err: crate::scheduler::TaskHandlerError) -> Self {
        use crate::subscriptions::SubscriptionRegistryError;
        match err {
            crate::scheduler::TaskHandlerError::ParseError(reason) => ApiError::BadRequest(reason),
            crate::scheduler::TaskHandlerError::Subscriptions(SubscriptionRegistryError::NotFound(_)) => {
                ApiError::NotFound
            }
            crate::scheduler::TaskHandlerError::Subscriptions(
                err @ SubscriptionRegistryError::DuplicateMessageType(_, _),
            ) => ApiError::BadRequest(err.to_string()),
            crate::scheduler::TaskHandlerError::Subscriptions(
                err @ SubscriptionRegistryError::OptimisticLockingFailed(_),
            ) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            ApiError::Internal(reason) => {
                error!("internal error serving request: {reason}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, message).into_response()
    }
}
