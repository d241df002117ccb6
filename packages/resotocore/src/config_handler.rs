use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use resotocore_types::{ConfigEntity, ConfigId, ConfigValidation, MergeMode, WorkerTaskSpec};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::instrument;

use crate::bus::MessageBus;
use crate::worker_queue::WorkerTaskQueue;
use resotocore_utils::{Collection, CollectionHandle, EntityCollection, EntityStore, EntityStoreError};

const CONFIGS: CollectionHandle<Value> = CollectionHandle::new(Collection::Configs);
const CONFIG_VALIDATION: CollectionHandle<ConfigValidation> = CollectionHandle::new(Collection::ConfigValidation);

/// How long `put_config` waits for an external validator before giving up.
const EXTERNAL_VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const VALIDATE_CONFIG_TASK: &str = "validate_config";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("config {0} not found")]
    NotFound(ConfigId),
    #[error("optimistic locking failed for config {0}")]
    OptimisticLockingFailed(ConfigId),
    #[error("error validating section {section}: {reason}")]
    Validation { section: String, reason: String },
    #[error("external validation rejected the change: {0}")]
    ExternalValidation(String),
    #[error("no worker available to validate this configuration")]
    WorkerUnavailable,
    #[error("entity store: {0}")]
    Store(#[from] EntityStoreError),
}

/// The seam each recognised top-level configuration key is typed through;
/// analogous to the original's pluggable config model `Kind`. `check_valid`
/// may coerce the value (e.g. a bare string into a duration in seconds).
pub trait ConfigKind: Send + Sync {
    fn check_valid(&self, value: Value) -> Result<Value, ConfigError>;

    /// `Some(order)` marks this kind "complex": `config_yaml` renders its
    /// value's fields in `order` instead of dumping it as an opaque blob.
    fn field_order(&self) -> Option<&'static [&'static str]> {
        None
    }
}

/// Validates a bare boolean, e.g. `analytics_opt_out`.
pub struct BoolKind;

impl ConfigKind for BoolKind {
    fn check_valid(&self, value: Value) -> Result<Value, ConfigError> {
        match value {
            Value::Bool(_) => Ok(value),
            other => Err(ConfigError::Validation {
                section: "bool".to_string(),
                reason: format!("expected a boolean, got {other}"),
            }),
        }
    }
}

/// Coerces a bare string duration (`"30s"`, `"5m"`, `"1h"`) or a plain
/// integer into a number of seconds.
pub struct DurationKind;

impl ConfigKind for DurationKind {
    fn check_valid(&self, value: Value) -> Result<Value, ConfigError> {
        match value {
            Value::Number(_) => Ok(value),
            Value::String(s) => parse_duration_string(&s)
                .map(|secs| Value::Number(secs.into()))
                .ok_or_else(|| ConfigError::Validation {
                    section: "duration".to_string(),
                    reason: format!("cannot parse {s:?} as a duration"),
                }),
            other => Err(ConfigError::Validation {
                section: "duration".to_string(),
                reason: format!("expected a duration, got {other}"),
            }),
        }
    }
}

fn parse_duration_string(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: u64 = digits.parse().ok()?;
    match unit {
        "" | "s" => Some(n),
        "m" => Some(n * 60),
        "h" => Some(n * 3600),
        "d" => Some(n * 86400),
        _ => None,
    }
}

/// A complex kind: validates that the section decodes as a list of the
/// target type and renders through a fixed field order when emitted.
pub struct StructListKind {
    order: &'static [&'static str],
}

impl StructListKind {
    pub fn new(order: &'static [&'static str]) -> Self {
        Self { order }
    }
}

impl ConfigKind for StructListKind {
    fn check_valid(&self, value: Value) -> Result<Value, ConfigError> {
        if !value.is_array() {
            return Err(ConfigError::Validation {
                section: "workflow".to_string(),
                reason: "expected a list".to_string(),
            });
        }
        Ok(value)
    }

    fn field_order(&self) -> Option<&'static [&'static str]> {
        Some(self.order)
    }
}

/// Field order the `workflow` config section renders through when it is a
/// registered, "complex" kind: mirrors [`resotocore_types::TaskDescriptor`].
pub const WORKFLOW_FIELD_ORDER: &[&str] = &["id", "name", "steps", "triggers", "on_surpass", "kind"];

/// `deep_merge(left, right)`: dicts merge recursively; non-dict right
/// values replace; under [`MergeMode::DropFalsyRight`] (the default) a
/// falsy right scalar is dropped in favour of an *existing* left value,
/// but is preserved when the left key is absent (there is nothing to fall
/// back to). `deep_merge(x, x) == x` for any `x` under either mode.
pub fn deep_merge(left: &Value, right: &Value, mode: MergeMode) -> Value {
    let Value::Object(right_map) = right else {
        return merge_scalar(left, right, mode, true);
    };
    let left_map = match left {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };

    let mut keys: Vec<String> = left_map.keys().cloned().collect();
    for key in right_map.keys() {
        if !left_map.contains_key(key) {
            keys.push(key.clone());
        }
    }

    let mut out = Map::new();
    for key in keys {
        let left_value = left_map.get(&key);
        let right_value = right_map.get(&key);
        let merged = match (left_value, right_value) {
            (Some(l), Some(r)) => deep_merge(l, r, mode),
            (Some(l), None) => l.clone(),
            (None, Some(r)) => merge_scalar(&Value::Null, r, mode, false),
            (None, None) => unreachable!(),
        };
        out.insert(key, merged);
    }
    Value::Object(out)
}

fn merge_scalar(left: &Value, right: &Value, mode: MergeMode, left_present: bool) -> Value {
    match mode {
        MergeMode::Overwrite => right.clone(),
        MergeMode::DropFalsyRight => {
            if left_present && is_falsy(right) {
                left.clone()
            } else {
                right.clone()
            }
        }
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(_) => false,
    }
}

/// CRUD of Config Entities, validating through the [`ConfigKind`] registry
/// and, when registered, through an external worker via the
/// [`WorkerTaskQueue`] before persisting.
#[derive(Clone)]
pub struct ConfigHandler {
    store: EntityStore,
    bus: MessageBus,
    worker_queue: WorkerTaskQueue,
    kinds: Arc<DashMap<String, Arc<dyn ConfigKind>>>,
    merge_mode: MergeMode,
}

impl ConfigHandler {
    pub fn new(store: EntityStore, bus: MessageBus, worker_queue: WorkerTaskQueue, merge_mode: MergeMode) -> Self {
        Self {
            store,
            bus,
            worker_queue,
            kinds: Arc::new(DashMap::new()),
            merge_mode,
        }
    }

    pub fn register_kind(&self, name: impl Into<String>, kind: Arc<dyn ConfigKind>) {
        self.kinds.insert(name.into(), kind);
    }

    fn configs(&self) -> Result<impl EntityCollection<Value>, ConfigError> {
        Ok(self.store.collection(&CONFIGS)?)
    }

    fn validations(&self) -> Result<impl EntityCollection<ConfigValidation>, ConfigError> {
        Ok(self.store.collection(&CONFIG_VALIDATION)?)
    }

    #[instrument(skip(self), fields(subsys = "ConfigHandler"))]
    pub async fn get_config(&self, id: &ConfigId) -> Result<Option<ConfigEntity>, ConfigError> {
        Ok(self.configs()?.get(id.as_ref()).await?.map(|doc| ConfigEntity {
            id: id.clone(),
            body: doc.value,
            revision: doc.rev,
        }))
    }

    pub async fn list_config_ids(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.configs()?.keys().await?)
    }

    /// Coerces each top-level key through its registered kind, naming the
    /// offending section on failure.
    fn check_and_coerce(&self, body: &Value) -> Result<Value, ConfigError> {
        let Value::Object(map) = body else {
            return Ok(body.clone());
        };
        let mut out = Map::new();
        for (key, value) in map {
            let coerced = match self.kinds.get(key) {
                Some(kind) => kind
                    .check_valid(value.clone())
                    .map_err(|err| match err {
                        ConfigError::Validation { reason, .. } => {
                            ConfigError::Validation { section: key.clone(), reason }
                        }
                        other => other,
                    })?,
                None => value.clone(),
            };
            out.insert(key.clone(), coerced);
        }
        Ok(Value::Object(out))
    }

    /// Submits a `validate_config` worker task and awaits its outcome;
    /// worker rejection surfaces as [`ConfigError::ExternalValidation`].
    async fn acknowledge_config_change(&self, id: &ConfigId, config: &Value) -> Result<(), ConfigError> {
        let mut attrs = BTreeMap::new();
        attrs.insert("config_id".to_string(), id.to_string());
        let spec = WorkerTaskSpec {
            name: VALIDATE_CONFIG_TASK.to_string(),
            attrs,
            payload: serde_json::json!({"config_id": id.as_ref(), "config": config}),
        };
        let result_rx = self.worker_queue.add_task(spec, EXTERNAL_VALIDATION_TIMEOUT);
        match result_rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(failure)) => Err(ConfigError::ExternalValidation(failure.0)),
            Err(_) => Err(ConfigError::WorkerUnavailable),
        }
    }

    #[instrument(skip(self, body), fields(subsys = "ConfigHandler"))]
    pub async fn put_config(&self, id: ConfigId, body: Value, validate: bool) -> Result<ConfigEntity, ConfigError> {
        let coerced = if validate { self.check_and_coerce(&body)? } else { body };

        if validate {
            if let Some(validation) = self.validations()?.get(id.as_ref()).await? {
                if validation.value.external_validation {
                    self.acknowledge_config_change(&id, &coerced).await?;
                }
            }
        }

        let configs = self.configs()?;
        match configs.get(id.as_ref()).await? {
            Some(existing) if existing.value == coerced => Ok(ConfigEntity {
                id,
                body: existing.value,
                revision: existing.rev,
            }),
            Some(existing) => {
                let doc = configs
                    .update(id.as_ref(), existing.rev, coerced)
                    .await
                    .map_err(|err| match err {
                        EntityStoreError::StaleRevision { .. } => ConfigError::OptimisticLockingFailed(id.clone()),
                        other => other.into(),
                    })?;
                self.publish_updated(&id, doc.rev);
                Ok(ConfigEntity { id, body: doc.value, revision: doc.rev })
            }
            None => {
                let doc = configs.insert(id.as_ref(), coerced).await?;
                self.publish_updated(&id, doc.rev);
                Ok(ConfigEntity { id, body: doc.value, revision: doc.rev })
            }
        }
    }

    fn publish_updated(&self, id: &ConfigId, revision: resotocore_types::Revision) {
        self.bus.emit_event(
            "scheduler",
            "config_updated",
            serde_json::json!({"id": id.as_ref(), "revision": revision.to_string()}),
        );
    }

    /// Right-biased deep-merge of `patch` into the current config (or an
    /// empty object if none exists yet), then `put_config`.
    #[instrument(skip(self, patch), fields(subsys = "ConfigHandler"))]
    pub async fn patch_config(&self, id: ConfigId, patch: Value) -> Result<ConfigEntity, ConfigError> {
        let current = self.configs()?.get(id.as_ref()).await?;
        let current_body = current.map(|doc| doc.value).unwrap_or_else(|| Value::Object(Map::new()));
        let merged = deep_merge(&current_body, &patch, self.merge_mode);
        self.put_config(id, merged, true).await
    }

    #[instrument(skip(self), fields(subsys = "ConfigHandler"))]
    pub async fn delete_config(&self, id: &ConfigId) -> Result<(), ConfigError> {
        self.configs()?.delete(id.as_ref()).await?;
        self.validations()?.delete(id.as_ref()).await?;
        self.bus.emit_event("scheduler", "config_deleted", serde_json::json!({"id": id.as_ref()}));
        Ok(())
    }

    #[instrument(skip(self), fields(subsys = "ConfigHandler"))]
    pub async fn put_config_validation(&self, validation: ConfigValidation) -> Result<(), ConfigError> {
        let collection = self.validations()?;
        match collection.get(validation.id.as_ref()).await? {
            Some(existing) => {
                collection
                    .update(validation.id.as_ref(), existing.rev, validation)
                    .await?;
            }
            None => {
                let key = validation.id.as_ref().to_string();
                collection.insert(&key, validation).await?;
            }
        }
        Ok(())
    }

    /// Serialises the config to YAML, preserving insertion order of
    /// top-level keys. Keys registered under a "complex" kind render
    /// through that kind's field order instead of default map order.
    #[instrument(skip(self), fields(subsys = "ConfigHandler"))]
    pub async fn config_yaml(&self, id: &ConfigId, with_revision: bool) -> Result<Option<String>, ConfigError> {
        let Some(entity) = self.get_config(id).await? else {
            return Ok(None);
        };
        let Value::Object(map) = &entity.body else {
            return Ok(Some(serde_yaml::to_string(&entity.body).unwrap_or_default()));
        };

        let mut yaml = String::new();
        for (key, value) in map {
            let rendered_value = match self.kinds.get(key).and_then(|k| k.field_order().map(|o| o.to_vec())) {
                Some(order) => reorder_fields(value, &order),
                None => value.clone(),
            };
            let mut section = Map::new();
            section.insert(key.clone(), rendered_value);
            yaml.push_str(&serde_yaml::to_string(&Value::Object(section)).unwrap_or_default());
        }

        if with_revision {
            yaml.push_str(&format!(
                "\n# This property is not part of the configuration but defines the revision\n\
                 # of this document. Please leave it here to avoid conflicting writes.\n\
                 _revision: \"{}\"\n",
                entity.revision
            ));
        }
        Ok(Some(yaml))
    }
}

/// Re-keys every object in `value` (or `value` itself, if it is an object)
/// so its fields iterate in `order`, with any unlisted fields appended
/// afterwards in their original order.
fn reorder_fields(value: &Value, order: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(reorder_map(map, order)),
        Value::Array(items) => Value::Array(items.iter().map(|v| reorder_fields(v, order)).collect()),
        other => other.clone(),
    }
}

fn reorder_map(map: &Map<String, Value>, order: &[&str]) -> Map<String, Value> {
    let mut out = Map::new();
    for key in order {
        if let Some(v) = map.get(*key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    for (key, v) in map {
        if !out.contains_key(key) {
            out.insert(key.clone(), v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use resotocore_types::WorkerTaskDescription;

    fn handler() -> ConfigHandler {
        ConfigHandler::new(
            EntityStore::new(),
            MessageBus::new(),
            WorkerTaskQueue::new(),
            MergeMode::DropFalsyRight,
        )
    }

    #[test]
    fn deep_merge_is_idempotent() {
        let x = serde_json::json!({"a": 1, "b": {"c": true, "d": "x"}, "e": [1,2]});
        let merged = deep_merge(&x, &x, MergeMode::DropFalsyRight);
        assert_eq!(merged, x);
        let merged_overwrite = deep_merge(&x, &x, MergeMode::Overwrite);
        assert_eq!(merged_overwrite, x);
    }

    #[test]
    fn deep_merge_drops_falsy_right_over_existing_left() {
        let left = serde_json::json!({"enabled": true});
        let right = serde_json::json!({"enabled": false});
        let merged = deep_merge(&left, &right, MergeMode::DropFalsyRight);
        assert_eq!(merged, serde_json::json!({"enabled": true}));
    }

    #[test]
    fn deep_merge_preserves_falsy_right_when_left_absent() {
        let left = serde_json::json!({});
        let right = serde_json::json!({"enabled": false});
        let merged = deep_merge(&left, &right, MergeMode::DropFalsyRight);
        assert_eq!(merged, serde_json::json!({"enabled": false}));
    }

    #[test]
    fn deep_merge_overwrite_mode_always_takes_right() {
        let left = serde_json::json!({"enabled": true});
        let right = serde_json::json!({"enabled": false});
        let merged = deep_merge(&left, &right, MergeMode::Overwrite);
        assert_eq!(merged, serde_json::json!({"enabled": false}));
    }

    #[test]
    fn deep_merge_recurses_into_nested_objects() {
        let left = serde_json::json!({"api": {"port": 8900, "hosts": ["0.0.0.0"]}});
        let right = serde_json::json!({"api": {"port": 9000}});
        let merged = deep_merge(&left, &right, MergeMode::DropFalsyRight);
        assert_eq!(merged, serde_json::json!({"api": {"port": 9000, "hosts": ["0.0.0.0"]}}));
    }

    #[tokio::test]
    async fn put_config_is_a_noop_when_unchanged() {
        let handler = handler();
        let id = ConfigId::new("resoto.core").unwrap();
        let body = serde_json::json!({"api": {"port": 8900}});
        let first = handler.put_config(id.clone(), body.clone(), true).await.unwrap();
        let second = handler.put_config(id, body, true).await.unwrap();
        assert_eq!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn patch_config_merges_into_existing() {
        let handler = handler();
        let id = ConfigId::new("resoto.core").unwrap();
        handler
            .put_config(id.clone(), serde_json::json!({"api": {"port": 8900, "hosts": ["0.0.0.0"]}}), true)
            .await
            .unwrap();

        let patched = handler
            .patch_config(id, serde_json::json!({"api": {"port": 9000}}))
            .await
            .unwrap();
        assert_eq!(patched.body, serde_json::json!({"api": {"port": 9000, "hosts": ["0.0.0.0"]}}));
    }

    #[tokio::test]
    async fn invalid_bool_section_is_rejected() {
        let handler = handler();
        handler.register_kind("analytics_opt_out", Arc::new(BoolKind));
        let id = ConfigId::new("resoto.core").unwrap();
        let err = handler
            .put_config(id, serde_json::json!({"analytics_opt_out": "yes"}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { section, .. } if section == "analytics_opt_out"));
    }

    #[tokio::test]
    async fn duration_string_is_coerced_to_seconds() {
        let handler = handler();
        handler.register_kind("cli", Arc::new(DurationKind));
        let id = ConfigId::new("resoto.core").unwrap();
        let entity = handler
            .put_config(id, serde_json::json!({"cli": "5m"}), true)
            .await
            .unwrap();
        assert_eq!(entity.body, serde_json::json!({"cli": 300}));
    }

    #[tokio::test]
    async fn external_validation_rejection_blocks_the_write() {
        let handler = handler();
        let id = ConfigId::new("resoto.core").unwrap();
        handler
            .put_config_validation(ConfigValidation { id: id.clone(), external_validation: true })
            .await
            .unwrap();

        let worker_id = resotocore_types::WorkerId::new("validator_1").unwrap();
        let mut worker_handle = handler.worker_queue.attach(
            worker_id.clone(),
            vec![WorkerTaskDescription { name: VALIDATE_CONFIG_TASK.to_string(), filter: BTreeMap::new() }],
        );

        let put = tokio::spawn({
            let handler = handler.clone();
            let id = id.clone();
            async move { handler.put_config(id, serde_json::json!({"key": "value"}), true).await }
        });

        let envelope = worker_handle.recv().await.unwrap();
        handler
            .worker_queue
            .error_task(&worker_id, envelope.id, "bad value".to_string())
            .unwrap();

        let err = put.await.unwrap().unwrap_err();
        assert_eq!(err, ConfigError::ExternalValidation("bad value".to_string()));
        assert!(handler.get_config(&id).await.unwrap().is_none());
    }

    #[test]
    fn config_yaml_structured_emitter_follows_field_order() {
        let value = serde_json::json!({"name": "wf", "id": "wf_1", "steps": []});
        let reordered = reorder_fields(&value, WORKFLOW_FIELD_ORDER);
        let keys: Vec<&String> = reordered.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["id", "name", "steps"]);
    }
}
