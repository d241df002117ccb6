use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{entity::Revision, id::ConfigId};

/// Whether a config id requires a round-trip through the Worker Task Queue
/// before being persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
pub struct ConfigValidation {
    pub id: ConfigId,
    pub external_validation: bool,
}

/// `(id, body, revision)` as described in the data model: a persisted
/// configuration document, keyed by id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct ConfigEntity {
    pub id: ConfigId,
    /// Always a JSON object; kept as `Value` rather than `Map` so the
    /// `ToSchema` derive matches the same blanket impl the bus messages use.
    pub body: Value,
    pub revision: Revision,
}

/// Resolution for `patch_config`'s ambiguous falsy-right-value behaviour,
/// see `deep_merge`. Dropping a falsy right-hand scalar in favour of the
/// left value is surprising for legitimate `false`/`0` overrides, so this
/// is exposed as an explicit choice instead of baking one interpretation in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Right-hand falsy scalars (`false`, `0`, `""`, `null`) are dropped in
    /// favour of the left value when the left key is present.
    #[default]
    DropFalsyRight,
    /// Any right-hand scalar present, falsy or not, overwrites the left value.
    Overwrite,
}
