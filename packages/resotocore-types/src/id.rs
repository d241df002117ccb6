use serde::{Deserialize, Deserializer, Serialize};
use std::{ops::Deref, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IDError {
    #[error("ID must be between 1 and 64 characters")]
    LengthError,
    #[error("ID must be alphanumeric, '-', '_' or '.'")]
    CharError,
}

/// Generates a validated, string-backed identifier type: `[A-Za-z0-9-_.]{1,64}`.
macro_rules! new_string_id_type {
    ($type_name:ident) => {
        #[derive(
            Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
        )]
        #[serde(transparent)]
        pub struct $type_name(String);

        impl $type_name {
            pub fn new(id: impl Into<String>) -> Result<Self, IDError> {
                let id = id.into();

                if id.is_empty() || id.len() > 64 {
                    return Err(IDError::LengthError);
                }
                if !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
                {
                    return Err(IDError::CharError);
                }
                Ok(Self(id))
            }
        }

        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $type_name::new(s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $type_name {
            type Err = IDError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }

        impl TryFrom<&str> for $type_name {
            type Error = IDError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                $type_name::new(s)
            }
        }
    };
}

/// Generates a random, time-ordered identifier type backed by a UUIDv7.
macro_rules! new_uuid_id_type {
    ($type_name:ident) => {
        #[derive(
            Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
        )]
        #[serde(transparent)]
        pub struct $type_name(uuid::Uuid);

        impl $type_name {
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }
        }

        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $type_name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::from_str(s)?))
            }
        }
    };
}

// subscription registry
new_string_id_type!(SubscriberId);
// message bus / action fan-out
new_string_id_type!(MessageType);
// task descriptor store
new_string_id_type!(DescriptorId);
// worker task queue
new_string_id_type!(WorkerId);
// config handler
new_string_id_type!(ConfigId);

new_uuid_id_type!(RunningTaskId);
new_uuid_id_type!(WorkerTaskId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        SubscriberId::new("sub_1").unwrap();
        SubscriberId::new("collect.start-v2").unwrap();
    }

    #[test]
    fn invalid_ids() {
        assert_eq!(SubscriberId::new("").unwrap_err(), IDError::LengthError);
        assert_eq!(
            SubscriberId::new("with space").unwrap_err(),
            IDError::CharError
        );
    }

    #[test]
    fn running_task_ids_are_unique_and_ordered() {
        let a = RunningTaskId::new();
        let b = RunningTaskId::new();
        assert_ne!(a, b);
        assert!(a < b, "uuidv7 ids should be monotonically increasing");
    }

    #[test]
    fn deserialize_rejects_invalid_chars() {
        let err = serde_json::from_str::<SubscriberId>("\"bad/id\"").unwrap_err();
        assert!(err.to_string().contains("alphanumeric"));
    }
}
