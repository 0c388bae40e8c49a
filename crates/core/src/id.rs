//! Strongly-typed identifiers shared by the engine and its collaborators.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidId;

/// Identifier of a background task, assigned by the task manager when the
/// task is created.
///
/// Ids are UUIDv7, so ordering by id follows creation order. The task store
/// relies on this to break ties between tasks updated in the same instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

/// Identifier of an uploaded requirement artifact (image or zip).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl TaskId {
    /// Milliseconds since the Unix epoch at which the id was minted.
    ///
    /// `None` for ids that did not come from [`TaskId::new`] (nil or
    /// non-v7 uuids handed in through `from_uuid`).
    pub fn created_at_ms(&self) -> Option<u64> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        Some(secs * 1_000 + u64::from(nanos) / 1_000_000)
    }
}

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing uuid, e.g. one read back from storage.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = InvalidId;

            /// Surrounding whitespace is ignored; ids often arrive from
            /// environment variables or query strings.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s.trim())
                    .map(Self)
                    .map_err(|e| InvalidId::new($name, e))
            }
        }
    };
}

impl_uuid_newtype!(TaskId, "TaskId");
impl_uuid_newtype!(FileId, "FileId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips_through_display() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parsing_ignores_surrounding_whitespace() {
        let id = FileId::new();
        let parsed: FileId = format!("  {id}\n").parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_id_names_the_type() {
        let err = "not-a-uuid".parse::<TaskId>().unwrap_err();
        assert!(err.to_string().starts_with("invalid TaskId"));
    }

    #[test]
    fn task_ids_carry_their_creation_time() {
        let first = TaskId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = TaskId::new();

        let minted = first.created_at_ms().unwrap();
        assert!(minted > 1_600_000_000_000);
        assert!(second > first);
        assert!(second.created_at_ms().unwrap() >= minted);
        assert_eq!(TaskId::from_uuid(Uuid::nil()).created_at_ms(), None);
    }
}
