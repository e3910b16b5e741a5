//! Identity types for Medrota entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Common behaviour for strongly-typed entity identifiers.
///
/// Every table key is wrapped in its own newtype so a `UserId` can never be
/// passed where a `RotationId` is expected. The wire representation is the
/// bare UUID.
pub trait EntityIdType:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Wrap a raw UUID.
    fn new(uuid: Uuid) -> Self;

    /// Borrow the raw UUID.
    fn as_uuid(&self) -> Uuid;

    /// Generate a fresh timestamp-sortable (UUIDv7) identifier.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// The nil identifier.
    fn nil() -> Self {
        Self::new(Uuid::nil())
    }
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_entity_id!(
    /// Owning tenant (institution) of every row.
    TenantId
);
define_entity_id!(UserId);
define_entity_id!(
    /// Residency or fellowship program.
    ProgramId
);
define_entity_id!(RotationId);
define_entity_id!(CompetencyId);
define_entity_id!(
    /// A competency assigned to a specific user.
    AssignmentId
);
define_entity_id!(SubmissionId);
define_entity_id!(EvaluationId);
define_entity_id!(TimeRecordId);

/// Collect the raw UUIDs of a slice of typed ids, e.g. for `= ANY($1)` binds.
pub fn raw_ids<I: EntityIdType>(ids: &[I]) -> Vec<Uuid> {
    ids.iter().map(EntityIdType::as_uuid).collect()
}

/// Sorted, deduplicated copy of an id set.
///
/// Batch loads treat their input as a set: order and repetition carry no
/// meaning, so every entry point normalizes through here.
pub fn canonical_ids<I: EntityIdType>(ids: &[I]) -> Vec<I> {
    let mut out = ids.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}
