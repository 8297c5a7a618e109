use std::future::Future;

use crate::error::DeidResult;
use crate::lease::LeaseRecord;

/// Result of [`LeaseStore::put_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of [`LeaseStore::put_if_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    VersionMismatch,
}

/// Durable key-value store holding lease records.
///
/// Implementations must offer strongly consistent reads and conditional writes. A lost
/// condition is reported through the outcome enums. Errors are reserved for the store itself
/// failing, so callers can tell contention from infrastructure trouble.
pub trait LeaseStore {
    /// Reads the lease record named `name`.
    fn get(&self, name: &str) -> impl Future<Output = DeidResult<Option<LeaseRecord>>> + Send;

    /// Writes `record` only if no record with the same name exists.
    fn put_if_absent(
        &self,
        record: LeaseRecord,
    ) -> impl Future<Output = DeidResult<CreateOutcome>> + Send;

    /// Replaces the stored record only if its version still equals `expected_version`.
    fn put_if_version(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> impl Future<Output = DeidResult<UpdateOutcome>> + Send;
}
