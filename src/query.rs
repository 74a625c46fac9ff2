//! Contracts of the external collaborators driven by the coordinator.

use crate::encryption::EncryptionKey;
use crate::error::StorageError;
use crate::uri::Uri;

/// A query handed to the coordinator for execution.
///
/// The coordinator never inspects a query; it only drives this contract.
/// `process` may block arbitrarily. Cancellation is cooperative: a running
/// query is expected to poll
/// [`cancellation_in_progress`](crate::coordinator::StorageCoordinator::cancellation_in_progress)
/// and wind down; `cancel` is invoked only for queries that were cancelled
/// before `process` began.
pub trait Query: Send + Sync {
    /// Execute the query to completion.
    fn process(&self) -> Result<(), StorageError>;

    /// Note that the query was cancelled before processing began.
    fn cancel(&self);
}

/// The fragment consolidation collaborator.
///
/// Consolidation itself (reading fragments back and rewriting them as one) is
/// outside the coordinator; the coordinator validates the target and hands
/// control to this contract. Implementations are expected to take the
/// exclusive lock via
/// [`array_xlock`](crate::coordinator::StorageCoordinator::array_xlock) around
/// their destructive phase.
pub trait Consolidate {
    /// Consolidate the fragments of the array at `uri`.
    fn consolidate(
        &mut self,
        sm: &crate::coordinator::StorageCoordinator,
        uri: &Uri,
        key: &EncryptionKey,
    ) -> Result<(), StorageError>;
}
