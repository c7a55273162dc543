//! Persistence seam for request/response log records

use crate::logging::RequestLogRecord;
use async_trait::async_trait;
use std::fmt;

/// Error type for request log store operations
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Storage backend error
    StorageError(String),
    /// Serialization error
    SerializationError(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            StoreError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Trait for persisting one record per orchestrated provider attempt.
///
/// Calls are made from a detached task, so a slow or failing store never delays a request.
/// Errors are reported on the `steadfast::request_log` tracing target and otherwise ignored.
///
/// # Example
///
/// ```ignore
/// use steadfast::logging::RequestLogRecord;
/// use steadfast::traits::{RequestLogStore, StoreError};
/// use async_trait::async_trait;
/// use std::sync::Mutex;
///
/// struct InMemoryStore {
///     records: Mutex<Vec<RequestLogRecord>>,
/// }
///
/// #[async_trait]
/// impl RequestLogStore for InMemoryStore {
///     async fn log_request(&self, record: &RequestLogRecord) -> Result<(), StoreError> {
///         self.records.lock().unwrap().push(record.clone());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn log_request(&self, record: &RequestLogRecord) -> Result<(), StoreError>;
}

/// Store that keeps nothing. This is the default when no store is configured.
#[derive(Debug, Clone, Default)]
pub struct NoOpRequestLogStore;

#[async_trait]
impl RequestLogStore for NoOpRequestLogStore {
    async fn log_request(&self, _record: &RequestLogRecord) -> Result<(), StoreError> {
        Ok(())
    }
}
