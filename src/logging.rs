//! Request/response logger
//!
//! Every orchestrated attempt produces one [`RequestLogRecord`]. The record is traced
//! synchronously and queued for a single writer task that feeds the configured
//! [`RequestLogStore`]. The queue is bounded: when the store falls behind, new records are dropped
//! and reported rather than piling up. The caller never waits on persistence and never sees its
//! errors.
use crate::errors::AttemptOutcome;
use crate::models::TokenUsage;
use crate::providers::ProviderRole;
use crate::traits::{NoOpRequestLogStore, RequestLogStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

/// Which public operation produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Text,
    Structured,
    Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestLogRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub role: ProviderRole,
    pub model_id: Option<String>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub user_id: Option<String>,
}

/// Records waiting for the store beyond this are dropped.
pub const DEFAULT_LOG_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct RequestLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    store: Arc<dyn RequestLogStore>,
    capacity: usize,
    /// Feeds the writer task, spawned on first use so a logger can be built outside a runtime.
    queue: OnceLock<mpsc::Sender<RequestLogRecord>>,
}

impl std::fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLogger")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for RequestLogger {
    fn default() -> Self {
        Self::new(Arc::new(NoOpRequestLogStore))
    }
}

impl RequestLogger {
    pub fn new(store: Arc<dyn RequestLogStore>) -> Self {
        Self::with_capacity(store, DEFAULT_LOG_QUEUE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn RequestLogStore>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                store,
                capacity: capacity.max(1),
                queue: OnceLock::new(),
            }),
        }
    }

    /// Record one attempt. Never blocks and never fails.
    pub fn log_attempt(&self, record: RequestLogRecord) {
        let tokens = record.usage.map(|u| u.total_tokens);
        match &record.outcome {
            AttemptOutcome::Succeeded { attempts } => info!(
                role = %record.role,
                operation = ?record.operation,
                outcome = "succeeded",
                attempts,
                latency_ms = record.latency_ms,
                tokens,
                cost_usd = record.cost_usd,
                user_id = record.user_id.as_deref(),
                "Provider attempt succeeded"
            ),
            AttemptOutcome::Failed {
                class,
                error,
                attempts,
            } => warn!(
                role = %record.role,
                operation = ?record.operation,
                outcome = "failed",
                class = ?class,
                attempts,
                latency_ms = record.latency_ms,
                user_id = record.user_id.as_deref(),
                "Provider attempt failed: {}",
                error
            ),
            AttemptOutcome::CircuitOpen => info!(
                role = %record.role,
                operation = ?record.operation,
                outcome = "circuit_open",
                user_id = record.user_id.as_deref(),
                "Provider skipped, circuit open"
            ),
        }

        let Some(queue) = self.queue() else {
            error!(
                target: "steadfast::request_log",
                role = %record.role,
                "No async runtime available, request log record dropped"
            );
            return;
        };
        match queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => error!(
                target: "steadfast::request_log",
                role = %record.role,
                capacity = self.inner.capacity,
                "Request log queue full, record dropped"
            ),
            Err(TrySendError::Closed(record)) => error!(
                target: "steadfast::request_log",
                role = %record.role,
                "Request log writer has stopped, record dropped"
            ),
        }
    }

    fn queue(&self) -> Option<&mpsc::Sender<RequestLogRecord>> {
        if let Some(queue) = self.inner.queue.get() {
            return Some(queue);
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        Some(self.inner.queue.get_or_init(|| {
            let (sender, receiver) = mpsc::channel(self.inner.capacity);
            runtime.spawn(write_records(Arc::clone(&self.inner.store), receiver));
            sender
        }))
    }
}

/// Drains the queue into the store one record at a time. Ends once every logger clone is gone.
async fn write_records(
    store: Arc<dyn RequestLogStore>,
    mut receiver: mpsc::Receiver<RequestLogRecord>,
) {
    while let Some(record) = receiver.recv().await {
        if let Err(e) = store.log_request(&record).await {
            error!(
                target: "steadfast::request_log",
                role = %record.role,
                "Failed to persist request log record: {}",
                e
            );
        }
    }
}
