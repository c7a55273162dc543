//! Error taxonomy for provider calls and orchestration
//!
//! Vendor-call failures are [`ProviderError`]s, each of which is either retryable or fatal.
//! Orchestration-level failures (missing credentials, open circuits, oversized context, and
//! exhausted fallback chains) are [`CoreError`]s.
use crate::providers::ProviderRole;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Whether a failed call may be attempted again against the same provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// A failure from a single call to a vendor API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("authentication rejected by provider ({status})")]
    Authentication { status: u16 },
    #[error("invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },
    #[error("structured output failed schema validation: {0}")]
    SchemaValidation(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: u32, actual: usize },
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Upstream { .. }
            | ProviderError::Network(_)
            | ProviderError::MalformedResponse(_) => ErrorClass::Retryable,
            ProviderError::Authentication { .. }
            | ProviderError::InvalidRequest { .. }
            | ProviderError::SchemaValidation(_)
            | ProviderError::DimensionMismatch { .. } => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Map a non-success HTTP status from a vendor into an error.
    ///
    /// 408 and 429 are transient, as is anything in the 5xx range. 401/403 are credential
    /// problems and every other 4xx is treated as a malformed request.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = summarize_body(body);
        match status {
            401 | 403 => ProviderError::Authentication { status },
            408 => ProviderError::Timeout(Duration::ZERO),
            429 => ProviderError::RateLimited { retry_after: None },
            500..=599 => ProviderError::Upstream { status, message },
            _ => ProviderError::InvalidRequest { status, message },
        }
    }
}

const MAX_ERROR_BODY_CHARS: usize = 512;

fn summarize_body(body: &str) -> String {
    // OpenAI-compatible vendors put the useful part in error.message
    let extracted = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.trim().to_owned());
    extracted.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Errors the retry executor knows how to classify and synthesise.
pub trait RetryableError: fmt::Display {
    fn class(&self) -> ErrorClass;

    /// The error reported when an attempt is abandoned because a deadline passed.
    fn timed_out(after: Duration) -> Self;

    /// How long the provider asked callers to wait before trying again.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for ProviderError {
    fn class(&self) -> ErrorClass {
        ProviderError::class(self)
    }

    fn timed_out(after: Duration) -> Self {
        ProviderError::Timeout(after)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The last error from an exhausted or aborted retry loop.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error} (after {attempts} attempt(s) in {elapsed:?})")]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// One role's entry in an orchestration's attempt log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The role's circuit denied the call; no request was made.
    CircuitOpen,
    Failed {
        class: ErrorClass,
        error: String,
        attempts: u32,
    },
    Succeeded {
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub role: ProviderRole,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
}

impl AttemptSummary {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded { .. })
    }
}

/// Every role in a fallback chain failed or was skipped.
#[derive(Debug, Clone, Serialize)]
pub struct AllProvidersFailed {
    pub attempts: Vec<AttemptSummary>,
    pub elapsed_ms: u64,
}

impl fmt::Display for AllProvidersFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "all providers failed: no provider was available");
        }
        write!(f, "all providers failed: ")?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            match &attempt.outcome {
                AttemptOutcome::CircuitOpen => write!(f, "{}: circuit open", attempt.role)?,
                AttemptOutcome::Failed { error, .. } => write!(f, "{}: {}", attempt.role, error)?,
                AttemptOutcome::Succeeded { .. } => write!(f, "{}: succeeded", attempt.role)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for AllProvidersFailed {}

/// Failures surfaced by the provider layer to application code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("no credentials configured for provider role {0}")]
    ProviderUnavailable(ProviderRole),
    #[error("circuit for provider role {role} is open, retry in {retry_in:?}")]
    CircuitOpen {
        role: ProviderRole,
        retry_in: Duration,
    },
    #[error(
        "context too large for provider role {role}: system prompt needs {required_tokens} tokens, budget is {budget_tokens}"
    )]
    ContextTooLarge {
        role: ProviderRole,
        required_tokens: u64,
        budget_tokens: u64,
    },
    #[error(transparent)]
    AllProvidersFailed(#[from] AllProvidersFailed),
}

impl CoreError {
    /// Whether the error is terminal for the caller (no further fallback is possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoreError::ContextTooLarge { .. } | CoreError::AllProvidersFailed(_)
        )
    }
}
