//! Fallback chain orchestration
//!
//! A request walks a caller-supplied list of roles strictly in order. For each role:
//!
//! 1. roles without a credential, or that cannot serve the operation, are skipped without a
//!    trace in the attempt log,
//! 2. the conversation is trimmed to the role's context budget,
//! 3. the circuit breaker decides whether the role may be called at all,
//! 4. the call runs inside [`with_retry`] with a role-appropriate policy,
//! 5. the outcome is reported to the circuit breaker and the request logger.
//!
//! The first success ends the walk. If every role fails, the caller gets
//! [`AllProvidersFailed`] with one entry per role that was considered.
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::context::ContextWindowManager;
use crate::errors::{
    AllProvidersFailed, AttemptOutcome, AttemptSummary, CoreError, ErrorClass, ProviderError,
};
use crate::logging::{Operation, RequestLogRecord, RequestLogger};
use crate::models::{ChatMessage, Completion, CompletionRequest, OutputSchema, TokenUsage};
use crate::providers::{
    EmbeddingHandle, ModelHandle, ProviderMetadata, ProviderRegistry, ProviderRole,
};
use crate::retry::{RetryPolicy, with_retry};
use bon::Builder;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

/// Per-call knobs shared by every generation entry point.
#[derive(Debug, Clone, Default, Builder)]
pub struct GenerateOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Replaces the role-derived retry policy for every role in the chain.
    pub retry_policy: Option<RetryPolicy>,
    /// Attached to request-log records.
    #[builder(into)]
    pub user_id: Option<String>,
    /// Cancelling aborts the in-flight vendor call and stops the chain.
    #[builder(default)]
    pub cancel: CancellationToken,
}

/// Outcome of one full orchestration.
#[derive(Debug, Clone)]
pub struct FallbackResult<T> {
    pub output: T,
    pub provider_used: ProviderRole,
    /// Every role considered, in the order they were considered.
    pub attempts: Vec<AttemptSummary>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextGeneration {
    pub content: String,
    pub provider_used: ProviderRole,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuredGeneration<T> {
    pub parsed: T,
    pub provider_used: ProviderRole,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingGeneration {
    pub vectors: Vec<Vec<f32>>,
    pub provider_used: ProviderRole,
    pub latency_ms: u64,
}

type PreparedCompletion = (ModelHandle, Arc<CompletionRequest>);

/// A successful provider call plus the usage to bill for it.
struct Metered<T> {
    value: T,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct FallbackChain {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    context: ContextWindowManager,
    logger: RequestLogger,
}

impl FallbackChain {
    pub fn new(registry: Arc<ProviderRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            registry,
            breakers,
            context: ContextWindowManager::default(),
            logger: RequestLogger::default(),
        }
    }

    pub fn with_context_manager(mut self, context: ContextWindowManager) -> Self {
        self.context = context;
        self
    }

    pub fn with_logger(mut self, logger: RequestLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Complete a conversation using the first role in `role_order` that succeeds.
    #[instrument(skip_all, fields(roles = ?role_order))]
    pub async fn execute_with_fallback(
        &self,
        messages: &[ChatMessage],
        system_prompt: &str,
        role_order: &[ProviderRole],
        options: &GenerateOptions,
    ) -> Result<FallbackResult<Completion>, CoreError> {
        self.run_chain(
            Operation::Text,
            role_order,
            options,
            self.completion_preparer(messages, system_prompt, None, options),
            |(model, request): PreparedCompletion| async move {
                let completion = model.complete(&request).await?;
                Ok(Metered {
                    usage: completion.usage,
                    value: completion,
                })
            },
        )
        .await
    }

    pub async fn generate_text(
        &self,
        messages: &[ChatMessage],
        system_prompt: &str,
        role_order: &[ProviderRole],
        options: &GenerateOptions,
    ) -> Result<TextGeneration, CoreError> {
        let result = self
            .execute_with_fallback(messages, system_prompt, role_order, options)
            .await?;
        Ok(TextGeneration {
            latency_ms: millis(result.elapsed),
            provider_used: result.provider_used,
            usage: result.output.usage,
            content: result.output.content,
        })
    }

    /// Generate output conforming to `schema` and deserialize it into `T`.
    ///
    /// Output that is not valid JSON for `T` fails that role with
    /// [`ProviderError::SchemaValidation`], which is not retried; the chain moves to the next role.
    #[instrument(skip_all, fields(schema = %schema.name, roles = ?role_order))]
    pub async fn generate_structured_output<T>(
        &self,
        messages: &[ChatMessage],
        system_prompt: &str,
        schema: OutputSchema,
        role_order: &[ProviderRole],
        options: &GenerateOptions,
    ) -> Result<StructuredGeneration<T>, CoreError>
    where
        T: DeserializeOwned + Send,
    {
        let result = self
            .run_chain(
                Operation::Structured,
                role_order,
                options,
                self.completion_preparer(messages, system_prompt, Some(schema), options),
                |(model, request): PreparedCompletion| async move {
                    let completion = model.complete(&request).await?;
                    let parsed = parse_structured::<T>(&completion.content)?;
                    Ok(Metered {
                        value: parsed,
                        usage: completion.usage,
                    })
                },
            )
            .await?;
        Ok(StructuredGeneration {
            parsed: result.output,
            provider_used: result.provider_used,
            latency_ms: millis(result.elapsed),
        })
    }

    /// Embed `inputs` with the first embedding role in `role_order` that succeeds.
    ///
    /// Vectors whose length differs from the role's configured dimensionality fail that role with
    /// [`ProviderError::DimensionMismatch`].
    #[instrument(skip_all, fields(inputs = inputs.len(), roles = ?role_order))]
    pub async fn generate_embeddings(
        &self,
        inputs: &[String],
        role_order: &[ProviderRole],
        options: &GenerateOptions,
    ) -> Result<EmbeddingGeneration, CoreError> {
        let inputs: Arc<[String]> = inputs.into();
        let result = self
            .run_chain(
                Operation::Embedding,
                role_order,
                options,
                |role, metadata| {
                    let model = self.registry.get_embedding(role)?;
                    Ok((model, metadata.embedding_dimensions))
                },
                |(model, expected): (EmbeddingHandle, Option<u32>)| {
                    let inputs = Arc::clone(&inputs);
                    async move {
                        let embeddings = model.embed(&inputs).await?;
                        if let Some(expected) = expected
                            && let Some(bad) = embeddings
                                .vectors
                                .iter()
                                .find(|v| v.len() != expected as usize)
                        {
                            return Err(ProviderError::DimensionMismatch {
                                expected,
                                actual: bad.len(),
                            });
                        }
                        Ok(Metered {
                            usage: embeddings.usage,
                            value: embeddings.vectors,
                        })
                    }
                },
            )
            .await?;
        Ok(EmbeddingGeneration {
            vectors: result.output,
            provider_used: result.provider_used,
            latency_ms: millis(result.elapsed),
        })
    }

    /// Per-role preparation for chat roles: look up the model and trim the conversation to its
    /// context budget.
    fn completion_preparer<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        system_prompt: &'a str,
        schema: Option<OutputSchema>,
        options: &'a GenerateOptions,
    ) -> impl FnMut(ProviderRole, &ProviderMetadata) -> Result<PreparedCompletion, CoreError> + 'a
    {
        move |role, metadata| {
            let model = self.registry.get_model(role)?;
            let trimmed = self
                .context
                .trim_to_fit(messages, system_prompt, role, metadata)?;
            let request = Arc::new(CompletionRequest {
                system_prompt: system_prompt.to_string(),
                messages: trimmed,
                max_output_tokens: options.max_output_tokens,
                temperature: options.temperature,
                output_schema: schema.clone(),
            });
            Ok((model, request))
        }
    }

    /// Walk `role_order`, returning the first success.
    ///
    /// `prepare` runs once per role before the circuit is consulted and builds whatever the call
    /// needs. A role it reports as unavailable is skipped. Any other error is returned to the
    /// caller when it comes from the first role considered; later in the walk it is recorded as
    /// that role's failure so the attempts made so far are kept. `call` runs once per attempt
    /// with a clone of the prepared value.
    ///
    /// The circuit permit lives across the retried call, so a walk that is dropped mid-call hands
    /// a half-open trial back to the breaker.
    async fn run_chain<R, T, P, F, Fut>(
        &self,
        operation: Operation,
        role_order: &[ProviderRole],
        options: &GenerateOptions,
        mut prepare: P,
        call: F,
    ) -> Result<FallbackResult<T>, CoreError>
    where
        R: Clone,
        P: FnMut(ProviderRole, &ProviderMetadata) -> Result<R, CoreError>,
        F: Fn(R) -> Fut,
        Fut: Future<Output = Result<Metered<T>, ProviderError>>,
    {
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(role_order.len());

        for &role in role_order {
            if options.cancel.is_cancelled() {
                debug!("Request cancelled, not trying further providers");
                break;
            }
            let Some(metadata) = self.registry.metadata(role) else {
                debug!(role = %role, "Skipping provider without credentials");
                continue;
            };
            let prepared = match prepare(role, metadata) {
                Ok(prepared) => prepared,
                Err(CoreError::ProviderUnavailable(_)) => {
                    debug!(role = %role, "Skipping provider that cannot serve {:?}", operation);
                    continue;
                }
                Err(e) if attempts.is_empty() => return Err(e),
                // Earlier roles were already tried, keep their record
                Err(e) => {
                    let summary = AttemptSummary {
                        role,
                        outcome: AttemptOutcome::Failed {
                            class: ErrorClass::Fatal,
                            error: e.to_string(),
                            attempts: 0,
                        },
                        latency_ms: 0,
                    };
                    self.log(operation, metadata, &summary, None, options);
                    attempts.push(summary);
                    continue;
                }
            };

            let Some(permit) = self.breakers.allow_request(role) else {
                let summary = AttemptSummary {
                    role,
                    outcome: AttemptOutcome::CircuitOpen,
                    latency_ms: 0,
                };
                self.log(operation, metadata, &summary, None, options);
                attempts.push(summary);
                continue;
            };

            let role_started = Instant::now();
            let policy = options
                .retry_policy
                .clone()
                .unwrap_or_else(|| policy_for(role, operation));
            let result = with_retry(&policy, &options.cancel, |_| call(prepared.clone())).await;
            let latency_ms = millis(role_started.elapsed());

            match result {
                Ok(retried) => {
                    permit.record_success();
                    let attempt_count = retried.attempts.len() as u32;
                    let summary = AttemptSummary {
                        role,
                        outcome: AttemptOutcome::Succeeded {
                            attempts: attempt_count,
                        },
                        latency_ms,
                    };
                    self.log(operation, metadata, &summary, retried.value.usage, options);
                    attempts.push(summary);
                    return Ok(FallbackResult {
                        output: retried.value.value,
                        provider_used: role,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Err(failure) => {
                    permit.record_failure();
                    let summary = AttemptSummary {
                        role,
                        outcome: AttemptOutcome::Failed {
                            class: failure.error.class(),
                            error: failure.error.to_string(),
                            attempts: failure.attempts,
                        },
                        latency_ms,
                    };
                    self.log(operation, metadata, &summary, None, options);
                    attempts.push(summary);
                }
            }
        }

        let failure = AllProvidersFailed {
            attempts,
            elapsed_ms: millis(started.elapsed()),
        };
        error!("{}", failure);
        Err(CoreError::AllProvidersFailed(failure))
    }

    fn log(
        &self,
        operation: Operation,
        metadata: &ProviderMetadata,
        summary: &AttemptSummary,
        usage: Option<TokenUsage>,
        options: &GenerateOptions,
    ) {
        self.logger.log_attempt(RequestLogRecord {
            timestamp: Utc::now(),
            operation,
            role: summary.role,
            model_id: Some(metadata.model_id.clone()),
            outcome: summary.outcome.clone(),
            latency_ms: summary.latency_ms,
            usage,
            cost_usd: usage.map(|u| metadata.estimate_cost(&u)),
            user_id: options.user_id.clone(),
        });
    }
}

/// Structured output is the expensive path and gets the conservative policy unless the role
/// is explicitly a fast one.
fn policy_for(role: ProviderRole, operation: Operation) -> RetryPolicy {
    match (operation, role) {
        (Operation::Structured, ProviderRole::Fast) => RetryPolicy::aggressive(),
        (Operation::Structured, _) => RetryPolicy::conservative(),
        _ => RetryPolicy::for_role(role),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Parse model output as JSON, tolerating a surrounding Markdown code fence.
fn parse_structured<T: DeserializeOwned>(content: &str) -> Result<T, ProviderError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| ProviderError::SchemaValidation(e.to_string()))
}
