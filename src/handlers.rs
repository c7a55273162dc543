/// Axum handlers for the status and generation endpoints
use crate::AppState;
use crate::auth::AuthError;
use crate::circuit_breaker::CircuitStatus;
use crate::errors::CoreError;
use crate::fallback::GenerateOptions;
use crate::models::{ChatMessage, OutputSchema};
use crate::providers::{ProviderMetadata, ProviderRole};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Serialize)]
pub struct ProviderEntry<'a> {
    pub role: ProviderRole,
    #[serde(flatten)]
    pub metadata: &'a ProviderMetadata,
    pub circuit: CircuitStatus,
}

#[derive(Debug, Serialize)]
pub struct ListProvidersResponse<'a> {
    pub object: &'static str,
    pub data: Vec<ProviderEntry<'a>>,
}

#[instrument(skip(state))]
pub async fn list_providers(State(state): State<AppState>) -> Response {
    let registry = state.chain.registry();
    let breakers = state.chain.breakers();
    let data = registry
        .available_providers()
        .into_iter()
        .filter_map(|role| {
            registry.metadata(role).map(|metadata| ProviderEntry {
                role,
                metadata,
                circuit: breakers.status(role),
            })
        })
        .collect();
    Json(ListProvidersResponse {
        object: "list",
        data,
    })
    .into_response()
}

/// Latest health snapshot. Responds 503 when no provider is configured at all.
#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> Response {
    let providers = state.health.get_health_snapshot();
    let (status, label) = if !state.chain.registry().has_any_provider() {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else if providers.values().any(|s| s.last_error.is_some()) {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        status,
        Json(json!({
            "status": label,
            "providers": providers,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system_prompt: String,
    /// Role priority; defaults to primary, fallback1, fallback2.
    #[serde(default)]
    pub roles: Option<Vec<ProviderRole>>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// When set, the response carries the parsed JSON object instead of free text.
    #[serde(default)]
    pub response_schema: Option<OutputSchema>,
    /// Outer deadline for the whole fallback chain.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[instrument(skip(state, headers, request))]
pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let user_id = if state.auth.is_enabled() {
        Some(state.auth.require_auth(&headers)?)
    } else {
        None
    };
    if request.messages.is_empty() {
        return Err(ApiError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let roles = request
        .roles
        .unwrap_or_else(|| ProviderRole::TEXT_CHAIN.to_vec());
    if let Some(role) = roles.iter().find(|r| r.is_embedding()) {
        return Err(ApiError::InvalidRequest(format!(
            "{role} is an embedding role and cannot generate text"
        )));
    }

    let cancel = CancellationToken::new();
    let deadline = request.timeout_ms.map(|ms| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            debug!(timeout_ms = ms, "Generation deadline reached");
            cancel.cancel();
        })
    });
    let options = GenerateOptions {
        max_output_tokens: request.max_output_tokens,
        temperature: request.temperature,
        retry_policy: None,
        user_id,
        cancel,
    };

    let result = match request.response_schema {
        Some(schema) => state
            .chain
            .generate_structured_output::<serde_json::Value>(
                &request.messages,
                &request.system_prompt,
                schema,
                &roles,
                &options,
            )
            .await
            .map(|generation| Json(generation).into_response()),
        None => state
            .chain
            .generate_text(&request.messages, &request.system_prompt, &roles, &options)
            .await
            .map(|generation| Json(generation).into_response()),
    };
    if let Some(deadline) = deadline {
        deadline.abort();
    }
    Ok(result?)
}

/// Errors returned by the HTTP surface, rendered in the OpenAI error format.
#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    Core(CoreError),
    InvalidRequest(String),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(e) => {
                debug!("Rejected request: {}", e);
                error_response(
                    StatusCode::UNAUTHORIZED,
                    "authentication_error",
                    &e.to_string(),
                )
            }
            ApiError::InvalidRequest(message) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request_error", &message)
            }
            ApiError::Core(e @ CoreError::ContextTooLarge { .. }) => error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "context_length_exceeded",
                &e.to_string(),
            ),
            ApiError::Core(CoreError::AllProvidersFailed(failure)) => {
                warn!("Generation failed on every provider");
                let body = json!({
                    "error": {
                        "type": "providers_unavailable",
                        "message": failure.to_string(),
                        "attempts": failure.attempts,
                    }
                });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
            ApiError::Core(e) => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "providers_unavailable",
                &e.to_string(),
            ),
        }
    }
}

/// Create an OpenAI-compatible error response
fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = json!({
        "error": {
            "type": error_type,
            "message": message
        }
    });

    (status, Json(body)).into_response()
}
