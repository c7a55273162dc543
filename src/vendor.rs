//! OpenAI-compatible vendor adapter
//!
//! OpenAI, Anthropic and Google all expose `/chat/completions` and `/embeddings` endpoints in the
//! OpenAI format, so a single adapter covers every role. The adapter builds the upstream request,
//! sends it through an [`HttpClient`], and turns the response into either a typed result or a
//! classified [`ProviderError`].
use crate::client::HttpClient;
use crate::errors::ProviderError;
use crate::models::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Completion, CompletionRequest,
    EmbeddingRequest, EmbeddingResponse, Embeddings, JsonSchemaFormat, ResponseFormat,
};
use crate::providers::{EmbeddingModel, LanguageModel, VendorCredential};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, header};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Upper bound on a buffered upstream response body.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

pub struct OpenAiCompatible<T: HttpClient> {
    http_client: T,
    credential: VendorCredential,
    model_id: String,
    embedding_dimensions: Option<u32>,
}

impl<T: HttpClient> std::fmt::Debug for OpenAiCompatible<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatible")
            .field("base_url", &self.credential.base_url.as_str())
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl<T: HttpClient + Send + Sync> OpenAiCompatible<T> {
    pub fn new(
        http_client: T,
        credential: VendorCredential,
        model_id: String,
        embedding_dimensions: Option<u32>,
    ) -> Self {
        Self {
            http_client,
            credential,
            model_id,
            embedding_dimensions,
        }
    }

    async fn post_json<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = self
            .credential
            .base_url
            .join(path)
            .map_err(|e| ProviderError::InvalidRequest {
                status: 0,
                message: format!("invalid upstream URL: {e}"),
            })?;
        let payload = serde_json::to_vec(body).map_err(|e| ProviderError::InvalidRequest {
            status: 0,
            message: format!("failed to serialize request: {e}"),
        })?;

        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.credential.api_key),
            )
            .body(Body::from(payload))
            .map_err(|e| ProviderError::InvalidRequest {
                status: 0,
                message: format!("failed to build request: {e}"),
            })?;

        let response = self.http_client.request(req).await.map_err(|e| {
            error!("Error sending request to {}: {}", url, e);
            ProviderError::Network(e.to_string())
        })?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let bytes = axum::body::to_bytes(response.into_body(), MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| ProviderError::Network(format!("failed to read response body: {e}")))?;

        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        let body = String::from_utf8_lossy(&bytes);
        debug!("Upstream {} returned {}: {}", url, status, body);
        Err(match ProviderError::from_status(status.as_u16(), &body) {
            ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
            other => other,
        })
    }
}

fn retry_after(headers: &axum::http::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl<T: HttpClient + Send + Sync> LanguageModel for OpenAiCompatible<T> {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    #[instrument(skip(self, request), fields(model = %self.model_id))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let system = ChatMessage::system(request.system_prompt.as_str());
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(&system);
        }
        messages.extend(request.messages.iter());

        let body = ChatCompletionRequest {
            model: &self.model_id,
            messages,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            response_format: request
                .output_schema
                .as_ref()
                .map(|schema| ResponseFormat::JsonSchema {
                    json_schema: JsonSchemaFormat {
                        name: &schema.name,
                        schema: &schema.schema,
                        strict: true,
                    },
                }),
        };

        let bytes = self.post_json("chat/completions", &body).await?;
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("response has no choices".into()))?;
        if choice.finish_reason.as_deref() == Some("length") {
            debug!("Completion was truncated at max_tokens");
        }
        let content = choice.message.content.unwrap_or_default();

        Ok(Completion {
            content,
            usage: parsed.usage,
        })
    }
}

#[async_trait]
impl<T: HttpClient + Send + Sync> EmbeddingModel for OpenAiCompatible<T> {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    #[instrument(skip(self, inputs), fields(model = %self.model_id, inputs = inputs.len()))]
    async fn embed(&self, inputs: &[String]) -> Result<Embeddings, ProviderError> {
        let body = EmbeddingRequest {
            model: &self.model_id,
            input: inputs,
            dimensions: self.embedding_dimensions,
        };
        let bytes = self.post_json("embeddings", &body).await?;
        let mut parsed: EmbeddingResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if parsed.data.len() != inputs.len() {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);

        Ok(Embeddings {
            vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
            usage: parsed.usage,
        })
    }
}
