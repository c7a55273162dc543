//! Steadfast - a resilient multi-provider LLM client
//!
//! This library sits between application code and upstream AI vendors. Requests walk an ordered
//! chain of provider roles; each role is guarded by a circuit breaker, wrapped in bounded
//! exponential-backoff retries and trimmed to its context window before the call is made. A
//! background health monitor probes every configured role and publishes a lock-free snapshot.
//!
//! The same crate ships a small HTTP server exposing provider status, health and a generation
//! endpoint.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod context;
pub mod errors;
pub mod fallback;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod models;
pub mod providers;
pub mod retry;
pub mod traits;
pub mod vendor;

use auth::KeyRing;
use fallback::FallbackChain;
use handlers::{generate, health as health_handler, list_providers};
use health::HealthMonitor;

/// Shared state for the HTTP handlers
#[derive(Clone, Debug)]
pub struct AppState {
    pub chain: Arc<FallbackChain>,
    pub health: Arc<HealthMonitor>,
    pub auth: Arc<KeyRing>,
}

impl AppState {
    pub fn new(chain: FallbackChain, health: Arc<HealthMonitor>, auth: KeyRing) -> Self {
        Self {
            chain: Arc::new(chain),
            health,
            auth: Arc::new(auth),
        }
    }
}

/// Build the main router
/// This creates routes for:
/// - `/v1/providers` - Configured provider roles with metadata and circuit state
/// - `/v1/health` - The latest health snapshot
/// - `/v1/generate` - Text or structured generation through the fallback chain
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/providers", get(list_providers))
        .route("/v1/health", get(health_handler))
        .route("/v1/generate", post(generate))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The prefix must live for the whole program, hence `Cow<'static, str>`: pass a literal or an
/// owned string.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

#[cfg(test)]
pub mod test_utils {
    use crate::client::HttpClient;
    use crate::errors::ProviderError;
    use crate::logging::RequestLogRecord;
    use crate::models::{Completion, CompletionRequest, Embeddings, TokenUsage};
    use crate::providers::{EmbeddingModel, LanguageModel};
    use crate::traits::{RequestLogStore, StoreError};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        status: StatusCode,
        body: String,
        headers: Vec<(String, String)>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                status,
                body: body.to_string(),
                headers: Vec::new(),
            }
        }

        pub fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("status", &self.status)
                .finish()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            // Extract request details
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            // Read body
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            let mut response = axum::response::Response::builder().status(self.status);
            for (name, value) in &self.headers {
                response = response.header(name, value);
            }
            Ok(response
                .body(axum::body::Body::from(self.body.clone()))
                .unwrap())
        }
    }

    /// A chat model that replays a script of results. The last entry repeats once the script
    /// runs out.
    #[derive(Debug)]
    pub struct ScriptedModel {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        delay: Option<Duration>,
        calls: AtomicU32,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl ScriptedModel {
        pub fn sequence(script: Vec<Result<String, ProviderError>>) -> Self {
            assert!(!script.is_empty(), "script needs at least one result");
            Self {
                script: Mutex::new(script.into()),
                delay: None,
                calls: AtomicU32::new(0),
                last_request: Mutex::new(None),
            }
        }

        pub fn always_ok(content: &str) -> Self {
            Self::sequence(vec![Ok(content.to_string())])
        }

        pub fn always_err(error: ProviderError) -> Self {
            Self::sequence(vec![Err(error)])
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_request(&self) -> Option<CompletionRequest> {
            self.last_request.lock().unwrap().clone()
        }

        fn next_result(&self) -> Result<String, ProviderError> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next_result().map(|content| Completion {
                content,
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
            })
        }
    }

    /// An embedding model returning constant vectors of a fixed length.
    #[derive(Debug)]
    pub struct ScriptedEmbedding {
        dimensions: usize,
        calls: AtomicU32,
    }

    impl ScriptedEmbedding {
        pub fn new(dimensions: usize) -> Self {
            Self {
                dimensions,
                calls: AtomicU32::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingModel for ScriptedEmbedding {
        fn model_id(&self) -> &str {
            "scripted-embedding"
        }

        async fn embed(&self, inputs: &[String]) -> Result<Embeddings, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Embeddings {
                vectors: inputs.iter().map(|_| vec![0.5; self.dimensions]).collect(),
                usage: Some(TokenUsage {
                    prompt_tokens: inputs.len() as u64,
                    completion_tokens: 0,
                    total_tokens: inputs.len() as u64,
                }),
            })
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryLogStore {
        records: Mutex<Vec<RequestLogRecord>>,
    }

    impl MemoryLogStore {
        pub fn records(&self) -> Vec<RequestLogRecord> {
            self.records.lock().unwrap().clone()
        }

        /// Records are written from detached tasks; poll until `count` have arrived.
        pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<RequestLogRecord> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let records = self.records();
                if records.len() >= count || tokio::time::Instant::now() >= deadline {
                    return records;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[async_trait]
    impl RequestLogStore for MemoryLogStore {
        async fn log_request(&self, record: &RequestLogRecord) -> Result<(), StoreError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }
}
