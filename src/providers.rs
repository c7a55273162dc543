//! Provider registry: maps logical roles onto vendor model handles.
//!
//! Which roles are usable is decided once, at construction, from the vendor credentials that are
//! present. Lookups never touch the network.
use crate::client::HttpClient;
use crate::errors::{CoreError, ProviderError};
use crate::models::{Completion, CompletionRequest, Embeddings, TokenUsage};
use crate::vendor::OpenAiCompatible;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// A logical slot a vendor model is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderRole {
    Primary,
    Fast,
    Reasoning,
    Fallback1,
    Fallback2,
    Embedding,
    EmbeddingLarge,
}

impl ProviderRole {
    pub const ALL: [ProviderRole; 7] = [
        ProviderRole::Primary,
        ProviderRole::Fast,
        ProviderRole::Reasoning,
        ProviderRole::Fallback1,
        ProviderRole::Fallback2,
        ProviderRole::Embedding,
        ProviderRole::EmbeddingLarge,
    ];

    /// The default chain for text generation.
    pub const TEXT_CHAIN: [ProviderRole; 3] = [
        ProviderRole::Primary,
        ProviderRole::Fallback1,
        ProviderRole::Fallback2,
    ];

    pub const EMBEDDING_CHAIN: [ProviderRole; 2] =
        [ProviderRole::Embedding, ProviderRole::EmbeddingLarge];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderRole::Primary => "primary",
            ProviderRole::Fast => "fast",
            ProviderRole::Reasoning => "reasoning",
            ProviderRole::Fallback1 => "fallback1",
            ProviderRole::Fallback2 => "fallback2",
            ProviderRole::Embedding => "embedding",
            ProviderRole::EmbeddingLarge => "embeddingLarge",
        }
    }

    pub fn is_embedding(&self) -> bool {
        matches!(self, ProviderRole::Embedding | ProviderRole::EmbeddingLarge)
    }

    /// The vendor whose model backs this role.
    pub fn vendor(&self) -> Vendor {
        match self {
            ProviderRole::Primary | ProviderRole::Reasoning => Vendor::Anthropic,
            ProviderRole::Fast
            | ProviderRole::Fallback1
            | ProviderRole::Embedding
            | ProviderRole::EmbeddingLarge => Vendor::OpenAi,
            ProviderRole::Fallback2 => Vendor::Google,
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider role '{s}'"))
    }
}

/// An upstream AI vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    OpenAi,
    Anthropic,
    Google,
}

impl Vendor {
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "OPENAI_API_KEY",
            Vendor::Anthropic => "ANTHROPIC_API_KEY",
            Vendor::Google => "GOOGLE_GENERATIVE_AI_API_KEY",
        }
    }

    pub fn base_url_var(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "OPENAI_BASE_URL",
            Vendor::Anthropic => "ANTHROPIC_BASE_URL",
            Vendor::Google => "GOOGLE_GENERATIVE_AI_BASE_URL",
        }
    }

    /// Base URL of the vendor's OpenAI-compatible API. Paths are joined onto it, so it ends in `/`.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "https://api.openai.com/v1/",
            Vendor::Anthropic => "https://api.anthropic.com/v1/",
            Vendor::Google => "https://generativelanguage.googleapis.com/v1beta/openai/",
        }
    }
}

/// Static description of the model behind a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub display_name: String,
    pub vendor: Vendor,
    pub model_id: String,
    /// USD per million input tokens.
    pub input_cost_per_million: f64,
    /// USD per million output tokens.
    pub output_cost_per_million: f64,
    pub context_window: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<u32>,
}

impl ProviderMetadata {
    /// Built-in descriptor for each role.
    pub fn default_for(role: ProviderRole) -> Self {
        let (display_name, model_id, input, output, context_window, dims) = match role {
            ProviderRole::Primary => (
                "Claude Sonnet",
                "claude-sonnet-4-5",
                3.0,
                15.0,
                200_000,
                None,
            ),
            ProviderRole::Fast => ("GPT-4o mini", "gpt-4o-mini", 0.15, 0.6, 128_000, None),
            ProviderRole::Reasoning => (
                "Claude Opus",
                "claude-opus-4-1",
                15.0,
                75.0,
                200_000,
                None,
            ),
            ProviderRole::Fallback1 => ("GPT-4o", "gpt-4o", 2.5, 10.0, 128_000, None),
            ProviderRole::Fallback2 => (
                "Gemini Flash",
                "gemini-2.5-flash",
                0.3,
                2.5,
                1_048_576,
                None,
            ),
            ProviderRole::Embedding => (
                "OpenAI text-embedding-3-small",
                "text-embedding-3-small",
                0.02,
                0.0,
                8_191,
                Some(1536),
            ),
            ProviderRole::EmbeddingLarge => (
                "OpenAI text-embedding-3-large",
                "text-embedding-3-large",
                0.13,
                0.0,
                8_191,
                Some(3072),
            ),
        };
        Self {
            display_name: display_name.to_string(),
            vendor: role.vendor(),
            model_id: model_id.to_string(),
            input_cost_per_million: input,
            output_cost_per_million: output,
            context_window,
            embedding_dimensions: dims,
        }
    }

    /// USD cost of a call with the given usage.
    pub fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_cost_per_million
            + usage.completion_tokens as f64 * self.output_cost_per_million)
            / 1_000_000.0
    }
}

/// Environment variable overriding the model id for a role, e.g. `STEADFAST_MODEL_FALLBACK1`.
pub fn model_override_var(role: ProviderRole) -> String {
    format!("STEADFAST_MODEL_{}", role.as_str().to_ascii_uppercase())
}

/// API key and endpoint for one vendor.
#[derive(Clone)]
pub struct VendorCredential {
    pub api_key: String,
    pub base_url: Url,
}

impl fmt::Debug for VendorCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorCredential")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

/// Vendor credentials and per-role metadata, read once at start-up.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    vendors: HashMap<Vendor, VendorCredential>,
    model_overrides: HashMap<ProviderRole, String>,
}

impl ProviderCredentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build credentials from an arbitrary key lookup. Empty values count as absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut vendors = HashMap::new();
        for vendor in [Vendor::OpenAi, Vendor::Anthropic, Vendor::Google] {
            let Some(api_key) = non_empty(vendor.api_key_var()) else {
                debug!("No credential configured for {:?}", vendor);
                continue;
            };
            let base_url = match non_empty(vendor.base_url_var()).map(|u| parse_base_url(&u)) {
                Some(Ok(url)) => url,
                Some(Err(e)) => {
                    warn!(
                        "Ignoring invalid {}: {}, using default",
                        vendor.base_url_var(),
                        e
                    );
                    default_url(vendor)
                }
                None => default_url(vendor),
            };
            vendors.insert(vendor, VendorCredential { api_key, base_url });
        }

        let model_overrides = ProviderRole::ALL
            .into_iter()
            .filter_map(|role| non_empty(&model_override_var(role)).map(|m| (role, m)))
            .collect();

        Self {
            vendors,
            model_overrides,
        }
    }

    pub fn with_vendor(mut self, vendor: Vendor, api_key: impl Into<String>) -> Self {
        self.vendors.insert(
            vendor,
            VendorCredential {
                api_key: api_key.into(),
                base_url: default_url(vendor),
            },
        );
        self
    }

    pub fn vendor(&self, vendor: Vendor) -> Option<&VendorCredential> {
        self.vendors.get(&vendor)
    }

    pub fn metadata_for(&self, role: ProviderRole) -> ProviderMetadata {
        let mut metadata = ProviderMetadata::default_for(role);
        if let Some(model) = self.model_overrides.get(&role) {
            metadata.model_id = model.clone();
        }
        metadata
    }
}

fn parse_base_url(raw: &str) -> Result<Url, url::ParseError> {
    // Url::join drops the last path segment unless the base ends in '/'
    if raw.ends_with('/') {
        raw.parse()
    } else {
        format!("{raw}/").parse()
    }
}

fn default_url(vendor: Vendor) -> Url {
    Url::parse(vendor.default_base_url()).expect("built-in vendor URLs are valid")
}

/// A chat model bound to a role.
#[async_trait]
pub trait LanguageModel: Send + Sync + fmt::Debug {
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

/// An embedding model bound to a role.
#[async_trait]
pub trait EmbeddingModel: Send + Sync + fmt::Debug {
    fn model_id(&self) -> &str;

    async fn embed(&self, inputs: &[String]) -> Result<Embeddings, ProviderError>;
}

pub type ModelHandle = Arc<dyn LanguageModel>;
pub type EmbeddingHandle = Arc<dyn EmbeddingModel>;

#[derive(Debug, Clone)]
enum Handle {
    Chat(ModelHandle),
    Embedding(EmbeddingHandle),
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    metadata: ProviderMetadata,
    handle: Handle,
}

/// Role -> model lookup table, built once from the configured credentials.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    entries: HashMap<ProviderRole, RegistryEntry>,
}

impl ProviderRegistry {
    /// A registry with no roles available.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bind every role whose vendor has a credential to an OpenAI-compatible adapter.
    pub fn from_credentials<T>(credentials: &ProviderCredentials, http_client: T) -> Self
    where
        T: HttpClient + Clone + Send + Sync + 'static,
    {
        let mut registry = Self::empty();
        for role in ProviderRole::ALL {
            let metadata = credentials.metadata_for(role);
            let Some(credential) = credentials.vendor(metadata.vendor) else {
                continue;
            };
            let adapter = Arc::new(OpenAiCompatible::new(
                http_client.clone(),
                credential.clone(),
                metadata.model_id.clone(),
                metadata.embedding_dimensions,
            ));
            registry = if role.is_embedding() {
                registry.with_embedding(role, metadata, adapter)
            } else {
                registry.with_model(role, metadata, adapter)
            };
        }
        info!(
            "Provider registry initialised with roles: {:?}",
            registry.available_providers()
        );
        registry
    }

    pub fn with_model(
        mut self,
        role: ProviderRole,
        metadata: ProviderMetadata,
        model: ModelHandle,
    ) -> Self {
        self.entries.insert(
            role,
            RegistryEntry {
                metadata,
                handle: Handle::Chat(model),
            },
        );
        self
    }

    pub fn with_embedding(
        mut self,
        role: ProviderRole,
        metadata: ProviderMetadata,
        model: EmbeddingHandle,
    ) -> Self {
        self.entries.insert(
            role,
            RegistryEntry {
                metadata,
                handle: Handle::Embedding(model),
            },
        );
        self
    }

    pub fn get_model(&self, role: ProviderRole) -> Result<ModelHandle, CoreError> {
        match self.entries.get(&role).map(|e| &e.handle) {
            Some(Handle::Chat(model)) => Ok(Arc::clone(model)),
            _ => Err(CoreError::ProviderUnavailable(role)),
        }
    }

    pub fn get_embedding(&self, role: ProviderRole) -> Result<EmbeddingHandle, CoreError> {
        match self.entries.get(&role).map(|e| &e.handle) {
            Some(Handle::Embedding(model)) => Ok(Arc::clone(model)),
            _ => Err(CoreError::ProviderUnavailable(role)),
        }
    }

    pub fn metadata(&self, role: ProviderRole) -> Option<&ProviderMetadata> {
        self.entries.get(&role).map(|e| &e.metadata)
    }

    pub fn is_available(&self, role: ProviderRole) -> bool {
        self.entries.contains_key(&role)
    }

    /// Roles with a credential, in declaration order.
    pub fn available_providers(&self) -> BTreeSet<ProviderRole> {
        self.entries.keys().copied().collect()
    }

    pub fn has_any_provider(&self) -> bool {
        !self.entries.is_empty()
    }
}
