//! Configuration parsing and validation for the status server
//!
//! Every option can be given on the command line or through a `STEADFAST_*` environment variable.
//! Vendor credentials are not part of this struct: they are read from the vendors' own variables
//! by `ProviderCredentials::from_env`.
use anyhow::anyhow;
use clap::Parser;
use std::time::Duration;
use steadfast::auth::KeyRing;
use steadfast::circuit_breaker::CircuitBreakerConfig;
use steadfast::client::PoolConfig;
use steadfast::health::HealthMonitorConfig;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the status server will listen.
    #[arg(short = 'p', long, env = "STEADFAST_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "STEADFAST_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "STEADFAST_METRICS", default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, env = "STEADFAST_METRICS_PREFIX", default_value = "steadfast")]
    pub metrics_prefix: String,

    /// Seconds between health probe cycles.
    #[arg(long, env = "STEADFAST_PROBE_INTERVAL_SECS", default_value_t = 60)]
    pub probe_interval_secs: u64,

    /// Deadline in seconds for a single health probe.
    #[arg(long, env = "STEADFAST_PROBE_TIMEOUT_SECS", default_value_t = 10)]
    pub probe_timeout_secs: u64,

    /// Consecutive failures that open a provider's circuit.
    #[arg(long, env = "STEADFAST_CIRCUIT_THRESHOLD", default_value_t = 5)]
    pub circuit_threshold: u32,

    /// Seconds an open circuit waits before allowing a trial request.
    #[arg(long, env = "STEADFAST_CIRCUIT_COOLDOWN_SECS", default_value_t = 30)]
    pub circuit_cooldown_secs: u64,

    /// Upper bound in seconds for the cooldown as failed trials grow it.
    #[arg(long, env = "STEADFAST_CIRCUIT_MAX_COOLDOWN_SECS", default_value_t = 300)]
    pub circuit_max_cooldown_secs: u64,

    /// Tokens held back from each model's context window for the response.
    #[arg(long, env = "STEADFAST_RESERVED_OUTPUT_TOKENS", default_value_t = 2000)]
    pub reserved_output_tokens: u64,

    /// Maximum number of idle HTTP connections to keep alive per vendor host.
    #[arg(long, env = "STEADFAST_POOL_MAX_IDLE_PER_HOST", default_value_t = 32)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, env = "STEADFAST_POOL_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    /// API keys for the generation endpoint as `user_id=key`. Without any, the endpoint is open.
    #[arg(
        long = "auth-key",
        env = "STEADFAST_AUTH_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub auth_keys: Vec<String>,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.circuit_threshold == 0 {
            return Err(anyhow!("circuit threshold must be at least 1"));
        }
        if self.circuit_max_cooldown_secs < self.circuit_cooldown_secs {
            return Err(anyhow!(
                "circuit max cooldown ({}s) is shorter than the base cooldown ({}s)",
                self.circuit_max_cooldown_secs,
                self.circuit_cooldown_secs
            ));
        }
        if self.probe_interval_secs == 0 || self.probe_timeout_secs == 0 {
            return Err(anyhow!("probe interval and timeout must be positive"));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "metrics port {} clashes with the server port",
                self.metrics_port
            ));
        }
        self.key_ring()?;
        Ok(self)
    }

    pub fn key_ring(&self) -> Result<KeyRing, anyhow::Error> {
        Ok(KeyRing::from_entries(&self.auth_keys)?)
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.circuit_threshold)
            .cooldown(Duration::from_secs(self.circuit_cooldown_secs))
            .max_cooldown(Duration::from_secs(self.circuit_max_cooldown_secs))
            .build()
    }

    pub fn health_monitor(&self) -> HealthMonitorConfig {
        HealthMonitorConfig::builder()
            .interval(Duration::from_secs(self.probe_interval_secs))
            .probe_timeout(Duration::from_secs(self.probe_timeout_secs))
            .build()
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            max_idle_per_host: self.pool_max_idle_per_host,
        }
    }
}
