//! Background health monitor
//!
//! On a fixed interval every credentialed role gets one minimal request (a one-token completion or
//! a one-word embedding). Probe outcomes feed the circuit breakers like any other call, and a probe
//! against an open circuit acts as its half-open trial, so a recovered provider closes its circuit
//! without waiting for user traffic.
//!
//! Snapshots are published through an [`ArcSwap`]: readers never block, and each cycle replaces
//! the whole map.
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitStatus};
use crate::errors::ProviderError;
use crate::models::{ChatMessage, CompletionRequest};
use crate::providers::{ProviderRegistry, ProviderRole};
use arc_swap::ArcSwap;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Builder)]
pub struct HealthMonitorConfig {
    #[builder(default = Duration::from_secs(60))]
    pub interval: Duration,
    /// Fixed deadline for each probe, independent of user retry policies.
    #[builder(default = Duration::from_secs(10))]
    pub probe_timeout: Duration,
    /// Weight of the newest sample in the rolling response time.
    #[builder(default = 0.3)]
    pub latency_smoothing: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub model_id: String,
    pub circuit: CircuitStatus,
    /// Exponentially weighted average of successful probe latencies.
    pub avg_response_time_ms: Option<f64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub type HealthReport = BTreeMap<ProviderRole, HealthSnapshot>;

enum ProbeOutcome {
    Healthy(Duration),
    Unhealthy(String),
    /// Another trial already holds the circuit.
    Skipped,
}

#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: HealthMonitorConfig,
    snapshots: ArcSwap<HealthReport>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            config,
            snapshots: ArcSwap::from_pointee(HealthReport::new()),
        }
    }

    /// The snapshot from the most recent probe cycle, with live circuit state.
    pub fn get_health_snapshot(&self) -> HealthReport {
        let mut report = HealthReport::clone(&self.snapshots.load());
        for (role, snapshot) in report.iter_mut() {
            snapshot.circuit = self.breakers.status(*role);
        }
        // Roles not probed yet still report their circuit
        for role in self.registry.available_providers() {
            report
                .entry(role)
                .or_insert_with(|| self.blank_snapshot(role));
        }
        report
    }

    /// Probe every credentialed role once, concurrently, and publish a new snapshot.
    #[instrument(skip(self))]
    pub async fn run_probe_cycle(&self) {
        let roles: Vec<ProviderRole> = self.registry.available_providers().into_iter().collect();
        let outcomes = join_all(roles.iter().map(|&role| self.probe(role))).await;

        let previous = self.snapshots.load_full();
        let checked_at = Utc::now();
        let mut next = HealthReport::new();
        for (role, outcome) in roles.into_iter().zip(outcomes) {
            let mut snapshot = previous
                .get(&role)
                .cloned()
                .unwrap_or_else(|| self.blank_snapshot(role));
            match outcome {
                ProbeOutcome::Healthy(latency) => {
                    snapshot.avg_response_time_ms = Some(smooth_latency(
                        snapshot.avg_response_time_ms,
                        latency.as_secs_f64() * 1000.0,
                        self.config.latency_smoothing,
                    ));
                    snapshot.last_success_at = Some(checked_at);
                    snapshot.last_checked_at = Some(checked_at);
                    snapshot.last_error = None;
                }
                ProbeOutcome::Unhealthy(error) => {
                    snapshot.last_checked_at = Some(checked_at);
                    snapshot.last_error = Some(error);
                }
                ProbeOutcome::Skipped => {}
            }
            snapshot.circuit = self.breakers.status(role);
            next.insert(role, snapshot);
        }

        let unhealthy = next.values().filter(|s| s.last_error.is_some()).count();
        info!(
            providers = next.len(),
            unhealthy, "Health probe cycle complete"
        );
        self.snapshots.store(Arc::new(next));
    }

    fn blank_snapshot(&self, role: ProviderRole) -> HealthSnapshot {
        HealthSnapshot {
            model_id: self
                .registry
                .metadata(role)
                .map(|m| m.model_id.clone())
                .unwrap_or_default(),
            circuit: self.breakers.status(role),
            avg_response_time_ms: None,
            last_success_at: None,
            last_checked_at: None,
            last_error: None,
        }
    }

    async fn probe(&self, role: ProviderRole) -> ProbeOutcome {
        let Some(permit) = self.breakers.begin_probe(role) else {
            debug!(role = %role, "Skipping probe, a trial is already in flight");
            return ProbeOutcome::Skipped;
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.probe_timeout, self.send_probe(role))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.probe_timeout)),
        };

        match result {
            Ok(()) => {
                permit.record_success();
                let latency = started.elapsed();
                debug!(role = %role, latency_ms = latency.as_millis() as u64, "Probe succeeded");
                ProbeOutcome::Healthy(latency)
            }
            Err(e) => {
                permit.record_failure();
                warn!(role = %role, "Probe failed: {}", e);
                ProbeOutcome::Unhealthy(e.to_string())
            }
        }
    }

    async fn send_probe(&self, role: ProviderRole) -> Result<(), ProviderError> {
        if role.is_embedding() {
            let model = self
                .registry
                .get_embedding(role)
                .map_err(|e| ProviderError::Network(e.to_string()))?;
            model.embed(&["ping".to_string()]).await?;
        } else {
            let model = self
                .registry
                .get_model(role)
                .map_err(|e| ProviderError::Network(e.to_string()))?;
            let request = CompletionRequest {
                system_prompt: String::new(),
                messages: vec![ChatMessage::user("ping")],
                max_output_tokens: Some(1),
                temperature: Some(0.0),
                output_schema: None,
            };
            model.complete(&request).await?;
        }
        Ok(())
    }

    /// Run probe cycles on the configured interval until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval.as_secs(),
                "Health monitor started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Health monitor stopping");
                        break;
                    }
                    _ = interval.tick() => self.run_probe_cycle().await,
                }
            }
        })
    }
}

/// Exponentially weighted moving average; the first sample seeds the average.
fn smooth_latency(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    match previous {
        Some(avg) => alpha * sample + (1.0 - alpha) * avg,
        None => sample,
    }
}
