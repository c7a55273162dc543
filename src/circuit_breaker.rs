//! Per-role circuit breakers
//!
//! Each [`ProviderRole`] has a small state machine:
//!
//! ```text
//!   closed --(failures >= threshold)--> open --(cooldown elapsed)--> half-open
//!     ^                                  ^                              |
//!     |                                  +-------(trial fails)---------+
//!     +-----------------------------(trial succeeds)-------------------+
//! ```
//!
//! While half-open exactly one trial request is let through. The check-and-set on that trial slot
//! happens under the role's map entry lock, so concurrent requests cannot both win it. No lock is
//! ever held across a provider call: callers take a [`CallPermit`] from
//! [`CircuitBreakerRegistry::allow_request`], make the call, then report the outcome through the
//! permit. Only the permit that claimed a trial can resolve it, and a trial permit dropped without
//! an outcome hands the trial back instead of leaving the circuit stuck half-open.
use crate::errors::CoreError;
use crate::providers::ProviderRole;
use bon::Builder;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Builder)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    #[builder(default = 5)]
    pub failure_threshold: u32,
    /// Cooldown applied the first time a circuit opens.
    #[builder(default = Duration::from_secs(30))]
    pub cooldown: Duration,
    /// Ceiling for the cooldown as failed trials keep re-opening the circuit.
    #[builder(default = Duration::from_secs(300))]
    pub max_cooldown: Duration,
    /// Growth factor applied to the cooldown on each failed half-open trial.
    #[builder(default = 2.0)]
    pub cooldown_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
    /// Cooldown in effect for the current (or next) open period.
    cooldown: Duration,
    /// Id of the half-open trial currently in flight.
    trial: Option<u64>,
    next_trial: u64,
    last_trial: Option<TrialOutcome>,
}

impl Circuit {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_transition: Instant::now(),
            cooldown,
            trial: None,
            next_trial: 0,
            last_trial: None,
        }
    }

    fn transition(&mut self, role: ProviderRole, to: CircuitState) {
        if self.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                role = %role,
                failures = self.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit transitioning to open"
            ),
            _ => info!(role = %role, "Circuit transitioning to {}", to),
        }
        self.state = to;
        self.last_transition = Instant::now();
    }

    fn claim_trial(&mut self, role: ProviderRole) -> u64 {
        self.transition(role, CircuitState::HalfOpen);
        let id = self.next_trial;
        self.next_trial = self.next_trial.wrapping_add(1);
        self.trial = Some(id);
        id
    }

    fn holds_trial(&self, trial: Option<u64>) -> bool {
        trial.is_some() && self.trial == trial
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_transition.elapsed() >= self.cooldown
    }

    fn retry_in(&self) -> Duration {
        self.cooldown.saturating_sub(self.last_transition.elapsed())
    }
}

/// Serializable view of one role's circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
    /// Time until an open circuit admits a trial; zero unless open.
    pub retry_in_ms: u64,
    pub seconds_since_last_failure: Option<u64>,
    pub seconds_since_transition: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trial: Option<TrialOutcome>,
}

/// Permission to make one call to a role.
///
/// Report how the call went with [`CallPermit::record_success`] or
/// [`CallPermit::record_failure`]. A trial permit dropped without an outcome, because the future
/// driving the call was cancelled, re-opens the circuit without growing its cooldown and frees the
/// trial slot for the next caller.
#[must_use = "a trial permit dropped without an outcome abandons the trial"]
pub struct CallPermit {
    breakers: Arc<CircuitBreakerRegistry>,
    role: ProviderRole,
    trial: Option<u64>,
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("role", &self.role)
            .field("trial", &self.trial)
            .finish()
    }
}

impl CallPermit {
    pub fn role(&self) -> ProviderRole {
        self.role
    }

    /// Whether this permit holds the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn record_success(mut self) {
        let trial = self.trial.take();
        self.breakers.on_success(self.role, trial);
    }

    pub fn record_failure(mut self) {
        let trial = self.trial.take();
        self.breakers.on_failure(self.role, trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let Some(trial) = self.trial.take() {
            self.breakers.abandon_trial(self.role, trial);
        }
    }
}

/// Owns the circuit for every provider role. Construct one per process and share it behind an
/// `Arc`; tests get isolation by building a fresh one.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<ProviderRole, Circuit>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn with_circuit<R>(&self, role: ProviderRole, f: impl FnOnce(&mut Circuit) -> R) -> R {
        let mut circuit = self
            .circuits
            .entry(role)
            .or_insert_with(|| Circuit::new(self.config.cooldown));
        f(&mut circuit)
    }

    fn permit(self: &Arc<Self>, role: ProviderRole, trial: Option<u64>) -> CallPermit {
        CallPermit {
            breakers: Arc::clone(self),
            role,
            trial,
        }
    }

    /// Whether a call to `role` may go ahead. A half-open circuit grants exactly one trial; every
    /// other caller is refused until that trial resolves.
    pub fn allow_request(self: &Arc<Self>, role: ProviderRole) -> Option<CallPermit> {
        let trial = self.with_circuit(role, |circuit| match circuit.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open if circuit.cooldown_elapsed() => {
                Some(Some(circuit.claim_trial(role)))
            }
            CircuitState::Open => None,
            CircuitState::HalfOpen if circuit.trial.is_some() => None,
            CircuitState::HalfOpen => Some(Some(circuit.claim_trial(role))),
        })?;
        Some(self.permit(role, trial))
    }

    /// Like [`Self::allow_request`], but reports a refusal as [`CoreError::CircuitOpen`].
    pub fn check(self: &Arc<Self>, role: ProviderRole) -> Result<CallPermit, CoreError> {
        self.allow_request(role).ok_or_else(|| CoreError::CircuitOpen {
            role,
            retry_in: self.with_circuit(role, |c| c.retry_in()),
        })
    }

    /// Claim the circuit for a health probe. Unlike a user request, a probe does not wait for the
    /// cooldown: an open circuit moves straight to half-open with the probe as its trial. Returns
    /// `None` only when another trial is already in flight.
    pub fn begin_probe(self: &Arc<Self>, role: ProviderRole) -> Option<CallPermit> {
        let trial = self.with_circuit(role, |circuit| match circuit.state {
            CircuitState::Closed => Some(None),
            CircuitState::HalfOpen if circuit.trial.is_some() => None,
            CircuitState::Open | CircuitState::HalfOpen => Some(Some(circuit.claim_trial(role))),
        })?;
        Some(self.permit(role, trial))
    }

    /// Record a success observed outside any permit. It closes an open circuit, but never stands
    /// in for a trial's outcome.
    pub fn record_success(&self, role: ProviderRole) {
        self.on_success(role, None)
    }

    /// Record a failure observed outside any permit. It can open a closed circuit, but never fails
    /// a trial.
    pub fn record_failure(&self, role: ProviderRole) {
        self.on_failure(role, None)
    }

    fn on_success(&self, role: ProviderRole, trial: Option<u64>) {
        let base_cooldown = self.config.cooldown;
        self.with_circuit(role, |circuit| {
            circuit.consecutive_failures = 0;
            if circuit.state == CircuitState::Closed {
                return;
            }
            if circuit.holds_trial(trial) {
                circuit.last_trial = Some(TrialOutcome::Succeeded);
            }
            circuit.trial = None;
            circuit.cooldown = base_cooldown;
            circuit.transition(role, CircuitState::Closed);
        })
    }

    fn on_failure(&self, role: ProviderRole, trial: Option<u64>) {
        let threshold = self.config.failure_threshold.max(1);
        let multiplier = self.config.cooldown_multiplier.max(1.0);
        let max_cooldown = self.config.max_cooldown;
        self.with_circuit(role, |circuit| {
            circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            circuit.last_failure = Some(Instant::now());
            match circuit.state {
                CircuitState::Closed => {
                    if circuit.consecutive_failures >= threshold {
                        circuit.transition(role, CircuitState::Open);
                    } else {
                        debug!(
                            role = %role,
                            failures = circuit.consecutive_failures,
                            "Recorded provider failure"
                        );
                    }
                }
                CircuitState::HalfOpen if circuit.holds_trial(trial) => {
                    circuit.last_trial = Some(TrialOutcome::Failed);
                    circuit.trial = None;
                    circuit.cooldown = circuit.cooldown.mul_f64(multiplier).min(max_cooldown);
                    circuit.transition(role, CircuitState::Open);
                }
                // A call admitted before the circuit opened finished late
                CircuitState::HalfOpen | CircuitState::Open => {
                    debug!(role = %role, "Ignoring failure from a call outside the trial");
                }
            }
        })
    }

    fn abandon_trial(&self, role: ProviderRole, trial: u64) {
        self.with_circuit(role, |circuit| {
            if circuit.state == CircuitState::HalfOpen && circuit.holds_trial(Some(trial)) {
                debug!(role = %role, "Trial abandoned without an outcome");
                circuit.trial = None;
                circuit.transition(role, CircuitState::Open);
            }
        })
    }

    /// Current state without side effects. An open circuit whose cooldown has elapsed still
    /// reports `Open` until a request claims the trial.
    pub fn state(&self, role: ProviderRole) -> CircuitState {
        self.circuits
            .get(&role)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn consecutive_failures(&self, role: ProviderRole) -> u32 {
        self.circuits
            .get(&role)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn status(&self, role: ProviderRole) -> CircuitStatus {
        let render = |c: &Circuit| CircuitStatus {
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            cooldown_ms: c.cooldown.as_millis() as u64,
            retry_in_ms: if c.state == CircuitState::Open {
                c.retry_in().as_millis() as u64
            } else {
                0
            },
            seconds_since_last_failure: c.last_failure.map(|t| t.elapsed().as_secs()),
            seconds_since_transition: c.last_transition.elapsed().as_secs(),
            last_trial: c.last_trial,
        };
        match self.circuits.get(&role) {
            Some(circuit) => render(&circuit),
            None => render(&Circuit::new(self.config.cooldown)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32) -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .cooldown(Duration::from_secs(30))
                .max_cooldown(Duration::from_secs(300))
                .build(),
        ))
    }

    #[test]
    fn test_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.max_cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_unknown_role_starts_closed() {
        let breakers = registry(5);
        assert_eq!(breakers.state(ProviderRole::Primary), CircuitState::Closed);
        let permit = breakers.allow_request(ProviderRole::Primary).unwrap();
        assert!(!permit.is_trial());
        assert_eq!(breakers.consecutive_failures(ProviderRole::Primary), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_then_admits_one_trial() {
        let breakers = registry(5);
        let role = ProviderRole::Primary;

        for _ in 0..4 {
            breakers.allow_request(role).unwrap().record_failure();
        }
        assert_eq!(breakers.state(role), CircuitState::Closed);
        breakers.allow_request(role).unwrap().record_failure();
        assert_eq!(breakers.state(role), CircuitState::Open);
        assert!(breakers.allow_request(role).is_none());
        assert!(matches!(
            breakers.check(role),
            Err(CoreError::CircuitOpen { role: ProviderRole::Primary, .. })
        ));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breakers.allow_request(role).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breakers
            .allow_request(role)
            .expect("first call after cooldown is the trial");
        assert!(trial.is_trial());
        assert_eq!(breakers.state(role), CircuitState::HalfOpen);
        assert!(breakers.allow_request(role).is_none(), "only one trial at a time");
        assert!(breakers.allow_request(role).is_none());

        // Failed trial re-opens immediately and restarts (and grows) the cooldown
        trial.record_failure();
        assert_eq!(breakers.state(role), CircuitState::Open);
        assert!(breakers.allow_request(role).is_none());
        assert_eq!(breakers.status(role).cooldown_ms, 60_000);
        assert_eq!(breakers.status(role).last_trial, Some(TrialOutcome::Failed));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breakers.allow_request(role).is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breakers.allow_request(role).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_trial_closes_and_resets() {
        let breakers = registry(2);
        let role = ProviderRole::Fallback1;
        breakers.record_failure(role);
        breakers.record_failure(role);
        assert_eq!(breakers.state(role), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        breakers.allow_request(role).unwrap().record_success();

        assert_eq!(breakers.state(role), CircuitState::Closed);
        assert_eq!(breakers.consecutive_failures(role), 0);
        let status = breakers.status(role);
        assert_eq!(status.cooldown_ms, 30_000);
        assert_eq!(status.last_trial, Some(TrialOutcome::Succeeded));
        let first = breakers.allow_request(role);
        let second = breakers.allow_request(role);
        assert!(first.is_some() && second.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_growth_is_capped() {
        let breakers = registry(1);
        let role = ProviderRole::Fast;
        breakers.record_failure(role);

        let mut expected = 30;
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(expected)).await;
            breakers.allow_request(role).unwrap().record_failure();
            expected = (expected * 2).min(300);
            assert_eq!(breakers.status(role).cooldown_ms, expected * 1000);
        }
        assert_eq!(breakers.status(role).cooldown_ms, 300_000);
    }

    #[test]
    fn test_success_in_closed_state_resets_failure_count() {
        let breakers = registry(3);
        let role = ProviderRole::Reasoning;
        breakers.record_failure(role);
        breakers.record_failure(role);
        breakers.record_success(role);
        breakers.record_failure(role);
        breakers.record_failure(role);
        assert_eq!(breakers.state(role), CircuitState::Closed);
    }

    #[test]
    fn test_roles_are_independent() {
        let breakers = registry(1);
        breakers.record_failure(ProviderRole::Primary);
        assert!(breakers.allow_request(ProviderRole::Primary).is_none());
        assert!(breakers.allow_request(ProviderRole::Fallback1).is_some());
    }

    #[test]
    fn test_probe_claims_trial_on_open_circuit() {
        let breakers = registry(1);
        let role = ProviderRole::Primary;
        breakers.record_failure(role);
        assert!(breakers.allow_request(role).is_none());

        let probe = breakers.begin_probe(role).unwrap();
        assert!(probe.is_trial());
        assert_eq!(breakers.state(role), CircuitState::HalfOpen);
        assert!(breakers.allow_request(role).is_none(), "probe holds the trial slot");
        assert!(breakers.begin_probe(role).is_none());

        probe.record_success();
        assert_eq!(breakers.state(role), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_the_slot() {
        let breakers = registry(1);
        let role = ProviderRole::Primary;
        breakers.record_failure(role);
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = breakers.allow_request(role).unwrap();
        assert_eq!(breakers.state(role), CircuitState::HalfOpen);
        drop(trial);

        // Back to open with the same cooldown, not wedged half-open
        assert_eq!(breakers.state(role), CircuitState::Open);
        assert_eq!(breakers.status(role).cooldown_ms, 30_000);
        assert!(breakers.allow_request(role).is_none());
        tokio::time::advance(Duration::from_secs(30)).await;
        breakers.allow_request(role).unwrap().record_success();
        assert_eq!(breakers.state(role), CircuitState::Closed);

        // A probe can claim an abandoned trial without waiting
        breakers.record_failure(role);
        drop(breakers.begin_probe(role).unwrap());
        assert_eq!(breakers.state(role), CircuitState::Open);
        assert!(breakers.begin_probe(role).unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_cancelled_mid_call_recovers() {
        let breakers = registry(1);
        let role = ProviderRole::Primary;
        breakers.record_failure(role);
        tokio::time::advance(Duration::from_secs(30)).await;

        let call = {
            let breakers = Arc::clone(&breakers);
            async move {
                let permit = breakers.allow_request(role).unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
                permit.record_success();
            }
        };
        assert!(
            tokio::time::timeout(Duration::from_secs(1), call)
                .await
                .is_err()
        );

        assert_eq!(breakers.state(role), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(3600)).await;
        let probe = breakers.begin_probe(role).unwrap();
        probe.record_success();
        assert_eq!(breakers.state(role), CircuitState::Closed);
        assert!(breakers.allow_request(role).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_do_not_resolve_the_trial() {
        let breakers = registry(2);
        let role = ProviderRole::Fallback2;
        let straggler = breakers.allow_request(role).unwrap();
        breakers.record_failure(role);
        breakers.record_failure(role);
        assert_eq!(breakers.state(role), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breakers.allow_request(role).unwrap();

        // A call admitted while closed fails after the trial started
        straggler.record_failure();
        assert_eq!(breakers.state(role), CircuitState::HalfOpen);
        assert_eq!(breakers.status(role).cooldown_ms, 30_000);
        assert!(breakers.allow_request(role).is_none(), "trial still in flight");
        assert_eq!(breakers.status(role).last_trial, None);

        trial.record_failure();
        assert_eq!(breakers.state(role), CircuitState::Open);
        assert_eq!(breakers.status(role).cooldown_ms, 60_000);
        assert_eq!(breakers.status(role).last_trial, Some(TrialOutcome::Failed));
    }

    #[test]
    fn test_concurrent_callers_win_half_open_trial_once() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .cooldown(Duration::ZERO)
                .build(),
        ));
        let role = ProviderRole::Primary;
        breakers.record_failure(role);
        assert_eq!(breakers.state(role), CircuitState::Open);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let breakers = Arc::clone(&breakers);
                std::thread::spawn(move || breakers.allow_request(role))
            })
            .collect();
        // Permits stay alive until every thread has tried
        let permits: Vec<CallPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 1);
        assert!(permits[0].is_trial());
    }
}
