use crate::config::{AppConfig, FailoverPolicy, PluginRef, UpstreamConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamStatus {
    Healthy,
    Unhealthy,
    HalfOpen,
}

/// Selection verdict for one upstream under the breaker rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Dispatch normally.
    Admit,
    /// Dispatch as the single recovery probe of a half-open upstream.
    Probe,
    /// Within the recovery window; excluded from this request.
    Skip,
}

#[derive(Debug)]
struct BreakerState {
    status: UpstreamStatus,
    last_failure_time: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    slow_start_activated: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            status: UpstreamStatus::Healthy,
            last_failure_time: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            slow_start_activated: None,
        }
    }
}

/// Serializable health view for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamHealth {
    pub target: String,
    pub weight: u32,
    pub priority: u32,
    pub status: UpstreamStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub ms_since_last_failure: Option<u64>,
    pub slow_start_active: bool,
}

/// Per-worker mutable record for one upstream of a route. Shared by all
/// concurrent requests; breaker mutations are serialized by the inner
/// mutex.
#[derive(Debug)]
pub struct RuntimeUpstream {
    target: Url,
    config: UpstreamConfig,
    state: Mutex<BreakerState>,
}

impl RuntimeUpstream {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, anyhow::Error> {
        let target = Url::parse(&config.target)
            .map_err(|e| anyhow::anyhow!("invalid upstream target '{}': {e}", config.target))?;
        Ok(Self {
            target,
            config: config.clone(),
            state: Mutex::new(BreakerState::new()),
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    pub fn plugins(&self) -> &[PluginRef] {
        &self.config.plugins
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn status(&self) -> UpstreamStatus {
        self.state.lock().expect("breaker lock poisoned").status
    }

    pub fn health(&self, now: Instant) -> UpstreamHealth {
        let state = self.state.lock().expect("breaker lock poisoned");
        UpstreamHealth {
            target: self.config.target.clone(),
            weight: self.config.weight,
            priority: self.config.priority,
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            ms_since_last_failure: state
                .last_failure_time
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            slow_start_active: state.slow_start_activated.is_some(),
        }
    }

    /// Weight after slow-start dampening: scales linearly from zero at
    /// activation to full weight after `warmup_ms`.
    pub fn effective_weight(&self, policy: &FailoverPolicy, now: Instant) -> f64 {
        let base = self.config.weight.max(1) as f64;
        let state = self.state.lock().expect("breaker lock poisoned");
        match (state.slow_start_activated, &policy.slow_start) {
            (Some(activated), Some(slow_start)) if slow_start.warmup_ms > 0 => {
                let elapsed = now.saturating_duration_since(activated).as_millis() as f64;
                base * (elapsed / slow_start.warmup_ms as f64).min(1.0)
            }
            _ => base,
        }
    }

    /// Resolve breaker eligibility at selection time. An unhealthy
    /// upstream whose jittered recovery interval has elapsed moves to
    /// half-open here, claiming the single probe slot.
    pub fn evaluate_eligibility(&self, policy: &FailoverPolicy, now: Instant) -> Eligibility {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.status {
            UpstreamStatus::Healthy => Eligibility::Admit,
            // another request already holds the probe slot
            UpstreamStatus::HalfOpen => Eligibility::Skip,
            UpstreamStatus::Unhealthy => {
                let Some(last_failure) = state.last_failure_time else {
                    state.status = UpstreamStatus::HalfOpen;
                    return Eligibility::Probe;
                };
                let elapsed = now.saturating_duration_since(last_failure).as_millis() as f64;
                // jitter ±20%, freshly sampled per evaluation
                let jitter = 1.0 + (rand::random::<f64>() * 0.4 - 0.2);
                let effective_interval = policy.recovery_interval_ms as f64 * jitter;
                if elapsed >= effective_interval {
                    state.status = UpstreamStatus::HalfOpen;
                    tracing::debug!(target = %self.config.target, "upstream entering half-open probe");
                    Eligibility::Probe
                } else {
                    Eligibility::Skip
                }
            }
        }
    }

    /// Record a successful attempt. Returns the new status when the
    /// breaker transitioned.
    pub fn record_success(&self, policy: &FailoverPolicy, now: Instant) -> Option<UpstreamStatus> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.status {
            UpstreamStatus::Healthy => {
                state.consecutive_failures = 0;
                state.consecutive_successes += 1;
                None
            }
            UpstreamStatus::HalfOpen => {
                state.status = UpstreamStatus::Healthy;
                state.last_failure_time = None;
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
                if policy.slow_start.is_some() {
                    state.slow_start_activated = Some(now);
                }
                tracing::info!(target = %self.config.target, "upstream recovered via probe");
                Some(UpstreamStatus::Healthy)
            }
            UpstreamStatus::Unhealthy => {
                // probe-less recovery path: successes accumulate toward the
                // healthy threshold
                state.consecutive_failures = 0;
                state.consecutive_successes += 1;
                if state.consecutive_successes >= policy.healthy_threshold {
                    state.status = UpstreamStatus::Healthy;
                    state.last_failure_time = None;
                    state.consecutive_successes = 0;
                    tracing::info!(target = %self.config.target, "upstream recovered via healthy threshold");
                    Some(UpstreamStatus::Healthy)
                } else {
                    None
                }
            }
        }
    }

    /// Record a failed attempt. Returns the new status when the breaker
    /// transitioned.
    pub fn record_failure(&self, policy: &FailoverPolicy, now: Instant) -> Option<UpstreamStatus> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_successes = 0;
        match state.status {
            UpstreamStatus::Healthy => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= policy.consecutive_failures_threshold {
                    state.status = UpstreamStatus::Unhealthy;
                    state.last_failure_time = Some(now);
                    state.slow_start_activated = None;
                    tracing::warn!(target = %self.config.target, "upstream marked unhealthy");
                    Some(UpstreamStatus::Unhealthy)
                } else {
                    None
                }
            }
            UpstreamStatus::HalfOpen => {
                state.status = UpstreamStatus::Unhealthy;
                state.last_failure_time = Some(now);
                state.slow_start_activated = None;
                tracing::warn!(target = %self.config.target, "recovery probe failed");
                Some(UpstreamStatus::Unhealthy)
            }
            UpstreamStatus::Unhealthy => {
                state.consecutive_failures += 1;
                state.last_failure_time = Some(now);
                None
            }
        }
    }

    /// Per-attempt timeout: recovering upstreams get the short budget.
    pub fn attempt_timeout(&self, policy: &FailoverPolicy) -> Duration {
        match self.status() {
            UpstreamStatus::Healthy => Duration::from_millis(policy.request_timeout_ms),
            UpstreamStatus::Unhealthy | UpstreamStatus::HalfOpen => {
                Duration::from_millis(policy.recovery_timeout_ms)
            }
        }
    }
}

/// Weighted-random pick within the best (lowest-number) priority
/// partition of the candidates.
pub fn select_upstream(
    candidates: &[Arc<RuntimeUpstream>],
    policy: &FailoverPolicy,
    now: Instant,
) -> Option<Arc<RuntimeUpstream>> {
    let best_priority = candidates.iter().map(|u| u.priority()).min()?;
    let partition: Vec<&Arc<RuntimeUpstream>> = candidates
        .iter()
        .filter(|u| u.priority() == best_priority)
        .collect();

    let weights: Vec<f64> = partition
        .iter()
        .map(|u| u.effective_weight(policy, now).max(f64::MIN_POSITIVE))
        .collect();
    let total: f64 = weights.iter().sum();

    let mut roll = rand::random::<f64>() * total;
    for (&upstream, weight) in partition.iter().zip(&weights) {
        roll -= weight;
        if roll <= 0.0 {
            return Some(Arc::clone(upstream));
        }
    }
    partition.last().map(|&u| Arc::clone(u))
}

/// Per-worker runtime state: one shared record per configured upstream,
/// keyed by route path. Rebuilt on config reload; breaker counters start
/// fresh by design.
#[derive(Debug, Default)]
pub struct RuntimeState {
    routes: HashMap<String, Vec<Arc<RuntimeUpstream>>>,
}

impl RuntimeState {
    pub fn from_config(config: &AppConfig) -> Result<Self, anyhow::Error> {
        let mut routes = HashMap::new();
        for route in &config.routes {
            let upstreams = route
                .upstreams
                .iter()
                .map(RuntimeUpstream::from_config)
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(Arc::new)
                .collect();
            routes.insert(route.path.clone(), upstreams);
        }
        Ok(Self { routes })
    }

    pub fn upstreams_for(&self, route_path: &str) -> &[Arc<RuntimeUpstream>] {
        self.routes
            .get(route_path)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn health_report(&self, now: Instant) -> HashMap<String, Vec<UpstreamHealth>> {
        self.routes
            .iter()
            .map(|(path, upstreams)| {
                (
                    path.clone(),
                    upstreams.iter().map(|u| u.health(now)).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlowStartConfig;

    fn upstream(target: &str, weight: u32, priority: u32) -> Arc<RuntimeUpstream> {
        Arc::new(
            RuntimeUpstream::from_config(&UpstreamConfig {
                target: target.to_string(),
                weight,
                priority,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn policy() -> FailoverPolicy {
        FailoverPolicy::default()
    }

    #[test]
    fn trips_after_exact_threshold() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let now = Instant::now();

        assert_eq!(u.record_failure(&p, now), None);
        assert_eq!(u.record_failure(&p, now), None);
        assert_eq!(u.record_failure(&p, now), Some(UpstreamStatus::Unhealthy));
        assert_eq!(u.status(), UpstreamStatus::Unhealthy);
    }

    #[test]
    fn success_resets_failure_streak() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let now = Instant::now();

        u.record_failure(&p, now);
        u.record_failure(&p, now);
        u.record_success(&p, now);
        u.record_failure(&p, now);
        u.record_failure(&p, now);
        assert_eq!(u.status(), UpstreamStatus::Healthy);
        assert_eq!(u.record_failure(&p, now), Some(UpstreamStatus::Unhealthy));
    }

    #[test]
    fn no_half_open_before_eighty_percent_of_interval() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let failed_at = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, failed_at);
        }

        // below recovery_interval_ms * 0.8 the jittered window can never
        // have elapsed
        let probe_time = failed_at + Duration::from_millis(3900);
        for _ in 0..50 {
            assert_eq!(u.evaluate_eligibility(&p, probe_time), Eligibility::Skip);
        }
        assert_eq!(u.status(), UpstreamStatus::Unhealthy);
    }

    #[test]
    fn half_open_admitted_after_max_jittered_interval() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let failed_at = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, failed_at);
        }

        // 6000ms >= 5000 * 1.2, the jitter ceiling
        let probe_time = failed_at + Duration::from_millis(6000);
        assert_eq!(u.evaluate_eligibility(&p, probe_time), Eligibility::Probe);
        assert_eq!(u.status(), UpstreamStatus::HalfOpen);

        // the probe slot is single-occupancy
        assert_eq!(u.evaluate_eligibility(&p, probe_time), Eligibility::Skip);
    }

    #[test]
    fn probe_success_restores_healthy() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let failed_at = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, failed_at);
        }
        let probe_time = failed_at + Duration::from_millis(6000);
        assert_eq!(u.evaluate_eligibility(&p, probe_time), Eligibility::Probe);
        assert_eq!(u.record_success(&p, probe_time), Some(UpstreamStatus::Healthy));
        assert!(u.health(probe_time).ms_since_last_failure.is_none());
    }

    #[test]
    fn probe_failure_rearms_recovery_window() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let failed_at = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, failed_at);
        }
        let probe_time = failed_at + Duration::from_millis(6000);
        u.evaluate_eligibility(&p, probe_time);
        assert_eq!(u.record_failure(&p, probe_time), Some(UpstreamStatus::Unhealthy));
        // window restarts from the probe failure
        assert_eq!(
            u.evaluate_eligibility(&p, probe_time + Duration::from_millis(3900)),
            Eligibility::Skip
        );
    }

    #[test]
    fn healthy_threshold_path_recovers_without_probe() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        let now = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, now);
        }
        assert_eq!(u.record_success(&p, now), None);
        assert_eq!(u.record_success(&p, now), Some(UpstreamStatus::Healthy));
    }

    #[test]
    fn selection_prefers_lowest_priority_number() {
        let a = upstream("http://a/", 1, 1);
        let b = upstream("http://b/", 10_000, 2);
        let candidates = vec![Arc::clone(&a), Arc::clone(&b)];
        let p = policy();
        let now = Instant::now();
        for _ in 0..50 {
            let picked = select_upstream(&candidates, &p, now).unwrap();
            assert_eq!(picked.target().as_str(), "http://a/");
        }
    }

    #[test]
    fn selection_distributes_by_weight() {
        let a = upstream("http://a/", 99, 1);
        let b = upstream("http://b/", 1, 1);
        let candidates = vec![Arc::clone(&a), Arc::clone(&b)];
        let p = policy();
        let now = Instant::now();
        let mut a_hits = 0;
        for _ in 0..500 {
            if select_upstream(&candidates, &p, now).unwrap().target().as_str() == "http://a/" {
                a_hits += 1;
            }
        }
        assert!(a_hits > 400, "weight 99 upstream picked only {a_hits}/500");
    }

    #[test]
    fn slow_start_scales_weight_linearly() {
        let u = upstream("http://a/", 100, 1);
        let mut p = policy();
        p.slow_start = Some(SlowStartConfig { warmup_ms: 10_000 });

        let failed_at = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, failed_at);
        }
        let probe_time = failed_at + Duration::from_millis(6000);
        u.evaluate_eligibility(&p, probe_time);
        u.record_success(&p, probe_time);

        let halfway = probe_time + Duration::from_millis(5000);
        let w = u.effective_weight(&p, halfway);
        assert!((w - 50.0).abs() < 1.0, "expected ~50, got {w}");

        let done = probe_time + Duration::from_millis(10_000);
        assert_eq!(u.effective_weight(&p, done), 100.0);
        assert!(u.health(halfway).slow_start_active);
    }

    #[test]
    fn timeout_tracks_status() {
        let u = upstream("http://a/", 100, 1);
        let p = policy();
        assert_eq!(u.attempt_timeout(&p), Duration::from_millis(30_000));
        let now = Instant::now();
        for _ in 0..3 {
            u.record_failure(&p, now);
        }
        assert_eq!(u.attempt_timeout(&p), Duration::from_millis(3000));
    }

    #[test]
    fn runtime_state_builds_per_route() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "routes": [{
                "path": "/api",
                "upstreams": [
                    {"target": "http://a/"},
                    {"target": "http://b/", "weight": 50, "priority": 2}
                ]
            }]
        }))
        .unwrap();
        let state = RuntimeState::from_config(&config).unwrap();
        assert_eq!(state.upstreams_for("/api").len(), 2);
        assert!(state.upstreams_for("/missing").is_empty());
        let report = state.health_report(Instant::now());
        assert_eq!(report["/api"][1].priority, 2);
    }
}
