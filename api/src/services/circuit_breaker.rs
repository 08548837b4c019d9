//! Per-source circuit breaker.
//!
//! CLOSED counts consecutive failures and opens at `failure_threshold`. OPEN rejects
//! callers until `open_until`, after which exactly one caller gets a probe permit
//! (HALF_OPEN). A successful probe closes the breaker and resets the cooldown; a failed
//! probe reopens it with the cooldown doubled, capped at `cooldown_max`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use domain::{CircuitState, SourceHealthView};
use tracing::{info, warn};

use super::clock::Clock;

const MAX_COOLDOWN_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_base: Duration::from_secs(30),
            cooldown_max: Duration::from_secs(900),
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown applied on the `trips`-th consecutive opening (1-based).
    pub fn cooldown_for(&self, trips: u32) -> Duration {
        let exponent = trips.saturating_sub(1).min(MAX_COOLDOWN_EXPONENT);
        self.cooldown_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cooldown_max)
            .min(self.cooldown_max)
    }
}

#[derive(Debug)]
struct SourceHealth {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// Consecutive openings since the last success.
    trips: u32,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    source_id: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    health: Mutex<SourceHealth>,
}

impl CircuitBreaker {
    pub fn new(
        source_id: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            health: Mutex::new(SourceHealth {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trips: 0,
                probe_in_flight: false,
            }),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn lock(&self) -> MutexGuard<'_, SourceHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits a request, or returns how long until the source may be tried again.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Duration> {
        let now = self.clock.now();
        let mut health = self.lock();
        match health.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let until = health.open_until.unwrap_or(now);
                if now >= until {
                    health.state = CircuitState::HalfOpen;
                    health.probe_in_flight = true;
                    info!(source = %self.source_id, "circuit half-open, probing");
                    Ok(self.permit(true))
                } else {
                    Err(until - now)
                }
            }
            CircuitState::HalfOpen => {
                if health.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    health.probe_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    fn permit(self: &Arc<Self>, probe: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        }
    }

    fn on_success(&self) {
        let mut health = self.lock();
        if health.state != CircuitState::Closed {
            info!(source = %self.source_id, "circuit closed");
        }
        health.state = CircuitState::Closed;
        health.consecutive_failures = 0;
        health.open_until = None;
        health.trips = 0;
        health.probe_in_flight = false;
    }

    /// Returns true when this failure opened the circuit.
    fn on_failure(&self) -> bool {
        let now = self.clock.now();
        let mut health = self.lock();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let should_open = match health.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => health.consecutive_failures >= self.config.failure_threshold,
            // A request admitted before the circuit opened; the cooldown already runs.
            CircuitState::Open => false,
        };
        if !should_open {
            return false;
        }
        health.trips = health.trips.saturating_add(1);
        let cooldown = self.config.cooldown_for(health.trips);
        health.state = CircuitState::Open;
        health.open_until = Some(now + cooldown);
        health.probe_in_flight = false;
        warn!(
            source = %self.source_id,
            failures = health.consecutive_failures,
            trips = health.trips,
            cooldown_ms = cooldown.as_millis() as u64,
            "circuit opened"
        );
        metrics::counter!("circuit_breaker_opened_total", "source" => self.source_id.clone())
            .increment(1);
        true
    }

    /// A probe that never reported back; let the next caller probe right away.
    fn on_abandoned_probe(&self) {
        let now = self.clock.now();
        let mut health = self.lock();
        if health.state == CircuitState::HalfOpen && health.probe_in_flight {
            health.state = CircuitState::Open;
            health.open_until = Some(now);
            health.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Cooldown that applied when the circuit last opened.
    pub fn current_cooldown(&self) -> Option<Duration> {
        let health = self.lock();
        (health.trips > 0).then(|| self.config.cooldown_for(health.trips))
    }

    pub fn view(&self) -> SourceHealthView {
        let now = self.clock.now();
        let health = self.lock();
        let retry_in_ms = match (health.state, health.open_until) {
            (CircuitState::Open, Some(until)) => {
                Some(until.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };
        SourceHealthView {
            source_id: self.source_id.clone(),
            state: health.state,
            consecutive_failures: health.consecutive_failures,
            trips: health.trips,
            retry_in_ms,
        }
    }
}

/// Admission ticket for one request. Must be settled with `succeed` or `fail`;
/// an unsettled probe permit reopens the circuit with an already-elapsed cooldown.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.on_failure()
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandoned_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "birdeye",
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown_base: Duration::from_secs(10),
                cooldown_max: Duration::from_secs(60),
            },
            clock,
        ))
    }

    fn fail_times(breaker: &Arc<CircuitBreaker>, times: usize) {
        for _ in 0..times {
            breaker.try_acquire().expect("admitted").fail();
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_times(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        let retry_in = breaker.try_acquire().err().expect("rejected while open");
        assert_eq!(retry_in, Duration::from_secs(10));
        clock.advance(Duration::from_secs(9));
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock);
        fail_times(&breaker, 2);
        breaker.try_acquire().expect("admitted").succeed();
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.view().consecutive_failures, 2);
    }

    #[test]
    fn half_open_allows_single_probe() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        fail_times(&breaker, 3);
        clock.advance(Duration::from_secs(10));

        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        probe.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probes_double_cooldown_up_to_cap() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        fail_times(&breaker, 3);

        let mut cooldowns = vec![breaker.current_cooldown().expect("open")];
        for _ in 0..4 {
            clock.advance(*cooldowns.last().expect("cooldown"));
            breaker.try_acquire().expect("probe").fail();
            cooldowns.push(breaker.current_cooldown().expect("reopened"));
        }
        let secs: Vec<u64> = cooldowns.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![10, 20, 40, 60, 60]);

        clock.advance(Duration::from_secs(60));
        breaker.try_acquire().expect("probe").succeed();
        assert_eq!(breaker.current_cooldown(), None);

        fail_times(&breaker, 3);
        assert_eq!(breaker.current_cooldown(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn abandoned_probe_does_not_wedge_the_source() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        fail_times(&breaker, 3);
        clock.advance(Duration::from_secs(10));

        drop(breaker.try_acquire().expect("probe"));
        assert_eq!(breaker.state(), CircuitState::Open);
        let probe = breaker.try_acquire().expect("probe again immediately");
        assert!(probe.is_probe());
    }

    #[test]
    fn late_failure_while_open_keeps_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        let straggler = breaker.try_acquire().expect("admitted");
        fail_times(&breaker, 3);
        clock.advance(Duration::from_secs(5));
        assert!(!straggler.fail());
        assert_eq!(breaker.view().retry_in_ms, Some(5_000));
    }

    #[test]
    fn cooldown_growth_saturates() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_base: Duration::from_secs(1),
            cooldown_max: Duration::from_secs(3600),
        };
        assert_eq!(config.cooldown_for(1), Duration::from_secs(1));
        assert_eq!(config.cooldown_for(4), Duration::from_secs(8));
        assert_eq!(config.cooldown_for(u32::MAX), Duration::from_secs(3600));
    }
}
