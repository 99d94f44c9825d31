use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// CircuitBreaker — load shedding for the bulk submission path
// ---------------------------------------------------------------------------

/// How long a rolling sample stays in the error window.
const WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Per-call timeout. Configured in milliseconds with a 1 s floor.
    pub timeout: Duration,
    /// Minimum calls in the window before the error rate is evaluated.
    pub request_volume_threshold: u64,
    /// Concurrent in-flight call cap.
    pub max_concurrent: usize,
    /// Error percentage at which the breaker opens.
    pub error_percent_threshold: u8,
    /// How long the breaker stays open before a probe is let through.
    pub sleep_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            request_volume_threshold: 20_000,
            max_concurrent: 100,
            error_percent_threshold: 25,
            sleep_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit open")]
    Open,
    #[error("too many concurrent requests")]
    TooManyRequests,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Inner(anyhow::Error),
}

/// Hystrix-style breaker: a rolling window of call outcomes opens the
/// circuit once volume and error-rate thresholds are both exceeded; while
/// open, calls fail fast. After the sleep window one probe call is allowed;
/// its success closes the circuit again.
pub struct CircuitBreaker {
    config: BreakerConfig,
    permits: Semaphore,
    state: Mutex<BreakerState>,
}

#[derive(Default)]
struct BreakerState {
    samples: VecDeque<(Instant, bool)>,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent);
        Self {
            config,
            permits,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub async fn call<T, F>(&self, fut: F) -> Result<T, BreakerError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        {
            let state = self.state.lock().expect("breaker lock poisoned");
            if let Some(until) = state.open_until
                && Instant::now() < until
            {
                return Err(BreakerError::Open);
            }
            // Past the sleep window: fall through and let this call probe.
        }

        let Ok(_permit) = self.permits.try_acquire() else {
            return Err(BreakerError::TooManyRequests);
        };

        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => {
                self.record(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(false);
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.record(false);
                Err(BreakerError::Timeout)
            }
        }
    }

    fn record(&self, success: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("breaker lock poisoned");

        if success {
            if state.open_until.is_some() {
                // Probe succeeded: close and start from a clean window.
                state.open_until = None;
                state.samples.clear();
            }
            state.samples.push_back((now, true));
            Self::prune(&mut state.samples, now);
            return;
        }

        state.samples.push_back((now, false));
        Self::prune(&mut state.samples, now);

        let total = state.samples.len() as u64;
        if total < self.config.request_volume_threshold {
            return;
        }
        let failures = state.samples.iter().filter(|(_, ok)| !ok).count() as u64;
        if failures * 100 >= total * self.config.error_percent_threshold as u64 {
            state.open_until = Some(now + self.config.sleep_window);
        }
    }

    fn prune(samples: &mut VecDeque<(Instant, bool)>, now: Instant) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
