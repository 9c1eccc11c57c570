//! Per-provider concurrency and pacing control.
//!
//! A task wanting to issue a request takes a provider slot, then a global
//! slot, then waits out the pacing interval. Semaphore queuing is FIFO and
//! every wait is a cancellation point; dropping the future releases exactly
//! what was taken. The adaptive delay grows on failures and decays on
//! successes, bounded both ways.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::BatchError;
use crate::providers::Provider;

/// Growth factor applied to the adaptive delay after a failure.
const BACKOFF_GROWTH: f64 = 1.5;
/// Decay divisor applied after a success.
const RECOVERY_DECAY: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_concurrent_kto: usize,
    pub max_concurrent_kma: usize,
    pub max_concurrent_total: usize,
    /// Minimum wall-time between request starts to one provider.
    pub min_interval: Duration,
    /// Ceiling for the adaptive delay.
    pub max_adaptive_delay: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_kto: 5,
            max_concurrent_kma: 3,
            max_concurrent_total: 8,
            min_interval: Duration::from_millis(100),
            max_adaptive_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct PaceState {
    last_start: Option<Instant>,
    adaptive_delay: Duration,
    consecutive_failures: u32,
}

struct Lane {
    slots: Arc<Semaphore>,
    pace: Mutex<PaceState>,
    min_interval: Duration,
}

impl Lane {
    fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            pace: Mutex::new(PaceState {
                last_start: None,
                adaptive_delay: Duration::ZERO,
                consecutive_failures: 0,
            }),
            min_interval,
        }
    }
}

/// Composite permit held for the duration of one request.
pub struct SlotPermit {
    _provider: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

/// Runtime pacing view for the operator surface.
#[derive(Debug, Clone)]
pub struct LaneState {
    pub available_slots: usize,
    pub adaptive_delay: Duration,
    pub consecutive_failures: u32,
}

pub struct ConcurrencyGovernor {
    global: Arc<Semaphore>,
    kto: Lane,
    kma: Lane,
    max_adaptive_delay: Duration,
}

impl ConcurrencyGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_concurrent_total)),
            kto: Lane::new(config.max_concurrent_kto, config.min_interval),
            kma: Lane::new(config.max_concurrent_kma, config.min_interval),
            max_adaptive_delay: config.max_adaptive_delay,
        }
    }

    fn lane(&self, provider: Provider) -> &Lane {
        match provider {
            Provider::Kto => &self.kto,
            Provider::Kma => &self.kma,
        }
    }

    /// Take a provider slot and a global slot, then wait out the pacing
    /// interval. Lock order is always provider slot before global slot.
    pub async fn acquire(&self, provider: Provider) -> Result<SlotPermit, BatchError> {
        let lane = self.lane(provider);

        let provider_permit =
            lane.slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BatchError::Transient {
                    detail: format!("{provider} request lane closed"),
                })?;
        let global_permit =
            self.global
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BatchError::Transient {
                    detail: "global request lane closed".to_string(),
                })?;

        // Reserve the next start instant before sleeping so concurrent
        // waiters space out FIFO instead of stampeding at the same tick.
        let start_at = {
            let mut pace = lane.pace.lock().await;
            let interval = lane.min_interval + pace.adaptive_delay;
            let now = Instant::now();
            let start_at = match pace.last_start {
                Some(last) => (last + interval).max(now),
                None => now,
            };
            pace.last_start = Some(start_at);
            start_at
        };
        tokio::time::sleep_until(start_at).await;

        Ok(SlotPermit {
            _provider: provider_permit,
            _global: global_permit,
        })
    }

    /// Feed the pacing loop with the outcome of a finished request.
    pub async fn report(&self, provider: Provider, success: bool) {
        let lane = self.lane(provider);
        let mut pace = lane.pace.lock().await;
        if success {
            pace.consecutive_failures = 0;
            if !pace.adaptive_delay.is_zero() {
                let decayed = pace.adaptive_delay.as_secs_f64() / RECOVERY_DECAY;
                pace.adaptive_delay = if decayed < 0.01 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(decayed)
                };
            }
        } else {
            pace.consecutive_failures += 1;
            let grown = if pace.adaptive_delay.is_zero() {
                lane.min_interval.max(Duration::from_millis(100))
            } else {
                Duration::from_secs_f64(pace.adaptive_delay.as_secs_f64() * BACKOFF_GROWTH)
            };
            pace.adaptive_delay = grown.min(self.max_adaptive_delay);
            debug!(
                "{provider} pacing backed off to {:?} ({} consecutive failures)",
                pace.adaptive_delay, pace.consecutive_failures
            );
        }
    }

    pub async fn state(&self, provider: Provider) -> LaneState {
        let lane = self.lane(provider);
        let pace = lane.pace.lock().await;
        LaneState {
            available_slots: lane.slots.available_permits(),
            adaptive_delay: pace.adaptive_delay,
            consecutive_failures: pace.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> GovernorConfig {
        GovernorConfig {
            max_concurrent_kto: 2,
            max_concurrent_kma: 1,
            max_concurrent_total: 2,
            min_interval: Duration::from_millis(1),
            max_adaptive_delay: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn permits_bound_in_flight_requests() {
        let governor = ConcurrencyGovernor::new(quick_config());
        let a = governor.acquire(Provider::Kto).await.unwrap();
        let _b = governor.acquire(Provider::Kto).await.unwrap();

        // Both global permits are held; a third acquire must wait.
        let third = tokio::time::timeout(
            Duration::from_millis(50),
            governor.acquire(Provider::Kma),
        )
        .await;
        assert!(third.is_err());

        drop(a);
        let third = tokio::time::timeout(
            Duration::from_millis(200),
            governor.acquire(Provider::Kma),
        )
        .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn failures_grow_delay_and_successes_decay_it() {
        let governor = ConcurrencyGovernor::new(quick_config());

        governor.report(Provider::Kto, false).await;
        governor.report(Provider::Kto, false).await;
        let backed_off = governor.state(Provider::Kto).await;
        assert!(backed_off.adaptive_delay > Duration::ZERO);
        assert_eq!(backed_off.consecutive_failures, 2);

        for _ in 0..40 {
            governor.report(Provider::Kto, true).await;
        }
        let recovered = governor.state(Provider::Kto).await;
        assert_eq!(recovered.adaptive_delay, Duration::ZERO);
        assert_eq!(recovered.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn delay_is_capped() {
        let governor = ConcurrencyGovernor::new(quick_config());
        for _ in 0..50 {
            governor.report(Provider::Kma, false).await;
        }
        let state = governor.state(Provider::Kma).await;
        assert!(state.adaptive_delay <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_nothing_it_did_not_take() {
        let governor = Arc::new(ConcurrencyGovernor::new(quick_config()));
        let held = governor.acquire(Provider::Kma).await.unwrap();

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.acquire(Provider::Kma).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        // The aborted waiter must not have consumed the permit.
        let reacquired = tokio::time::timeout(
            Duration::from_millis(200),
            governor.acquire(Provider::Kma),
        )
        .await;
        assert!(reacquired.is_ok());
    }
}
