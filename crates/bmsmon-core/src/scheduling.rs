//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tick pacing for the fleet poll loop."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Interval timer that delays rather than bursts after a slow tick.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
    period: Duration,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Completes immediately the first time, then once per period.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_tick_is_delayed_not_burst() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10));
        limiter.tick().await;
        let start = Instant::now();
        tokio::time::sleep(Duration::from_secs(25)).await;
        limiter.tick().await;
        let late = Instant::now();
        limiter.tick().await;
        assert_eq!(late - start, Duration::from_secs(25));
        assert_eq!(Instant::now() - late, Duration::from_secs(10));
    }
}
