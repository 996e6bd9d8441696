//! Fixed-interval trigger
//!
//! Each pipeline owns one. The first tick fires one full period after
//! creation; a tick missed because the previous cycle overran is delayed
//! rather than fired in a burst.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub struct Trigger {
    interval: Interval,
    period: Duration,
}

impl Trigger {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}
