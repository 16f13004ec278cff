//! Events-per-minute estimation from wrapping sensor counters.
//!
//! ANT+ cadence and speed sensors broadcast a 16-bit cumulative event count
//! (crank or wheel revolutions) together with a 16-bit device timestamp of the
//! last event, both wrapping at 65536. Sensors resend the last reading four
//! times a second whether or not anything happened, so the estimator has to
//! tell fresh events from resends and let the rate decay once events stop.

use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, time::Duration, time::Instant};
use tracing::trace;

const MILLIS_PER_SECOND: u64 = 1_000;
const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SECOND;

/// Tuning for [`EventRateEstimator`]
///
/// The history bounds are empirical: they should cover a few broadcast
/// periods of the slowest sensor in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Device timestamp resolution in ticks per second
    pub ticks_per_second: u32,
    /// Maximum age of a history entry
    pub history_window: Duration,
    /// Maximum number of history entries
    pub history_capacity: usize,
}

impl RateConfig {
    /// Device ticks in one minute
    #[must_use]
    pub const fn ticks_per_minute(&self) -> u64 {
        self.ticks_per_second as u64 * 60
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 1024,
            history_window: Duration::from_secs(5),
            history_capacity: 100,
        }
    }
}

/// A time stamped sensor counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    /// When the sample was received
    pub observed_at: Instant,
    /// Cumulative event count reported by the sensor
    pub counter: u16,
    /// Device time of the last event, in device ticks
    pub device_time: u16,
}

/// Converts a wrapping event counter into events per minute
#[derive(Debug, Clone)]
pub struct EventRateEstimator {
    config: RateConfig,
    last_counter: Option<u16>,
    last_rate: u32,
    // oldest first
    history: VecDeque<RateSample>,
}

impl EventRateEstimator {
    /// Create an estimator with the given tuning
    #[must_use]
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            last_counter: None,
            last_rate: 0,
            history: VecDeque::with_capacity(config.history_capacity),
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &RateConfig {
        &self.config
    }

    /// Whether a baseline counter has been recorded
    #[must_use]
    pub const fn is_primed(&self) -> bool {
        self.last_counter.is_some()
    }

    /// The rate most recently reported
    #[must_use]
    pub const fn rate(&self) -> u32 {
        self.last_rate
    }

    /// Number of samples currently held in the history
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Feed one sensor reading and return the events-per-minute estimate
    ///
    /// The first reading only records a baseline: its timestamp may date from
    /// long before the receiver started listening.
    pub fn update(&mut self, now: Instant, counter: u16, device_time: u16) -> u32 {
        let Some(previous) = self.last_counter.replace(counter) else {
            self.last_rate = 0;
            return 0;
        };

        if counter.wrapping_sub(previous) == 0 {
            return self.refresh(now);
        }

        self.evict(now);
        if let Some(last) = self.history.back() {
            let ticks = device_time.wrapping_sub(last.device_time);
            if ticks != 0 {
                let events = counter.wrapping_sub(last.counter);
                self.last_rate = saturate(
                    u64::from(events) * self.config.ticks_per_minute() / u64::from(ticks),
                );
            }
        }
        self.history.push_back(RateSample {
            observed_at: now,
            counter,
            device_time,
        });

        trace!(counter, device_time, rate = self.last_rate, "new sensor event");
        self.last_rate
    }

    /// Re-evaluate the rate without new event data
    ///
    /// Called for resent readings and when a reader polls between
    /// broadcasts. The rate only changes once more wall-clock time has passed
    /// since the last event than the current rate allows for; it then decays
    /// and never increases.
    pub fn refresh(&mut self, now: Instant) -> u32 {
        let Some(last) = self.history.back() else {
            self.last_rate = 0;
            return 0;
        };

        let idle = elapsed_millis(now, last.observed_at);
        if idle.saturating_mul(u64::from(self.last_rate)) >= MILLIS_PER_MINUTE {
            self.decay(now);
        }
        self.last_rate
    }

    /// Forget all state, as if the sensor had never been heard
    pub fn reset(&mut self) {
        self.last_counter = None;
        self.last_rate = 0;
        self.history.clear();
    }

    fn decay(&mut self, now: Instant) {
        self.evict(now);
        let (Some(first), Some(last), Some(counter)) =
            (self.history.front(), self.history.back(), self.last_counter)
        else {
            self.last_rate = 0;
            return;
        };

        let events = u64::from(counter.wrapping_sub(first.counter));
        let span_ticks = u64::from(last.device_time.wrapping_sub(first.device_time));
        let span = span_ticks * MILLIS_PER_SECOND / u64::from(self.config.ticks_per_second.max(1));
        let elapsed = elapsed_millis(now, last.observed_at) + span;
        if elapsed == 0 {
            return;
        }

        let decayed = saturate(events * MILLIS_PER_MINUTE / elapsed);
        trace!(decayed, previous = self.last_rate, "rate decayed");
        self.last_rate = decayed.min(self.last_rate);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(first) = self.history.front() {
            let fresh = now.saturating_duration_since(first.observed_at) <= self.config.history_window;
            if fresh && self.history.len() < self.config.history_capacity {
                break;
            }
            self.history.pop_front();
        }
    }
}

impl Default for EventRateEstimator {
    fn default() -> Self {
        Self::new(RateConfig::default())
    }
}

fn elapsed_millis(now: Instant, then: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(then).as_millis()).unwrap_or(u64::MAX)
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
