use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::{channel::ChannelState, rate::RateConfig, sensor::SensorType, sensor::SensorValue};

/// A sensor value, the channel that supplied it and when it was last updated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading<T> {
    /// Decoded value
    pub value: T,
    /// Channel whose broadcast produced the value
    pub channel: u8,
    /// Receive time of the broadcast that produced it
    pub at: Instant,
}

impl<T> Reading<T> {
    /// Create a new reading
    #[must_use]
    pub const fn new(value: T, channel: u8, at: Instant) -> Self {
        Self { value, channel, at }
    }

    /// Time elapsed between the update and `now`
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.at)
    }
}

/// Aggregated sensor readings published by the supervisor
///
/// Snapshots are immutable once published; every change produces a new one
/// with a higher `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    /// Heart rate in beats per minute
    pub heart_rate: Option<Reading<u16>>,
    /// Crank cadence in revolutions per minute
    pub cadence: Option<Reading<f32>>,
    /// Speed in meters per second
    pub speed: Option<Reading<f32>>,
    /// Power in watts
    pub power: Option<Reading<u16>>,
    /// State of every supervised channel, indexed by channel number
    pub channel_states: Vec<ChannelState>,
    /// Incremented on every replacement
    pub version: u64,
}

impl SensorSnapshot {
    /// Empty snapshot with all channels closed
    #[must_use]
    pub fn new(channel_count: usize) -> Self {
        Self {
            heart_rate: None,
            cadence: None,
            speed: None,
            power: None,
            channel_states: vec![ChannelState::Closed; channel_count],
            version: 0,
        }
    }

    /// State of a channel, `None` when out of range
    #[must_use]
    pub fn channel_state(&self, channel: u8) -> Option<ChannelState> {
        self.channel_states.get(usize::from(channel)).copied()
    }

    /// Whether any channel is receiving from a device
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.channel_states.iter().any(|state| state.is_tracking())
    }

    /// Merge values decoded on `channel`, returning whether any were present
    ///
    /// The channel becomes the owner of every field it supplies; a later
    /// value from another channel takes the field over.
    pub fn apply(&mut self, channel: u8, value: &SensorValue, at: Instant) -> bool {
        if let Some(bpm) = value.heart_rate {
            self.heart_rate = Some(Reading::new(bpm, channel, at));
        }
        if let Some(rpm) = value.cadence {
            self.cadence = Some(Reading::new(rpm, channel, at));
        }
        if let Some(speed) = value.speed {
            self.speed = Some(Reading::new(speed, channel, at));
        }
        if let Some(watts) = value.power {
            self.power = Some(Reading::new(watts, channel, at));
        }
        !value.is_empty()
    }

    /// Apply values `channel` re-evaluated without a new broadcast
    ///
    /// Only readings owned by `channel` move, and only their value; the
    /// update time stays that of the last broadcast.
    pub fn apply_refresh(&mut self, channel: u8, value: &SensorValue) -> bool {
        let mut changed = false;
        if let (Some(rpm), Some(reading)) = (value.cadence, owned(&mut self.cadence, channel)) {
            changed |= replace(&mut reading.value, rpm);
        }
        if let (Some(speed), Some(reading)) = (value.speed, owned(&mut self.speed, channel)) {
            changed |= replace(&mut reading.value, speed);
        }
        changed
    }

    /// Drop the readings `channel` supplied, returning whether any were set
    ///
    /// Readings another channel wrote last are kept.
    pub fn clear(&mut self, channel: u8) -> bool {
        take_owned(&mut self.heart_rate, channel)
            | take_owned(&mut self.cadence, channel)
            | take_owned(&mut self.speed, channel)
            | take_owned(&mut self.power, channel)
    }
}

fn owned<T>(reading: &mut Option<Reading<T>>, channel: u8) -> Option<&mut Reading<T>> {
    reading.as_mut().filter(|reading| reading.channel == channel)
}

fn take_owned<T>(reading: &mut Option<Reading<T>>, channel: u8) -> bool {
    reading.take_if(|reading| reading.channel == channel).is_some()
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Sensor bound to a channel by [`Supervisor::start`](crate::Supervisor::start)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAssignment {
    /// Channel number
    pub channel: u8,
    /// Sensor searched for on that channel
    pub sensor: SensorType,
}

impl ChannelAssignment {
    /// Bind a sensor to a channel
    #[must_use]
    pub const fn new(channel: u8, sensor: SensorType) -> Self {
        Self { channel, sensor }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of radio channels supervised
    pub channel_count: usize,
    /// Channels opened by `start` and after a radio reset
    pub layout: Vec<ChannelAssignment>,
    /// Rate estimator tuning shared by all decoders
    pub rate: RateConfig,
    /// Time a channel may search before it is taken offline
    pub search_timeout: Duration,
    /// Wheel circumference in meters for speed sensors
    pub wheel_circumference: f32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channel_count: 8,
            layout: vec![
                ChannelAssignment::new(0, SensorType::HeartRate),
                ChannelAssignment::new(1, SensorType::BikeCadence),
                ChannelAssignment::new(2, SensorType::BikeSpeedCadence),
            ],
            rate: RateConfig::default(),
            search_timeout: Duration::from_secs(30),
            wheel_circumference: 2.096,
        }
    }
}
