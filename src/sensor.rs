use crate::{
    protocol::PAYLOAD_SIZE,
    rate::{EventRateEstimator, RateConfig},
};
use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Instant};
use tracing::{debug, trace};

/// ANT+ public RF channel, 2457 MHz
pub const ANT_PLUS_FREQUENCY: u8 = 57;

/// RF channel used by the SRM bridge, 2450 MHz
pub const SRM_FREQUENCY: u8 = 50;

/// SRM bridge page carrying the rider's initials
const SRM_PAGE_INITIALS: u8 = 5;
/// SRM bridge page carrying power, speed, cadence and heart rate
const SRM_PAGE_DATA: u8 = 6;

/// Kind of sensor bound to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    /// Heart rate monitor
    HeartRate,
    /// Bike cadence sensor
    BikeCadence,
    /// Combined bike speed and cadence sensor
    BikeSpeedCadence,
    /// SRM PowerControl bridge relaying power, cadence and heart rate
    SrmBridge,
}

impl SensorType {
    /// All supported sensor types
    pub const ALL: [Self; 4] = [
        Self::HeartRate,
        Self::BikeCadence,
        Self::BikeSpeedCadence,
        Self::SrmBridge,
    ];

    /// ANT device type id
    #[must_use]
    pub const fn device_type(self) -> u8 {
        match self {
            Self::HeartRate => 120,
            Self::BikeCadence => 122,
            Self::BikeSpeedCadence => 121,
            Self::SrmBridge => 12,
        }
    }

    /// Channel message period in 1/32768 s units
    #[must_use]
    pub const fn channel_period(self) -> u16 {
        match self {
            Self::HeartRate => 8070,        // ~4.06 Hz
            Self::BikeCadence => 8102,      // ~4.04 Hz
            Self::BikeSpeedCadence => 8086, // ~4.05 Hz
            Self::SrmBridge => 8192,        // 4.00 Hz
        }
    }

    /// RF frequency offset from 2400 MHz
    #[must_use]
    pub const fn rf_frequency(self) -> u8 {
        match self {
            Self::SrmBridge => SRM_FREQUENCY,
            _ => ANT_PLUS_FREQUENCY,
        }
    }

    /// Look up a sensor type by ANT device type id
    ///
    /// The pairing bit (bit 7) is ignored.
    #[must_use]
    pub const fn from_device_type(device_type: u8) -> Option<Self> {
        match device_type & 0x7F {
            120 => Some(Self::HeartRate),
            122 => Some(Self::BikeCadence),
            121 => Some(Self::BikeSpeedCadence),
            12 => Some(Self::SrmBridge),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "Heart Rate"),
            Self::BikeCadence => write!(f, "Bike Cadence"),
            Self::BikeSpeedCadence => write!(f, "Bike Speed & Cadence"),
            Self::SrmBridge => write!(f, "SRM Bridge"),
        }
    }
}

/// Values decoded from one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorValue {
    /// Heart rate in beats per minute
    pub heart_rate: Option<u16>,
    /// Cadence in revolutions per minute
    pub cadence: Option<f32>,
    /// Speed in meters per second
    pub speed: Option<f32>,
    /// Power in watts
    pub power: Option<u16>,
}

impl SensorValue {
    /// Whether any field is set
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.heart_rate.is_none()
            && self.cadence.is_none()
            && self.speed.is_none()
            && self.power.is_none()
    }
}

/// Per sensor type payload decoder
///
/// Chosen once when a channel opens and kept for the channel's lifetime.
#[derive(Debug, Clone)]
pub enum SensorDecoder {
    /// Computed heart rate is sent directly, no estimation needed
    HeartRate,
    /// Crank revolutions into cadence
    BikeCadence {
        /// Crank revolution rate
        crank: EventRateEstimator,
    },
    /// Crank and wheel revolutions into cadence and speed
    BikeSpeedCadence {
        /// Crank revolution rate
        crank: EventRateEstimator,
        /// Wheel revolution rate
        wheel: EventRateEstimator,
        /// Wheel circumference in meters
        wheel_circumference: f32,
    },
    /// Instantaneous values relayed by the SRM bridge
    SrmBridge {
        /// Sequence id of the last data page
        last_sequence: Option<u8>,
    },
}

impl SensorDecoder {
    /// Create the decoder for a sensor type
    #[must_use]
    pub fn new(sensor: SensorType, rate: &RateConfig, wheel_circumference: f32) -> Self {
        match sensor {
            SensorType::HeartRate => Self::HeartRate,
            SensorType::BikeCadence => Self::BikeCadence {
                crank: EventRateEstimator::new(*rate),
            },
            SensorType::BikeSpeedCadence => Self::BikeSpeedCadence {
                crank: EventRateEstimator::new(*rate),
                wheel: EventRateEstimator::new(*rate),
                wheel_circumference,
            },
            SensorType::SrmBridge => Self::SrmBridge {
                last_sequence: None,
            },
        }
    }

    /// Sensor type this decoder handles
    #[must_use]
    pub const fn sensor(&self) -> SensorType {
        match self {
            Self::HeartRate => SensorType::HeartRate,
            Self::BikeCadence { .. } => SensorType::BikeCadence,
            Self::BikeSpeedCadence { .. } => SensorType::BikeSpeedCadence,
            Self::SrmBridge { .. } => SensorType::SrmBridge,
        }
    }

    /// Decode a broadcast payload
    ///
    /// Returns `None` when the payload carries no usable value yet: a zero
    /// heart rate, the first counter reading, or a repeated bridge page.
    ///
    /// Payload layouts:
    /// - heart rate: byte 7 computed heart rate
    /// - cadence: bytes 4-5 crank event time, 6-7 crank revolutions (little-endian)
    /// - speed & cadence: bytes 0-1 crank time, 2-3 crank revolutions,
    ///   4-5 wheel time, 6-7 wheel revolutions (little-endian)
    /// - SRM bridge: byte 0 page type, 1 sequence id, 2-3 power,
    ///   4-5 speed in 0.1 km/h (big-endian), 6 cadence, 7 heart rate
    pub fn decode(&mut self, payload: &[u8; PAYLOAD_SIZE], now: Instant) -> Option<SensorValue> {
        match self {
            Self::HeartRate => {
                let bpm = payload[7];
                (bpm > 0).then(|| SensorValue {
                    heart_rate: Some(u16::from(bpm)),
                    ..SensorValue::default()
                })
            }
            Self::BikeCadence { crank } => {
                let mut buf = &payload[4..];
                let time = buf.get_u16_le();
                let revolutions = buf.get_u16_le();
                let primed = crank.is_primed();
                let rpm = crank.update(now, revolutions, time);
                primed.then(|| SensorValue {
                    cadence: Some(rpm as f32),
                    ..SensorValue::default()
                })
            }
            Self::BikeSpeedCadence {
                crank,
                wheel,
                wheel_circumference,
            } => {
                let mut buf = &payload[..];
                let crank_time = buf.get_u16_le();
                let crank_revolutions = buf.get_u16_le();
                let wheel_time = buf.get_u16_le();
                let wheel_revolutions = buf.get_u16_le();

                let primed = crank.is_primed() && wheel.is_primed();
                let rpm = crank.update(now, crank_revolutions, crank_time);
                let wheel_rpm = wheel.update(now, wheel_revolutions, wheel_time);
                primed.then(|| SensorValue {
                    cadence: Some(rpm as f32),
                    speed: Some(wheel_rpm as f32 * *wheel_circumference / 60.0),
                    ..SensorValue::default()
                })
            }
            Self::SrmBridge { last_sequence } => decode_srm(payload, last_sequence),
        }
    }

    /// Re-evaluate rate based values without a new broadcast
    ///
    /// Lets cadence and speed decay while the sensor is silent. Decoders
    /// without estimators return `None`.
    pub fn refresh(&mut self, now: Instant) -> Option<SensorValue> {
        match self {
            Self::BikeCadence { crank } if crank.is_primed() => Some(SensorValue {
                cadence: Some(crank.refresh(now) as f32),
                ..SensorValue::default()
            }),
            Self::BikeSpeedCadence {
                crank,
                wheel,
                wheel_circumference,
            } if crank.is_primed() && wheel.is_primed() => Some(SensorValue {
                cadence: Some(crank.refresh(now) as f32),
                speed: Some(wheel.refresh(now) as f32 * *wheel_circumference / 60.0),
                ..SensorValue::default()
            }),
            _ => None,
        }
    }

    /// Clear any rate history, used when the channel closes or goes offline
    pub fn reset(&mut self) {
        match self {
            Self::HeartRate => {}
            Self::BikeCadence { crank } => crank.reset(),
            Self::BikeSpeedCadence { crank, wheel, .. } => {
                crank.reset();
                wheel.reset();
            }
            Self::SrmBridge { last_sequence } => *last_sequence = None,
        }
    }
}

fn decode_srm(payload: &[u8; PAYLOAD_SIZE], last_sequence: &mut Option<u8>) -> Option<SensorValue> {
    let mut buf = &payload[..];
    let page = buf.get_u8();
    match page {
        SRM_PAGE_DATA => {}
        SRM_PAGE_INITIALS => return None,
        other => {
            debug!(page = other, "unexpected SRM page type");
            return None;
        }
    }

    let sequence = buf.get_u8();
    if let Some(last) = *last_sequence {
        // the id is a single byte, so a small id after a large one is a wrap
        let wrapped = sequence < 20 && last > 200;
        if sequence == last || (sequence < last && !wrapped) {
            trace!(sequence, "SRM ignoring repeat");
            return None;
        }
    }
    *last_sequence = Some(sequence);

    let power = buf.get_u16();
    let speed_tenth_kmh = buf.get_u16();
    let cadence = buf.get_u8();
    let bpm = buf.get_u8();

    Some(SensorValue {
        heart_rate: (bpm > 0).then_some(u16::from(bpm)),
        cadence: Some(f32::from(cadence)),
        speed: Some(f32::from(speed_tenth_kmh) / 36.0),
        power: Some(power),
    })
}
