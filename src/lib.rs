#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # antsense
//!
//! A Rust library for pairing with and decoding ANT+ fitness sensors.
//!
//! The crate is the sensor core of an ANT receiver: it takes the raw messages
//! an ANT USB stick delivers, drives the channel configuration and pairing
//! handshake, decodes sensor broadcasts and publishes the results as an
//! immutable snapshot. Talking to the stick itself is left to the host; the
//! core only needs a way to send commands ([`RadioSink`]) and, optionally, a
//! place to remember paired devices ([`PairingStore`]).
//!
//! ## Supported Sensors
//!
//! - **Heart rate monitors** (device type 120)
//! - **Bike cadence sensors** (device type 122)
//! - **Bike speed & cadence sensors** (device type 121)
//! - **SRM PowerControl bridge** (device type 12, power, cadence, speed and heart rate)
//!
//! Cadence and speed are derived from the sensors' wrapping revolution
//! counters and 1/1024 s event timestamps, and decay towards zero when the
//! sensor stops reporting new revolutions.
//!
//! ## Quick Start
//!
//! ```
//! use antsense::{FrameSink, MemoryPairingStore, SensorType, Supervisor, SupervisorConfig};
//! use std::{sync::Arc, time::Instant};
//!
//! // frames for the USB writer task arrive on `frames`
//! let (sink, mut frames) = FrameSink::channel();
//! let supervisor = Supervisor::new(
//!     SupervisorConfig::default(),
//!     sink,
//!     Arc::new(MemoryPairingStore::new()),
//! );
//!
//! supervisor.open(0, SensorType::HeartRate)?;
//! assert_eq!(frames.try_recv().unwrap().as_ref(), &[0x03, 0x42, 0x00, 0x00, 0x00]);
//!
//! // hand every message read from the stick to the supervisor
//! supervisor.feed(&[0x03, 0x40, 0x00, 0x42, 0x00], Instant::now())?;
//!
//! let snapshot = supervisor.current_snapshot();
//! if let Some(heart_rate) = snapshot.heart_rate {
//!     println!("{} bpm", heart_rate.value);
//! }
//! # Ok::<(), antsense::AntError>(())
//! ```

/// Channel state machine and configuration handshake
pub mod channel;
/// Error types and handling
pub mod error;
/// Remembered device pairings
pub mod pairing;
/// ANT message structures and parsing
pub mod protocol;
/// Command sink and clock abstractions
pub mod radio;
/// Events-per-minute estimation from wrapping counters
pub mod rate;
/// Sensor types and payload decoders
pub mod sensor;
/// Channel supervisor
pub mod supervisor;
/// Snapshot and configuration types
pub mod types;

// Re-export the main types for convenient usage
pub use channel::{ChannelConfig, ChannelState};
pub use error::{AntError, DecodeError, Result};
pub use pairing::{MemoryPairingStore, PairingStore};
pub use protocol::{Command, MessageId, ProtocolMessage, RawMessage};
pub use radio::{Clock, FrameSink, RadioSink, SystemClock};
pub use rate::{EventRateEstimator, RateConfig};
pub use sensor::{SensorType, SensorValue};
pub use supervisor::Supervisor;
pub use types::{ChannelAssignment, Reading, SensorSnapshot, SupervisorConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ANT+ managed network number
///
/// Channels are assigned on network 0. The ANT+ network key itself is set by
/// the radio driver before any channel is opened.
pub const ANT_PLUS_NETWORK: u8 = 0;
