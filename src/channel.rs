use crate::{
    error::{AntError, Result},
    protocol::{
        Command, MessageId, CHANNEL_IN_WRONG_STATE, EVENT_CHANNEL_CLOSED, EVENT_RX_FAIL,
        EVENT_RX_FAIL_GO_TO_SEARCH, EVENT_RX_SEARCH_TIMEOUT, RESPONSE_NO_ERROR,
        WILDCARD_DEVICE_NUMBER,
    },
    sensor::SensorType,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Slave receive channel type
const CHANNEL_TYPE_RX: u8 = 0x00;

/// Connection state of a radio channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not in use
    #[default]
    Closed,
    /// Configuration handshake in progress
    PendingOpen,
    /// Open and searching for a device
    Searching,
    /// Receiving broadcasts, no usable value decoded yet
    TrackingStatus,
    /// Receiving broadcasts with usable values
    TrackingData,
    /// Search timed out or the radio rejected the configuration
    Offline,
}

impl ChannelState {
    /// Whether the radio is searching for or tracking a device
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Searching | Self::TrackingStatus | Self::TrackingData
        )
    }

    /// Whether a device has been found
    #[must_use]
    pub const fn is_tracking(self) -> bool {
        matches!(self, Self::TrackingStatus | Self::TrackingData)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::PendingOpen => write!(f, "Pending Open"),
            Self::Searching => write!(f, "Searching"),
            Self::TrackingStatus => write!(f, "Tracking Status"),
            Self::TrackingData => write!(f, "Tracking Data"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Static radio configuration of a channel
///
/// Fixed when the channel opens. The device number is the one field that
/// changes afterwards, when a wildcard search resolves to a real device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Sensor bound to the channel
    pub sensor: SensorType,
    /// ANT device type id
    pub device_type: u8,
    /// Device number, 0 to pair with any device
    pub device_number: u16,
    /// Transmission type
    pub transmission_type: u8,
    /// Network number
    pub network: u8,
    /// Message period in 1/32768 s units
    pub period: u16,
    /// RF frequency offset from 2400 MHz
    pub rf_frequency: u8,
    /// Proximity search bin, only sent for wildcard searches
    pub proximity_bin: u8,
    /// High priority search timeout in 2.5 s units, 0 disables it
    pub search_timeout: u8,
    /// Low priority search timeout in 2.5 s units
    pub low_priority_search_timeout: u8,
}

impl ChannelConfig {
    /// Standard configuration for a sensor type
    ///
    /// High priority search is disabled and the low priority search runs for
    /// 30 seconds.
    #[must_use]
    pub const fn for_sensor(sensor: SensorType, device_number: u16) -> Self {
        Self {
            sensor,
            device_type: sensor.device_type(),
            device_number,
            transmission_type: 0x01,
            network: crate::ANT_PLUS_NETWORK,
            period: sensor.channel_period(),
            rf_frequency: sensor.rf_frequency(),
            proximity_bin: 0,
            search_timeout: 0,
            low_priority_search_timeout: 12,
        }
    }

    /// Whether the channel searches for any device of its type
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        self.device_number == WILDCARD_DEVICE_NUMBER
    }
}

/// Steps of the channel configuration handshake, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    /// Assign the channel
    Assign,
    /// Set device number, type and transmission type
    SetChannelId,
    /// Set the message period
    SetPeriod,
    /// Set the RF frequency
    SetFrequency,
    /// Set the high priority search timeout
    SetSearchTimeout,
    /// Set the low priority search timeout
    SetLowPrioritySearchTimeout,
    /// Configure proximity search (wildcard searches only)
    SetProximitySearch,
    /// Open the channel
    Open,
}

impl ConfigStep {
    /// Message id the radio echoes in its response to this step
    #[must_use]
    pub const fn message_id(self) -> MessageId {
        match self {
            Self::Assign => MessageId::AssignChannel,
            Self::SetChannelId => MessageId::ChannelId,
            Self::SetPeriod => MessageId::ChannelPeriod,
            Self::SetFrequency => MessageId::RadioFrequency,
            Self::SetSearchTimeout => MessageId::SearchTimeout,
            Self::SetLowPrioritySearchTimeout => MessageId::LowPrioritySearchTimeout,
            Self::SetProximitySearch => MessageId::ProximitySearch,
            Self::Open => MessageId::OpenChannel,
        }
    }

    /// Step following this one, `None` after the channel is opened
    #[must_use]
    pub const fn next(self, wildcard: bool) -> Option<Self> {
        match self {
            Self::Assign => Some(Self::SetChannelId),
            Self::SetChannelId => Some(Self::SetPeriod),
            Self::SetPeriod => Some(Self::SetFrequency),
            Self::SetFrequency => Some(Self::SetSearchTimeout),
            Self::SetSearchTimeout => Some(Self::SetLowPrioritySearchTimeout),
            Self::SetLowPrioritySearchTimeout if wildcard => Some(Self::SetProximitySearch),
            Self::SetLowPrioritySearchTimeout | Self::SetProximitySearch => Some(Self::Open),
            Self::Open => None,
        }
    }

    /// Radio command for this step
    #[must_use]
    pub const fn command(self, channel: u8, config: &ChannelConfig) -> Command {
        match self {
            Self::Assign => Command::AssignChannel {
                channel,
                channel_type: CHANNEL_TYPE_RX,
                network: config.network,
            },
            Self::SetChannelId => Command::SetChannelId {
                channel,
                device_number: config.device_number,
                device_type: config.device_type,
                transmission_type: config.transmission_type,
            },
            Self::SetPeriod => Command::SetChannelPeriod {
                channel,
                period: config.period,
            },
            Self::SetFrequency => Command::SetRadioFrequency {
                channel,
                frequency: config.rf_frequency,
            },
            Self::SetSearchTimeout => Command::SetSearchTimeout {
                channel,
                timeout: config.search_timeout,
            },
            Self::SetLowPrioritySearchTimeout => Command::SetLowPrioritySearchTimeout {
                channel,
                timeout: config.low_priority_search_timeout,
            },
            Self::SetProximitySearch => Command::SetProximitySearch {
                channel,
                bin: config.proximity_bin,
            },
            Self::Open => Command::OpenChannel { channel },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Close,
    Unassign,
}

/// What the owner of a channel has to do after a transition
#[derive(Debug, Default)]
pub struct Effects {
    /// Commands to send to the radio, in order
    pub commands: Vec<Command>,
    /// The broadcast should be handed to the sensor decoder
    pub decode: bool,
    /// A wildcard search resolved to this device number
    pub paired: Option<u16>,
    /// Rate history must be cleared
    pub reset: bool,
    /// The radio rejected a handshake step
    pub rejected: Option<AntError>,
}

impl Effects {
    /// Nothing to do
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && !self.decode
            && self.paired.is_none()
            && !self.reset
            && self.rejected.is_none()
    }

    fn command(command: Command) -> Self {
        Self {
            commands: vec![command],
            ..Self::default()
        }
    }
}

/// State machine for one radio channel
///
/// Transitions are driven by the channel responses and broadcasts routed to
/// it. The machine never talks to the radio itself; it returns the commands
/// to send in [`Effects`].
#[derive(Debug, Clone)]
pub struct Channel {
    number: u8,
    state: ChannelState,
    config: Option<ChannelConfig>,
    pending: Option<ConfigStep>,
    teardown: Option<Teardown>,
    assigned: bool,
    opened: bool,
    since: Option<Instant>,
}

impl Channel {
    /// Create a closed channel
    #[must_use]
    pub const fn new(number: u8) -> Self {
        Self {
            number,
            state: ChannelState::Closed,
            config: None,
            pending: None,
            teardown: None,
            assigned: false,
            opened: false,
            since: None,
        }
    }

    /// Channel number
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.number
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ChannelState {
        self.state
    }

    /// Configuration of the last open request
    #[must_use]
    pub const fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    /// Handshake step awaiting a response
    #[must_use]
    pub const fn pending_step(&self) -> Option<ConfigStep> {
        self.pending
    }

    /// When the current state was entered
    #[must_use]
    pub const fn since(&self) -> Option<Instant> {
        self.since
    }

    /// Closed with no teardown in flight, so radio traffic has nothing to act on
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.state, ChannelState::Closed) && self.teardown.is_none()
    }

    /// Start the configuration handshake
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidState`] unless the channel is `Closed` or
    /// `Offline`.
    pub fn open(&mut self, config: ChannelConfig, now: Instant) -> Result<Vec<Command>> {
        if !matches!(self.state, ChannelState::Closed | ChannelState::Offline) {
            return Err(AntError::InvalidState {
                channel: self.number,
                state: self.state,
            });
        }

        info!(
            channel = self.number,
            sensor = %config.sensor,
            device_number = config.device_number,
            "opening channel"
        );

        self.config = Some(config);
        self.pending = Some(ConfigStep::Assign);
        self.assigned = false;
        self.opened = false;
        self.transition(ChannelState::PendingOpen, now);

        Ok(vec![ConfigStep::Assign.command(self.number, &config)])
    }

    /// Handle a channel response or RF event
    pub fn on_response(&mut self, responding_to: u8, code: u8, now: Instant) -> Effects {
        if responding_to == MessageId::Event as u8 {
            return self.on_event(code, now);
        }

        if let Some(step) = self.pending {
            if step.message_id() as u8 == responding_to {
                return self.on_step_response(step, code, now);
            }
        }

        match MessageId::from_u8(responding_to) {
            Some(MessageId::CloseChannel) if self.teardown == Some(Teardown::Close) => {
                if code == RESPONSE_NO_ERROR {
                    // unassign once the radio reports the channel closed
                    return Effects::default();
                }
                debug!(channel = self.number, code, "close rejected, unassigning directly");
                Effects::command(self.begin_unassign())
            }
            Some(MessageId::UnassignChannel) => {
                if self.teardown == Some(Teardown::Unassign) {
                    self.teardown = None;
                }
                if code == RESPONSE_NO_ERROR {
                    debug!(channel = self.number, "channel unassigned");
                } else {
                    debug!(channel = self.number, code, "unassign rejected");
                }
                Effects::default()
            }
            Some(MessageId::Request) if code != RESPONSE_NO_ERROR => {
                warn!(channel = self.number, code, "channel id request rejected");
                Effects::default()
            }
            _ => {
                trace!(channel = self.number, responding_to, code, "ignoring response");
                Effects::default()
            }
        }
    }

    /// Handle a broadcast from the tracked (or searched-for) device
    ///
    /// Broadcasts are only meaningful once the channel is open; anything
    /// received in `Closed`, `PendingOpen` or `Offline` is dropped.
    pub fn on_broadcast(&mut self, now: Instant) -> Effects {
        match self.state {
            ChannelState::Searching => self.transition(ChannelState::TrackingStatus, now),
            ChannelState::TrackingStatus | ChannelState::TrackingData => {}
            state => {
                debug!(channel = self.number, %state, "ignoring broadcast");
                return Effects::default();
            }
        }

        let mut effects = Effects {
            decode: true,
            ..Effects::default()
        };
        if self.config.is_some_and(|config| config.is_wildcard()) {
            debug!(channel = self.number, "requesting channel id");
            effects.commands.push(Command::RequestMessage {
                channel: self.number,
                message_id: MessageId::ChannelId,
            });
        }
        effects
    }

    /// Note that the last broadcast decoded into a usable value
    pub fn record_data(&mut self, now: Instant) {
        if self.state == ChannelState::TrackingStatus {
            self.transition(ChannelState::TrackingData, now);
        }
    }

    /// Handle the channel id reported by the radio
    ///
    /// A non-wildcard id replaces the configured device number. When several
    /// ids arrive the last one wins.
    pub fn on_channel_id(&mut self, device_number: u16) -> Effects {
        if !self.state.is_active() || device_number == WILDCARD_DEVICE_NUMBER {
            debug!(channel = self.number, device_number, state = %self.state, "ignoring channel id");
            return Effects::default();
        }
        let Some(config) = self.config.as_mut() else {
            return Effects::default();
        };

        if config.device_number == device_number {
            return Effects::default();
        }

        info!(channel = self.number, device_number, "found ANT device");
        config.device_number = device_number;
        Effects {
            paired: Some(device_number),
            ..Effects::default()
        }
    }

    /// Close the channel
    ///
    /// Idempotent: closing a closed channel does nothing. An open channel is
    /// closed and then unassigned once the radio confirms; a channel that was
    /// only assigned is unassigned straight away.
    pub fn close(&mut self, now: Instant) -> Effects {
        if self.state == ChannelState::Closed {
            return Effects::default();
        }

        let mut effects = Effects {
            reset: true,
            ..Effects::default()
        };
        if self.opened {
            self.teardown = Some(Teardown::Close);
            self.opened = false;
            effects.commands.push(Command::CloseChannel {
                channel: self.number,
            });
        } else if self.assigned || self.pending.is_some() {
            effects.commands.push(self.begin_unassign());
        }

        self.pending = None;
        self.transition(ChannelState::Closed, now);
        effects
    }

    /// Apply the search timeout lazily
    ///
    /// The radio normally reports the timeout itself; this covers a lost
    /// event.
    pub fn expire(&mut self, now: Instant, search_timeout: Duration) -> Effects {
        let timed_out = self.state == ChannelState::Searching
            && self
                .since
                .is_some_and(|since| now.saturating_duration_since(since) >= search_timeout);
        if !timed_out {
            return Effects::default();
        }

        warn!(channel = self.number, "no device found before search timeout");
        self.time_out(now)
    }

    /// Take the channel offline after the radio link failed
    pub fn fail(&mut self, now: Instant) -> Effects {
        if matches!(self.state, ChannelState::Closed | ChannelState::Offline) {
            return Effects::default();
        }
        self.assigned = false;
        self.teardown = None;
        self.go_offline(now)
    }

    /// Forget everything after the radio reset itself
    pub fn force_reset(&mut self, now: Instant) -> Effects {
        let was_idle = self.is_idle();
        let previous = self.state;
        *self = Self::new(self.number);
        self.since = Some(now);
        if previous != ChannelState::Closed {
            info!(channel = self.number, from = %previous, "channel reset by radio");
        }
        Effects {
            reset: !was_idle,
            ..Effects::default()
        }
    }

    fn on_step_response(&mut self, step: ConfigStep, code: u8, now: Instant) -> Effects {
        let Some(config) = self.config else {
            return Effects::default();
        };

        if code != RESPONSE_NO_ERROR {
            let mut effects = self.go_offline(now);
            effects.rejected = Some(AntError::Protocol {
                channel: self.number,
                message_id: step.message_id() as u8,
                code,
            });
            if self.assigned {
                effects.commands.push(self.begin_unassign());
            }
            return effects;
        }

        if step == ConfigStep::Assign {
            self.assigned = true;
        }

        match step.next(config.is_wildcard()) {
            Some(next) => {
                trace!(channel = self.number, step = %next.message_id(), "configuring channel");
                self.pending = Some(next);
                if next == ConfigStep::Open {
                    self.opened = true;
                }
                Effects::command(next.command(self.number, &config))
            }
            None => {
                self.pending = None;
                self.transition(ChannelState::Searching, now);
                Effects::default()
            }
        }
    }

    fn on_event(&mut self, code: u8, now: Instant) -> Effects {
        match code {
            EVENT_RX_SEARCH_TIMEOUT if self.state.is_active() => {
                warn!(channel = self.number, "ANT search timed out, unassigning channel");
                self.time_out(now)
            }
            EVENT_CHANNEL_CLOSED if self.teardown == Some(Teardown::Close) => {
                Effects::command(self.begin_unassign())
            }
            EVENT_RX_FAIL_GO_TO_SEARCH if self.state.is_tracking() => {
                self.transition(ChannelState::Searching, now);
                Effects::default()
            }
            EVENT_RX_FAIL => {
                trace!(channel = self.number, "missed broadcast");
                Effects::default()
            }
            CHANNEL_IN_WRONG_STATE => {
                warn!(channel = self.number, state = %self.state, "radio reports channel in wrong state");
                Effects::default()
            }
            _ => {
                debug!(channel = self.number, code, state = %self.state, "ignoring channel event");
                Effects::default()
            }
        }
    }

    fn time_out(&mut self, now: Instant) -> Effects {
        let mut effects = self.go_offline(now);
        effects.commands.push(self.begin_unassign());
        effects
    }

    fn go_offline(&mut self, now: Instant) -> Effects {
        self.pending = None;
        self.opened = false;
        self.transition(ChannelState::Offline, now);
        Effects {
            reset: true,
            ..Effects::default()
        }
    }

    fn begin_unassign(&mut self) -> Command {
        self.teardown = Some(Teardown::Unassign);
        self.assigned = false;
        self.opened = false;
        Command::UnassignChannel {
            channel: self.number,
        }
    }

    fn transition(&mut self, next: ChannelState, now: Instant) {
        if self.state != next {
            info!(channel = self.number, from = %self.state, to = %next, "channel state changed");
        }
        self.state = next;
        self.since = Some(now);
    }
}
