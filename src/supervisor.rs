use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{Channel, ChannelConfig, ChannelState, Effects},
    error::{AntError, DecodeError, Result},
    pairing::PairingStore,
    protocol::{decode, ProtocolMessage, RawMessage, WILDCARD_DEVICE_NUMBER},
    radio::{Clock, RadioSink, SystemClock},
    sensor::{SensorDecoder, SensorType},
    types::{SensorSnapshot, SupervisorConfig},
};

/// Channel numbers are five bits wide on the wire
const MAX_CHANNELS: usize = 32;

struct Slot {
    channel: Channel,
    decoder: Option<SensorDecoder>,
}

struct Inner {
    slots: Vec<Slot>,
    sink: Box<dyn RadioSink>,
    // working copy, published as an immutable Arc
    snapshot: SensorSnapshot,
    dirty: bool,
    started: bool,
}

/// Owns the radio channels and publishes decoded sensor values
///
/// `Supervisor` routes every message received from the ANT radio to the
/// state machine and decoder of its channel, sends the resulting commands to
/// the radio and keeps an aggregated [`SensorSnapshot`] up to date.
///
/// All channel state sits behind one lock. Readers get the last published
/// snapshot, an immutable `Arc` that is swapped on every change, so they
/// never wait for decode work. Search timeouts and the decay of cadence and
/// speed are evaluated lazily whenever a message is fed or a snapshot is read.
///
/// # Examples
///
/// ```
/// use antsense::{ChannelState, Command, MemoryPairingStore, Supervisor, SupervisorConfig};
/// use std::{sync::Arc, time::Instant};
///
/// let sink = |command: &Command| -> antsense::Result<()> {
///     println!("-> {command}");
///     Ok(())
/// };
/// let supervisor = Supervisor::new(
///     SupervisorConfig::default(),
///     sink,
///     Arc::new(MemoryPairingStore::new()),
/// );
///
/// // heart rate on 0, cadence on 1, speed & cadence on 2
/// supervisor.start()?;
///
/// // the radio acknowledges ASSIGN_CHANNEL on channel 0
/// supervisor.feed(&[0x03, 0x40, 0x00, 0x42, 0x00], Instant::now())?;
///
/// let snapshot = supervisor.current_snapshot();
/// assert_eq!(snapshot.channel_states[0], ChannelState::PendingOpen);
/// assert!(snapshot.heart_rate.is_none());
/// # Ok::<(), antsense::AntError>(())
/// ```
pub struct Supervisor {
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<Arc<SensorSnapshot>>,
    pairing: Arc<dyn PairingStore>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    /// Create a supervisor using the system clock
    pub fn new(
        config: SupervisorConfig,
        sink: impl RadioSink + 'static,
        pairing: Arc<dyn PairingStore>,
    ) -> Self {
        Self::with_clock(config, sink, pairing, Arc::new(SystemClock))
    }

    /// Create a supervisor with an explicit clock
    ///
    /// The clock is only consulted for operations that carry no receive
    /// time: opening, closing and reading snapshots.
    pub fn with_clock(
        config: SupervisorConfig,
        sink: impl RadioSink + 'static,
        pairing: Arc<dyn PairingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let count = config.channel_count.min(MAX_CHANNELS);
        if count < config.channel_count {
            warn!(
                requested = config.channel_count,
                count, "limiting supervised channels"
            );
        }

        let slots = (0..=u8::MAX)
            .take(count)
            .map(|number| Slot {
                channel: Channel::new(number),
                decoder: None,
            })
            .collect();
        let snapshot = SensorSnapshot::new(count);
        let (sender, _) = watch::channel(Arc::new(snapshot.clone()));

        Self {
            config,
            inner: Mutex::new(Inner {
                slots,
                sink: Box::new(sink),
                snapshot,
                dirty: false,
                started: false,
            }),
            snapshot: sender,
            pairing,
            clock,
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Open the configured channel layout
    ///
    /// Channels of the layout that are already open are left alone. The
    /// layout is opened again after the radio reports a reset.
    ///
    /// # Errors
    ///
    /// Returns the first error met while opening; the remaining channels of
    /// the layout are still opened.
    pub fn start(&self) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        info!(channels = self.config.layout.len(), "starting ANT sensors");

        inner.started = true;
        let result = self.open_layout(&mut inner, now);
        inner.publish(&self.snapshot);
        result
    }

    /// Open a channel for a sensor type
    ///
    /// Pairs with the device remembered by the pairing store, or searches for
    /// any device of the type when none is known.
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidChannel`] for a channel outside the
    /// supervised range, [`AntError::InvalidState`] if the channel is not
    /// `Closed` or `Offline`, and [`AntError::Transport`] if the radio could
    /// not be reached; the channel is then `Offline`.
    pub fn open(&self, channel: u8, sensor: SensorType) -> Result<()> {
        self.open_with(channel, self.lookup(sensor))
    }

    /// Open a channel with an explicit configuration
    ///
    /// # Errors
    ///
    /// See [`Supervisor::open`].
    pub fn open_with(&self, channel: u8, config: ChannelConfig) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let result = self.open_in(&mut inner, channel, config, now);
        inner.publish(&self.snapshot);
        result
    }

    /// Close a channel
    ///
    /// Closing a closed channel does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidChannel`] for a channel outside the
    /// supervised range and [`AntError::Transport`] if the close command
    /// could not be sent.
    pub fn close(&self, channel: u8) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let result = inner.slot_index(channel).and_then(|index| {
            let effects = inner.slots[index].channel.close(now);
            inner.apply(index, effects, now, self.pairing.as_ref())
        });
        inner.publish(&self.snapshot);
        result
    }

    /// Close every channel
    ///
    /// A later radio reset no longer reopens the layout.
    ///
    /// # Errors
    ///
    /// Returns the first transport error; every channel is closed regardless.
    pub fn shutdown(&self) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        info!("stopping ANT sensors");

        inner.started = false;
        let mut result = Ok(());
        for index in 0..inner.slots.len() {
            let effects = inner.slots[index].channel.close(now);
            result = result.and(inner.apply(index, effects, now, self.pairing.as_ref()));
        }
        inner.publish(&self.snapshot);
        result
    }

    /// Feed one raw message received from the radio
    ///
    /// This is the only path through which radio traffic changes state.
    /// Messages for closed channels are dropped.
    ///
    /// # Errors
    ///
    /// All errors are recoverable: the message is dropped and the supervisor
    /// stays consistent. [`AntError::Decode`] for malformed or unknown
    /// messages, [`AntError::InvalidChannel`] for a channel outside the
    /// supervised range and [`AntError::Transport`] if a follow-up command
    /// could not be sent.
    pub fn feed(&self, bytes: &[u8], arrived_at: Instant) -> Result<()> {
        let message = decode(bytes).inspect_err(|error| match error {
            DecodeError::UnknownMessageId(_) => debug!(%error, "dropping message"),
            _ => warn!(%error, bytes = ?bytes, "dropping malformed message"),
        })?;
        trace!(?message, "received");

        let mut inner = self.inner.lock();
        self.tick(&mut inner, arrived_at);
        let result = self.dispatch(&mut inner, message, arrived_at);
        inner.publish(&self.snapshot);
        result
    }

    /// Feed a [`RawMessage`]
    ///
    /// # Errors
    ///
    /// See [`Supervisor::feed`].
    pub fn feed_raw(&self, message: &RawMessage) -> Result<()> {
        self.feed(&message.bytes, message.arrived_at)
    }

    /// Latest sensor snapshot
    ///
    /// Applies pending search timeouts and rate decay first, unless a message
    /// is being processed concurrently; the reader then gets the last
    /// published snapshot rather than waiting.
    pub fn current_snapshot(&self) -> Arc<SensorSnapshot> {
        if let Some(mut inner) = self.inner.try_lock() {
            let now = self.clock.now();
            self.tick(&mut inner, now);
            inner.publish(&self.snapshot);
        }
        Arc::clone(&self.snapshot.borrow())
    }

    /// Watch snapshot replacements
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<SensorSnapshot>> {
        self.snapshot.subscribe()
    }

    /// Current state of a channel, `None` when out of range
    #[must_use]
    pub fn channel_state(&self, channel: u8) -> Option<ChannelState> {
        self.inner
            .lock()
            .slots
            .get(usize::from(channel))
            .map(|slot| slot.channel.state())
    }

    fn lookup(&self, sensor: SensorType) -> ChannelConfig {
        let device_number = self.pairing.get(sensor).unwrap_or(WILDCARD_DEVICE_NUMBER);
        if device_number == WILDCARD_DEVICE_NUMBER {
            debug!(%sensor, "no paired device, searching");
        }
        ChannelConfig::for_sensor(sensor, device_number)
    }

    fn open_in(
        &self,
        inner: &mut Inner,
        channel: u8,
        config: ChannelConfig,
        now: Instant,
    ) -> Result<()> {
        let index = inner.slot_index(channel)?;
        let slot = &mut inner.slots[index];
        let commands = slot.channel.open(config, now)?;
        slot.decoder = Some(SensorDecoder::new(
            config.sensor,
            &self.config.rate,
            self.config.wheel_circumference,
        ));

        let effects = Effects {
            commands,
            ..Effects::default()
        };
        inner.apply(index, effects, now, self.pairing.as_ref())
    }

    fn open_layout(&self, inner: &mut Inner, now: Instant) -> Result<()> {
        let mut result = Ok(());
        for assignment in &self.config.layout {
            let state = inner
                .slots
                .get(usize::from(assignment.channel))
                .map(|slot| slot.channel.state());
            if state.is_some_and(|state| !matches!(state, ChannelState::Closed | ChannelState::Offline)) {
                debug!(channel = assignment.channel, "channel already open");
                continue;
            }

            let config = self.lookup(assignment.sensor);
            if let Err(error) = self.open_in(inner, assignment.channel, config, now) {
                warn!(channel = assignment.channel, %error, "failed to open channel");
                result = result.and(Err(error));
            }
        }
        result
    }

    fn dispatch(&self, inner: &mut Inner, message: ProtocolMessage, now: Instant) -> Result<()> {
        if let ProtocolMessage::Startup { reason } = message {
            return self.restart(inner, reason, now);
        }
        let Some(channel) = message.channel() else {
            return Ok(());
        };

        let index = inner
            .slot_index(channel)
            .inspect_err(|error| warn!(%error, "dropping message"))?;
        let slot = &mut inner.slots[index];
        if slot.channel.is_idle() {
            debug!(channel, "dropping message for closed channel");
            return Ok(());
        }

        let effects = match message {
            ProtocolMessage::BroadcastData { payload, .. } => {
                let effects = slot.channel.on_broadcast(now);
                if effects.decode {
                    let value = slot
                        .decoder
                        .as_mut()
                        .and_then(|decoder| decoder.decode(&payload, now));
                    if value.is_some_and(|value| inner.snapshot.apply(channel, &value, now)) {
                        inner.dirty = true;
                        slot.channel.record_data(now);
                    }
                }
                effects
            }
            ProtocolMessage::ChannelId {
                device_number,
                device_type,
                ..
            } => {
                let expected = slot.channel.config().map(|config| config.sensor);
                if expected.is_some() && SensorType::from_device_type(device_type) != expected {
                    warn!(channel, device_type, "channel id reports a different device type");
                }
                slot.channel.on_channel_id(device_number)
            }
            ProtocolMessage::ChannelResponse {
                responding_to,
                code,
                ..
            } => slot.channel.on_response(responding_to, code, now),
            ProtocolMessage::Startup { .. } => return Ok(()),
        };

        inner.apply(index, effects, now, self.pairing.as_ref())
    }

    fn restart(&self, inner: &mut Inner, reason: u8, now: Instant) -> Result<()> {
        warn!(reason, "ANT radio reset, channels lost");
        for slot in &mut inner.slots {
            if slot.channel.force_reset(now).reset {
                inner.dirty |= inner.snapshot.clear(slot.channel.number());
            }
            slot.decoder = None;
        }

        if inner.started {
            self.open_layout(inner, now)
        } else {
            Ok(())
        }
    }

    fn tick(&self, inner: &mut Inner, now: Instant) {
        for index in 0..inner.slots.len() {
            let effects = inner.slots[index]
                .channel
                .expire(now, self.config.search_timeout);
            if !effects.is_empty() {
                if let Err(error) = inner.apply(index, effects, now, self.pairing.as_ref()) {
                    let channel = inner.slots[index].channel.number();
                    debug!(channel, %error, "unassign after search timeout failed");
                }
            }

            let slot = &mut inner.slots[index];
            if !slot.channel.state().is_tracking() {
                continue;
            }
            let channel = slot.channel.number();
            if let Some(value) = slot.decoder.as_mut().and_then(|decoder| decoder.refresh(now)) {
                inner.dirty |= inner.snapshot.apply_refresh(channel, &value);
            }
        }
    }
}

impl Inner {
    fn slot_index(&self, channel: u8) -> Result<usize> {
        let index = usize::from(channel);
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(AntError::InvalidChannel {
                channel,
                count: self.slots.len(),
            })
        }
    }

    fn apply(
        &mut self,
        index: usize,
        effects: Effects,
        now: Instant,
        pairing: &dyn PairingStore,
    ) -> Result<()> {
        let slot = &mut self.slots[index];
        let channel = slot.channel.number();
        let sensor = slot.channel.config().map(|config| config.sensor);

        if let Some(error) = &effects.rejected {
            error!(%error, "channel configuration rejected");
        }
        if effects.reset {
            if let Some(decoder) = slot.decoder.as_mut() {
                decoder.reset();
            }
            self.dirty |= self.snapshot.clear(channel);
        }
        if let (Some(device_number), Some(sensor)) = (effects.paired, sensor) {
            info!(channel, %sensor, device_number, "paired ANT device");
            pairing.set(sensor, device_number);
        }

        for command in &effects.commands {
            trace!(%command, "sending");
            if let Err(error) = self.sink.send(command) {
                error!(%command, %error, "failed to send radio command");
                if slot.channel.fail(now).reset {
                    if let Some(decoder) = slot.decoder.as_mut() {
                        decoder.reset();
                    }
                    self.dirty |= self.snapshot.clear(channel);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn publish(&mut self, sender: &watch::Sender<Arc<SensorSnapshot>>) {
        for (slot, state) in self.slots.iter().zip(self.snapshot.channel_states.iter_mut()) {
            if *state != slot.channel.state() {
                *state = slot.channel.state();
                self.dirty = true;
            }
        }
        if !self.dirty {
            return;
        }

        self.dirty = false;
        self.snapshot.version += 1;
        sender.send_replace(Arc::new(self.snapshot.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pairing::MemoryPairingStore,
        protocol::{
            Command, MessageId, EVENT_CHANNEL_CLOSED, EVENT_RX_SEARCH_TIMEOUT, RESPONSE_NO_ERROR,
        },
    };
    use std::time::Duration;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    struct Harness {
        supervisor: Supervisor,
        sent: Arc<Mutex<Vec<Command>>>,
        pairing: Arc<MemoryPairingStore>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(config: SupervisorConfig) -> Self {
            Self::with_pairing(config, MemoryPairingStore::new())
        }

        fn with_pairing(config: SupervisorConfig, pairing: MemoryPairingStore) -> Self {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&sent);
            let sink = move |command: &Command| -> Result<()> {
                log.lock().push(*command);
                Ok(())
            };
            let pairing = Arc::new(pairing);
            let clock = Arc::new(ManualClock {
                now: Mutex::new(Instant::now()),
            });
            let supervisor =
                Supervisor::with_clock(config, sink, pairing.clone(), clock.clone());
            Self {
                supervisor,
                sent,
                pairing,
                clock,
            }
        }

        fn take(&self) -> Vec<Command> {
            std::mem::take(&mut *self.sent.lock())
        }

        fn feed(&self, bytes: &[u8]) -> Result<()> {
            self.supervisor.feed(bytes, self.clock.now())
        }

        fn respond(&self, channel: u8, responding_to: u8, code: u8) {
            self.feed(&[3, 0x40, channel, responding_to, code]).unwrap();
        }

        /// Acknowledge every command until the radio goes quiet
        fn ack_all(&self) -> Vec<Command> {
            let mut all = Vec::new();
            loop {
                let batch = self.take();
                if batch.is_empty() {
                    return all;
                }
                for command in &batch {
                    self.respond(command.channel(), command.message_id() as u8, RESPONSE_NO_ERROR);
                }
                all.extend(batch);
            }
        }

        fn broadcast(&self, channel: u8, payload: [u8; 8]) {
            let mut frame = vec![9, 0x4E, channel];
            frame.extend_from_slice(&payload);
            self.feed(&frame).unwrap();
        }

        fn state(&self, channel: u8) -> Option<ChannelState> {
            self.supervisor.channel_state(channel)
        }
    }

    fn cadence_page(time: u16, revolutions: u16) -> [u8; 8] {
        let t = time.to_le_bytes();
        let r = revolutions.to_le_bytes();
        [0, 0, 0, 0, t[0], t[1], r[0], r[1]]
    }

    fn speed_cadence_page(crank: (u16, u16), wheel: (u16, u16)) -> [u8; 8] {
        let [c0, c1] = crank.0.to_le_bytes();
        let [c2, c3] = crank.1.to_le_bytes();
        let [w0, w1] = wheel.0.to_le_bytes();
        let [w2, w3] = wheel.1.to_le_bytes();
        [c0, c1, c2, c3, w0, w1, w2, w3]
    }

    #[test]
    fn test_start_opens_default_layout() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.start().unwrap();

        let sent = harness.take();
        assert_eq!(sent.len(), 3);
        for (channel, command) in sent.iter().enumerate() {
            assert_eq!(command.message_id(), MessageId::AssignChannel);
            assert_eq!(usize::from(command.channel()), channel);
        }

        let snapshot = harness.supervisor.current_snapshot();
        assert_eq!(snapshot.channel_states[..3], [ChannelState::PendingOpen; 3]);
        assert_eq!(snapshot.channel_states[3], ChannelState::Closed);
        assert!(snapshot.version > 0);
    }

    #[test]
    fn test_handshake_reaches_searching() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();

        harness.take();
        harness.respond(0, MessageId::AssignChannel as u8, RESPONSE_NO_ERROR);
        // an ack only advances the handshake
        assert_eq!(harness.state(0), Some(ChannelState::PendingOpen));

        let rest = harness.ack_all();
        assert_eq!(rest.last(), Some(&Command::OpenChannel { channel: 0 }));
        assert_eq!(harness.state(0), Some(ChannelState::Searching));
        assert_eq!(
            harness.supervisor.current_snapshot().channel_states[0],
            ChannelState::Searching
        );
    }

    #[test]
    fn test_wildcard_pairing_is_remembered() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(1, SensorType::BikeCadence).unwrap();
        let handshake = harness.ack_all();
        assert!(handshake
            .iter()
            .any(|command| command.message_id() == MessageId::ProximitySearch));

        harness.broadcast(1, cadence_page(0, 0));
        assert_eq!(
            harness.take(),
            vec![Command::RequestMessage {
                channel: 1,
                message_id: MessageId::ChannelId
            }]
        );

        let [lo, hi] = 1234u16.to_le_bytes();
        harness.feed(&[5, 0x51, 1, lo, hi, 122, 1]).unwrap();
        assert_eq!(harness.pairing.get(SensorType::BikeCadence), Some(1234));

        harness.supervisor.close(1).unwrap();
        assert_eq!(harness.take(), vec![Command::CloseChannel { channel: 1 }]);
        harness.respond(1, MessageId::CloseChannel as u8, RESPONSE_NO_ERROR);
        harness.respond(1, MessageId::Event as u8, EVENT_CHANNEL_CLOSED);
        assert_eq!(harness.take(), vec![Command::UnassignChannel { channel: 1 }]);
        harness.respond(1, MessageId::UnassignChannel as u8, RESPONSE_NO_ERROR);

        harness.supervisor.open(1, SensorType::BikeCadence).unwrap();
        let handshake = harness.ack_all();
        assert!(handshake.contains(&Command::SetChannelId {
            channel: 1,
            device_number: 1234,
            device_type: 122,
            transmission_type: 1,
        }));
        assert!(!handshake
            .iter()
            .any(|command| command.message_id() == MessageId::ProximitySearch));
    }

    #[test]
    fn test_broadcast_during_pending_open_is_ignored() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.take();

        harness.broadcast(0, [0, 0, 0, 0, 0, 0, 0, 150]);
        let snapshot = harness.supervisor.current_snapshot();
        assert!(snapshot.heart_rate.is_none());
        assert_eq!(snapshot.channel_states[0], ChannelState::PendingOpen);
        assert!(harness.take().is_empty());
    }

    #[test]
    fn test_heart_rate_reaches_snapshot() {
        let pairing = MemoryPairingStore::with_pairings([(SensorType::HeartRate, 99)]);
        let harness = Harness::with_pairing(SupervisorConfig::default(), pairing);
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.ack_all();

        let before = harness.supervisor.current_snapshot();
        harness.broadcast(0, [0, 0, 0, 0, 0, 0, 0, 150]);
        let snapshot = harness.supervisor.current_snapshot();

        let reading = snapshot.heart_rate.unwrap();
        assert_eq!(reading.value, 150);
        assert_eq!(reading.at, harness.clock.now());
        assert_eq!(snapshot.channel_states[0], ChannelState::TrackingData);
        assert!(snapshot.version > before.version);
        // known device, no channel id request
        assert!(harness.take().is_empty());
        // the earlier snapshot is untouched
        assert!(before.heart_rate.is_none());
    }

    #[test]
    fn test_search_timeout_event_takes_channel_offline() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(2, SensorType::BikeSpeedCadence).unwrap();
        harness.ack_all();

        harness.respond(2, MessageId::Event as u8, EVENT_RX_SEARCH_TIMEOUT);
        assert_eq!(harness.state(2), Some(ChannelState::Offline));
        assert_eq!(harness.take(), vec![Command::UnassignChannel { channel: 2 }]);

        // may be opened again
        harness.respond(2, MessageId::UnassignChannel as u8, RESPONSE_NO_ERROR);
        assert!(harness.supervisor.open(2, SensorType::BikeSpeedCadence).is_ok());
    }

    #[test]
    fn test_search_timeout_applied_lazily() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.ack_all();

        harness.clock.advance(Duration::from_secs(29));
        assert_eq!(
            harness.supervisor.current_snapshot().channel_states[0],
            ChannelState::Searching
        );

        harness.clock.advance(Duration::from_secs(1));
        assert_eq!(
            harness.supervisor.current_snapshot().channel_states[0],
            ChannelState::Offline
        );
        assert_eq!(harness.take(), vec![Command::UnassignChannel { channel: 0 }]);
    }

    #[test]
    fn test_handshake_rejection_takes_channel_offline() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.take();

        harness.respond(0, MessageId::AssignChannel as u8, RESPONSE_NO_ERROR);
        harness.take();
        harness.respond(0, MessageId::ChannelId as u8, 0x15);
        assert_eq!(harness.state(0), Some(ChannelState::Offline));
        assert_eq!(harness.take(), vec![Command::UnassignChannel { channel: 0 }]);
    }

    #[test]
    fn test_malformed_messages_are_dropped() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        let version = harness.supervisor.current_snapshot().version;

        assert!(matches!(
            harness.feed(&[0x02, 0x99, 0x00, 0x00]),
            Err(AntError::Decode(DecodeError::UnknownMessageId(0x99)))
        ));
        assert!(matches!(
            harness.feed(&[0x09, 0x4E, 0x00]),
            Err(AntError::Decode(_))
        ));
        assert!(matches!(harness.feed(&[]), Err(AntError::Decode(_))));

        assert_eq!(harness.supervisor.current_snapshot().version, version);
        assert_eq!(harness.state(0), Some(ChannelState::PendingOpen));
    }

    #[test]
    fn test_out_of_range_channel() {
        let config = SupervisorConfig {
            channel_count: 2,
            ..SupervisorConfig::default()
        };
        let harness = Harness::new(config);

        let result = harness.feed(&[9, 0x4E, 5, 0, 0, 0, 0, 0, 0, 0, 80]);
        assert!(matches!(
            result,
            Err(AntError::InvalidChannel { channel: 5, count: 2 })
        ));
        assert!(result.is_err_and(|error| error.is_recoverable()));
        assert!(matches!(
            harness.supervisor.open(5, SensorType::HeartRate),
            Err(AntError::InvalidChannel { .. })
        ));
        assert_eq!(harness.state(5), None);

        // the layout names channel 2, which does not exist here
        assert!(harness.supervisor.start().is_err());
        assert_eq!(harness.state(0), Some(ChannelState::PendingOpen));
        assert_eq!(harness.state(1), Some(ChannelState::PendingOpen));
    }

    #[test]
    fn test_messages_for_closed_channel_are_ignored() {
        let harness = Harness::new(SupervisorConfig::default());
        let version = harness.supervisor.current_snapshot().version;

        harness.broadcast(3, [0, 0, 0, 0, 0, 0, 0, 80]);
        harness.respond(3, MessageId::Event as u8, EVENT_RX_SEARCH_TIMEOUT);

        assert_eq!(harness.state(3), Some(ChannelState::Closed));
        assert_eq!(harness.supervisor.current_snapshot().version, version);
        assert!(harness.take().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.ack_all();

        harness.supervisor.close(0).unwrap();
        harness.supervisor.close(0).unwrap();
        assert_eq!(harness.take(), vec![Command::CloseChannel { channel: 0 }]);
        assert_eq!(harness.state(0), Some(ChannelState::Closed));

        harness.supervisor.close(4).unwrap();
        assert!(harness.take().is_empty());
        assert!(harness.supervisor.close(40).is_err());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.start().unwrap();
        harness.ack_all();

        harness.supervisor.shutdown().unwrap();
        let sent = harness.take();
        assert_eq!(sent.len(), 3);
        assert!(sent
            .iter()
            .all(|command| command.message_id() == MessageId::CloseChannel));
        assert!(!harness
            .supervisor
            .current_snapshot()
            .channel_states
            .iter()
            .any(|state| *state != ChannelState::Closed));
    }

    #[test]
    fn test_radio_reset_reopens_layout() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.start().unwrap();
        harness.ack_all();
        assert_eq!(harness.state(1), Some(ChannelState::Searching));

        harness.feed(&[1, 0x6F, 0x20]).unwrap();
        let sent = harness.take();
        assert_eq!(sent.len(), 3);
        assert!(sent
            .iter()
            .all(|command| command.message_id() == MessageId::AssignChannel));
        for channel in 0..3 {
            assert_eq!(harness.state(channel), Some(ChannelState::PendingOpen));
        }

        // without start, a reset only closes
        harness.supervisor.shutdown().unwrap();
        harness.ack_all();
        harness.feed(&[1, 0x6F, 0x00]).unwrap();
        assert!(harness.take().is_empty());
        assert_eq!(harness.state(0), Some(ChannelState::Closed));
    }

    #[test]
    fn test_sink_failure_takes_channel_offline() {
        let sink = |_: &Command| -> Result<()> { Err(AntError::Transport("stick removed".into())) };
        let supervisor = Supervisor::new(
            SupervisorConfig::default(),
            sink,
            Arc::new(MemoryPairingStore::new()),
        );

        let result = supervisor.open(0, SensorType::HeartRate);
        assert!(matches!(result, Err(AntError::Transport(_))));
        assert!(result.is_err_and(|error| error.is_recoverable()));
        assert_eq!(supervisor.channel_state(0), Some(ChannelState::Offline));
    }

    #[test]
    fn test_lazy_timeout_survives_failed_unassign() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let sink = move |command: &Command| -> Result<()> {
            if command.message_id() == MessageId::UnassignChannel {
                return Err(AntError::Transport("stick removed".into()));
            }
            log.lock().push(*command);
            Ok(())
        };
        let clock = Arc::new(ManualClock {
            now: Mutex::new(Instant::now()),
        });
        let supervisor = Supervisor::with_clock(
            SupervisorConfig::default(),
            sink,
            Arc::new(MemoryPairingStore::new()),
            clock.clone(),
        );

        supervisor.open(0, SensorType::HeartRate).unwrap();
        loop {
            let batch = std::mem::take(&mut *sent.lock());
            if batch.is_empty() {
                break;
            }
            for command in batch {
                let ack = [3, 0x40, 0, command.message_id() as u8, RESPONSE_NO_ERROR];
                supervisor.feed(&ack, clock.now()).unwrap();
            }
        }
        assert_eq!(supervisor.channel_state(0), Some(ChannelState::Searching));

        clock.advance(Duration::from_secs(31));
        let snapshot = supervisor.current_snapshot();
        assert_eq!(snapshot.channel_state(0), Some(ChannelState::Offline));
        assert!(supervisor.open(0, SensorType::HeartRate).is_ok());
        assert_eq!(supervisor.channel_state(0), Some(ChannelState::PendingOpen));
    }

    #[test]
    fn test_cadence_decays_while_silent() {
        let pairing = MemoryPairingStore::with_pairings([(SensorType::BikeCadence, 5)]);
        let harness = Harness::with_pairing(SupervisorConfig::default(), pairing);
        harness.supervisor.open(1, SensorType::BikeCadence).unwrap();
        harness.ack_all();

        harness.broadcast(1, cadence_page(0, 0));
        harness.clock.advance(Duration::from_millis(500));
        harness.broadcast(1, cadence_page(512, 1));
        harness.clock.advance(Duration::from_millis(500));
        harness.broadcast(1, cadence_page(1024, 2));

        let snapshot = harness.supervisor.current_snapshot();
        let cadence = snapshot.cadence.unwrap();
        assert!((cadence.value - 120.0).abs() < f32::EPSILON);
        let updated_at = cadence.at;

        harness.clock.advance(Duration::from_secs(3));
        let decayed = harness.supervisor.current_snapshot().cadence.unwrap();
        assert!(decayed.value < 120.0);
        assert_eq!(decayed.at, updated_at);
    }

    #[test]
    fn test_offline_clears_readings() {
        let pairing = MemoryPairingStore::with_pairings([(SensorType::HeartRate, 7)]);
        let harness = Harness::with_pairing(SupervisorConfig::default(), pairing);
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.ack_all();
        harness.broadcast(0, [0, 0, 0, 0, 0, 0, 0, 130]);
        assert!(harness.supervisor.current_snapshot().heart_rate.is_some());

        harness.respond(0, MessageId::Event as u8, EVENT_RX_SEARCH_TIMEOUT);
        assert!(harness.supervisor.current_snapshot().heart_rate.is_none());
    }

    #[test]
    fn test_losing_one_cadence_source_keeps_the_other() {
        let pairing = MemoryPairingStore::with_pairings([
            (SensorType::BikeCadence, 5),
            (SensorType::BikeSpeedCadence, 9),
        ]);
        let harness = Harness::with_pairing(SupervisorConfig::default(), pairing);
        harness.supervisor.start().unwrap();
        harness.ack_all();

        harness.broadcast(2, speed_cadence_page((0, 0), (0, 0)));
        harness.clock.advance(Duration::from_millis(500));
        harness.broadcast(2, speed_cadence_page((1024, 1), (512, 1)));
        harness.clock.advance(Duration::from_millis(500));
        harness.broadcast(2, speed_cadence_page((2048, 2), (1024, 2)));

        let before = harness.supervisor.current_snapshot();
        let cadence = before.cadence.unwrap();
        assert_eq!(cadence.channel, 2);
        assert!((cadence.value - 60.0).abs() < f32::EPSILON);

        // the standalone cadence sensor never showed up
        harness.respond(1, MessageId::Event as u8, EVENT_RX_SEARCH_TIMEOUT);
        assert_eq!(harness.state(1), Some(ChannelState::Offline));

        let after = harness.supervisor.current_snapshot();
        assert_eq!(after.channel_state(2), Some(ChannelState::TrackingData));
        assert_eq!(after.cadence, before.cadence);
        assert_eq!(after.speed, before.speed);

        harness.supervisor.close(1).unwrap();
        harness.ack_all();
        assert_eq!(harness.supervisor.current_snapshot().cadence, before.cadence);

        harness.supervisor.close(2).unwrap();
        harness.ack_all();
        let closed = harness.supervisor.current_snapshot();
        assert!(closed.cadence.is_none());
        assert!(closed.speed.is_none());
    }

    #[test]
    fn test_feed_raw_message() {
        let harness = Harness::new(SupervisorConfig::default());
        harness.supervisor.open(0, SensorType::HeartRate).unwrap();
        harness.take();

        let raw = RawMessage::new(vec![3, 0x40, 0, 0x42, 0], harness.clock.now());
        harness.supervisor.feed_raw(&raw).unwrap();
        assert_eq!(
            harness.take(),
            vec![Command::SetChannelId {
                channel: 0,
                device_number: 0,
                device_type: 120,
                transmission_type: 1,
            }]
        );
    }

    #[test]
    fn test_subscribe_observes_replacements() {
        let harness = Harness::new(SupervisorConfig::default());
        let mut receiver = harness.supervisor.subscribe();

        tokio_test::block_on(async {
            harness.supervisor.open(0, SensorType::HeartRate).unwrap();
            receiver.changed().await.unwrap();
            let snapshot = Arc::clone(&receiver.borrow_and_update());
            assert_eq!(snapshot.channel_states[0], ChannelState::PendingOpen);
        });
        assert!(!receiver.has_changed().unwrap());
    }
}
