use crate::error::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{fmt, time::Instant};

/// Offset of the length byte
///
/// Messages arrive as delivered by the ANT radio service: the serial sync
/// byte and trailing checksum are already stripped, so a frame is
/// `[length, message id, data...]` where `length` counts only the data bytes.
pub const MESG_SIZE_OFFSET: usize = 0;

/// Offset of the message id byte
pub const MESG_ID_OFFSET: usize = 1;

/// Offset of the first data byte (always the channel number for channel messages)
pub const MESG_DATA_OFFSET: usize = 2;

/// Mask applied to the channel byte; the upper bits carry the network number
pub const CHANNEL_NUMBER_MASK: u8 = 0x1F;

/// Size of a broadcast payload in bytes
pub const PAYLOAD_SIZE: usize = 8;

/// Wildcard device number, meaning "pair with any device of this type"
pub const WILDCARD_DEVICE_NUMBER: u16 = 0;

/// Response code for a successfully executed command
pub const RESPONSE_NO_ERROR: u8 = 0x00;
/// A receive channel timed out while searching
pub const EVENT_RX_SEARCH_TIMEOUT: u8 = 0x01;
/// A receive channel missed a message it expected
pub const EVENT_RX_FAIL: u8 = 0x02;
/// The channel has been closed
pub const EVENT_CHANNEL_CLOSED: u8 = 0x07;
/// The channel lost its device and dropped back to searching
pub const EVENT_RX_FAIL_GO_TO_SEARCH: u8 = 0x08;
/// The command is not valid in the channel's current state
pub const CHANNEL_IN_WRONG_STATE: u8 = 0x15;

/// ANT message ids used by the sensor core
///
/// Values follow the ANT Message Protocol and Usage document, section 9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// Pseudo id carried in channel responses for RF events
    Event = 0x01,
    /// Channel response or event
    ChannelResponse = 0x40,
    /// Unassign channel command
    UnassignChannel = 0x41,
    /// Assign channel command
    AssignChannel = 0x42,
    /// Set channel message period
    ChannelPeriod = 0x43,
    /// Set high priority search timeout
    SearchTimeout = 0x44,
    /// Set channel RF frequency
    RadioFrequency = 0x45,
    /// Open channel command
    OpenChannel = 0x4B,
    /// Close channel command
    CloseChannel = 0x4C,
    /// Request a message from the radio
    Request = 0x4D,
    /// Broadcast data from a sensor
    BroadcastData = 0x4E,
    /// Channel id (set as a command, received as a response to a request)
    ChannelId = 0x51,
    /// Set low priority search timeout
    LowPrioritySearchTimeout = 0x63,
    /// Radio startup after a reset
    Startup = 0x6F,
    /// Configure proximity search
    ProximitySearch = 0x71,
}

impl MessageId {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Event),
            0x40 => Some(Self::ChannelResponse),
            0x41 => Some(Self::UnassignChannel),
            0x42 => Some(Self::AssignChannel),
            0x43 => Some(Self::ChannelPeriod),
            0x44 => Some(Self::SearchTimeout),
            0x45 => Some(Self::RadioFrequency),
            0x4B => Some(Self::OpenChannel),
            0x4C => Some(Self::CloseChannel),
            0x4D => Some(Self::Request),
            0x4E => Some(Self::BroadcastData),
            0x51 => Some(Self::ChannelId),
            0x63 => Some(Self::LowPrioritySearchTimeout),
            0x6F => Some(Self::Startup),
            0x71 => Some(Self::ProximitySearch),
            _ => None,
        }
    }

    /// Number of data bytes an inbound message with this id must carry
    ///
    /// `None` for ids the radio never sends to us.
    const fn inbound_data_size(self) -> Option<usize> {
        match self {
            Self::BroadcastData => Some(1 + PAYLOAD_SIZE),
            Self::ChannelId => Some(5),
            Self::ChannelResponse => Some(3),
            Self::Startup => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Event => "EVENT",
            Self::ChannelResponse => "CHANNEL_RESPONSE",
            Self::UnassignChannel => "UNASSIGN_CHANNEL",
            Self::AssignChannel => "ASSIGN_CHANNEL",
            Self::ChannelPeriod => "CHANNEL_MESG_PERIOD",
            Self::SearchTimeout => "CHANNEL_SEARCH_TIMEOUT",
            Self::RadioFrequency => "CHANNEL_RADIO_FREQ",
            Self::OpenChannel => "OPEN_CHANNEL",
            Self::CloseChannel => "CLOSE_CHANNEL",
            Self::Request => "REQUEST",
            Self::BroadcastData => "BROADCAST_DATA",
            Self::ChannelId => "CHANNEL_ID",
            Self::LowPrioritySearchTimeout => "SET_LP_SEARCH_TIMEOUT",
            Self::Startup => "STARTUP",
            Self::ProximitySearch => "PROX_SEARCH_CONFIG",
        };
        write!(f, "{name}({:#04x})", *self as u8)
    }
}

/// A raw message as handed over by the radio driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Message bytes including the length and id header
    pub bytes: Bytes,
    /// When the message arrived
    pub arrived_at: Instant,
}

impl RawMessage {
    /// Create a new raw message
    pub fn new(bytes: impl Into<Bytes>, arrived_at: Instant) -> Self {
        Self {
            bytes: bytes.into(),
            arrived_at,
        }
    }

    /// Decode into a typed protocol message
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn decode(&self) -> Result<ProtocolMessage, DecodeError> {
        decode(&self.bytes)
    }
}

/// Typed inbound ANT message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Sensor broadcast
    BroadcastData {
        /// Channel number
        channel: u8,
        /// Sensor page data
        payload: [u8; PAYLOAD_SIZE],
    },
    /// Identity of the device a channel is tracking
    ChannelId {
        /// Channel number
        channel: u8,
        /// Device number of the paired device
        device_number: u16,
        /// Device type (bit 7 is the pairing bit)
        device_type: u8,
        /// Transmission type
        transmission_type: u8,
    },
    /// Response to a command, or an RF event when `responding_to` is [`MessageId::Event`]
    ChannelResponse {
        /// Channel number
        channel: u8,
        /// Id of the message being responded to
        responding_to: u8,
        /// Response or event code
        code: u8,
    },
    /// The radio has (re)started and lost all channel configuration
    Startup {
        /// Reset reason bit field
        reason: u8,
    },
}

impl ProtocolMessage {
    /// Channel this message belongs to, if it is a channel message
    #[must_use]
    pub const fn channel(&self) -> Option<u8> {
        match *self {
            Self::BroadcastData { channel, .. }
            | Self::ChannelId { channel, .. }
            | Self::ChannelResponse { channel, .. } => Some(channel),
            Self::Startup { .. } => None,
        }
    }
}

/// Parse a raw ANT message
///
/// Layout of the data section per message id:
/// - `0x4E` broadcast: channel, 8 payload bytes (extended data ignored)
/// - `0x51` channel id: channel, device number (u16 little-endian), device type, transmission type
/// - `0x40` channel response: channel, responding message id, code
/// - `0x6F` startup: reason
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] when the buffer cannot hold the header or
/// the fixed layout for its id, [`DecodeError::UnknownMessageId`] for ids the
/// core does not consume, and [`DecodeError::LengthMismatch`] when the length
/// byte disagrees with the buffer.
pub fn decode(data: &[u8]) -> Result<ProtocolMessage, DecodeError> {
    if data.len() < MESG_DATA_OFFSET {
        return Err(DecodeError::TooShort {
            expected: MESG_DATA_OFFSET,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let declared = usize::from(buf.get_u8());
    let raw_id = buf.get_u8();

    let (id, required) = MessageId::from_u8(raw_id)
        .and_then(|id| id.inbound_data_size().map(|size| (id, size)))
        .ok_or(DecodeError::UnknownMessageId(raw_id))?;

    if declared != buf.remaining() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.remaining(),
        });
    }

    if buf.remaining() < required {
        return Err(DecodeError::TooShort {
            expected: MESG_DATA_OFFSET + required,
            actual: data.len(),
        });
    }

    let message = match id {
        MessageId::BroadcastData => {
            let channel = buf.get_u8() & CHANNEL_NUMBER_MASK;
            let mut payload = [0; PAYLOAD_SIZE];
            buf.copy_to_slice(&mut payload);
            ProtocolMessage::BroadcastData { channel, payload }
        }
        MessageId::ChannelId => ProtocolMessage::ChannelId {
            channel: buf.get_u8() & CHANNEL_NUMBER_MASK,
            device_number: buf.get_u16_le(),
            device_type: buf.get_u8(),
            transmission_type: buf.get_u8(),
        },
        MessageId::ChannelResponse => ProtocolMessage::ChannelResponse {
            channel: buf.get_u8() & CHANNEL_NUMBER_MASK,
            responding_to: buf.get_u8(),
            code: buf.get_u8(),
        },
        MessageId::Startup => ProtocolMessage::Startup {
            reason: buf.get_u8(),
        },
        _ => return Err(DecodeError::UnknownMessageId(raw_id)),
    };

    Ok(message)
}

/// Commands the core issues to the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Assign a channel on a network
    AssignChannel {
        /// Channel number
        channel: u8,
        /// Channel type (0x00 = bidirectional receive)
        channel_type: u8,
        /// Network number
        network: u8,
    },
    /// Set the device the channel should pair with
    SetChannelId {
        /// Channel number
        channel: u8,
        /// Device number, 0 for wildcard
        device_number: u16,
        /// Device type
        device_type: u8,
        /// Transmission type
        transmission_type: u8,
    },
    /// Set the message period in 1/32768 s units
    SetChannelPeriod {
        /// Channel number
        channel: u8,
        /// Period
        period: u16,
    },
    /// Set the high priority search timeout in 2.5 s units
    SetSearchTimeout {
        /// Channel number
        channel: u8,
        /// Timeout, 0 disables high priority search
        timeout: u8,
    },
    /// Set the RF frequency as an offset from 2400 MHz
    SetRadioFrequency {
        /// Channel number
        channel: u8,
        /// Frequency offset
        frequency: u8,
    },
    /// Set the low priority search timeout in 2.5 s units
    SetLowPrioritySearchTimeout {
        /// Channel number
        channel: u8,
        /// Timeout
        timeout: u8,
    },
    /// Configure proximity search
    SetProximitySearch {
        /// Channel number
        channel: u8,
        /// Proximity bin, 0 disables the threshold
        bin: u8,
    },
    /// Open the channel
    OpenChannel {
        /// Channel number
        channel: u8,
    },
    /// Close the channel
    CloseChannel {
        /// Channel number
        channel: u8,
    },
    /// Unassign the channel
    UnassignChannel {
        /// Channel number
        channel: u8,
    },
    /// Ask the radio to send a message, e.g. the channel id
    RequestMessage {
        /// Channel number
        channel: u8,
        /// Requested message id
        message_id: MessageId,
    },
}

impl Command {
    /// Message id this command is sent with
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        match self {
            Self::AssignChannel { .. } => MessageId::AssignChannel,
            Self::SetChannelId { .. } => MessageId::ChannelId,
            Self::SetChannelPeriod { .. } => MessageId::ChannelPeriod,
            Self::SetSearchTimeout { .. } => MessageId::SearchTimeout,
            Self::SetRadioFrequency { .. } => MessageId::RadioFrequency,
            Self::SetLowPrioritySearchTimeout { .. } => MessageId::LowPrioritySearchTimeout,
            Self::SetProximitySearch { .. } => MessageId::ProximitySearch,
            Self::OpenChannel { .. } => MessageId::OpenChannel,
            Self::CloseChannel { .. } => MessageId::CloseChannel,
            Self::UnassignChannel { .. } => MessageId::UnassignChannel,
            Self::RequestMessage { .. } => MessageId::Request,
        }
    }

    /// Channel the command targets
    #[must_use]
    pub const fn channel(&self) -> u8 {
        match *self {
            Self::AssignChannel { channel, .. }
            | Self::SetChannelId { channel, .. }
            | Self::SetChannelPeriod { channel, .. }
            | Self::SetSearchTimeout { channel, .. }
            | Self::SetRadioFrequency { channel, .. }
            | Self::SetLowPrioritySearchTimeout { channel, .. }
            | Self::SetProximitySearch { channel, .. }
            | Self::OpenChannel { channel }
            | Self::CloseChannel { channel }
            | Self::UnassignChannel { channel }
            | Self::RequestMessage { channel, .. } => channel,
        }
    }

    /// Serialize the command to the radio framing
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(5);
        data.put_u8(self.channel());

        match *self {
            Self::AssignChannel {
                channel_type,
                network,
                ..
            } => {
                data.put_u8(channel_type);
                data.put_u8(network);
            }
            Self::SetChannelId {
                device_number,
                device_type,
                transmission_type,
                ..
            } => {
                data.put_u16_le(device_number);
                data.put_u8(device_type);
                data.put_u8(transmission_type);
            }
            Self::SetChannelPeriod { period, .. } => data.put_u16_le(period),
            Self::SetSearchTimeout { timeout, .. }
            | Self::SetLowPrioritySearchTimeout { timeout, .. } => data.put_u8(timeout),
            Self::SetRadioFrequency { frequency, .. } => data.put_u8(frequency),
            Self::SetProximitySearch { bin, .. } => data.put_u8(bin),
            Self::RequestMessage { message_id, .. } => data.put_u8(message_id as u8),
            Self::OpenChannel { .. } | Self::CloseChannel { .. } | Self::UnassignChannel { .. } => {}
        }

        let mut buf = BytesMut::with_capacity(MESG_DATA_OFFSET + data.len());
        buf.put_u8(data.len() as u8);
        buf.put_u8(self.message_id() as u8);
        buf.extend_from_slice(&data);
        buf.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on channel {}", self.message_id(), self.channel())
    }
}
