use thiserror::Error;

use crate::channel::ChannelState;

/// Errors produced while decoding a raw ANT message
///
/// These are never fatal: the supervisor logs them and drops the message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is shorter than the fixed layout of its message id
    #[error("Message too short: {actual} bytes, expected at least {expected}")]
    TooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes received
        actual: usize,
    },

    /// The message id is not one the core understands
    #[error("Unknown message ID: {0:02X}")]
    UnknownMessageId(u8),

    /// The length byte disagrees with the buffer size
    #[error("Length byte says {declared} data bytes, buffer holds {actual}")]
    LengthMismatch {
        /// Data length declared in the header
        declared: usize,
        /// Data bytes actually present
        actual: usize,
    },
}

/// Errors that can occur when driving ANT channels
#[derive(Error, Debug)]
pub enum AntError {
    /// A raw message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Channel number outside the supervised range
    #[error("Invalid channel {channel}: only {count} channel(s) supervised")]
    InvalidChannel {
        /// Requested channel number
        channel: u8,
        /// Number of channels the supervisor owns
        count: usize,
    },

    /// The requested operation is not valid in the channel's current state
    #[error("Channel {channel} is {state}")]
    InvalidState {
        /// Channel number
        channel: u8,
        /// Current state
        state: ChannelState,
    },

    /// The radio rejected a configuration step
    #[error("Channel {channel}: message {message_id:02X} failed with code {code:02X}")]
    Protocol {
        /// Channel number
        channel: u8,
        /// Message the radio responded to
        message_id: u8,
        /// Non-zero response code
        code: u8,
    },

    /// The radio command sink failed to deliver a command
    #[error("Radio transport error: {0}")]
    Transport(String),
}

/// Result type for ANT operations
pub type Result<T> = std::result::Result<T, AntError>;

impl AntError {
    /// Check if the supervisor stays usable after the error
    ///
    /// The offending message or command is dropped; a transport failure
    /// also takes its channel offline until it is reopened.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::InvalidChannel { .. }
                | Self::InvalidState { .. }
                | Self::Transport(_)
        )
    }

    /// Check if this error takes a channel offline
    #[must_use]
    pub const fn is_channel_failure(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Transport(_))
    }
}
