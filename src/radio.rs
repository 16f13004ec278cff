use bytes::Bytes;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::{AntError, Result},
    protocol::Command,
};

/// Destination for commands addressed to the ANT radio
///
/// Implemented by the USB or serial transport that owns the stick. A send
/// failure takes the affected channel offline.
pub trait RadioSink: Send {
    /// Send one command to the radio
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Transport`] if the command could not be delivered.
    fn send(&mut self, command: &Command) -> Result<()>;
}

impl<F> RadioSink for F
where
    F: FnMut(&Command) -> Result<()> + Send,
{
    fn send(&mut self, command: &Command) -> Result<()> {
        self(command)
    }
}

/// Sink that forwards encoded frames to an async writer task
pub struct FrameSink {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl FrameSink {
    /// Create a sink and the receiver the writer task drains
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl RadioSink for FrameSink {
    fn send(&mut self, command: &Command) -> Result<()> {
        let frame = command.encode();
        debug!("Sending command: {:02X?}", frame.as_ref());

        self.sender
            .send(frame)
            .map_err(|_| AntError::Transport(format!("writer closed before {command}")))
    }
}

/// Source of receive times for messages that carry none
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
