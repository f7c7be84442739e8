//! Downstream emitter seam.
//!
//! The relay only ever talks to a [`DownstreamEmitter`]; the transport that
//! actually delivers bytes to the client (chunked HTTP response, WebSocket,
//! stdout in the CLI) sits behind it.

use tokio::sync::mpsc;

use crate::error::{CoreResult, RelayError};
use crate::event::OutboundEvent;

/// Accepts an ordered sequence of frames and a terminal `complete` call.
///
/// Contract: after `complete()` no further `send` is permitted. The relay
/// self-enforces this; implementations do not need to reject late sends.
pub trait DownstreamEmitter: Send + Sync {
    fn send(&self, event: OutboundEvent) -> CoreResult<()>;
    fn complete(&self) -> CoreResult<()>;
}

/// What a [`ChannelEmitter`] pushes to its consumer.
#[derive(Debug)]
pub enum Emission {
    Event(OutboundEvent),
    Complete,
}

/// Emitter backed by an unbounded tokio channel. `send` is non-blocking;
/// a closed channel means the client went away and maps to
/// `DownstreamDelivery`.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<Emission>,
}

impl ChannelEmitter {
    /// Returns the emitter plus the receiver the transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Emission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DownstreamEmitter for ChannelEmitter {
    fn send(&self, event: OutboundEvent) -> CoreResult<()> {
        self.tx
            .send(Emission::Event(event))
            .map_err(|_| RelayError::DownstreamDelivery("client channel closed".into()))
    }

    fn complete(&self) -> CoreResult<()> {
        self.tx
            .send(Emission::Complete)
            .map_err(|_| RelayError::DownstreamDelivery("client channel closed".into()))
    }
}
