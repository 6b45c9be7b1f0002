//! The duplex channel to the downstream consumer.
//!
//! Outbound it carries [`ChangeEvent`]s, inbound [`Acknowledgment`]s. A
//! transport is split once per session: the change streamer owns the sink,
//! the acknowledgment listener owns the source.

pub mod channel;
pub mod json_lines;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::postgres::{ChangeEvent, Lsn};
use crate::Result;

pub use channel::{channel_transport, ChannelTransport, ConsumerEnd};
pub use json_lines::JsonLinesTransport;

/// A position the consumer has durably processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub lsn: Lsn,
}

impl Acknowledgment {
    pub fn new(lsn: Lsn) -> Self {
        Self { lsn }
    }
}

#[async_trait]
pub trait EventSink: Send {
    /// Sends one event. Waits while the consumer is not draining.
    async fn send(&mut self, event: &ChangeEvent) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait AckSource: Send {
    /// Next acknowledgment; `Ok(None)` once the consumer has gone away.
    ///
    /// A frame that is not a valid acknowledgment yields
    /// `Err(Error::Serialization)`; the source remains usable afterwards.
    async fn recv(&mut self) -> Result<Option<Acknowledgment>>;
}

pub trait Transport: Send {
    type Sink: EventSink;
    type Source: AckSource;

    fn split(self) -> (Self::Sink, Self::Source);
}
