use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AckSource, Acknowledgment, EventSink, Transport};
use crate::postgres::ChangeEvent;
use crate::{Error, Result};

/// In-process transport over bounded channels.
///
/// The event channel's capacity bounds how far the streamer can run ahead
/// of the consumer.
pub struct ChannelTransport {
    events: mpsc::Sender<ChangeEvent>,
    acks: mpsc::Receiver<Acknowledgment>,
}

/// The consumer's side of a [`ChannelTransport`].
pub struct ConsumerEnd {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub acks: mpsc::Sender<Acknowledgment>,
}

pub fn channel_transport(capacity: usize) -> (ChannelTransport, ConsumerEnd) {
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
    let (ack_tx, ack_rx) = mpsc::channel(capacity.max(1));
    (
        ChannelTransport {
            events: event_tx,
            acks: ack_rx,
        },
        ConsumerEnd {
            events: event_rx,
            acks: ack_tx,
        },
    )
}

impl Transport for ChannelTransport {
    type Sink = ChannelSink;
    type Source = ChannelSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (
            ChannelSink {
                events: Some(self.events),
            },
            ChannelSource { acks: self.acks },
        )
    }
}

pub struct ChannelSink {
    events: Option<mpsc::Sender<ChangeEvent>>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: &ChangeEvent) -> Result<()> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| Error::Transport("event channel already closed".to_string()))?;
        events
            .send(event.clone())
            .await
            .map_err(|_| Error::Transport("consumer dropped the event channel".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.events.take();
        Ok(())
    }
}

pub struct ChannelSource {
    acks: mpsc::Receiver<Acknowledgment>,
}

#[async_trait]
impl AckSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Acknowledgment>> {
        Ok(self.acks.recv().await)
    }
}
