//! Change Streamer: turns the server's WAL stream into ordered change events.
//!
//! The streamer owns the read side of the replication connection. It decodes
//! every XLogData message, hands events to the transport in server order and
//! answers keepalives. Acknowledgments are handled elsewhere (see
//! [`crate::listener`]); the streamer only reads the shared confirmed
//! position when it has to report status.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::postgres::{ChangeEvent, ChangeKind, ConfirmedPosition, Lsn, PgOutputDecoder, ReplicationMessage};
use crate::transport::EventSink;
use crate::{Error, Result};

/// Read side of a replication stream.
#[async_trait]
pub trait WalSource: Send {
    /// Next CopyData payload, or `None` once the server ends the copy.
    ///
    /// Must be cancel safe: dropping the future must not lose a partially
    /// read message.
    async fn next_message(&mut self) -> Result<Option<Bytes>>;
}

/// Write side of a replication stream, shared by the streamer and the
/// acknowledgment listener.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Reports `confirmed` as written, flushed and applied.
    async fn send_status(&self, confirmed: Lsn, reply_requested: bool) -> Result<()>;

    /// Ends the stream. Calling it more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Stopped,
}

/// How a stream loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The session's cancellation token fired.
    Cancelled,
    /// The server sent CopyDone.
    ServerClosed,
}

/// Everything a stream run shares with its session.
#[derive(Clone)]
pub struct StreamContext {
    pub start_position: Lsn,
    pub confirmed: Arc<ConfirmedPosition>,
    pub cancel: CancellationToken,
    pub keepalive_interval: Duration,
    pub state: Arc<watch::Sender<StreamState>>,
}

pub struct ChangeStreamer {
    ctx: StreamContext,
    decoder: PgOutputDecoder,
    /// Inside a transaction that committed before the start position.
    skipping: bool,
    last_position: Lsn,
    events_sent: u64,
}

impl ChangeStreamer {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            decoder: PgOutputDecoder::new(),
            skipping: false,
            last_position: Lsn::ZERO,
            events_sent: 0,
        }
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent
    }

    /// Runs until cancelled, until the server ends the stream, or until an
    /// error. Decode and transport errors are fatal.
    pub async fn run<W, S, E>(&mut self, wal: &mut W, status: &S, sink: &mut E) -> Result<StreamEnd>
    where
        W: WalSource,
        S: StatusSink,
        E: EventSink,
    {
        self.ctx.state.send_replace(StreamState::Streaming);
        info!(start = %self.ctx.start_position, "Change streamer running");

        let mut ticker = interval(self.ctx.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        let result = loop {
            tokio::select! {
                biased;

                _ = self.ctx.cancel.cancelled() => break Ok(StreamEnd::Cancelled),

                _ = ticker.tick() => {
                    if let Err(e) = status.send_status(self.ctx.confirmed.get(), false).await {
                        break Err(e);
                    }
                }

                msg = wal.next_message() => match msg {
                    Ok(Some(data)) => {
                        if let Err(e) = self.handle_message(data, status, sink, &mut ticker).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(StreamEnd::ServerClosed),
                    Err(e) => break Err(e),
                },
            }
        };

        let result = match result {
            Err(Error::Shutdown) => Ok(StreamEnd::Cancelled),
            other => other,
        };
        info!(events = self.events_sent, "Change streamer stopped");
        result
    }

    async fn handle_message<S, E>(
        &mut self,
        data: Bytes,
        status: &S,
        sink: &mut E,
        ticker: &mut Interval,
    ) -> Result<()>
    where
        S: StatusSink,
        E: EventSink,
    {
        match ReplicationMessage::parse(data)? {
            ReplicationMessage::PrimaryKeepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                trace!(%wal_end, reply_requested, "Keepalive");
                if reply_requested {
                    status.send_status(self.ctx.confirmed.get(), false).await?;
                }
                Ok(())
            }
            ReplicationMessage::XLogData { wal_start, data, .. } => {
                match self.decoder.decode(wal_start, &data)? {
                    Some(event) if self.admit(&event) => self.forward(event, status, sink, ticker).await,
                    _ => Ok(()),
                }
            }
        }
    }

    /// Drops whole transactions that committed before the start position.
    fn admit(&mut self, event: &ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::Begin => {
                let commit = event.commit_position.unwrap_or(event.position);
                self.skipping = commit < self.ctx.start_position;
                if self.skipping {
                    debug!(
                        xid = ?event.xid,
                        %commit,
                        start = %self.ctx.start_position,
                        "Skipping transaction committed before start position"
                    );
                }
                !self.skipping
            }
            ChangeKind::Commit => {
                let admitted = !self.skipping;
                self.skipping = false;
                admitted
            }
            _ => !self.skipping,
        }
    }

    /// Sends one event, waiting as long as the consumer needs. The status
    /// ticker keeps running meanwhile so the server does not time the
    /// stream out behind a slow consumer.
    async fn forward<S, E>(
        &mut self,
        event: ChangeEvent,
        status: &S,
        sink: &mut E,
        ticker: &mut Interval,
    ) -> Result<()>
    where
        S: StatusSink,
        E: EventSink,
    {
        if event.position < self.last_position {
            warn!(
                position = %event.position,
                previous = %self.last_position,
                "Event position moved backwards"
            );
        }
        self.last_position = event.position;

        let send = sink.send(&event);
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(Error::Shutdown),
                sent = &mut send => {
                    sent?;
                    break;
                }
                _ = ticker.tick() => {
                    debug!(position = %event.position, "Consumer is slow, reporting status while blocked");
                    status.send_status(self.ctx.confirmed.get(), false).await?;
                }
            }
        }
        self.events_sent += 1;
        trace!(position = %event.position, kind = ?event.kind, "Event sent");
        Ok(())
    }
}
