//! Runs the change streamer and the acknowledgment listener side by side.
//!
//! Both loops run in one task. Whichever finishes first, for any reason,
//! triggers the session teardown; the other loop is then dropped.

use tracing::{error, info, warn};

use crate::listener::{self, ListenerEnd};
use crate::session::Teardown;
use crate::streamer::{ChangeStreamer, StatusSink, StreamContext, StreamEnd, StreamState, WalSource};
use crate::transport::Transport;
use crate::Result;

/// Why a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The session was cancelled or reset.
    Cancelled,
    /// The server ended the copy stream.
    ServerClosed,
    /// The consumer closed or lost the transport.
    ConsumerGone,
}

enum First {
    Streamer(Result<StreamEnd>),
    Listener(Result<ListenerEnd>),
}

/// Streams changes over `transport` until the first termination.
///
/// Teardown always runs before this returns, so the transport and the
/// replication stream are closed on every path.
pub async fn run_stream<W, S, T>(ctx: StreamContext, mut wal: W, status: S, transport: T) -> Result<Termination>
where
    W: WalSource,
    S: StatusSink,
    T: Transport,
{
    let (mut sink, mut source) = transport.split();
    let teardown = Teardown::new(ctx.cancel.clone());
    let confirmed = ctx.confirmed.clone();
    let cancel = ctx.cancel.clone();
    let state = ctx.state.clone();
    let mut streamer = ChangeStreamer::new(ctx);

    let first = {
        let streaming = streamer.run(&mut wal, &status, &mut sink);
        let listening = listener::run(&mut source, &status, &confirmed, &cancel);
        tokio::select! {
            r = streaming => First::Streamer(r),
            r = listening => First::Listener(r),
        }
    };

    teardown.run(&mut sink, &status).await;
    state.send_replace(StreamState::Stopped);

    let result = match first {
        First::Streamer(Ok(StreamEnd::Cancelled)) | First::Listener(Ok(ListenerEnd::Cancelled)) => {
            Ok(Termination::Cancelled)
        }
        First::Streamer(Ok(StreamEnd::ServerClosed)) => Ok(Termination::ServerClosed),
        First::Listener(Ok(ListenerEnd::ConsumerClosed)) => Ok(Termination::ConsumerGone),
        First::Listener(Ok(ListenerEnd::ConsumerLost(reason))) => {
            warn!(%reason, "Consumer connection lost");
            Ok(Termination::ConsumerGone)
        }
        First::Streamer(Err(e)) | First::Listener(Err(e)) => {
            error!(error = %e, "Stream failed");
            Err(e)
        }
    };

    info!(
        events = streamer.events_sent(),
        confirmed = %confirmed.get(),
        "Stream finished"
    );
    result
}
