//! Acknowledgment Listener: folds consumer acks into the confirmed position.

use tracing::{debug, info, warn};

use crate::postgres::ConfirmedPosition;
use crate::streamer::StatusSink;
use crate::transport::AckSource;
use crate::{Error, Result};
use tokio_util::sync::CancellationToken;

/// How the listener loop ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEnd {
    Cancelled,
    /// The consumer closed its side cleanly.
    ConsumerClosed,
    /// Reading from the consumer failed; treated like a close.
    ConsumerLost(String),
}

/// Reads acknowledgments until the consumer goes away or `cancel` fires.
///
/// Each ack that moves the confirmed position forward is reported to the
/// server immediately. Stale or repeated acks are ignored, and so are frames
/// that do not parse. Only a failed status update is an error.
pub async fn run<A, S>(
    source: &mut A,
    status: &S,
    confirmed: &ConfirmedPosition,
    cancel: &CancellationToken,
) -> Result<ListenerEnd>
where
    A: AckSource,
    S: StatusSink,
{
    let mut acks: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ListenerEnd::Cancelled),
            next = source.recv() => next,
        };

        match next {
            Ok(Some(ack)) => {
                acks += 1;
                if confirmed.advance(ack.lsn) {
                    debug!(lsn = %ack.lsn, "Acknowledgment advanced confirmed position");
                    status.send_status(confirmed.get(), false).await?;
                } else {
                    debug!(lsn = %ack.lsn, confirmed = %confirmed.get(), "Stale acknowledgment ignored");
                }
            }
            Ok(None) => {
                info!(acks, "Consumer closed the acknowledgment channel");
                return Ok(ListenerEnd::ConsumerClosed);
            }
            Err(Error::Serialization(e)) => {
                warn!(error = %e, "Ignoring malformed acknowledgment");
            }
            Err(e) => {
                warn!(error = %e, "Lost the acknowledgment channel");
                return Ok(ListenerEnd::ConsumerLost(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::Lsn;
    use crate::streamer::testing::RecordingStatus;
    use crate::transport::{channel_transport, Acknowledgment, JsonLinesTransport, Transport};
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_acks_fold_to_maximum() {
        let (transport, consumer) = channel_transport(8);
        let (_sink, mut source) = transport.split();
        for lsn in [5, 3, 5, 10, 7] {
            consumer.acks.send(Acknowledgment::new(Lsn(lsn))).await.unwrap();
        }
        drop(consumer);

        let status = RecordingStatus::default();
        let confirmed = ConfirmedPosition::new(Lsn::ZERO);
        let end = run(&mut source, &status, &confirmed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, ListenerEnd::ConsumerClosed);
        assert_eq!(confirmed.get(), Lsn(10));
        assert_eq!(status.sent(), vec![(Lsn(5), false), (Lsn(10), false)]);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (mut client, server) = tokio::io::duplex(1024);
        let transport = JsonLinesTransport::new(BufReader::new(server), tokio::io::sink());
        let (_sink, mut source) = transport.split();

        client
            .write_all(b"{\"lsn\":\"0/10\"}\nnot json\n{\"lsn\":\"zzz\"}\n\n{\"lsn\":\"0/20\"}\n")
            .await
            .unwrap();
        drop(client);

        let status = RecordingStatus::default();
        let confirmed = ConfirmedPosition::new(Lsn::ZERO);
        let end = run(&mut source, &status, &confirmed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, ListenerEnd::ConsumerClosed);
        assert_eq!(confirmed.get(), Lsn(0x20));
        assert_eq!(status.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_non_utf8_frame_is_skipped() {
        let (mut client, server) = tokio::io::duplex(1024);
        let transport = JsonLinesTransport::new(BufReader::new(server), tokio::io::sink());
        let (_sink, mut source) = transport.split();

        client.write_all(b"{\"lsn\":\"0/10\"}\n").await.unwrap();
        client.write_all(b"\xff\xfe{\"lsn\":\"0/99\"}\n").await.unwrap();
        client.write_all(b"{\"lsn\":\"0/30\"}\n").await.unwrap();
        drop(client);

        let status = RecordingStatus::default();
        let confirmed = ConfirmedPosition::new(Lsn::ZERO);
        let end = run(&mut source, &status, &confirmed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, ListenerEnd::ConsumerClosed);
        assert_eq!(confirmed.get(), Lsn(0x30));
        assert_eq!(status.sent(), vec![(Lsn(0x10), false), (Lsn(0x30), false)]);
    }

    #[tokio::test]
    async fn test_cancel_stops_listener() {
        let (transport, _consumer) = channel_transport(1);
        let (_sink, mut source) = transport.split();
        let status = RecordingStatus::default();
        let confirmed = ConfirmedPosition::new(Lsn::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = run(&mut source, &status, &confirmed, &cancel).await.unwrap();
        assert_eq!(end, ListenerEnd::Cancelled);
        assert!(status.sent().is_empty());
    }

    #[tokio::test]
    async fn test_initial_position_not_regressed() {
        let (transport, consumer) = channel_transport(4);
        let (_sink, mut source) = transport.split();
        consumer.acks.send(Acknowledgment::new(Lsn(50))).await.unwrap();
        drop(consumer);

        let status = RecordingStatus::default();
        let confirmed = ConfirmedPosition::new(Lsn(100));
        run(&mut source, &status, &confirmed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(confirmed.get(), Lsn(100));
        assert!(status.sent().is_empty());
    }
}
