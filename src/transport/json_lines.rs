use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{AckSource, Acknowledgment, EventSink, Transport};
use crate::postgres::ChangeEvent;
use crate::Result;

/// Newline-delimited JSON over any reader/writer pair.
///
/// Each event is one JSON object per line on the writer; each line on the
/// reader is an acknowledgment such as `{"lsn":"0/16B3748"}`.
pub struct JsonLinesTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> JsonLinesTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> Transport for JsonLinesTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Sink = JsonLinesSink<W>;
    type Source = JsonLinesSource<R>;

    fn split(self) -> (Self::Sink, Self::Source) {
        (
            JsonLinesSink {
                writer: self.writer,
                line: Vec::with_capacity(512),
            },
            JsonLinesSource {
                reader: self.reader,
                line: Vec::with_capacity(64),
            },
        )
    }
}

pub struct JsonLinesSink<W> {
    writer: W,
    line: Vec<u8>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for JsonLinesSink<W> {
    async fn send(&mut self, event: &ChangeEvent) -> Result<()> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, event)?;
        self.line.push(b'\n');
        self.writer.write_all(&self.line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Lines are parsed as bytes, so one that is not UTF-8 is a malformed
/// acknowledgment rather than a read failure.
pub struct JsonLinesSource<R> {
    reader: R,
    /// Partial line kept across cancelled reads.
    line: Vec<u8>,
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> AckSource for JsonLinesSource<R> {
    async fn recv(&mut self) -> Result<Option<Acknowledgment>> {
        loop {
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                self.line.clear();
                continue;
            }
            trace!(line = %String::from_utf8_lossy(&self.line).trim_end(), "Received consumer frame");
            let ack: serde_json::Result<Acknowledgment> = serde_json::from_slice(&self.line);
            self.line.clear();
            return Ok(Some(ack?));
        }
    }
}
