//! Replication-mode connection speaking the PostgreSQL wire protocol directly.
//!
//! `tokio-postgres` cannot drive a CopyBoth sub-protocol, so the replication
//! side opens its own socket and uses `postgres-protocol` for message
//! encoding and authentication.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::frontend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::lsn::Lsn;
use super::messages::encode_status_update;
use crate::config::PostgresConfig;
use crate::streamer::{StatusSink, WalSource};
use crate::{Error, Result};

const MAX_FRAME_LEN: usize = 1 << 30;

/// One backend message: tag byte and body without the length prefix.
#[derive(Debug)]
struct Frame {
    tag: u8,
    body: Bytes,
}

/// A row returned by a simple query, values in text format.
#[derive(Debug, Clone, Default)]
pub struct QueryRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl QueryRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)?.as_deref()
    }
}

pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Opening replication connection"
        );

        timeout(config.connect_timeout(), Self::establish(config))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "Timed out after {}s connecting to {}:{}",
                    config.connect_timeout_secs, config.host, config.port
                ))
            })?
    }

    async fn establish(config: &PostgresConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                Error::Connection(format!("{}:{}: {}", config.host, config.port, e))
            })?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
        };

        let params = [
            ("user", config.username.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "pg-deltastream"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params, &mut buf)?;
        conn.write(&buf).await?;

        conn.authenticate(&config.username, config.password.as_deref())
            .await?;
        conn.wait_ready().await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(conn)
    }

    async fn authenticate(&mut self, user: &str, password: Option<&str>) -> Result<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'R' => {}
                b'E' => {
                    let (code, message) = parse_error_response(&frame.body);
                    return Err(Error::Authentication(format!("{}: {}", code, message)));
                }
                tag => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message during authentication: {}",
                        tag as char
                    )))
                }
            }

            let mut body = frame.body;
            if body.remaining() < 4 {
                return Err(Error::Protocol("Truncated authentication request".to_string()));
            }
            let mut buf = BytesMut::new();

            match body.get_i32() {
                0 => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                3 => {
                    let password = require_password(password)?;
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                }
                5 => {
                    let password = require_password(password)?;
                    if body.remaining() < 4 {
                        return Err(Error::Protocol("Truncated MD5 salt".to_string()));
                    }
                    let mut salt = [0u8; 4];
                    body.copy_to_slice(&mut salt);
                    let hash = md5_hash(user.as_bytes(), password.as_bytes(), salt);
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                10 => {
                    let password = require_password(password)?;
                    let mechanisms = split_cstrings(&body);
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(Error::Authentication(format!(
                            "No supported SASL mechanism offered: {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, client.message(), &mut buf)?;
                    scram = Some(client);
                }
                11 => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| Error::Protocol("SASL continue without initial response".to_string()))?;
                    client
                        .update(&body)
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(client.message(), &mut buf)?;
                }
                12 => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| Error::Protocol("SASL final without exchange".to_string()))?;
                    client
                        .finish(&body)
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    continue;
                }
                other => {
                    return Err(Error::Authentication(format!(
                        "Unsupported authentication method: {}",
                        other
                    )))
                }
            }

            self.write(&buf).await?;
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'Z' => {
                    debug!("Ready for query");
                    return Ok(());
                }
                b'E' => return Err(server_error(&frame.body)),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => {}
            }
        }
    }

    /// Runs a replication command or SQL statement with the simple query protocol.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>> {
        debug!(query, "Sending simple query");
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.write(&buf).await?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'T' => columns = parse_row_description(&frame.body)?,
                b'D' => rows.push(QueryRow::new(
                    columns.clone(),
                    parse_data_row(&frame.body)?,
                )),
                b'E' => failure = Some(server_error(&frame.body)),
                b'Z' => break,
                // CommandComplete, EmptyQueryResponse, NoticeResponse
                _ => {}
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    /// Enters CopyBoth mode streaming `slot_name` from `start`.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start: Lsn,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            quote_ident(slot_name),
            start,
            publication.replace('\'', "''")
        );
        info!(slot = slot_name, %start, "Starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.write(&buf).await?;

        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'W' => {
                    info!("Entered CopyBoth mode");
                    return Ok(ReplicationStream {
                        stream: self.stream,
                        read_buf: self.read_buf,
                    });
                }
                b'E' => {
                    let err = server_error(&frame.body);
                    // The server follows the error with ReadyForQuery.
                    let _ = self.wait_ready().await;
                    return Err(err);
                }
                b'N' => log_notice(&frame.body),
                tag => {
                    return Err(Error::Protocol(format!(
                        "Unexpected response to START_REPLICATION: {}",
                        tag as char
                    )))
                }
            }
        }
    }

    /// Sends Terminate and closes the socket.
    pub async fn close(mut self) -> Result<()> {
        info!("Closing replication connection");
        let mut buf = BytesMut::new();
        frontend::terminate(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.read_buf).await
    }
}

/// A replication connection in CopyBoth mode, before it is split.
pub struct ReplicationStream {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl ReplicationStream {
    /// Splits into the WAL reading half and the status writing half.
    pub fn split(self) -> (WalReader, StatusWriter) {
        let (read, write) = self.stream.into_split();
        (
            WalReader {
                read,
                read_buf: self.read_buf,
            },
            StatusWriter {
                write: Mutex::new(write),
                closed: AtomicBool::new(false),
            },
        )
    }
}

pub struct WalReader {
    read: OwnedReadHalf,
    read_buf: BytesMut,
}

#[async_trait]
impl WalSource for WalReader {
    async fn next_message(&mut self) -> Result<Option<Bytes>> {
        loop {
            let frame = read_frame(&mut self.read, &mut self.read_buf).await?;
            match frame.tag {
                b'd' => return Ok(Some(frame.body)),
                b'c' => {
                    debug!("Server ended the copy stream");
                    return Ok(None);
                }
                b'E' => return Err(server_error(&frame.body)),
                b'N' => log_notice(&frame.body),
                tag => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message in CopyBoth mode: {}",
                        tag as char
                    )))
                }
            }
        }
    }
}

pub struct StatusWriter {
    write: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

#[async_trait]
impl StatusSink for StatusWriter {
    async fn send_status(&self, confirmed: Lsn, reply_requested: bool) -> Result<()> {
        let payload = encode_status_update(confirmed, SystemTime::now(), reply_requested);

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        let mut write = self.write.lock().await;
        write.write_all(&frame).await?;
        write.flush().await?;
        debug!(%confirmed, "Sent standby status update");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        frontend::copy_done(&mut buf);
        frontend::terminate(&mut buf);

        let mut write = self.write.lock().await;
        write.write_all(&buf).await?;
        write.shutdown().await?;
        Ok(())
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<Frame> {
    loop {
        if buf.len() >= 5 {
            let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            if len < 4 || len as usize > MAX_FRAME_LEN {
                return Err(Error::Protocol(format!("Invalid frame length: {}", len)));
            }
            let total = 1 + len as usize;
            if buf.len() >= total {
                let mut frame = buf.split_to(total);
                let tag = frame.get_u8();
                frame.advance(4);
                return Ok(Frame {
                    tag,
                    body: frame.freeze(),
                });
            }
            buf.reserve(total - buf.len());
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(Error::Connection(
                "Server closed the replication connection".to_string(),
            ));
        }
    }
}

fn require_password(password: Option<&str>) -> Result<&str> {
    password.ok_or_else(|| Error::Authentication("Password required but not provided".to_string()))
}

fn split_cstrings(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect()
}

/// Extracts SQLSTATE and message from an ErrorResponse/NoticeResponse body.
pub(crate) fn parse_error_response(body: &[u8]) -> (String, String) {
    let mut code = String::new();
    let mut message = String::new();
    let mut rest = body;

    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]).to_string();
        match field {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
        rest = tail.get(end + 1..).unwrap_or_default();
    }

    (code, message)
}

fn server_error(body: &[u8]) -> Error {
    let (code, message) = parse_error_response(body);
    Error::Server { code, message }
}

fn log_notice(body: &[u8]) {
    let (code, message) = parse_error_response(body);
    warn!(code = %code, "Server notice: {}", message);
}

fn parse_row_description(mut body: &[u8]) -> Result<Vec<String>> {
    if body.remaining() < 2 {
        return Err(Error::Protocol("Truncated RowDescription".to_string()));
    }
    let count = body.get_u16() as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let end = body
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Protocol("Unterminated column name".to_string()))?;
        names.push(String::from_utf8_lossy(&body[..end]).to_string());
        body.advance(end + 1);
        // table oid, attnum, type oid, typlen, typmod, format
        if body.remaining() < 18 {
            return Err(Error::Protocol("Truncated RowDescription field".to_string()));
        }
        body.advance(18);
    }
    Ok(names)
}

fn parse_data_row(mut body: &[u8]) -> Result<Vec<Option<String>>> {
    if body.remaining() < 2 {
        return Err(Error::Protocol("Truncated DataRow".to_string()));
    }
    let count = body.get_u16() as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(Error::Protocol("Truncated DataRow value".to_string()));
        }
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(Error::Protocol("Truncated DataRow value".to_string()));
        }
        values.push(Some(String::from_utf8_lossy(&body[..len]).to_string()));
        body.advance(len);
    }
    Ok(values)
}

/// Quotes an identifier for use in a replication command or SQL statement.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
