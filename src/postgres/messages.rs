//! Streaming replication sub-protocol carried inside CopyData frames.
//!
//! The server sends `w` (XLogData) and `k` (primary keepalive) messages; the
//! client answers with `r` (standby status update).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::lsn::Lsn;
use crate::{Error, Result};

/// Microseconds between the unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        timestamp: i64,
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: Lsn,
        timestamp: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::decode("Empty replication message"));
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::decode("Invalid XLogData header size"));
                }
                let wal_start = Lsn(data.get_u64());
                let wal_end = Lsn(data.get_u64());
                let timestamp = data.get_i64();
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    timestamp,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::decode("Invalid keepalive message size"));
                }
                let wal_end = Lsn(data.get_u64());
                let timestamp = data.get_i64();
                let reply_requested = data.get_u8() != 0;
                Ok(ReplicationMessage::PrimaryKeepalive {
                    wal_end,
                    timestamp,
                    reply_requested,
                })
            }
            _ => Err(Error::decode(format!(
                "Unknown replication message tag: {}",
                tag as char
            ))),
        }
    }
}

/// Builds the payload of a standby status update.
///
/// The confirmed position is reported as written, flushed and applied.
pub fn encode_status_update(confirmed: Lsn, now: SystemTime, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(confirmed.0);
    buf.put_u64(confirmed.0);
    buf.put_u64(confirmed.0);
    buf.put_i64(unix_to_pg_timestamp(now));
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

pub fn unix_to_pg_timestamp(time: SystemTime) -> i64 {
    let micros = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as i64;
    micros - PG_EPOCH_OFFSET_MICROS
}

/// PostgreSQL timestamp (microseconds since 2000-01-01) to unix milliseconds.
pub fn pg_timestamp_to_unix_millis(pg_micros: i64) -> i64 {
    (pg_micros + PG_EPOCH_OFFSET_MICROS) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xlogdata() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x100);
        buf.put_u64(0x200);
        buf.put_i64(42);
        buf.put_slice(b"Bpayload");

        match ReplicationMessage::parse(buf.freeze()).unwrap() {
            ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                timestamp,
                data,
            } => {
                assert_eq!(wal_start, Lsn(0x100));
                assert_eq!(wal_end, Lsn(0x200));
                assert_eq!(timestamp, 42);
                assert_eq!(&data[..], b"Bpayload");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x300);
        buf.put_i64(0);
        buf.put_u8(1);

        assert_eq!(
            ReplicationMessage::parse(buf.freeze()).unwrap(),
            ReplicationMessage::PrimaryKeepalive {
                wal_end: Lsn(0x300),
                timestamp: 0,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_parse_rejects_short_and_unknown() {
        assert!(matches!(
            ReplicationMessage::parse(Bytes::new()),
            Err(Error::StreamDecode { .. })
        ));
        assert!(matches!(
            ReplicationMessage::parse(Bytes::from_static(b"w\0\0")),
            Err(Error::StreamDecode { .. })
        ));
        assert!(matches!(
            ReplicationMessage::parse(Bytes::from_static(b"zzzz")),
            Err(Error::StreamDecode { .. })
        ));
    }

    #[test]
    fn test_status_update_layout() {
        let now = UNIX_EPOCH + Duration::from_secs(946_684_800 + 1);
        let mut payload = encode_status_update(Lsn(0xABC), now, false);

        assert_eq!(payload.len(), 34);
        assert_eq!(payload.get_u8(), b'r');
        assert_eq!(payload.get_u64(), 0xABC);
        assert_eq!(payload.get_u64(), 0xABC);
        assert_eq!(payload.get_u64(), 0xABC);
        assert_eq!(payload.get_i64(), 1_000_000);
        assert_eq!(payload.get_u8(), 0);
    }

    #[test]
    fn test_timestamp_conversion() {
        assert_eq!(pg_timestamp_to_unix_millis(0), 946_684_800_000);
        assert_eq!(pg_timestamp_to_unix_millis(1_500), 946_684_800_001);
    }
}
