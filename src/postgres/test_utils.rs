use bytes::{BufMut, Bytes, BytesMut};

/// Builds pgoutput message bodies and the CopyData frames that carry them.
pub struct MockMessageBuilder {
    timestamp: i64,
}

/// A column in a value list: `None` is SQL NULL.
pub type MockValue<'a> = Option<&'a str>;

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            timestamp: 750_684_600_000_000, // 2023-10-15 11:30:00 UTC, microseconds since 2000-01-01
        }
    }

    pub fn begin(&self, final_lsn: u64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(&self, commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation(&self, rel_id: u32, schema: &str, table: &str, columns: &[(&str, u32, bool)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(rel_id);
        put_cstr(&mut buf, schema);
        put_cstr(&mut buf, table);
        buf.put_u8(b'd'); // replica identity default
        buf.put_u16(columns.len() as u16);

        for (name, type_id, is_key) in columns {
            buf.put_u8(u8::from(*is_key));
            put_cstr(&mut buf, name);
            buf.put_u32(*type_id);
            buf.put_i32(-1);
        }

        buf.freeze()
    }

    pub fn insert(&self, rel_id: u32, values: &[MockValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    pub fn update(&self, rel_id: u32, old: Option<(u8, &[MockValue<'_>])>, new: &[MockValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);
        if let Some((tag, values)) = old {
            buf.put_u8(tag);
            put_tuple(&mut buf, values);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    pub fn delete(&self, rel_id: u32, key: &[MockValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, key);
        buf.freeze()
    }

    /// Wraps a pgoutput body in an XLogData CopyData payload.
    pub fn xlogdata(&self, wal_start: u64, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(wal_start);
        buf.put_u64(wal_start);
        buf.put_i64(self.timestamp);
        buf.put_slice(body);
        buf.freeze()
    }

    pub fn keepalive(&self, wal_end: u64, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(wal_end);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }

    /// A full single-row insert transaction for relation 16384 (`public.users`).
    ///
    /// The relation message is sent first; the transaction commits at `lsn + 2`.
    pub fn users_insert_txn(&self, lsn: u64, xid: u32, id: &str, name: &str) -> Vec<Bytes> {
        vec![
            self.xlogdata(lsn, &self.begin(lsn + 2, xid)),
            self.xlogdata(lsn, &self.users_relation()),
            self.xlogdata(lsn + 1, &self.insert(16384, &[Some(id), Some(name)])),
            self.xlogdata(lsn + 2, &self.commit(lsn + 2, lsn + 2)),
        ]
    }

    pub fn users_relation(&self) -> Bytes {
        self.relation(16384, "public", "users", &[("id", 23, true), ("name", 25, false)])
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue<'_>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(v) => {
                buf.put_u8(b't');
                buf.put_u32(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            None => buf.put_u8(b'n'),
        }
    }
}
