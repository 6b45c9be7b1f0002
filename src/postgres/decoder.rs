use bytes::Buf;
use std::collections::HashMap;
use tracing::{debug, trace};

use super::lsn::Lsn;
use super::messages::pg_timestamp_to_unix_millis;
use super::types::{ChangeEvent, ChangeKind, ColumnValues};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// Decodes pgoutput (protocol version 1) messages into change events.
///
/// Holds only the relation cache and the open transaction; it performs no
/// I/O, so it can be driven from captured byte fixtures.
///
/// Positions are per transaction: `begin` and row events carry the commit
/// LSN announced by Begin, `commit` carries the commit end LSN. The server
/// sends transactions in commit order, so positions never go backwards even
/// when transactions overlapped in the WAL.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    current_xid: Option<u32>,
    current_commit: Option<Lsn>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    /// Decodes the body of one XLogData message received at `wal_position`.
    ///
    /// Relation, type, origin and truncate messages update state or are
    /// skipped and yield `None`. `wal_position` is only used for a row event
    /// that arrives outside a transaction.
    pub fn decode(&mut self, wal_position: Lsn, data: &[u8]) -> Result<Option<ChangeEvent>> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Ok(None);
        }
        let position = self.current_commit.unwrap_or(wal_position);

        let msg_type = cursor.get_u8();
        match msg_type {
            b'B' => self.decode_begin(wal_position, cursor).map(Some),
            b'C' => self.decode_commit(cursor).map(Some),
            b'R' => self.decode_relation(cursor).map(|_| None),
            b'I' => self.decode_insert(position, cursor).map(Some),
            b'U' => self.decode_update(position, cursor).map(Some),
            b'D' => self.decode_delete(position, cursor).map(Some),
            b'T' => {
                debug!(%position, "TRUNCATE received, not forwarded");
                Ok(None)
            }
            b'Y' | b'O' | b'M' => {
                trace!(%position, "Skipping pgoutput message {}", msg_type as char);
                Ok(None)
            }
            _ => Err(Error::decode(format!(
                "Unknown pgoutput message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_begin(&mut self, position: Lsn, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(cursor, 20, "BEGIN")?;

        let final_lsn = Lsn(cursor.get_u64());
        let timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        self.current_xid = Some(xid);
        self.current_commit = Some(final_lsn);

        trace!("BEGIN: lsn={}, final={}, xid={}", position, final_lsn, xid);
        Ok(ChangeEvent::begin(
            final_lsn,
            xid,
            final_lsn,
            pg_timestamp_to_unix_millis(timestamp),
        ))
    }

    fn decode_commit(&mut self, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(cursor, 25, "COMMIT")?;

        let _flags = cursor.get_u8();
        let _commit_lsn = cursor.get_u64();
        let end_lsn = Lsn(cursor.get_u64());
        let timestamp = cursor.get_i64();

        self.current_commit = None;
        trace!("COMMIT: lsn={}", end_lsn);
        Ok(ChangeEvent::commit(
            end_lsn,
            self.current_xid.take(),
            pg_timestamp_to_unix_millis(timestamp),
        ))
    }

    fn decode_relation(&mut self, mut cursor: &[u8]) -> Result<()> {
        need(cursor, 4, "RELATION")?;
        let rel_id = cursor.get_u32();
        let schema = read_cstr(&mut cursor, "RELATION namespace")?;
        let table = read_cstr(&mut cursor, "RELATION name")?;

        need(cursor, 3, "RELATION")?;
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            need(cursor, 1, "RELATION column")?;
            let flags = cursor.get_u8();
            let name = read_cstr(&mut cursor, "RELATION column name")?;
            need(cursor, 8, "RELATION column")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();

            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: (flags & 1) != 0,
            });
        }

        debug!("RELATION: {}={}.{}", rel_id, schema, table);
        self.relations.insert(
            rel_id,
            RelationInfo {
                id: rel_id,
                schema,
                table,
                columns,
            },
        );

        Ok(())
    }

    fn decode_insert(&mut self, position: Lsn, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(cursor, 5, "INSERT")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'N' {
            return Err(Error::decode(format!(
                "Unexpected tuple type in INSERT: {}",
                tuple_type as char
            )));
        }

        let relation = self.lookup(rel_id)?;
        let columns = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(ChangeEvent::row(
            position,
            ChangeKind::Insert,
            self.current_xid,
            &relation.schema,
            &relation.table,
            columns,
            None,
        ))
    }

    fn decode_update(&mut self, position: Lsn, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(cursor, 5, "UPDATE")?;

        let rel_id = cursor.get_u32();
        let relation = self.lookup(rel_id)?;

        let mut old = None;
        let mut tuple_type = cursor.get_u8();
        if tuple_type == b'O' || tuple_type == b'K' {
            old = Some(decode_tuple_data(&mut cursor, &relation.columns)?);
            need(cursor, 1, "UPDATE new tuple")?;
            tuple_type = cursor.get_u8();
        }

        if tuple_type != b'N' {
            return Err(Error::decode(format!(
                "Unexpected tuple type in UPDATE: {}",
                tuple_type as char
            )));
        }
        let columns = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(ChangeEvent::row(
            position,
            ChangeKind::Update,
            self.current_xid,
            &relation.schema,
            &relation.table,
            columns,
            old,
        ))
    }

    fn decode_delete(&mut self, position: Lsn, mut cursor: &[u8]) -> Result<ChangeEvent> {
        need(cursor, 5, "DELETE")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'O' && tuple_type != b'K' {
            return Err(Error::decode(format!(
                "Unexpected tuple type in DELETE: {}",
                tuple_type as char
            )));
        }

        let relation = self.lookup(rel_id)?;
        let old_tuple = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(ChangeEvent::row(
            position,
            ChangeKind::Delete,
            self.current_xid,
            &relation.schema,
            &relation.table,
            old_tuple.clone(),
            Some(old_tuple),
        ))
    }

    fn lookup(&self, rel_id: u32) -> Result<&RelationInfo> {
        self.relations
            .get(&rel_id)
            .ok_or_else(|| Error::decode(format!("Unknown relation ID: {}", rel_id)))
    }
}

fn need(cursor: &[u8], len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(Error::decode(format!("Invalid {} message size", what)));
    }
    Ok(())
}

fn read_cstr(cursor: &mut &[u8], what: &str) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::decode(format!("Unterminated string in {}", what)))?;
    let value = String::from_utf8_lossy(&cursor[..end]).to_string();
    cursor.advance(end + 1);
    Ok(value)
}

fn decode_tuple_data(cursor: &mut &[u8], columns: &[ColumnInfo]) -> Result<ColumnValues> {
    need(cursor, 2, "tuple")?;
    let num_columns = cursor.get_u16();

    if num_columns as usize != columns.len() {
        return Err(Error::decode(format!(
            "Column count mismatch: {} vs {}",
            num_columns,
            columns.len()
        )));
    }

    let mut tuple = ColumnValues::new();

    for column in columns {
        need(cursor, 1, "tuple column")?;
        let col_type = cursor.get_u8();

        match col_type {
            b'n' => {
                tuple.insert(column.name.clone(), serde_json::Value::Null);
            }
            // Unchanged TOASTed value: the server does not resend it.
            b'u' => {}
            b't' => {
                need(cursor, 4, "tuple column")?;
                let len = cursor.get_u32() as usize;
                if cursor.remaining() < len {
                    return Err(Error::decode("Invalid text value length"));
                }
                let value = String::from_utf8_lossy(&cursor[..len]).to_string();
                cursor.advance(len);

                tuple.insert(
                    column.name.clone(),
                    parse_postgres_value(&value, column.type_id),
                );
            }
            b'b' => {
                return Err(Error::decode(
                    "Binary tuple values are not requested and cannot be decoded",
                ));
            }
            _ => {
                return Err(Error::decode(format!(
                    "Unknown column type: {}",
                    col_type as char
                )));
            }
        }
    }

    Ok(tuple)
}

pub(crate) fn parse_postgres_value(text: &str, type_id: u32) -> serde_json::Value {
    match type_id {
        16 => match text {
            // bool
            "t" => serde_json::Value::Bool(true),
            "f" => serde_json::Value::Bool(false),
            _ => serde_json::Value::String(text.to_string()),
        },
        20 | 21 | 23 | 26 => {
            // int8, int2, int4, oid
            text.parse::<i64>()
                .map(serde_json::Value::from)
                .unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
        }
        700 | 701 => {
            // float4, float8; NaN and Infinity stay strings
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(text.to_string()))
        }
        114 | 3802 => {
            // json, jsonb
            serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
        }
        _ => serde_json::Value::String(text.to_string()),
    }
}
