//! Replication slot lifecycle and the atomic snapshot/position capture.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::connection::{quote_ident, QueryRow, ReplicationConnection};
use super::lsn::Lsn;
use crate::{Error, Result};

/// SQLSTATE undefined_object, returned when dropping a missing slot.
const UNDEFINED_OBJECT: &str = "42704";

/// SQLSTATE object_in_use, returned while a walsender still holds the slot.
const OBJECT_IN_USE: &str = "55006";

const DROP_RETRY_DELAY: Duration = Duration::from_millis(200);

const MAX_SLOT_NAME_LEN: usize = 63;

/// What a slot creation captured, all at the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_name: String,
    pub snapshot_id: String,
    pub start_position: Lsn,
}

static SLOT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generates a fresh slot name: `<prefix>_<unix micros>_<counter>`.
pub fn generate_slot_name(prefix: &str) -> Result<String> {
    let micros = chrono::Utc::now().timestamp_micros();
    let counter = SLOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}_{}_{}", prefix, micros, counter);
    validate_slot_name(&name)?;
    Ok(name)
}

/// Slot names may contain only lower case letters, digits and underscores.
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SLOT_NAME_LEN {
        return Err(Error::invalid_request(format!(
            "slot name must be 1 to {} characters",
            MAX_SLOT_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::invalid_request(format!(
            "slot name '{}' may only contain lower case letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

pub struct SlotCoordinator;

impl SlotCoordinator {
    /// Creates a logical slot and exports its snapshot in one request.
    ///
    /// The snapshot stays importable only while `conn` stays idle, so the
    /// caller must keep the connection open and unused until snapshot reads
    /// are done.
    pub async fn create_slot(conn: &mut ReplicationConnection, slot_name: &str) -> Result<SlotInfo> {
        validate_slot_name(slot_name)?;
        info!(slot = slot_name, "Creating replication slot");

        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput EXPORT_SNAPSHOT",
            quote_ident(slot_name)
        );

        let rows = conn.simple_query(&query).await.map_err(|e| match e {
            Error::Server { code, message } => Error::SlotCreation {
                message: format!("{} ({})", message, code),
            },
            other => other,
        })?;

        let info = parse_slot_row(rows.first())?;
        info!(
            slot = %info.slot_name,
            snapshot = %info.snapshot_id,
            start = %info.start_position,
            "Created replication slot"
        );
        Ok(info)
    }

    /// Drops a slot. A slot that no longer exists counts as dropped.
    pub async fn drop_slot(conn: &mut ReplicationConnection, slot_name: &str) -> Result<()> {
        validate_slot_name(slot_name)?;
        info!(slot = slot_name, "Dropping replication slot");

        let query = format!("DROP_REPLICATION_SLOT {}", quote_ident(slot_name));
        match conn.simple_query(&query).await {
            Ok(_) => {
                info!(slot = slot_name, "Dropped replication slot");
                Ok(())
            }
            Err(Error::Server { code, .. }) if code == UNDEFINED_OBJECT => {
                warn!(slot = slot_name, "Replication slot does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`drop_slot`](Self::drop_slot), but retries for up to `wait`
    /// while the slot is still held by a connection that is shutting down.
    pub async fn drop_slot_when_released(
        conn: &mut ReplicationConnection,
        slot_name: &str,
        wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            match Self::drop_slot(conn, slot_name).await {
                Err(Error::Server { code, .. })
                    if code == OBJECT_IN_USE && Instant::now() + DROP_RETRY_DELAY < deadline =>
                {
                    debug!(slot = slot_name, "Slot still active, retrying drop");
                    sleep(DROP_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    /// Creates `FOR ALL TABLES` publication `name` unless it already exists.
    pub async fn ensure_publication(conn: &mut ReplicationConnection, name: &str) -> Result<()> {
        let literal = name.replace('\'', "''");
        let rows = conn
            .simple_query(&format!(
                "SELECT 1 AS present FROM pg_publication WHERE pubname = '{}'",
                literal
            ))
            .await?;
        if !rows.is_empty() {
            return Ok(());
        }

        info!(publication = name, "Creating publication for all tables");
        conn.simple_query(&format!(
            "CREATE PUBLICATION {} FOR ALL TABLES",
            quote_ident(name)
        ))
        .await?;
        Ok(())
    }
}

fn parse_slot_row(row: Option<&QueryRow>) -> Result<SlotInfo> {
    let row = row.ok_or_else(|| Error::SlotCreation {
        message: "server returned no row for CREATE_REPLICATION_SLOT".to_string(),
    })?;

    let field = |name: &str| {
        row.get(name)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::SlotCreation {
                message: format!("missing '{}' in slot creation result", name),
            })
    };

    let slot_name = field("slot_name")?;
    let snapshot_id = field("snapshot_name")?;
    let start_position = field("consistent_point")?
        .parse()
        .map_err(|e: Error| Error::SlotCreation {
            message: e.to_string(),
        })?;

    Ok(SlotInfo {
        slot_name,
        snapshot_id,
        start_position,
    })
}
