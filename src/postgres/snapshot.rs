//! Paginated reads bound to an exported snapshot.
//!
//! Each page runs in its own repeatable-read transaction that imports the
//! snapshot, so every page sees the database exactly as it was when the slot
//! was created, before and during streaming.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, IsolationLevel, NoTls};
use tracing::{debug, error, info};

use super::connection::quote_ident;
use crate::{Config, Error, Result};

/// One table row as a JSON object keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderBy {
    pub column: String,
    /// `asc` or `desc`, any case.
    pub order: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SnapshotRequest {
    pub table: String,
    pub offset: i64,
    pub limit: i64,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("asc") {
            Some(SortDirection::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Some(SortDirection::Desc)
        } else {
            None
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// A validated page read, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub sql: String,
    pub offset: i64,
    pub limit: i64,
}

impl SnapshotRequest {
    pub fn new(table: impl Into<String>, offset: i64, limit: i64) -> Self {
        Self {
            table: table.into(),
            offset,
            limit,
            order_by: None,
        }
    }

    pub fn order_by(mut self, column: impl Into<String>, order: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            order: order.into(),
        });
        self
    }

    /// Checks the request and builds its query without touching the database.
    pub fn validate(&self) -> Result<PageQuery> {
        let table = quote_table(&self.table)?;

        if self.offset < 0 {
            return Err(Error::invalid_request("'offset' must not be negative"));
        }
        if self.limit < 1 {
            return Err(Error::invalid_request("'limit' must be at least 1"));
        }

        let order = match &self.order_by {
            None => String::new(),
            Some(ob) => {
                if ob.column.is_empty() {
                    return Err(Error::invalid_request(
                        "required field 'column' missing in 'order_by'",
                    ));
                }
                let direction = SortDirection::parse(&ob.order).ok_or_else(|| {
                    Error::invalid_request(
                        "order_by order direction can only be either 'ASC' or 'DESC'",
                    )
                })?;
                format!(" ORDER BY t.{} {}", quote_ident(&ob.column), direction.as_sql())
            }
        };

        Ok(PageQuery {
            sql: format!(
                "SELECT row_to_json(t)::text FROM {} AS t{} OFFSET $1 LIMIT $2",
                table, order
            ),
            offset: self.offset,
            limit: self.limit,
        })
    }
}

fn quote_table(table: &str) -> Result<String> {
    if table.is_empty() {
        return Err(Error::invalid_request("required field 'table' missing"));
    }
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::invalid_request(format!(
            "'{}' is not a valid table name",
            table
        )));
    }
    Ok(parts
        .iter()
        .map(|p| quote_ident(p))
        .collect::<Vec<_>>()
        .join("."))
}

/// Exported snapshot names are hex groups separated by dashes.
fn validate_snapshot_id(snapshot_id: &str) -> Result<()> {
    if snapshot_id.is_empty()
        || !snapshot_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-')
    {
        return Err(Error::invalid_request(format!(
            "'{}' is not a valid snapshot identifier",
            snapshot_id
        )));
    }
    Ok(())
}

/// Reads pages from a snapshot that outlives the slot's own export.
///
/// The snapshot a slot exports is only valid while its replication
/// connection stays idle, and `START_REPLICATION` ends it. The reader
/// therefore imports it once into a repeatable-read transaction on a
/// holding connection and re-exports it from there; pages are read against
/// that copy, which lives until the reader is closed.
pub struct SnapshotReader {
    client: Mutex<Client>,
    holder: Client,
    held_snapshot: Option<String>,
    connection_tasks: Vec<JoinHandle<()>>,
}

impl SnapshotReader {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!("Opening snapshot connections to PostgreSQL");
        let pg_config = config.postgres_config();
        let mut connection_tasks = Vec::with_capacity(2);

        let (client, connection) = pg_config.connect(NoTls).await?;
        connection_tasks.push(tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Snapshot connection error: {}", e);
            }
        }));

        let (holder, connection) = pg_config.connect(NoTls).await?;
        connection_tasks.push(tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Snapshot holding connection error: {}", e);
            }
        }));

        Ok(Self {
            client: Mutex::new(client),
            holder,
            held_snapshot: None,
            connection_tasks,
        })
    }

    /// Pins `exported` on the holding connection and returns the id pages
    /// are read from.
    ///
    /// Must run while the exporting replication connection is still idle.
    pub async fn hold(&mut self, exported: &str) -> Result<String> {
        validate_snapshot_id(exported)?;
        if self.held_snapshot.is_some() {
            return Err(Error::invalid_request("a snapshot is already held"));
        }

        self.holder
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        self.holder
            .batch_execute(&format!("SET TRANSACTION SNAPSHOT '{}'", exported))
            .await
            .map_err(|e| snapshot_error(e, exported))?;
        let row = self.holder.query_one("SELECT pg_export_snapshot()", &[]).await?;
        let held: String = row.try_get(0)?;

        debug!(exported, held = %held, "Holding snapshot");
        self.held_snapshot = Some(held.clone());
        Ok(held)
    }

    /// Reads one page of `request.table` as of the held snapshot.
    pub async fn read_page(&self, request: &SnapshotRequest) -> Result<Vec<Row>> {
        let page = request.validate()?;
        let snapshot_id = self
            .held_snapshot
            .as_deref()
            .ok_or(Error::SnapshotUnavailable)?;

        let mut client = self.client.lock().await;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        debug!(snapshot = snapshot_id, "Setting transaction snapshot");
        tx.batch_execute(&format!("SET TRANSACTION SNAPSHOT '{}'", snapshot_id))
            .await
            .map_err(|e| snapshot_error(e, snapshot_id))?;

        debug!(query = %page.sql, offset = page.offset, limit = page.limit, "Executing page query");
        let rows = tx
            .query(page.sql.as_str(), &[&page.offset, &page.limit])
            .await
            .map_err(query_error)?;

        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get(0)?;
            data.push(serde_json::from_str::<Row>(&text)?);
        }
        tx.commit().await?;

        info!(
            table = %request.table,
            offset = page.offset,
            limit = page.limit,
            count = data.len(),
            "Read snapshot page"
        );
        Ok(data)
    }

    /// Ends the holding transaction, releasing the snapshot.
    pub fn close(self) {
        for task in self.connection_tasks {
            task.abort();
        }
    }
}

fn snapshot_error(e: tokio_postgres::Error, snapshot_id: &str) -> Error {
    match e.code() {
        Some(code)
            if *code == SqlState::INVALID_PARAMETER_VALUE
                || *code == SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE =>
        {
            Error::SnapshotExpired {
                snapshot_id: snapshot_id.to_string(),
                message: e
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string()),
            }
        }
        _ => Error::Postgres(e),
    }
}

fn query_error(e: tokio_postgres::Error) -> Error {
    match e.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::UNDEFINED_COLUMN => {
            Error::invalid_request(
                e.as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string()),
            )
        }
        _ => Error::Postgres(e),
    }
}
