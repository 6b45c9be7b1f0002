//! The public entry point: one engine per replication source.
//!
//! An [`Engine`] owns at most one session at a time. A session is created by
//! [`Engine::init_session`] (new slot with exported snapshot) or
//! [`Engine::resume_streaming`] (existing slot, no snapshot), and is torn
//! down when a new one replaces it.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::coordinator::{self, Termination};
use crate::postgres::{
    generate_slot_name, validate_slot_name, Lsn, ReplicationConnection, Row, SlotCoordinator,
    SlotInfo, SnapshotReader, SnapshotRequest,
};
use crate::session::{Session, SessionStatus, Teardown};
use crate::streamer::{StreamContext, StreamState};
use crate::transport::Transport;
use crate::{Config, Error, Result};

pub struct Engine {
    config: Config,
    session: Mutex<Session>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            session: Mutex::new(Session::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a new slot and exports its snapshot, replacing any current
    /// session.
    pub async fn init_session(&self) -> Result<SlotInfo> {
        self.reset().await;

        let mut conn = ReplicationConnection::connect(&self.config.postgres).await?;
        let replication = &self.config.replication;
        if replication.create_publication {
            SlotCoordinator::ensure_publication(&mut conn, &replication.publication).await?;
        }

        let mut reader = SnapshotReader::connect(&self.config).await?;
        let slot_name = generate_slot_name(&replication.slot_prefix)?;
        let slot = SlotCoordinator::create_slot(&mut conn, &slot_name).await?;

        // The export dies with START_REPLICATION; pin a copy first.
        if let Err(e) = reader.hold(&slot.snapshot_id).await {
            warn!(slot = %slot.slot_name, error = %e, "Could not hold snapshot, dropping new slot");
            if let Err(drop_err) = SlotCoordinator::drop_slot(&mut conn, &slot.slot_name).await {
                warn!(slot = %slot.slot_name, error = %drop_err, "Failed to drop slot");
            }
            if let Err(close_err) = conn.close().await {
                warn!(error = %close_err, "Failed to close replication connection");
            }
            reader.close();
            return Err(e);
        }

        let mut session = self.session.lock().await;
        session.confirmed.advance(slot.start_position);
        session.slot = Some(slot.clone());
        session.replication = Some(conn);
        session.snapshot = Some(Arc::new(reader));

        info!(slot = %slot.slot_name, snapshot = %slot.snapshot_id, "Session initialized");
        Ok(slot)
    }

    /// Reads one page of a table as of the session's snapshot.
    ///
    /// Works from `init_session` until the session is replaced or shut
    /// down, including while it streams. Resumed sessions have no snapshot.
    pub async fn read_snapshot_page(&self, request: &SnapshotRequest) -> Result<Vec<Row>> {
        request.validate()?;

        let reader = {
            let session = self.session.lock().await;
            session.snapshot.clone().ok_or(Error::SnapshotUnavailable)?
        };

        reader.read_page(request).await
    }

    /// Streams changes from the session's slot, starting at its consistent
    /// point, until the session terminates.
    pub async fn start_streaming<T: Transport>(&self, transport: T) -> Result<Termination> {
        let (conn, slot_name, ctx, active) = {
            let mut session = self.session.lock().await;
            let slot = session.slot.clone().ok_or(Error::SnapshotUnavailable)?;
            if session.streamed {
                return Err(Error::invalid_request(
                    "session has already streamed; initialize a new session",
                ));
            }
            let active = session
                .active
                .clone()
                .try_lock_owned()
                .map_err(|_| Error::invalid_request("a stream is already running"))?;
            let conn = session
                .replication
                .take()
                .ok_or(Error::SnapshotUnavailable)?;
            session.streamed = true;
            let ctx = session.stream_context(
                slot.start_position,
                self.config.replication.keepalive_interval(),
            );
            (conn, slot.slot_name, ctx, active)
        };

        let result = self.stream(conn, &slot_name, ctx, transport).await;
        drop(active);
        result
    }

    /// Streams from an existing slot, replacing any current session.
    ///
    /// With `from` unset the server resumes at the slot's confirmed
    /// position. No snapshot is available on a resumed session.
    pub async fn resume_streaming<T: Transport>(
        &self,
        slot_name: &str,
        from: Option<Lsn>,
        transport: T,
    ) -> Result<Termination> {
        validate_slot_name(slot_name)?;
        self.reset().await;

        let conn = ReplicationConnection::connect(&self.config.postgres).await?;
        let start = from.unwrap_or(Lsn::ZERO);

        let (ctx, active) = {
            let mut session = self.session.lock().await;
            *session = Session::resumed(slot_name.to_string(), start);
            session.streamed = true;
            let active = session
                .active
                .clone()
                .try_lock_owned()
                .map_err(|_| Error::invalid_request("a stream is already running"))?;
            let ctx = session.stream_context(start, self.config.replication.keepalive_interval());
            (ctx, active)
        };

        info!(slot = slot_name, from = %start, "Resuming replication");
        let result = self.stream(conn, slot_name, ctx, transport).await;
        drop(active);
        result
    }

    async fn stream<T: Transport>(
        &self,
        conn: ReplicationConnection,
        slot_name: &str,
        ctx: StreamContext,
        transport: T,
    ) -> Result<Termination> {
        ctx.state.send_replace(StreamState::Starting);

        let started = conn
            .start_replication(slot_name, ctx.start_position, &self.config.replication.publication)
            .await;
        let stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                warn!(slot = slot_name, error = %e, "Could not start replication");
                let (mut sink, _) = transport.split();
                let teardown = Teardown::new(ctx.cancel.clone());
                teardown.run_without_stream(&mut sink).await;
                ctx.state.send_replace(StreamState::Stopped);
                return Err(e);
            }
        };

        let (wal, status) = stream.split();
        coordinator::run_stream(ctx, wal, status, transport).await
    }

    /// Stops the current stream, if any. Safe to call repeatedly.
    pub async fn cancel(&self) {
        let session = self.session.lock().await;
        if !session.cancel.is_cancelled() {
            info!("Cancelling session");
            session.cancel.cancel();
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.lock().await.status()
    }

    /// Drops a replication slot over a dedicated connection.
    ///
    /// A slot whose stream is still shutting down is retried until
    /// `shutdown_timeout` passes.
    pub async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        validate_slot_name(slot_name)?;
        let mut conn = ReplicationConnection::connect(&self.config.postgres).await?;
        let result = SlotCoordinator::drop_slot_when_released(
            &mut conn,
            slot_name,
            self.config.replication.shutdown_timeout(),
        )
        .await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close replication connection");
        }
        result
    }

    /// Tears down the current session and waits for its stream to stop.
    pub async fn shutdown(&self) {
        self.reset().await;
    }

    /// Replaces the current session with an empty one. The old session is
    /// cancelled and its stream given `shutdown_timeout` to finish.
    async fn reset(&self) {
        let old = {
            let mut session = self.session.lock().await;
            std::mem::replace(&mut *session, Session::new())
        };
        old.cancel.cancel();

        let wait = self.config.replication.shutdown_timeout();
        if timeout(wait, old.active.lock()).await.is_err() {
            warn!(?wait, "Previous stream did not stop in time");
        }

        if let Some(conn) = old.replication {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close idle replication connection");
            }
        }
        if let Some(reader) = old.snapshot {
            if let Ok(reader) = Arc::try_unwrap(reader) {
                reader.close();
            }
        }
        if let Some(slot) = old.slot {
            info!(slot = %slot.slot_name, "Previous session reset");
        }
    }
}
