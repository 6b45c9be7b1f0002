//! Per-session state shared by the engine and the stream tasks.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::postgres::{ConfirmedPosition, Lsn, ReplicationConnection, SlotInfo, SnapshotReader};
use crate::streamer::{StatusSink, StreamContext, StreamState};
use crate::transport::EventSink;

/// Point-in-time view of a session, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub slot_name: Option<String>,
    pub snapshot_id: Option<String>,
    pub start_position: Option<Lsn>,
    pub confirmed_position: Lsn,
    pub stream_state: StreamState,
}

pub(crate) struct Session {
    pub slot: Option<SlotInfo>,
    /// The connection that created the slot, reused for streaming.
    pub replication: Option<ReplicationConnection>,
    /// Holds a copy of the slot's snapshot for the life of the session.
    pub snapshot: Option<Arc<SnapshotReader>>,
    pub confirmed: Arc<ConfirmedPosition>,
    pub cancel: CancellationToken,
    pub state: Arc<watch::Sender<StreamState>>,
    /// Held for as long as a stream runs.
    pub active: Arc<Mutex<()>>,
    /// Set once a stream has been started on this session.
    pub streamed: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            slot: None,
            replication: None,
            snapshot: None,
            confirmed: Arc::new(ConfirmedPosition::new(Lsn::ZERO)),
            cancel: CancellationToken::new(),
            state: Arc::new(watch::channel(StreamState::Idle).0),
            active: Arc::new(Mutex::new(())),
            streamed: false,
        }
    }

    /// A session for an existing slot; no snapshot is available.
    pub fn resumed(slot_name: String, from: Lsn) -> Self {
        Self {
            slot: Some(SlotInfo {
                slot_name,
                snapshot_id: String::new(),
                start_position: from,
            }),
            confirmed: Arc::new(ConfirmedPosition::new(from)),
            ..Self::new()
        }
    }

    pub fn stream_context(&self, start_position: Lsn, keepalive_interval: Duration) -> StreamContext {
        StreamContext {
            start_position,
            confirmed: self.confirmed.clone(),
            cancel: self.cancel.clone(),
            keepalive_interval,
            state: self.state.clone(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            slot_name: self.slot.as_ref().map(|s| s.slot_name.clone()),
            snapshot_id: self
                .slot
                .as_ref()
                .map(|s| s.snapshot_id.clone())
                .filter(|id| !id.is_empty()),
            start_position: self.slot.as_ref().map(|s| s.start_position),
            confirmed_position: self.confirmed.get(),
            stream_state: *self.state.borrow(),
        }
    }
}

/// Releases a stream's resources exactly once, whichever side ends first.
pub(crate) struct Teardown {
    cancel: CancellationToken,
    done: AtomicBool,
}

impl Teardown {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            done: AtomicBool::new(false),
        }
    }

    /// Cancels the session, then closes the transport and the replication
    /// stream. Close failures are logged, not returned. Returns false if
    /// teardown had already run.
    pub async fn run<E, S>(&self, sink: &mut E, status: &S) -> bool
    where
        E: EventSink,
        S: StatusSink,
    {
        if self.done.swap(true, Ordering::AcqRel) {
            debug!("Teardown already done");
            return false;
        }

        self.cancel.cancel();
        if let Err(e) = sink.close().await {
            warn!(error = %e, "Failed to close transport");
        }
        if let Err(e) = status.close().await {
            warn!(error = %e, "Failed to close replication stream");
        }
        true
    }

    /// Teardown for a stream that never started: only the transport is open.
    pub async fn run_without_stream<E: EventSink>(&self, sink: &mut E) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cancel.cancel();
        if let Err(e) = sink.close().await {
            warn!(error = %e, "Failed to close transport");
        }
        true
    }
}
