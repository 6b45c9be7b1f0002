pub mod connection;
pub mod decoder;
pub mod lsn;
pub mod messages;
pub mod slot;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod decoder_tests;
#[cfg(test)]
pub mod test_utils;

pub use connection::{ReplicationConnection, ReplicationStream, StatusWriter, WalReader};
pub use decoder::{ColumnInfo, PgOutputDecoder, RelationInfo};
pub use lsn::{ConfirmedPosition, Lsn};
pub use messages::ReplicationMessage;
pub use slot::{generate_slot_name, validate_slot_name, SlotCoordinator, SlotInfo};
pub use snapshot::{OrderBy, Row, SnapshotReader, SnapshotRequest};
pub use types::*;
