//! Sequence resync after inserting explicit ids.

use crate::db::{Database, QualifiedName, SequenceSync, INSUFFICIENT_PRIVILEGE};
use tracing::{debug, warn};

/// Align the sequence behind `column` for every loaded table. Never fails.
/// Returns the number of sequences moved.
pub(crate) fn sync_sequences(db: &mut dyn Database, tables: &[QualifiedName], column: &str) -> usize {
    let mut synced = 0;
    for table in tables {
        match db.sync_sequence(table, column) {
            Ok(SequenceSync::Reset { max }) => {
                debug!(table = %table, ?max, "sequence reset");
                synced += 1;
            }
            Ok(SequenceSync::NoColumn) | Ok(SequenceSync::NoSequence) => {}
            Err(err) if err.has_code(INSUFFICIENT_PRIVILEGE) => {}
            Err(err) => {
                warn!(table = %table, column, "could not sync sequence: {}", err);
            }
        }
    }
    synced
}
