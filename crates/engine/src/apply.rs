//! Apply loop shared by the applier and the replayer
//!
//! `apply_events` decodes a write-set buffer event by event and executes
//! each event against storage on behalf of a session:
//!
//! - a format description replaces the session's cached apply format and
//!   is not executed
//! - a GTID event with `gno == 0` is skipped so that commit synthesizes a
//!   local id; any other GTID is recorded as the session's `gtid_next`
//! - every other event first stamps the session with the originating
//!   server id, the event time (apply time when the event has none) and
//!   the skip-replication flag, then runs against the storage transaction
//!
//! The first failure stops the loop. Nothing after a bad event is decoded.

use crate::high_priority::RelayLogInfo;
use chrono::{DateTime, TimeZone, Utc};
use replicore_concurrency::{KillState, MdlDuration, OptionBits, Session, SessionState};
use replicore_core::{
    decode_next, Condition, Event, EventBody, ReplicationError, Result, SchemaChange, Seqno,
};
use replicore_storage::{MemoryEngine, StorageError, StorageTrx, WriteOutcome, ER_UNKNOWN};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

/// Summary of a successful apply loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedEvents {
    /// Events executed against storage
    pub executed: usize,
    /// Events consumed without execution (format descriptions, empty GTIDs)
    pub skipped: usize,
    /// Bytes consumed; equals the buffer length
    pub consumed: usize,
    /// Row changes tolerated in idempotent mode
    pub ignored: usize,
}

/// Decode and execute every event in `buf`
///
/// # Errors
///
/// `MalformedEvent` if an event cannot be decoded, `ApplyFailure` for the
/// first event storage rejects.
pub fn apply_events(
    engine: &MemoryEngine,
    session: &Session,
    rli: &RelayLogInfo,
    buf: &[u8],
) -> Result<AppliedEvents> {
    let seqno = current_seqno(session);
    let mut applied = AppliedEvents::default();
    if buf.is_empty() {
        debug!(target: "replicore::applier", seqno = seqno.get(), "empty write-set to apply");
        return Ok(applied);
    }

    let mut format = session
        .lock()
        .apply_format
        .clone()
        .unwrap_or_else(|| rli.format().clone());

    while applied.consumed < buf.len() {
        let remaining = &buf[applied.consumed..];
        let (event, consumed) = decode_next(remaining, &format).map_err(|e| {
            error!(
                target: "replicore::applier",
                seqno = seqno.get(),
                remaining = remaining.len(),
                error = %e,
                "applier could not read event"
            );
            e
        })?;
        applied.consumed += consumed;

        match &event.body {
            EventBody::FormatDescription(fd) => {
                format = fd.clone();
                session.lock().apply_format = Some(fd.clone());
                applied.skipped += 1;
                continue;
            }
            EventBody::Gtid { gno: 0, .. } => {
                trace!(target: "replicore::applier", seqno = seqno.get(), "skipping empty gtid");
                applied.skipped += 1;
                continue;
            }
            _ => {}
        }

        applied.executed += 1;
        let trx = stamp_session(session, &event);
        match execute_event(engine, session, trx, &event) {
            Ok(ignored) => {
                if !ignored.is_empty() {
                    let mut state = session.lock();
                    state.has_ignored_error = true;
                    for condition in &ignored {
                        state.diagnostics.push_warning(condition.code, condition.message.clone());
                    }
                    applied.ignored += ignored.len();
                }
            }
            Err(condition) => {
                let event_type = event.event_type().name();
                warn!(
                    target: "replicore::applier",
                    event = applied.executed,
                    event_type,
                    code = condition.code,
                    seqno = seqno.get(),
                    "event apply failed"
                );
                session
                    .lock()
                    .diagnostics
                    .set_error(condition.code, condition.message.clone());
                return Err(ReplicationError::ApplyFailure {
                    code: condition.code,
                    event_index: applied.executed,
                    event_type,
                    message: condition.message,
                });
            }
        }
    }

    let state = session.lock();
    if state.killed == KillState::Connection {
        info!(target: "replicore::applier", seqno = seqno.get(), "applier aborted");
    }
    Ok(applied)
}

fn current_seqno(session: &Session) -> Seqno {
    session
        .lock()
        .transaction
        .as_ref()
        .map(|t| t.seqno())
        .unwrap_or_default()
}

/// Propagate event origin onto the session; returns its storage transaction
fn stamp_session(session: &Session, event: &Event) -> Option<StorageTrx> {
    let mut state = session.lock();
    state.origin_server_id = event.header.server_id;
    state.start_time = Some(event_time(event.header.timestamp));
    state
        .attrs
        .option_bits
        .set(OptionBits::SKIP_REPLICATION, event.header.skip_replication());
    state.transaction.as_ref().and_then(|t| t.storage_trx())
}

fn event_time(timestamp: u32) -> DateTime<Utc> {
    if timestamp == 0 {
        return Utc::now();
    }
    Utc.timestamp_opt(i64::from(timestamp), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn condition(err: StorageError) -> Condition {
    Condition {
        code: err.code(),
        message: err.to_string(),
    }
}

fn require_trx(trx: Option<StorageTrx>) -> std::result::Result<StorageTrx, Condition> {
    trx.ok_or_else(|| Condition {
        code: ER_UNKNOWN,
        message: "row event outside of a transaction".to_string(),
    })
}

fn lock_table(session: &Session, table: &str) {
    session.lock().mdl.acquire(table, MdlDuration::Transaction);
}

fn count_rows(state: &mut SessionState, rows: usize) {
    state.attrs.row_count += rows as u64;
}

/// Run one event; `Ok` carries the conditions tolerated on the way
fn execute_event(
    engine: &MemoryEngine,
    session: &Session,
    trx: Option<StorageTrx>,
    event: &Event,
) -> std::result::Result<Vec<Condition>, Condition> {
    let mut ignored = Vec::new();
    let mut note = |outcome: WriteOutcome| {
        if let WriteOutcome::Ignored { code, message } = outcome {
            ignored.push(Condition { code, message });
        }
    };

    match &event.body {
        EventBody::Query(SchemaChange::CreateTable { table, if_not_exists }) => {
            engine.create_table(table, *if_not_exists).map_err(condition)?;
        }
        EventBody::Query(SchemaChange::DropTable { table, if_exists }) => {
            engine.drop_table(table, *if_exists).map_err(condition)?;
        }
        EventBody::WriteRows { table, rows } => {
            let trx = require_trx(trx)?;
            lock_table(session, table);
            for row in rows {
                note(engine.insert(trx, table, row.clone()).map_err(condition)?);
            }
            count_rows(&mut session.lock(), rows.len());
        }
        EventBody::UpdateRows { table, rows } => {
            let trx = require_trx(trx)?;
            lock_table(session, table);
            for (before, after) in rows {
                note(engine.update(trx, table, before, after.clone()).map_err(condition)?);
            }
            count_rows(&mut session.lock(), rows.len());
        }
        EventBody::DeleteRows { table, rows } => {
            let trx = require_trx(trx)?;
            lock_table(session, table);
            for row in rows {
                note(engine.delete(trx, table, row).map_err(condition)?);
            }
            count_rows(&mut session.lock(), rows.len());
        }
        EventBody::Gtid { sid, gno } => {
            session.lock().gtid_next = Some((*sid, *gno));
        }
        EventBody::Xid { xid } => {
            trace!(target: "replicore::applier", xid, "commit marker");
        }
        EventBody::FormatDescription(_) => {}
    }
    Ok(ignored)
}

/// Write the raw buffer of a write-set that failed (or had tolerated
/// errors) to `<dir>/GRA_<session>_<seqno>.log`
///
/// Returns the path written, `None` without a dump directory or on I/O
/// failure.
pub fn dump_write_set(dir: Option<&Path>, session_id: u64, seqno: Seqno, data: &[u8]) -> Option<PathBuf> {
    let Some(dir) = dir else {
        warn!(
            target: "replicore::applier",
            session = session_id,
            seqno = seqno.get(),
            "no dump directory configured, write-set not dumped"
        );
        return None;
    };
    let path = dir.join(format!("GRA_{}_{}.log", session_id, seqno.get()));
    match std::fs::write(&path, data) {
        Ok(()) => {
            info!(target: "replicore::applier", path = %path.display(), len = data.len(), "dumped write-set");
            Some(path)
        }
        Err(e) => {
            warn!(target: "replicore::applier", path = %path.display(), error = %e, "failed to dump write-set");
            None
        }
    }
}
