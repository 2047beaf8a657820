//! Restart recovery over the write-ahead log.
//!
//! [`recover`] runs the phases in order: Analysis rebuilds the
//! transaction table from the last checkpoint, Redo repeats history,
//! postponed actions of committed transactions are finished, Undo rolls
//! back the losers, and a fresh checkpoint closes the run.

mod analysis;
mod context;
mod corruption;
mod postpone;
mod redo;
mod undo;

use crate::log::{LogManager, RecordBody, RecordType};
use crate::meta::Meta;
use crate::page_buffer::PageBuffer;
use crate::rv::RecoveryFunctions;
use crate::tdes::TranTable;
use crate::{Lsa, Result, NULL_LSA, NULL_TRANID};

use self::context::RecoveryContext;
pub use self::context::{RecoveryOptions, ServerRole};

use self::analysis::Analysis;
use self::postpone::Postpone;
use self::redo::Redo;
use self::undo::Undo;

/// Everything recovery works on. The log and the page buffer must not
/// be used by anyone else while recovery runs.
pub struct RecoveryEnv<'a> {
    pub log: &'a LogManager,
    pub meta: &'a mut Meta,
    pub page_buffer: &'a dyn PageBuffer,
    pub functions: &'a RecoveryFunctions,
}

/// What a recovery run found and did.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub start_redo_lsa: Lsa,
    pub end_redo_lsa: Lsa,
    /// Redo-carrying records Analysis saw.
    pub num_redo_records: usize,
    /// Page changes Redo actually replayed.
    pub redone: usize,
    pub postponed: usize,
    pub undone: usize,
    /// 2PC transactions left for their coordinator to resolve.
    pub loose_ends: usize,
    pub restore_incomplete: bool,
    /// Whatever survived recovery, which is only loose ends.
    pub table: TranTable,
}

/// Brings the database back to a consistent state after a crash, or
/// after restoring a backup when `options.restore_from_backup` is set.
pub fn recover(env: RecoveryEnv<'_>, options: RecoveryOptions) -> Result<RecoveryOutcome> {
    let RecoveryEnv { log, meta, page_buffer, functions } = env;

    let header = log.header();
    log::info!(
        "recovery starts: checkpoint {}, append {}, clean shutdown {}",
        header.chkpt_lsa,
        header.append_lsa,
        meta.is_clean_shutdown()
    );

    let mut context = RecoveryContext::new(header.chkpt_lsa, options);
    let mut table = TranTable::new();

    Analysis::new(log, meta, &mut table, &mut context).run()?;

    if context.is_page_server() {
        let stats = Redo::new(log, page_buffer, functions).run(&context)?;
        log.flush()?;
        page_buffer.flush_all()?;
        log.flush_header()?;
        return Ok(RecoveryOutcome {
            start_redo_lsa: context.start_redo_lsa(),
            end_redo_lsa: context.end_redo_lsa(),
            num_redo_records: context.num_redo_records,
            redone: stats.redone,
            postponed: 0,
            undone: 0,
            loose_ends: 0,
            restore_incomplete: false,
            table,
        });
    }

    // marks where this run's own records start
    log.append(NULL_TRANID, NULL_LSA, RecordType::DummyCrashRecovery, &RecordBody::Empty)?;

    let stats = Redo::new(log, page_buffer, functions).run(&context)?;

    let postponed = Postpone::new(log, page_buffer, functions).finish_all_postpone(&mut table)?;
    let undone = Undo::new(log, page_buffer, functions).run(&mut table)?;

    let mut loose_ends = 0;
    for tdes in table.iter_mut() {
        if tdes.state.is_2pc() {
            tdes.isloose_end = true;
            loose_ends += 1;
            log::warn!("trid {} is a 2PC loose end in state {:?}", tdes.trid, tdes.state);
        }
    }

    meta.set_clean_shutdown(false);
    log.checkpoint(&table, meta, page_buffer)?;
    log.flush_header()?;

    let outcome = RecoveryOutcome {
        start_redo_lsa: context.start_redo_lsa(),
        end_redo_lsa: context.end_redo_lsa(),
        num_redo_records: context.num_redo_records,
        redone: stats.redone,
        postponed,
        undone,
        loose_ends,
        restore_incomplete: context.is_restore_incomplete(),
        table,
    };
    log::info!(
        "recovery done: redo {}..{}, {} redone, {} postponed, {} undone, {} loose ends",
        outcome.start_redo_lsa,
        outcome.end_redo_lsa,
        outcome.redone,
        outcome.postponed,
        outcome.undone,
        outcome.loose_ends
    );
    Ok(outcome)
}
