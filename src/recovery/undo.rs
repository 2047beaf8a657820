//! Undo: rolls back every transaction Analysis left unilaterally
//! aborted, always undoing the highest undo address across all of them
//! next. Each undone change is logged with a compensation record, so a
//! crash during Undo never undoes a change twice.

use crate::log::{
    now_millis, LogManager, LogReader, LogRecord, PageOp, RecordBody, RecordType,
    SysopEnd, SysopEndKind,
};
use crate::page_buffer::PageBuffer;
use crate::rv::{Rcv, RecoveryFunctions};
use crate::tdes::{Tdes, TopOp, TranTable};
use crate::{Error, Lsa, MvccId, Result, TranId, NULL_LSA};

pub(crate) struct Undo<'a> {
    log: &'a LogManager,
    page_buffer: &'a dyn PageBuffer,
    functions: &'a RecoveryFunctions,
}

impl<'a> Undo<'a> {
    pub(crate) fn new(
        log: &'a LogManager,
        page_buffer: &'a dyn PageBuffer,
        functions: &'a RecoveryFunctions,
    ) -> Undo<'a> {
        Undo { log, page_buffer, functions }
    }

    /// Returns how many changes were undone.
    pub(crate) fn run(&self, table: &mut TranTable) -> Result<usize> {
        // aborted transactions with nothing left to undo just finish
        for trid in table.trids() {
            let done = match table.get(trid) {
                Some(tdes) => tdes.state.is_aborted() && tdes.undo_nxlsa.is_null(),
                None => false,
            };
            if done {
                self.complete(table, trid)?;
            }
        }

        let mut reader = LogReader::new(self.log);
        let mut undone = 0;
        while let Some((trid, lsa)) = table.max_undo_nxlsa() {
            let record = reader.read_record(lsa)?;
            if record.header.trid != trid {
                log::error!(
                    "record at {} belongs to trid {}, expected {}",
                    lsa,
                    record.header.trid,
                    trid
                );
                return Err(Error::Corruption { at: lsa });
            }

            let tdes = match table.get_mut(trid) {
                Some(tdes) => tdes,
                None => {
                    return Err(Error::ReportableBug(format!(
                        "trid {} vanished during undo",
                        trid
                    )));
                }
            };
            let next = self.undo_record(tdes, &record, &mut undone)?;
            tdes.undo_nxlsa = next;
            if next.is_null() {
                self.complete(table, trid)?;
            }
        }

        log::info!("undo done: {} changes rolled back", undone);
        Ok(undone)
    }

    /// Undoes `record` for `tdes` and returns the next address to undo.
    fn undo_record(
        &self,
        tdes: &mut Tdes,
        record: &LogRecord,
        undone: &mut usize,
    ) -> Result<Lsa> {
        use RecordType::*;

        let prev_tranlsa = record.header.prev_tranlsa;
        match record.header.rtype {
            UndoRedoData | DiffUndoRedoData | UndoData | MvccUndoRedoData
            | MvccDiffUndoRedoData | MvccUndoData => {
                let (op, undo) = match (record.body.page_op(), record.body.undo_data()) {
                    (Some(op), Some(undo)) => (*op, undo),
                    _ => return Err(Error::Corruption { at: record.lsa }),
                };
                let mvccid = record.body.mvccid();
                tdes.undo_nxlsa = prev_tranlsa;
                if op.is_logical() {
                    self.undo_logical(tdes, &op, undo, mvccid, record.lsa)?;
                } else {
                    self.undo_physical(tdes, &op, undo, mvccid, record.lsa)?;
                }
                *undone += 1;
                Ok(prev_tranlsa)
            }
            Compensate => match &record.body {
                RecordBody::Compensate { undo_nxlsa, .. } => Ok(*undo_nxlsa),
                _ => Err(Error::Corruption { at: record.lsa }),
            },
            SysopEnd => {
                let end = match &record.body {
                    RecordBody::SysopEnd(end) => end,
                    _ => return Err(Error::Corruption { at: record.lsa }),
                };
                match &end.kind {
                    SysopEndKind::LogicalCompensate { compensate_lsa } => Ok(*compensate_lsa),
                    SysopEndKind::LogicalUndo { op, undo } => {
                        tdes.undo_nxlsa = end.lastparent_lsa;
                        self.undo_logical(tdes, op, undo, None, record.lsa)?;
                        *undone += 1;
                        Ok(end.lastparent_lsa)
                    }
                    SysopEndKind::LogicalMvccUndo { op, mvccid, undo } => {
                        tdes.undo_nxlsa = end.lastparent_lsa;
                        self.undo_logical(tdes, op, undo, Some(*mvccid), record.lsa)?;
                        *undone += 1;
                        Ok(end.lastparent_lsa)
                    }
                    // a committed or aborted sysop is skipped as a whole
                    _ => Ok(end.lastparent_lsa),
                }
            }
            RedoData | MvccRedoData | DummyHeadPostpone | Postpone | RunPostpone
            | Savepoint | AtomicSysopStart | SysopStartPostpone | AssignedMvccid => {
                Ok(prev_tranlsa)
            }
            other => {
                log::warn!(
                    "trid {}: nothing to undo for the {:?} record at {}, rollback ends there",
                    tdes.trid,
                    other,
                    record.lsa
                );
                Ok(NULL_LSA)
            }
        }
    }

    fn undo_physical(
        &self,
        tdes: &mut Tdes,
        op: &PageOp,
        undo: &[u8],
        mvccid: Option<MvccId>,
        undone_lsa: Lsa,
    ) -> Result<()> {
        let compensate = RecordBody::Compensate {
            op: *op,
            undo_nxlsa: tdes.undo_nxlsa,
            data: undo.to_vec(),
        };

        let mut page = match self.page_buffer.fix(op.vpid)? {
            Some(page) => page,
            None => {
                log::warn!(
                    "page {} is gone, the undo of {} is only logged",
                    op.vpid,
                    undone_lsa
                );
                self.log.append_for(tdes, RecordType::Compensate, &compensate)?;
                return Ok(());
            }
        };

        let lsa = self.log.append_for(tdes, RecordType::Compensate, &compensate)?;
        {
            let mut rcv = Rcv {
                page: Some(page.data_mut()),
                vpid: op.vpid,
                offset: op.offset,
                data: undo,
                mvccid,
                lsa,
            };
            self.functions.apply_undo(op.rcvindex, &mut rcv)?;
        }
        page.set_lsa(lsa);
        page.set_dirty();
        log::trace!("undid {} on page {} with compensation {}", undone_lsa, op.vpid, lsa);
        Ok(())
    }

    /// Runs a logical undo inside a system operation that ends with a
    /// logical compensation pointing at what is left to undo.
    fn undo_logical(
        &self,
        tdes: &mut Tdes,
        op: &PageOp,
        undo: &[u8],
        mvccid: Option<MvccId>,
        undone_lsa: Lsa,
    ) -> Result<()> {
        let compensate_lsa = tdes.undo_nxlsa;
        let lastparent_lsa = tdes.tail_lsa;
        tdes.topops.push(TopOp { lastparent_lsa, posp_lsa: NULL_LSA });

        let mut rcv = Rcv {
            page: None,
            vpid: op.vpid,
            offset: op.offset,
            data: undo,
            mvccid,
            lsa: undone_lsa,
        };
        let applied = self.functions.apply_undo(op.rcvindex, &mut rcv);
        tdes.topops.pop();
        applied?;

        let end = SysopEnd::new(SysopEndKind::LogicalCompensate { compensate_lsa }, lastparent_lsa);
        self.log.append_for(tdes, RecordType::SysopEnd, &RecordBody::SysopEnd(end))?;
        tdes.undo_nxlsa = compensate_lsa;
        Ok(())
    }

    /// Logs the abort of `trid` and drops it from the table.
    fn complete(&self, table: &mut TranTable, trid: TranId) -> Result<()> {
        if let Some(mut tdes) = table.free(trid) {
            let lsa = self.log.append_for(
                &mut tdes,
                RecordType::Abort,
                &RecordBody::Donetime { at_time: now_millis() },
            )?;
            log::debug!("trid {} rolled back, abort logged at {}", trid, lsa);
        }
        Ok(())
    }
}
