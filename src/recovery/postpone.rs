//! Postpone completion: transactions that committed with postponed
//! actions, and system operations that did, get those actions run
//! before Undo. Actions already run before the crash are recognized by
//! the run-postpone records that point back at them.

use fnv::FnvHashSet;

use crate::log::{
    now_millis, LogManager, LogReader, LogRecord, RecordBody, RecordType, SysopEnd,
    SysopEndKind,
};
use crate::page_buffer::PageBuffer;
use crate::rv::{Rcv, RecoveryFunctions};
use crate::tdes::{Tdes, TranState, TranTable};
use crate::{Error, Lsa, Result, TranId};

pub(crate) struct Postpone<'a> {
    log: &'a LogManager,
    page_buffer: &'a dyn PageBuffer,
    functions: &'a RecoveryFunctions,
}

impl<'a> Postpone<'a> {
    pub(crate) fn new(
        log: &'a LogManager,
        page_buffer: &'a dyn PageBuffer,
        functions: &'a RecoveryFunctions,
    ) -> Postpone<'a> {
        Postpone { log, page_buffer, functions }
    }

    /// Runs every pending postponed action. Returns how many actions ran.
    pub(crate) fn finish_all_postpone(&self, table: &mut TranTable) -> Result<usize> {
        let mut ran = 0;
        for trid in table.trids() {
            loop {
                let tdes = match table.get_mut(trid) {
                    Some(tdes) => tdes,
                    None => break,
                };
                match tdes.state {
                    TranState::UnactiveTopopeCommittedWithPostpone => {
                        ran += self.finish_sysop_postpone(tdes)?;
                    }
                    TranState::UnactiveWillCommit
                    | TranState::UnactiveCommittedWithPostpone => {
                        ran += self.finish_tran_postpone(tdes)?;
                        self.commit(table, trid)?;
                        break;
                    }
                    _ => break,
                }
            }
        }
        if ran > 0 {
            log::info!("{} postponed actions completed", ran);
        }
        Ok(ran)
    }

    fn finish_tran_postpone(&self, tdes: &mut Tdes) -> Result<usize> {
        if tdes.posp_nxlsa.is_null() {
            return Ok(0);
        }
        let until = if tdes.rcv.tran_start_postpone_lsa.is_null() {
            tdes.tail_lsa
        } else {
            tdes.rcv.tran_start_postpone_lsa
        };
        let ran = self.run_postpones(tdes, tdes.posp_nxlsa, until, false)?;
        tdes.posp_nxlsa = Lsa::default();
        Ok(ran)
    }

    /// Finishes the innermost system operation in postpone and ends it.
    fn finish_sysop_postpone(&self, tdes: &mut Tdes) -> Result<usize> {
        let top = match tdes.topops.top() {
            Some(top) => *top,
            None => {
                return Err(Error::ReportableBug(format!(
                    "trid {} is in sysop postpone without an open sysop",
                    tdes.trid
                )));
            }
        };
        let until = if tdes.rcv.sysop_start_postpone_lsa.is_null() {
            tdes.tail_lsa
        } else {
            tdes.rcv.sysop_start_postpone_lsa
        };

        let ran = if top.posp_lsa.is_null() {
            0
        } else {
            self.run_postpones(tdes, top.posp_lsa, until, true)?
        };

        let end = SysopEnd::new(SysopEndKind::Commit, top.lastparent_lsa);
        self.log.append_for(tdes, RecordType::SysopEnd, &RecordBody::SysopEnd(end))?;
        tdes.topops.pop();
        tdes.undo_nxlsa = tdes.tail_lsa;
        tdes.rcv.sysop_start_postpone_lsa = Lsa::default();

        if tdes.topops.is_empty() {
            tdes.state = if tdes.rcv.tran_start_postpone_lsa.is_null() {
                TranState::UnactiveUnilaterallyAborted
            } else {
                TranState::UnactiveCommittedWithPostpone
            };
        }
        log::debug!("trid {} finished a sysop postpone, now {:?}", tdes.trid, tdes.state);
        Ok(ran)
    }

    /// Runs the postpone records of `tdes` found in `from..until` that
    /// have not run yet.
    fn run_postpones(
        &self,
        tdes: &mut Tdes,
        from: Lsa,
        until: Lsa,
        is_sysop_postpone: bool,
    ) -> Result<usize> {
        let mut reader = LogReader::new(self.log);
        let pending = self.collect_postpones(&mut reader, tdes.trid, from, until)?;
        let done = self.already_run(&mut reader, tdes.trid, until)?;

        let mut ran = 0;
        for record in pending {
            if done.contains(&record.lsa) {
                continue;
            }
            self.run_postpone(tdes, &record, is_sysop_postpone)?;
            ran += 1;
        }
        Ok(ran)
    }

    fn collect_postpones(
        &self,
        reader: &mut LogReader<'_>,
        trid: TranId,
        from: Lsa,
        until: Lsa,
    ) -> Result<Vec<LogRecord>> {
        let mut pending = vec![];
        let mut lsa = from;
        while !lsa.is_null() && lsa < until {
            let record = reader.read_record(lsa)?;
            if record.header.rtype == RecordType::EndOfLog {
                break;
            }
            lsa = record.header.forw_lsa;
            if record.header.trid == trid && record.header.rtype == RecordType::Postpone {
                pending.push(record);
            }
        }
        Ok(pending)
    }

    /// Addresses of postpone records that already have a run-postpone
    /// record after `from`.
    fn already_run(
        &self,
        reader: &mut LogReader<'_>,
        trid: TranId,
        from: Lsa,
    ) -> Result<FnvHashSet<Lsa>> {
        let mut done = FnvHashSet::default();
        let mut lsa = from;
        while !lsa.is_null() {
            let record = reader.read_record(lsa)?;
            if record.header.rtype == RecordType::EndOfLog {
                break;
            }
            lsa = record.header.forw_lsa;
            if record.header.trid != trid {
                continue;
            }
            match &record.body {
                RecordBody::RunPostpone { ref_lsa, .. } => {
                    done.insert(*ref_lsa);
                }
                RecordBody::SysopEnd(SysopEnd {
                    kind: SysopEndKind::LogicalRunPostpone { postpone_lsa, .. },
                    ..
                }) => {
                    done.insert(*postpone_lsa);
                }
                _ => {}
            }
        }
        Ok(done)
    }

    fn run_postpone(
        &self,
        tdes: &mut Tdes,
        record: &LogRecord,
        is_sysop_postpone: bool,
    ) -> Result<()> {
        let (op, redo) = match &record.body {
            RecordBody::Postpone { op, redo } => (*op, redo),
            _ => return Err(Error::Corruption { at: record.lsa }),
        };

        if op.is_logical() {
            let lastparent_lsa = tdes.tail_lsa;
            let mut rcv = Rcv {
                page: None,
                vpid: op.vpid,
                offset: op.offset,
                data: redo,
                mvccid: None,
                lsa: record.lsa,
            };
            self.functions.apply_redo(op.rcvindex, &mut rcv)?;
            let end = SysopEnd::new(
                SysopEndKind::LogicalRunPostpone { postpone_lsa: record.lsa, is_sysop_postpone },
                lastparent_lsa,
            );
            self.log.append_for(tdes, RecordType::SysopEnd, &RecordBody::SysopEnd(end))?;
            return Ok(());
        }

        let body = RecordBody::RunPostpone { op, ref_lsa: record.lsa, redo: redo.clone() };
        let mut page = match self.page_buffer.fix(op.vpid)? {
            Some(page) => page,
            None => {
                log::warn!(
                    "page {} is gone, the postponed action at {} is only logged",
                    op.vpid,
                    record.lsa
                );
                self.log.append_for(tdes, RecordType::RunPostpone, &body)?;
                return Ok(());
            }
        };

        let lsa = self.log.append_for(tdes, RecordType::RunPostpone, &body)?;
        {
            let mut rcv = Rcv {
                page: Some(page.data_mut()),
                vpid: op.vpid,
                offset: op.offset,
                data: redo,
                mvccid: None,
                lsa,
            };
            self.functions.apply_redo(op.rcvindex, &mut rcv)?;
        }
        page.set_lsa(lsa);
        page.set_dirty();
        Ok(())
    }

    fn commit(&self, table: &mut TranTable, trid: TranId) -> Result<()> {
        if let Some(mut tdes) = table.free(trid) {
            let lsa = self.log.append_for(
                &mut tdes,
                RecordType::Commit,
                &RecordBody::Donetime { at_time: now_millis() },
            )?;
            log::debug!("trid {} committed after its postponed actions at {}", trid, lsa);
        }
        Ok(())
    }
}
