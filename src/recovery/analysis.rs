//! Analysis: one forward pass from the checkpoint to the end of the log
//! that rebuilds the transaction table, finds where Redo starts and
//! ends, and cuts off a torn log tail.

use std::io;

use super::context::RecoveryContext;
use super::corruption::CorruptionChecker;
use crate::checkpoint::CheckpointInfo;
use crate::log::{
    align_up, LogManager, LogPage, LogReader, LogRecord, RecordBody, RecordHeader,
    RecordType, SysopEndKind, RECORD_HEADER_SIZE,
};
use crate::meta::Meta;
use crate::tdes::{TopOp, TranState, TranTable};
use crate::{Error, Lsa, Result, NULL_LSA, NULL_TRANID};

/// What the main loop does after looking at one record.
enum Step {
    Next(Lsa),
    Stop,
}

pub(crate) struct Analysis<'a> {
    log: &'a LogManager,
    table: &'a mut TranTable,
    context: &'a mut RecoveryContext,
    checkpoint: Option<CheckpointInfo>,
    seeded: bool,
}

impl<'a> Analysis<'a> {
    pub(crate) fn new(
        log: &'a LogManager,
        meta: &Meta,
        table: &'a mut TranTable,
        context: &'a mut RecoveryContext,
    ) -> Analysis<'a> {
        let checkpoint = meta.get_checkpoint_info(context.checkpoint_lsa()).cloned();
        if checkpoint.is_none() {
            log::debug!(
                "no checkpoint info for {}, analysis starts from an empty table",
                context.checkpoint_lsa()
            );
        }
        Analysis { log, table, context, checkpoint, seeded: false }
    }

    pub(crate) fn run(mut self) -> Result<()> {
        log::info!("analysis starts at {}", self.context.checkpoint_lsa());

        let mut reader = LogReader::unverified(self.log);
        let mut checker = CorruptionChecker::new();
        let mut page: Option<LogPage> = None;
        let mut record_lsa = self.context.checkpoint_lsa();
        let mut prev_lsa = NULL_LSA;

        while !record_lsa.is_null() {
            if page.as_ref().map(LogPage::logical_pageid) != Some(record_lsa.pageid) {
                match reader.fetch(record_lsa.pageid) {
                    Ok(fetched) => {
                        checker.check_page(fetched);
                        page = Some(fetched.clone());
                    }
                    Err(e) => {
                        self.on_fetch_failure(e, record_lsa, prev_lsa)?;
                        break;
                    }
                }
            }
            let current = match &page {
                Some(current) => current,
                None => {
                    return Err(Error::ReportableBug(
                        "analysis lost its log page".to_string(),
                    ));
                }
            };

            match self.step(&mut reader, &mut checker, current, record_lsa, prev_lsa)? {
                Step::Next(next) => {
                    prev_lsa = self.context.end_redo_lsa();
                    record_lsa = next;
                }
                Step::Stop => break,
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.recovery_2pc_analysis(self.table);
        }

        let header = self.log.header();
        let next_trid = header.next_trid.max(self.context.max_trid_seen.saturating_add(1));
        self.log.set_next_trid(next_trid);
        let mvcc_next_id =
            header.mvcc_next_id.max(self.context.max_mvccid_seen.saturating_add(1));
        self.log.set_mvcc_next_id(mvcc_next_id);

        log::info!(
            "analysis done: redo {}..={}, {} redo records, {} transactions, append at {}",
            self.context.start_redo_lsa(),
            self.context.end_redo_lsa(),
            self.context.num_redo_records,
            self.table.len(),
            self.log.append_lsa()
        );
        Ok(())
    }

    fn step(
        &mut self,
        reader: &mut LogReader<'_>,
        checker: &mut CorruptionChecker,
        page: &LogPage,
        crt: Lsa,
        prev_lsa: Lsa,
    ) -> Result<Step> {
        let area = page.area_size();
        if crt.offset < 0 || crt.offset as usize + RECORD_HEADER_SIZE > area {
            log::warn!("record address {} does not fit its page", crt);
            self.truncate(crt, prev_lsa)?;
            return Ok(Step::Stop);
        }
        let offset = crt.offset as usize;
        let header = RecordHeader::read_from(&page.area()[offset..]);

        checker.check_record(page, crt, &header);
        let first_corrupted = checker.first_corrupted_lsa();
        if checker.is_page_corrupted() && !first_corrupted.is_null() {
            if crt > first_corrupted {
                // the previous record was read in full, keep it
                self.truncate(crt, prev_lsa)?;
                return Ok(Step::Stop);
            }

            let end_of_header =
                Lsa::new(crt.pageid, align_up(offset + RECORD_HEADER_SIZE) as i32);
            if crt == first_corrupted
                || header.forw_lsa > first_corrupted
                || end_of_header.offset as usize > area
                || end_of_header > first_corrupted
            {
                log::warn!("partial log page flush, first corrupted record at {}", crt);
                self.truncate(crt, prev_lsa)?;
                return Ok(Step::Stop);
            }
        }

        let next = header.forw_lsa;
        if checker.is_page_corrupted()
            && header.rtype != RecordType::EndOfLog
            && next.pageid != crt.pageid
        {
            // a record leaving a torn page cannot be trusted to be whole
            log::warn!("record at {} leaves a torn log page", crt);
            self.truncate(crt, prev_lsa)?;
            return Ok(Step::Stop);
        }
        self.context.set_end_redo_lsa(crt);

        if next <= crt && header.rtype != RecordType::EndOfLog {
            log::error!(
                "loop in the log: the record at {} points forward to {}",
                crt,
                next
            );
            return Err(Error::Corruption { at: crt });
        }

        let record = match self.read_record(reader, crt, header)? {
            Some(record) => record,
            None => {
                self.truncate(crt, prev_lsa)?;
                return Ok(Step::Stop);
            }
        };

        if record.header.rtype.is_redo_counted() {
            self.context.num_redo_records += 1;
        }

        if !self.context.is_page_server() {
            self.seed_from_checkpoint(crt);
        }

        self.analyze_record(&record, prev_lsa)?;

        if self.context.is_restore_incomplete() {
            return Ok(Step::Stop);
        }
        if self.context.end_redo_lsa() == next {
            return Err(Error::ReportableBug(format!(
                "analysis did not advance past {}",
                next
            )));
        }
        if checker.is_page_corrupted() && record.header.rtype == RecordType::EndOfLog {
            // the rest of a torn page is garbage
            return Ok(Step::Stop);
        }

        Ok(Step::Next(next))
    }

    /// Reads the body belonging to `header`. `None` means the body is
    /// damaged or runs into a page that never reached the disk.
    fn read_record(
        &self,
        reader: &mut LogReader<'_>,
        lsa: Lsa,
        header: RecordHeader,
    ) -> Result<Option<LogRecord>> {
        if self.context.is_page_server() {
            return Ok(Some(LogRecord { lsa, header, body: RecordBody::Empty }));
        }

        let body = match reader.read_body(lsa, &header) {
            Ok(body) => body,
            Err(Error::Corruption { .. }) => return Ok(None),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !body.fits(header.rtype) {
            log::warn!(
                "the {:?} record at {} carries a {:?} body",
                header.rtype,
                lsa,
                body
            );
            return Ok(None);
        }
        Ok(Some(LogRecord { lsa, header, body }))
    }

    fn seed_from_checkpoint(&mut self, crt: Lsa) {
        if self.seeded {
            return;
        }
        let checkpoint = match &self.checkpoint {
            Some(checkpoint) if checkpoint.snapshot_lsa == crt => checkpoint,
            _ => return,
        };
        let start_redo_lsa = checkpoint.recovery_analysis(self.table, true);
        self.context.set_start_redo_lsa(start_redo_lsa);
        self.seeded = true;
        log::debug!(
            "transaction table seeded from the checkpoint snapshot at {}, {} transactions",
            crt,
            self.table.len()
        );
    }

    /// A page the scan needs could not be read.
    fn on_fetch_failure(&mut self, error: Error, at: Lsa, prev_lsa: Lsa) -> Result<()> {
        let beyond_end = matches!(
            &error,
            Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof
        );

        if self.context.is_restore_from_backup() {
            log::warn!(
                "restore stops early at {}, log page {} is unreadable: {:?}",
                at,
                at.pageid,
                error
            );
            self.context.set_forced_restore_stop();
            return self.truncate(at, prev_lsa);
        }

        if beyond_end {
            // the tail was never flushed
            return self.truncate(at, prev_lsa);
        }

        log::error!("log page {} cannot be fetched during analysis: {:?}", at.pageid, error);
        Err(error)
    }

    /// Drops the log from `at` on and keeps Redo from reaching past it.
    fn truncate(&mut self, at: Lsa, prev_lsa: Lsa) -> Result<()> {
        self.log.reset_append_lsa(at, prev_lsa)?;
        if self.context.end_redo_lsa() >= at {
            self.context.set_end_redo_lsa(prev_lsa);
        }
        Ok(())
    }

    fn analyze_record(&mut self, record: &LogRecord, prev_lsa: Lsa) -> Result<()> {
        use RecordType::*;

        let lsa = record.lsa;
        let trid = record.header.trid;
        if trid != NULL_TRANID {
            self.context.max_trid_seen = self.context.max_trid_seen.max(trid);
        }
        if let Some(mvccid) = record.body.mvccid() {
            self.context.max_mvccid_seen = self.context.max_mvccid_seen.max(mvccid);
        }

        if self.context.is_page_server() {
            if record.header.rtype == EndOfLog {
                self.log.resume_at(lsa, record.header.back_lsa)?;
            }
            return Ok(());
        }

        match record.header.rtype {
            UndoRedoData | DiffUndoRedoData | UndoData | RedoData => {
                self.table.rv_find_or_allocate(trid, lsa).set_tail_and_undo(lsa);
            }
            MvccUndoRedoData | MvccDiffUndoRedoData | MvccUndoData | MvccRedoData => {
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                tdes.set_tail_and_undo(lsa);
                tdes.last_mvcc_lsa = lsa;
                if let Some(mvccid) = record.body.mvccid() {
                    tdes.mvccid = mvccid;
                }
            }
            DummyHeadPostpone => {
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                tdes.set_tail_and_undo(lsa);
                if tdes.posp_nxlsa.is_null() {
                    tdes.posp_nxlsa = lsa;
                }
            }
            Postpone => {
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                if tdes.posp_nxlsa.is_null() {
                    tdes.posp_nxlsa = if tdes.tail_lsa.is_null() { lsa } else { tdes.tail_lsa };
                }
                tdes.set_tail_and_undo(lsa);
            }
            RunPostpone => {
                let ref_lsa = match &record.body {
                    RecordBody::RunPostpone { ref_lsa, .. } => *ref_lsa,
                    _ => NULL_LSA,
                };
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                if !tdes.state.is_committed_with_postpone() {
                    tdes.state = if tdes.topops.last == -1 {
                        TranState::UnactiveCommittedWithPostpone
                    } else {
                        TranState::UnactiveTopopeCommittedWithPostpone
                    };
                }
                if tdes.state == TranState::UnactiveCommittedWithPostpone {
                    tdes.undo_nxlsa = NULL_LSA;
                }
                tdes.tail_lsa = lsa;
                if tdes.state == TranState::UnactiveTopopeCommittedWithPostpone {
                    if let Some(top) = tdes.topops.top_mut() {
                        top.posp_lsa = ref_lsa;
                    }
                } else {
                    tdes.posp_nxlsa = ref_lsa;
                }
            }
            Compensate => {
                let undo_nxlsa = match &record.body {
                    RecordBody::Compensate { undo_nxlsa, .. } => *undo_nxlsa,
                    _ => NULL_LSA,
                };
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                tdes.tail_lsa = lsa;
                tdes.undo_nxlsa = undo_nxlsa;
            }
            CommitWithPostpone | CommitWithPostponeObsolete => {
                let posp_lsa = match &record.body {
                    RecordBody::StartPostpone { posp_lsa } => *posp_lsa,
                    _ => NULL_LSA,
                };
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                tdes.state = TranState::UnactiveCommittedWithPostpone;
                tdes.undo_nxlsa = NULL_LSA;
                tdes.tail_lsa = lsa;
                tdes.rcv.tran_start_postpone_lsa = lsa;
                tdes.posp_nxlsa = posp_lsa;
            }
            SysopStartPostpone => self.analyze_sysop_start_postpone(record),
            AtomicSysopStart => {
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                tdes.set_tail_and_undo(lsa);
                tdes.rcv.atomic_sysop_start_lsa = lsa;
            }
            AssignedMvccid => {
                if let RecordBody::AssignedMvccid { mvccid } = &record.body {
                    let tdes = self.table.rv_find_or_allocate(trid, lsa);
                    tdes.mvccid = *mvccid;
                    tdes.last_mvcc_lsa = lsa;
                }
            }
            Commit | Abort => self.analyze_complete(record, prev_lsa)?,
            SysopEnd => self.analyze_sysop_end(record),
            Savepoint => {
                let tdes = self.table.rv_find_or_allocate(trid, lsa);
                tdes.set_tail_and_undo(lsa);
                tdes.savept_lsa = lsa;
            }
            TwoPcPrepare => self.set_2pc_state(record, TranState::Unactive2pcPrepare),
            TwoPcStart => {
                self.set_2pc_state(record, TranState::Unactive2pcCollectingParticipantVotes)
            }
            TwoPcCommitDecision => {
                self.set_2pc_state(record, TranState::Unactive2pcCommitDecision)
            }
            TwoPcAbortDecision => {
                self.set_2pc_state(record, TranState::Unactive2pcAbortDecision)
            }
            TwoPcCommitInformParticipants => self.set_2pc_state(
                record,
                TranState::UnactiveCommittedInformingParticipants,
            ),
            TwoPcAbortInformParticipants => self.set_2pc_state(
                record,
                TranState::UnactiveAbortedInformingParticipants,
            ),
            TwoPcRecvAck => {
                self.table.rv_find_or_allocate(trid, lsa).tail_lsa = lsa;
            }
            TrantableSnapshot => self.analyze_trantable_snapshot(record)?,
            EndOfLog => {
                self.log.resume_at(lsa, record.header.back_lsa)?;
            }
            DummyCrashRecovery | DummyHead | EndCheckpoint => {}
            Corrupted => {
                return Err(Error::ReportableBug(format!(
                    "corrupted record at {} reached the analysis dispatch",
                    lsa
                )));
            }
        }
        Ok(())
    }

    fn set_2pc_state(&mut self, record: &LogRecord, state: TranState) {
        let tdes = self.table.rv_find_or_allocate(record.header.trid, record.lsa);
        tdes.state = state;
        tdes.tail_lsa = record.lsa;
    }

    /// Commit and abort records end a transaction. When restoring up
    /// to a point in time, the first one past that point ends the log.
    fn analyze_complete(&mut self, record: &LogRecord, prev_lsa: Lsa) -> Result<()> {
        if self.context.is_restore_from_backup() {
            let at_time = match &record.body {
                RecordBody::Donetime { at_time } => *at_time,
                _ => 0,
            };
            if self.context.does_restore_stop_before(at_time) {
                log::warn!(
                    "restore stops before the transaction finished at {} ({} ms)",
                    record.lsa,
                    at_time
                );
                self.truncate(record.lsa, prev_lsa)?;
                self.context.set_incomplete_restore();
                return Ok(());
            }
        }

        if let Some(mut tdes) = self.table.free(record.header.trid) {
            tdes.commit_abort_lsa = record.lsa;
            log::trace!(
                "trid {} finished with {:?} at {}",
                tdes.trid,
                record.header.rtype,
                record.lsa
            );
        }
        Ok(())
    }

    fn analyze_sysop_start_postpone(&mut self, record: &LogRecord) {
        let lsa = record.lsa;
        let tdes = self.table.rv_find_or_allocate(record.header.trid, lsa);
        tdes.set_tail_and_undo(lsa);
        tdes.rcv.sysop_start_postpone_lsa = lsa;

        let (sysop_end, posp_lsa) = match &record.body {
            RecordBody::SysopStartPostpone { sysop_end, posp_lsa } => (sysop_end, *posp_lsa),
            _ => return,
        };

        let runs_tran_postpone = matches!(
            sysop_end.kind,
            SysopEndKind::LogicalRunPostpone { is_sysop_postpone: false, .. }
        );
        if tdes.state != TranState::UnactiveTopopeCommittedWithPostpone && runs_tran_postpone {
            tdes.undo_nxlsa = NULL_LSA;
        }

        tdes.state = TranState::UnactiveTopopeCommittedWithPostpone;
        if tdes.topops.last == -1 {
            tdes.topops.last = 0;
        } else {
            log::debug!(
                "trid {} starts a sysop postpone with {} open top operations",
                tdes.trid,
                tdes.topops.last + 1
            );
        }
        if let Some(top) = tdes.topops.top_mut() {
            *top = TopOp { lastparent_lsa: sysop_end.lastparent_lsa, posp_lsa };
        }

        if sysop_end.lastparent_lsa < tdes.rcv.atomic_sysop_start_lsa {
            tdes.rcv.atomic_sysop_start_lsa = NULL_LSA;
        }
    }

    fn analyze_sysop_end(&mut self, record: &LogRecord) {
        let lsa = record.lsa;
        let tdes = self.table.rv_find_or_allocate(record.header.trid, lsa);
        tdes.set_tail_and_undo(lsa);
        tdes.tail_topresult_lsa = lsa;

        let end = match &record.body {
            RecordBody::SysopEnd(end) => end,
            _ => return,
        };

        let mut commit_start_postpone = false;
        match &end.kind {
            SysopEndKind::Abort => {
                if tdes.state == TranState::UnactiveCommittedWithPostpone {
                    tdes.undo_nxlsa = NULL_LSA;
                }
                tdes.rcv.analysis_last_aborted_sysop_lsa = lsa;
                tdes.rcv.analysis_last_aborted_sysop_start_lsa = end.lastparent_lsa;
            }
            SysopEndKind::Commit | SysopEndKind::LogicalUndo { .. } => {
                commit_start_postpone = true;
            }
            SysopEndKind::LogicalMvccUndo { mvccid, .. } => {
                tdes.last_mvcc_lsa = lsa;
                tdes.mvccid = *mvccid;
                commit_start_postpone = true;
            }
            SysopEndKind::LogicalCompensate { compensate_lsa } => {
                tdes.undo_nxlsa = *compensate_lsa;
                commit_start_postpone = true;
            }
            SysopEndKind::LogicalRunPostpone { postpone_lsa, is_sysop_postpone: true } => {
                if tdes.topops.last < 0
                    || tdes.state != TranState::UnactiveTopopeCommittedWithPostpone
                {
                    tdes.topops.last = 0;
                    tdes.state = TranState::UnactiveTopopeCommittedWithPostpone;
                }
                if let Some(top) = tdes.topops.top_mut() {
                    top.posp_lsa = *postpone_lsa;
                }
            }
            SysopEndKind::LogicalRunPostpone { postpone_lsa, is_sysop_postpone: false } => {
                tdes.posp_nxlsa = *postpone_lsa;
                if tdes.topops.last == -1 {
                    tdes.state = TranState::UnactiveCommittedWithPostpone;
                }
                tdes.undo_nxlsa = NULL_LSA;
                commit_start_postpone = true;
            }
        }

        if tdes.state == TranState::UnactiveTopopeCommittedWithPostpone {
            if commit_start_postpone {
                tdes.state = if tdes.rcv.tran_start_postpone_lsa.is_null() {
                    TranState::UnactiveUnilaterallyAborted
                } else {
                    TranState::UnactiveCommittedWithPostpone
                };
                tdes.topops.last = -1;
            } else {
                tdes.topops.last = 0;
            }
        } else {
            tdes.topops.last = -1;
        }

        // an end closes whichever of the atomic sysop and the sysop
        // postpone was opened last, if it was opened after the parent
        let rcv = &mut tdes.rcv;
        if !rcv.atomic_sysop_start_lsa.is_null()
            && rcv.atomic_sysop_start_lsa > rcv.sysop_start_postpone_lsa
            && rcv.atomic_sysop_start_lsa > end.lastparent_lsa
        {
            rcv.atomic_sysop_start_lsa = NULL_LSA;
        }
        if !rcv.sysop_start_postpone_lsa.is_null()
            && rcv.sysop_start_postpone_lsa > rcv.atomic_sysop_start_lsa
            && rcv.sysop_start_postpone_lsa > end.lastparent_lsa
        {
            rcv.sysop_start_postpone_lsa = NULL_LSA;
        }
    }

    /// A snapshot logged in place of a meta checkpoint entry seeds the
    /// table the same way, when it is where Analysis started.
    fn analyze_trantable_snapshot(&mut self, record: &LogRecord) -> Result<()> {
        if self.seeded || record.lsa != self.context.checkpoint_lsa() {
            return Ok(());
        }
        let snapshot = match &record.body {
            RecordBody::TrantableSnapshot { snapshot } => snapshot,
            _ => return Ok(()),
        };
        let info = CheckpointInfo::unpack(&mut &snapshot[..])?;
        let start_redo_lsa = info.recovery_analysis(self.table, true);
        self.context.set_start_redo_lsa(start_redo_lsa);
        self.checkpoint = Some(info);
        self.seeded = true;
        log::debug!("transaction table seeded from the snapshot record at {}", record.lsa);
        Ok(())
    }
}
