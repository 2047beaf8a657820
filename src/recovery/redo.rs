//! Redo: replays every logged page change from the redo start address
//! up to the last record Analysis trusted.
//!
//! With `recovery_parallel_count > 0` page changes are handed to worker
//! threads. All changes to one page go to the same worker, so each page
//! still sees its changes in log order. Changes whose recovery index is
//! flagged synchronous, and logical changes, run on the scanning thread
//! once every job handed out so far has completed.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use crossbeam_queue::ArrayQueue;
use fnv::FnvHasher;
use parking_lot::{Condvar, Mutex};

use super::context::RecoveryContext;
use crate::log::{LogManager, LogReader, LogRecord, PageOp, RecordType};
use crate::page_buffer::PageBuffer;
use crate::rv::{Rcv, RecoveryFunctions};
use crate::{Error, Lsa, MvccId, Result, MVCCID_NULL};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RedoStats {
    pub(crate) scanned: usize,
    pub(crate) redone: usize,
    pub(crate) max_mvccid: MvccId,
}

/// Which recovery function replays a record. Compensation records
/// carry an undo image, so they replay through the undo function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Redo,
    Undo,
}

fn call(
    functions: &RecoveryFunctions,
    replay: Replay,
    rcvindex: u16,
    rcv: &mut Rcv<'_>,
) -> Result<()> {
    match replay {
        Replay::Redo => functions.apply_redo(rcvindex, rcv),
        Replay::Undo => functions.apply_undo(rcvindex, rcv),
    }
}

/// Applies one redo to its page unless the page already has it.
/// Returns whether the page changed.
fn apply_page_redo(
    page_buffer: &dyn PageBuffer,
    functions: &RecoveryFunctions,
    lsa: Lsa,
    target: &Target<'_>,
    mvccid: Option<MvccId>,
) -> Result<bool> {
    let Target { op, data, replay } = *target;
    if op.is_logical() {
        let mut rcv = Rcv { page: None, vpid: op.vpid, offset: op.offset, data, mvccid, lsa };
        call(functions, replay, op.rcvindex, &mut rcv)?;
        return Ok(true);
    }

    let mut page = match page_buffer.fix(op.vpid)? {
        Some(page) => page,
        None => {
            log::debug!("redo at {} skipped, page {} does not exist", lsa, op.vpid);
            return Ok(false);
        }
    };
    if page.lsa() >= lsa {
        return Ok(false);
    }

    {
        let mut rcv = Rcv {
            page: Some(page.data_mut()),
            vpid: op.vpid,
            offset: op.offset,
            data,
            mvccid,
            lsa,
        };
        call(functions, replay, op.rcvindex, &mut rcv)?;
    }
    page.set_lsa(lsa);
    page.set_dirty();
    Ok(true)
}

/// A page change Redo has to consider.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    op: &'a PageOp,
    data: &'a [u8],
    replay: Replay,
}

fn redo_target(record: &LogRecord) -> Option<Target<'_>> {
    if !record.header.rtype.is_redo_counted() {
        return None;
    }
    let op = record.body.page_op()?;
    let data = record.body.redo_data()?;
    let replay = if record.header.rtype == RecordType::Compensate {
        Replay::Undo
    } else {
        Replay::Redo
    };
    Some(Target { op, data, replay })
}

struct RedoJob {
    lsa: Lsa,
    op: PageOp,
    data: Vec<u8>,
    replay: Replay,
    mvccid: Option<MvccId>,
}

/// Count of jobs handed to workers and not yet finished.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    cv: Condvar,
}

impl InFlight {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        self.cv.notify_all();
    }

    fn wait_until_below(&self, limit: usize, timeout: Duration) {
        let mut count = self.count.lock();
        while *count >= limit {
            let _ = self.cv.wait_for(&mut count, timeout);
        }
    }
}

struct Shared<'a> {
    page_buffer: &'a dyn PageBuffer,
    functions: &'a RecoveryFunctions,
    pool: ArrayQueue<RedoJob>,
    in_flight: InFlight,
    redone: AtomicUsize,
    error: Mutex<Option<Error>>,
}

impl Shared<'_> {
    fn set_error(&self, error: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            log::error!("redo worker failed: {:?}", error);
            *slot = Some(error);
        }
    }

    fn take_error(&self) -> Option<Error> {
        self.error.lock().take()
    }

    fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    fn run_worker(&self, jobs: crossbeam_channel::Receiver<RedoJob>) {
        for job in jobs.iter() {
            if !self.has_error() {
                let target = Target { op: &job.op, data: &job.data, replay: job.replay };
                match apply_page_redo(
                    self.page_buffer,
                    self.functions,
                    job.lsa,
                    &target,
                    job.mvccid,
                ) {
                    Ok(true) => {
                        self.redone.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => self.set_error(e),
                }
            }
            if self.pool.push(job).is_err() {
                self.set_error(Error::ReportableBug(
                    "redo job pool overflowed".to_string(),
                ));
            }
            self.in_flight.done();
        }
    }
}

fn worker_for(vpid: &crate::Vpid, workers: usize) -> usize {
    let mut hasher = FnvHasher::default();
    vpid.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

pub(crate) struct Redo<'a> {
    log: &'a LogManager,
    page_buffer: &'a dyn PageBuffer,
    functions: &'a RecoveryFunctions,
}

impl<'a> Redo<'a> {
    pub(crate) fn new(
        log: &'a LogManager,
        page_buffer: &'a dyn PageBuffer,
        functions: &'a RecoveryFunctions,
    ) -> Redo<'a> {
        Redo { log, page_buffer, functions }
    }

    pub(crate) fn run(&self, context: &RecoveryContext) -> Result<RedoStats> {
        let start = context.start_redo_lsa();
        let end = context.end_redo_lsa();
        if start.is_null() || end.is_null() || start > end {
            log::info!("redo has nothing to replay");
            return Ok(RedoStats::default());
        }

        let workers = self.log.config().recovery_parallel_count;
        log::info!("redo starts at {}, ends at {}, {} workers", start, end, workers);

        let stats = if workers == 0 {
            self.run_serial(start, end)?
        } else {
            self.run_parallel(start, end, workers)?
        };

        if stats.max_mvccid != MVCCID_NULL {
            let next = self.log.header().mvcc_next_id.max(stats.max_mvccid + 1);
            self.log.set_mvcc_next_id(next);
        }

        log::info!(
            "redo done: {} records scanned, {} page changes replayed",
            stats.scanned,
            stats.redone
        );
        Ok(stats)
    }

    /// Walks the records in `start..=end`, calling `f` on each.
    fn scan<F>(&self, start: Lsa, end: Lsa, mut f: F) -> Result<usize>
    where
        F: FnMut(&LogRecord) -> Result<()>,
    {
        let mut reader = LogReader::new(self.log);
        let mut lsa = start;
        let mut scanned = 0;
        while !lsa.is_null() && lsa <= end {
            let record = reader.read_record(lsa)?;
            if record.header.rtype == RecordType::EndOfLog {
                break;
            }
            scanned += 1;
            f(&record)?;
            lsa = record.header.forw_lsa;
        }
        Ok(scanned)
    }

    fn run_serial(&self, start: Lsa, end: Lsa) -> Result<RedoStats> {
        let mut stats = RedoStats::default();
        let scanned = self.scan(start, end, |record| {
            if let Some(mvccid) = mvccid_of(record) {
                stats.max_mvccid = stats.max_mvccid.max(mvccid);
            }
            if let Some(target) = redo_target(record) {
                let mvccid = record.body.mvccid();
                if apply_page_redo(
                    self.page_buffer,
                    self.functions,
                    record.lsa,
                    &target,
                    mvccid,
                )? {
                    stats.redone += 1;
                }
            }
            Ok(())
        })?;
        stats.scanned = scanned;
        Ok(stats)
    }

    fn run_parallel(&self, start: Lsa, end: Lsa, workers: usize) -> Result<RedoStats> {
        let pool_size = self.log.config().recovery_job_pool_size.max(1);
        let timeout = self.log.config().wait_timeout();

        let shared = Shared {
            page_buffer: self.page_buffer,
            functions: self.functions,
            pool: ArrayQueue::new(pool_size),
            in_flight: InFlight::default(),
            redone: AtomicUsize::new(0),
            error: Mutex::new(None),
        };
        for _ in 0..pool_size {
            let _ = shared.pool.push(RedoJob {
                lsa: Lsa::default(),
                op: PageOp::logical(0),
                data: vec![],
                replay: Replay::Redo,
                mvccid: None,
            });
        }

        let mut stats = RedoStats::default();
        let mut redone_inline = 0;

        let scanned = thread::scope(|scope| {
            let mut senders: Vec<Sender<RedoJob>> = Vec::with_capacity(workers);
            for id in 0..workers {
                let (tx, rx) = unbounded();
                senders.push(tx);
                let shared = &shared;
                let spawned = thread::Builder::new()
                    .name(format!("redo_worker_{}", id))
                    .spawn_scoped(scope, move || shared.run_worker(rx));
                if let Err(e) = spawned {
                    log::error!("failed to spawn redo worker {}: {:?}", id, e);
                    return Err(Error::Io(e));
                }
            }

            let scanned = self.scan(start, end, |record| {
                if let Some(error) = shared.take_error() {
                    return Err(error);
                }
                if let Some(mvccid) = mvccid_of(record) {
                    stats.max_mvccid = stats.max_mvccid.max(mvccid);
                }
                let target = match redo_target(record) {
                    Some(target) => target,
                    None => return Ok(()),
                };
                let op = target.op;
                let mvccid = record.body.mvccid();

                if op.is_logical() || self.functions.is_sync_redo(op.rcvindex) {
                    shared.in_flight.wait_until_below(1, timeout);
                    if apply_page_redo(
                        self.page_buffer,
                        self.functions,
                        record.lsa,
                        &target,
                        mvccid,
                    )? {
                        redone_inline += 1;
                    }
                    return Ok(());
                }

                let mut job = loop {
                    if let Some(job) = shared.pool.pop() {
                        break job;
                    }
                    shared.in_flight.wait_until_below(pool_size, timeout);
                };
                job.lsa = record.lsa;
                job.op = *op;
                job.data.clear();
                job.data.extend_from_slice(target.data);
                job.replay = target.replay;
                job.mvccid = mvccid;

                shared.in_flight.add();
                let worker = worker_for(&op.vpid, workers);
                if senders[worker].send(job).is_err() {
                    shared.in_flight.done();
                    return Err(Error::ReportableBug(format!(
                        "redo worker {} hung up",
                        worker
                    )));
                }
                Ok(())
            });

            shared.in_flight.wait_until_below(1, timeout);
            drop(senders);
            scanned
        })?;

        if let Some(error) = shared.take_error() {
            return Err(error);
        }

        stats.scanned = scanned;
        stats.redone = shared.redone.load(Ordering::Acquire) + redone_inline;
        Ok(stats)
    }
}

fn mvccid_of(record: &LogRecord) -> Option<MvccId> {
    if record.header.rtype.is_mvcc_op() {
        record.body.mvccid()
    } else {
        None
    }
}
