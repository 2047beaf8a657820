use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use rayon::prelude::*;

use super::block::Arena;
use super::daemon::SyncMessage;
use super::Shared;
use crate::page::init_null_page;
use crate::volume::{sys_io, Volumes};
use crate::{Error, Lsa, Result, Vpid, NULL_VPID};

const FLUSH_RETRIES: usize = 5;

/// Who fsynced a volume touched by a block flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum VolumeFlushState {
    NotFlushed = 0,
    FlushedByBlockFlush = 1,
    FlushedByHelper = 2,
}

#[derive(Debug)]
struct VolumeFlush {
    volid: i16,
    state: AtomicU8,
}

/// The volumes a block flush wrote to. The block flusher and the
/// file-sync helper race to claim each one, so every volume is
/// fsynced exactly once.
#[derive(Debug)]
pub(crate) struct FlushVolumesInfo {
    volumes: Vec<VolumeFlush>,
}

impl FlushVolumesInfo {
    pub fn new(volids: &[i16]) -> FlushVolumesInfo {
        FlushVolumesInfo {
            volumes: volids
                .iter()
                .map(|&volid| VolumeFlush {
                    volid,
                    state: AtomicU8::new(VolumeFlushState::NotFlushed as u8),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    fn claim(&self, index: usize, by: VolumeFlushState) -> bool {
        self.volumes[index]
            .state
            .compare_exchange(
                VolumeFlushState::NotFlushed as u8,
                by as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Fsyncs every volume nobody claimed yet. Returns how many this
    /// caller synced.
    pub fn sync_unclaimed(
        &self,
        volumes: &dyn Volumes,
        by: VolumeFlushState,
    ) -> io::Result<usize> {
        let mut synced = 0;
        for index in 0..self.volumes.len() {
            if self.claim(index, by) {
                volumes.sync(self.volumes[index].volid)?;
                synced += 1;
            }
        }
        Ok(synced)
    }

    /// Fsyncs everything regardless of claims, used when the helper
    /// went away holding claims.
    fn sync_all(&self, volumes: &dyn Volumes) -> io::Result<()> {
        for volume in &self.volumes {
            volumes.sync(volume.volid)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn state(&self, index: usize) -> u8 {
        self.volumes[index].state.load(Ordering::Acquire)
    }
}

/// A slot as seen by the flusher, ordered by (vpid, lsa, position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct OrderedSlot {
    pub vpid: Vpid,
    pub lsa: Lsa,
    pub position_in_block: usize,
}

/// Sorts the slots and nulls every page superseded by a later copy
/// of the same page, so each page is written once. On identical LSAs
/// the physically later slot wins. Returns the positions that were
/// nulled.
pub(crate) fn order_and_dedup(slots: &mut [OrderedSlot]) -> Vec<usize> {
    slots.par_sort_unstable();

    let mut superseded = vec![];
    for i in 1..slots.len() {
        let (prev, next) = (slots[i - 1], slots[i]);
        if !prev.vpid.is_null() && prev.vpid == next.vpid {
            slots[i - 1].vpid = NULL_VPID;
            superseded.push(prev.position_in_block);
        }
    }
    superseded
}

/// Distinct volumes of an ordered slot list, in order.
pub(crate) fn touched_volumes(slots: &[OrderedSlot]) -> Vec<i16> {
    let mut volids: Vec<i16> = vec![];
    for slot in slots {
        if slot.vpid.is_null() {
            continue;
        }
        if volids.last() != Some(&slot.vpid.volid) {
            volids.push(slot.vpid.volid);
        }
    }
    volids
}

impl Shared {
    /// Flushes a block, retrying transient failures. A failure that
    /// survives the retries becomes the global error.
    pub(super) fn flush_block_with_retry(
        &self,
        arena: &Arena,
        block_no: usize,
    ) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.flush_block(arena, block_no) {
                Ok(flushed) => return Ok(flushed),
                Err(e) if attempt + 1 < FLUSH_RETRIES => {
                    log::warn!(
                        "flush of double-write block {} failed, retrying: {:?}",
                        block_no,
                        e
                    );
                    attempt += 1;
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!(
                        "flush of double-write block {} failed for good: {:?}",
                        block_no,
                        e
                    );
                    self.set_error(&io::Error::new(
                        io::ErrorKind::Other,
                        e.to_string(),
                    ));
                    return Err(e);
                }
            }
        }
    }

    /// Writes a block to the double-write file, fsyncs it, then writes
    /// its pages to their volumes and fsyncs those. Returns `false`
    /// when someone else already flushed the block.
    pub(super) fn flush_block(
        &self,
        arena: &Arena,
        block_no: usize,
    ) -> Result<bool> {
        let block = &arena.blocks[block_no];
        let _flush_guard = block.flush_mu.lock();

        if !self.position.load().is_block_writing(block_no) {
            return Ok(false);
        }

        let concurrent_flushes = block.flush_counter.fetch_add(1, Ordering::AcqRel);
        if concurrent_flushes != 0 {
            block.flush_counter.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ReportableBug(format!(
                "double-write block {} flushed by {} threads at once",
                block_no,
                concurrent_flushes + 1
            )));
        }

        let res = self.flush_block_inner(arena, block_no);
        block.flush_counter.fetch_sub(1, Ordering::AcqRel);
        res?;

        // recycle the block before letting new writers in
        block.count_wb_pages.store(0, Ordering::Release);
        block.version.fetch_add(1, Ordering::AcqRel);

        let cleared = self.position.fetch_update(|current| {
            Some(current.ends_block_writing(block_no))
        });
        debug_assert!(cleared.is_ok());

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(
            block_no,
            crate::event_verifier::State::Empty,
            "flush_block",
        );

        block.waiters.notify_all();
        Ok(true)
    }

    fn flush_block_inner(&self, arena: &Arena, block_no: usize) -> Result<()> {
        let block = &arena.blocks[block_no];
        let page_size = arena.page_size;
        let count = block.count();

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(
            block_no,
            crate::event_verifier::State::Flushing,
            "flush_block_inner",
        );

        if count == 0 {
            log::trace!("double-write block {} has nothing to flush", block_no);
            return Ok(());
        }

        let mut block_image = block.write_buffer.lock();
        let write_buffer = &mut block_image[..count * page_size];
        let mut ordered = Vec::with_capacity(count);
        for (position_in_block, chunk) in
            write_buffer.chunks_exact_mut(page_size).enumerate()
        {
            let slot = block.slots[position_in_block].lock();
            chunk.copy_from_slice(&slot.page);
            ordered.push(OrderedSlot {
                vpid: slot.vpid,
                lsa: slot.lsa,
                position_in_block,
            });
        }

        for position_in_block in order_and_dedup(&mut ordered) {
            let start = position_in_block * page_size;
            init_null_page(&mut write_buffer[start..start + page_size]);
        }

        // the whole block reaches the double-write file before any of
        // its pages touch a data volume
        sys_io::write_all_at(&arena.file, write_buffer, 0)?;
        fault_injection::maybe!(arena.file.sync_all())?;

        log::debug!(
            "double-write block {} ({} pages) persisted to {:?}",
            block_no,
            count,
            arena.file_path
        );

        let volids = touched_volumes(&ordered);
        for slot in &ordered {
            if slot.vpid.is_null() {
                continue;
            }

            if !self.volumes.has_volume(slot.vpid.volid) {
                log::warn!(
                    "volume {} vanished before page {} could be written",
                    slot.vpid.volid,
                    slot.vpid
                );
            } else {
                let start = slot.position_in_block * page_size;
                self.volumes.write_page(
                    slot.vpid,
                    &write_buffer[start..start + page_size],
                )?;
            }

            self.slots_hash.remove_if_slot(
                slot.vpid,
                block_no,
                slot.position_in_block,
            );
        }

        let live_volids: Vec<i16> = volids
            .into_iter()
            .filter(|volid| self.volumes.has_volume(*volid))
            .collect();
        self.sync_volumes(&live_volids)?;

        log::trace!(
            "double-write block {} written to volumes {:?}",
            block_no,
            live_volids
        );

        Ok(())
    }

    fn sync_volumes(&self, volids: &[i16]) -> Result<()> {
        if volids.is_empty() {
            return Ok(());
        }

        let info = Arc::new(FlushVolumesInfo::new(volids));

        let helper_done = match &self.sync_helper {
            Some(helper) => {
                let (tx, rx) = bounded(1);
                let msg = SyncMessage::Sync { info: info.clone(), done: tx };
                if helper.send(msg).is_ok() { Some(rx) } else { None }
            }
            None => None,
        };

        info.sync_unclaimed(
            &*self.volumes,
            VolumeFlushState::FlushedByBlockFlush,
        )?;

        if let Some(rx) = helper_done {
            match rx.recv() {
                Ok(res) => res?,
                Err(_) => {
                    log::warn!(
                        "file sync helper went away mid-flush, syncing {} volumes here",
                        info.len()
                    );
                    info.sync_all(&*self.volumes)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(volid: i16, pageid: i32, lsa: i64, pos: usize) -> OrderedSlot {
        OrderedSlot {
            vpid: Vpid::new(volid, pageid),
            lsa: Lsa::new(lsa, 0),
            position_in_block: pos,
        }
    }

    #[test]
    fn dedup_keeps_freshest() {
        let mut slots = vec![
            os(1, 11, 5, 0),
            os(1, 10, 3, 1),
            os(1, 11, 8, 2),
            os(0, 4, 1, 3),
        ];
        let superseded = order_and_dedup(&mut slots);
        assert_eq!(superseded, vec![0]);

        let live: Vec<(Vpid, usize)> = slots
            .iter()
            .filter(|s| !s.vpid.is_null())
            .map(|s| (s.vpid, s.position_in_block))
            .collect();
        assert_eq!(
            live,
            vec![
                (Vpid::new(0, 4), 3),
                (Vpid::new(1, 10), 1),
                (Vpid::new(1, 11), 2),
            ]
        );
        assert_eq!(touched_volumes(&slots), vec![0, 1]);
    }

    #[test]
    fn dedup_identical_lsa_later_slot_wins() {
        let mut slots = vec![os(2, 7, 4, 3), os(2, 7, 4, 1)];
        let superseded = order_and_dedup(&mut slots);
        assert_eq!(superseded, vec![1]);
        let winner = slots.iter().find(|s| !s.vpid.is_null()).unwrap();
        assert_eq!(winner.position_in_block, 3);
    }

    #[test]
    fn null_pages_are_never_deduped_or_touched() {
        let mut slots = vec![
            OrderedSlot { vpid: NULL_VPID, lsa: Lsa::default(), position_in_block: 0 },
            OrderedSlot { vpid: NULL_VPID, lsa: Lsa::default(), position_in_block: 1 },
        ];
        assert!(order_and_dedup(&mut slots).is_empty());
        assert!(touched_volumes(&slots).is_empty());
    }

    #[test]
    fn claims_are_exclusive() {
        let info = FlushVolumesInfo::new(&[1, 2]);
        assert!(info.claim(0, VolumeFlushState::FlushedByHelper));
        assert!(!info.claim(0, VolumeFlushState::FlushedByBlockFlush));
        assert!(info.claim(1, VolumeFlushState::FlushedByBlockFlush));
        assert_eq!(info.state(0), VolumeFlushState::FlushedByHelper as u8);
        assert_eq!(info.state(1), VolumeFlushState::FlushedByBlockFlush as u8);
    }
}
