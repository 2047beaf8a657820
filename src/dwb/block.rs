use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::DwbGeometry;
use crate::{Lsa, Vpid, NULL_LSA, NULL_VPID};

/// One buffered page image.
#[derive(Debug)]
pub(crate) struct Slot {
    pub vpid: Vpid,
    pub lsa: Lsa,
    pub page: Box<[u8]>,
}

impl Slot {
    fn new(page_size: usize) -> Slot {
        Slot {
            vpid: NULL_VPID,
            lsa: NULL_LSA,
            page: vec![0; page_size].into_boxed_slice(),
        }
    }
}

/// A wait queue for threads blocked on a block flush or on a
/// structure change. The mutex guards nothing but the queue.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    mu: Mutex<()>,
    cv: Condvar,
}

impl WaitQueue {
    /// Waits at most `timeout` for `done` to hold. Returns whether it
    /// held when we woke up.
    pub fn wait_until<F: FnMut() -> bool>(
        &self,
        timeout: Duration,
        mut done: F,
    ) -> bool {
        let mut guard = self.mu.lock();
        if done() {
            return true;
        }
        let _ = self.cv.wait_for(&mut guard, timeout);
        drop(guard);
        done()
    }

    pub fn notify_all(&self) {
        let _guard = self.mu.lock();
        self.cv.notify_all();
    }
}

#[derive(Debug)]
pub(crate) struct Block {
    pub block_no: usize,
    pub slots: Vec<Mutex<Slot>>,
    /// Contiguous image of the block, assembled from the slots for
    /// the sequential write to the double-write file.
    pub write_buffer: Mutex<Box<[u8]>>,
    /// Number of slots whose copy has completed.
    pub count_wb_pages: AtomicUsize,
    /// Bumped every time the block is flushed and recycled.
    pub version: AtomicU64,
    /// Held for the whole of a flush of this block.
    pub flush_mu: Mutex<()>,
    pub flush_counter: AtomicUsize,
    pub waiters: WaitQueue,
}

impl Block {
    fn new(block_no: usize, block_pages: usize, page_size: usize) -> Block {
        Block {
            block_no,
            slots: (0..block_pages)
                .map(|_| Mutex::new(Slot::new(page_size)))
                .collect(),
            write_buffer: Mutex::new(
                vec![0; block_pages * page_size].into_boxed_slice(),
            ),
            count_wb_pages: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            flush_mu: Mutex::new(()),
            flush_counter: AtomicUsize::new(0),
            waiters: WaitQueue::default(),
        }
    }

    pub fn count(&self) -> usize {
        self.count_wb_pages.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// All blocks of one incarnation of the double-write buffer together
/// with the file that mirrors them. Replaced wholesale on `recreate`.
#[derive(Debug)]
pub(crate) struct Arena {
    pub geometry: DwbGeometry,
    pub page_size: usize,
    pub blocks: Vec<Block>,
    pub file: fs::File,
    pub file_path: PathBuf,
    /// Next block the flush daemon drains, in ring order.
    pub next_block_to_flush: AtomicUsize,
}

impl Arena {
    pub fn new(
        geometry: DwbGeometry,
        page_size: usize,
        file: fs::File,
        file_path: PathBuf,
    ) -> Arena {
        let blocks = (0..geometry.num_blocks)
            .map(|block_no| {
                Block::new(block_no, geometry.block_pages, page_size)
            })
            .collect();

        Arena {
            geometry,
            page_size,
            blocks,
            file,
            file_path,
            next_block_to_flush: AtomicUsize::new(0),
        }
    }

    pub fn prev_block_no(&self, block_no: usize) -> usize {
        if block_no == 0 { self.geometry.num_blocks - 1 } else { block_no - 1 }
    }

    /// Whether `other` was filled before `block_no` in ring order.
    pub fn is_older(&self, other: usize, block_no: usize) -> bool {
        let other_version = self.blocks[other].version();
        let version = self.blocks[block_no].version();
        other_version < version
            || (other_version == version && other < block_no)
    }
}
