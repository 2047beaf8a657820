//! The double-write buffer.
//!
//! Pages headed for a data volume are first copied into a slot of a
//! fixed-size block. A full block is written sequentially to the
//! double-write file and fsynced, and only then are its pages written
//! to their real locations. After a crash, a page torn on its volume
//! can be restored from the double-write file, see
//! [`DoubleWriteBuffer::load_and_recover_pages`].
//!
//! All structural state lives in one 64-bit word (see
//! [`position::Position`]) that is only ever changed by CAS.
use std::fs;
use std::io;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use fault_injection::fallible;
use parking_lot::{Mutex, RwLock};

use crate::config::DwbGeometry;
use crate::page::{init_null_page, page_lsa};
use crate::volume::Volumes;
use crate::{Config, Error, Result, Vpid};

mod block;
mod daemon;
mod flush;
mod position;
mod recover;
mod slots_hash;

use block::{Arena, WaitQueue};
use daemon::{FlushMessage, SyncMessage};
use position::{AtomicPosition, Position};
use slots_hash::{SlotRef, SlotsHash};

pub use recover::RecoveredPages;

const DWB_FILE_NAME: &str = "double_write_buffer";
const STRUCTURE_WAIT: Duration = Duration::from_millis(10);

/// Outcome of [`DoubleWriteBuffer::add_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staged {
    /// The page now lives in the buffer and will reach its volume
    /// with its block.
    Buffered,
    /// The buffer is not created. The caller writes the page itself.
    Disabled,
}

struct AcquiredSlot {
    arena: Arc<Arena>,
    block_no: usize,
    position_in_block: usize,
}

// Tracks a thread between slot acquisition and the end of its copy,
// so a structure change can wait for the buffer to go quiet.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    registered: bool,
}

impl<'a> InFlight<'a> {
    fn new(counter: &'a AtomicUsize) -> InFlight<'a> {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight { counter, registered: true }
    }

    fn leave(&mut self) {
        if self.registered {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            self.registered = false;
        }
    }

    fn rejoin(&mut self) {
        if !self.registered {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.registered = true;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.leave();
    }
}

// Clears the structure-modification bit on every exit path.
struct StructureGuard<'a> {
    shared: &'a Shared,
}

impl Drop for StructureGuard<'_> {
    fn drop(&mut self) {
        let res = self.shared.position.fetch_update(|current| {
            Some(Position { modifying_structure: false, ..current })
        });
        debug_assert!(res.is_ok());
        self.shared.structure_waiters.notify_all();
    }
}

pub(crate) struct Shared {
    config: Config,
    volumes: Arc<dyn Volumes>,
    position: AtomicPosition,
    arena: RwLock<Option<Arc<Arena>>>,
    slots_hash: SlotsHash,
    structure_waiters: WaitQueue,
    adders_in_flight: AtomicUsize,
    // sizing used by the next create, changed by recreate
    sizing: Mutex<(usize, usize)>,
    global_error: AtomicPtr<(io::ErrorKind, String)>,
    flush_daemon: Option<Sender<FlushMessage>>,
    sync_helper: Option<Sender<SyncMessage>>,
    #[cfg(feature = "for-internal-testing-only")]
    event_verifier: crate::event_verifier::EventVerifier,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let error_ptr =
            self.global_error.swap(ptr::null_mut(), Ordering::Acquire);
        if !error_ptr.is_null() {
            unsafe {
                drop(Box::from_raw(error_ptr));
            }
        }
    }
}

impl Shared {
    fn arena(&self) -> Option<Arc<Arena>> {
        self.arena.read().clone()
    }

    fn file_path(&self) -> PathBuf {
        self.config.path.join(DWB_FILE_NAME)
    }

    fn check_error(&self) -> io::Result<()> {
        let err_ptr: *const (io::ErrorKind, String) =
            self.global_error.load(Ordering::Acquire);

        if err_ptr.is_null() {
            Ok(())
        } else {
            let deref: &(io::ErrorKind, String) = unsafe { &*err_ptr };
            Err(io::Error::new(deref.0, deref.1.clone()))
        }
    }

    fn set_error(&self, error: &io::Error) {
        let boxed = Box::new((error.kind(), error.to_string()));
        let ptr = Box::into_raw(boxed);

        if self
            .global_error
            .compare_exchange(
                ptr::null_mut(),
                ptr,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // global fatal error already installed, drop this one
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }

    fn wait_for_structure_modification(&self) -> bool {
        self.structure_waiters.wait_until(STRUCTURE_WAIT, || {
            !self.position.load().modifying_structure
        })
    }

    /// Waits until the block's write bit clears.
    fn wait_for_block_completion(&self, arena: &Arena, block_no: usize) -> bool {
        arena.blocks[block_no]
            .waiters
            .wait_until(self.config.wait_timeout(), || {
                !self.position.load().is_block_writing(block_no)
            })
    }

    fn acquire_next_slot(
        &self,
        in_flight: &mut InFlight<'_>,
    ) -> Option<AcquiredSlot> {
        loop {
            let current = self.position.load();
            if !current.created {
                return None;
            }

            if current.modifying_structure {
                in_flight.leave();
                self.wait_for_structure_modification();
                in_flight.rejoin();
                continue;
            }

            let arena = match self.arena() {
                Some(arena) => arena,
                None => return None,
            };
            let geometry = arena.geometry;

            let block_no = current.block_no(geometry.log2_block_pages);
            let position_in_block =
                current.position_in_block(geometry.block_pages);

            let mut new = current;
            if position_in_block == 0 {
                if current.is_block_writing(block_no) {
                    // the previous fill of this block is still flushing
                    self.wait_for_block_completion(&arena, block_no);
                    continue;
                }
                new = new.starts_block_writing(block_no);
            }
            new = new.advance(geometry.num_pages);

            if self.position.compare_exchange(current, new).is_ok() {
                #[cfg(feature = "for-internal-testing-only")]
                if position_in_block == 0 {
                    self.event_verifier.mark(
                        block_no,
                        crate::event_verifier::State::Filling,
                        "acquire_next_slot",
                    );
                }

                log::trace!(
                    "acquired double-write slot {}/{}",
                    block_no,
                    position_in_block
                );
                return Some(AcquiredSlot { arena, block_no, position_in_block });
            }
        }
    }

    fn add_page(&self, vpid: Vpid, page: &[u8]) -> Result<Staged> {
        self.check_error()?;

        if page.len() != self.config.page_size {
            return Err(Error::Unsupported(format!(
                "page of {} bytes buffered in a double-write buffer of {} byte pages",
                page.len(),
                self.config.page_size
            )));
        }

        let mut in_flight = InFlight::new(&self.adders_in_flight);
        let AcquiredSlot { arena, block_no, position_in_block } =
            match self.acquire_next_slot(&mut in_flight) {
                Some(acquired) => acquired,
                None => return Ok(Staged::Disabled),
            };

        let block = &arena.blocks[block_no];
        let lsa = page_lsa(page);
        {
            let mut slot = block.slots[position_in_block].lock();
            slot.page.copy_from_slice(page);
            slot.vpid = vpid;
            slot.lsa = lsa;
        }

        if !vpid.is_null() {
            let slot_ref = SlotRef { block_no, position_in_block, lsa };
            self.slots_hash.insert(vpid, slot_ref, |previous| {
                let mut stale = arena.blocks[previous.block_no].slots
                    [previous.position_in_block]
                    .lock();
                if stale.vpid == vpid {
                    log::trace!(
                        "page {} buffered twice with lsa {}, dropping slot {}/{}",
                        vpid,
                        lsa,
                        previous.block_no,
                        previous.position_in_block
                    );
                    stale.vpid = crate::NULL_VPID;
                    init_null_page(&mut stale.page);
                }
            });
        }

        let count = block.count_wb_pages.fetch_add(1, Ordering::AcqRel) + 1;
        if count == arena.geometry.block_pages {
            self.block_full(&arena, block_no)?;
        }

        Ok(Staged::Buffered)
    }

    fn block_full(&self, arena: &Arc<Arena>, block_no: usize) -> Result<()> {
        // blocks reach disk in the order they were filled
        let prev = arena.prev_block_no(block_no);
        if prev != block_no {
            loop {
                let current = self.position.load();
                if !current.is_block_writing(prev) || !arena.is_older(prev, block_no)
                {
                    break;
                }
                self.check_error()?;
                self.wait_for_block_completion(arena, prev);
            }
        }

        if let Some(daemon) = &self.flush_daemon {
            if daemon.send(FlushMessage::BlockFull).is_ok() {
                return Ok(());
            }
            log::warn!("double-write flush daemon gone, flushing inline");
        }

        self.flush_block_with_retry(arena, block_no).map(|_| ())
    }

    fn read_page(&self, vpid: Vpid, buf: &mut [u8]) -> bool {
        if !self.position.load().created {
            return false;
        }
        let arena = match self.arena() {
            Some(arena) => arena,
            None => return false,
        };

        self.slots_hash
            .with_slot(vpid, |slot_ref| {
                let Some(block) = arena.blocks.get(slot_ref.block_no) else {
                    return false;
                };
                let slot = block.slots[slot_ref.position_in_block].lock();
                if slot.vpid != vpid || slot.page.len() != buf.len() {
                    return false;
                }
                buf.copy_from_slice(&slot.page);
                true
            })
            .unwrap_or(false)
    }

    fn flush_force(&self) -> Result<bool> {
        let mut null_page = None;

        loop {
            self.check_error()?;

            let current = self.position.load();
            if !current.created {
                return Ok(true);
            }

            if current.modifying_structure {
                self.wait_for_structure_modification();
                continue;
            }

            if current.blocks_writing == 0 {
                return Ok(true);
            }

            let arena = match self.arena() {
                Some(arena) => arena,
                None => return Ok(true),
            };
            let block_pages = arena.geometry.block_pages;
            let block_no = current.block_no(arena.geometry.log2_block_pages);

            if current.position_in_block(block_pages) == 0 {
                // every started block is fully claimed, just wait for
                // them to drain
                let writing = (0..arena.geometry.num_blocks)
                    .find(|b| current.is_block_writing(*b));
                if let Some(writing) = writing {
                    self.wait_for_block_completion(&arena, writing);
                }
                continue;
            }

            let block = &arena.blocks[block_no];
            let version = block.version();

            if current != self.position.load() {
                continue;
            }

            let null_page = null_page.get_or_insert_with(|| {
                let mut page = vec![0_u8; arena.page_size];
                init_null_page(&mut page);
                page
            });

            // pad with null pages so the block fills up and flushes,
            // which also keeps the flush order intact
            loop {
                let now = self.position.load();
                if now.position_in_block(block_pages) == 0
                    || now.block_no(arena.geometry.log2_block_pages) != block_no
                    || block.version() != version
                {
                    break;
                }
                if self.add_page(crate::NULL_VPID, null_page)? == Staged::Disabled {
                    return Ok(true);
                }
            }

            while block.version() == version {
                self.check_error()?;
                block.waiters.wait_until(self.config.wait_timeout(), || {
                    block.version() != version
                });
                if self.position.load().modifying_structure {
                    break;
                }
            }

            if block.version() != version {
                return Ok(true);
            }
        }
    }

    fn start_structure_modification(&self) -> Result<StructureGuard<'_>> {
        self.position
            .fetch_update(|current| {
                if current.modifying_structure {
                    None
                } else {
                    Some(Position { modifying_structure: true, ..current })
                }
            })
            .map_err(|_| {
                Error::Unsupported(
                    "double-write buffer structure is already being modified"
                        .to_string(),
                )
            })?;

        let guard = StructureGuard { shared: self };

        while self.adders_in_flight.load(Ordering::SeqCst) != 0 {
            thread::sleep(Duration::from_millis(1));
        }

        Ok(guard)
    }

    /// Flushes every started block, partial ones included. The slot
    /// position is left mid-block, so the arena must be discarded
    /// afterwards.
    fn drain_locked(&self) -> Result<()> {
        if let Some(arena) = self.arena() {
            let current = self.position.load();
            for block_no in 0..arena.geometry.num_blocks {
                if current.is_block_writing(block_no) {
                    self.flush_block_with_retry(&arena, block_no)?;
                }
            }
            debug_assert_eq!(self.position.load().blocks_writing, 0);
        }
        Ok(())
    }

    fn create_locked(&self) -> Result<()> {
        if self.position.load().created {
            return Ok(());
        }

        let (size, blocks) = *self.sizing.lock();
        let geometry = match DwbGeometry::compute(size, blocks, self.config.page_size)
        {
            Some(geometry) => geometry,
            None => {
                log::info!("double-write buffer disabled, pages are written directly");
                return Ok(());
            }
        };

        let arena = match self.create_arena(geometry) {
            Ok(arena) => arena,
            Err(e) => {
                log::warn!(
                    "unable to create double-write buffer, pages will be written directly: {:?}",
                    e
                );
                return Err(e.into());
            }
        };

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.reset();

        self.slots_hash.clear();
        *self.arena.write() = Some(Arc::new(arena));
        let res = self.position.fetch_update(|current| {
            Some(Position { created: true, blocks_writing: 0, ..current.reset() })
        });
        debug_assert!(res.is_ok());

        log::info!(
            "double-write buffer created with {} blocks of {} pages",
            geometry.num_blocks,
            geometry.block_pages
        );
        Ok(())
    }

    fn create_arena(&self, geometry: DwbGeometry) -> io::Result<Arena> {
        use fs2::FileExt;

        let path = self.file_path();
        if let Err(e) = fs::read_dir(&self.config.path) {
            if e.kind() == io::ErrorKind::NotFound {
                fallible!(fs::create_dir_all(&self.config.path));
            }
        }

        let file = fallible!(
            fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(&path)
        );
        fallible!(file.try_lock_exclusive());
        fallible!(
            file.set_len((geometry.num_pages * self.config.page_size) as u64)
        );
        fallible!(file.sync_all());

        Ok(Arena::new(geometry, self.config.page_size, file, path))
    }

    fn destroy_locked(&self) -> Result<()> {
        if !self.position.load().created {
            return Ok(());
        }

        self.drain_locked()?;

        let res = self.position.fetch_update(|current| {
            Some(Position { created: false, blocks_writing: 0, ..current.reset() })
        });
        debug_assert!(res.is_ok());

        self.slots_hash.clear();
        if let Some(arena) = self.arena.write().take() {
            let path = arena.file_path.clone();
            drop(arena);
            fallible!(fs::remove_file(&path));
        }

        log::info!("double-write buffer destroyed");
        Ok(())
    }
}

/// The double-write buffer together with its background threads.
pub struct DoubleWriteBuffer {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    is_shut_down: bool,
}

impl Drop for DoubleWriteBuffer {
    fn drop(&mut self) {
        if self.is_shut_down {
            return;
        }

        self.shutdown_inner();
        self.is_shut_down = true;
    }
}

impl std::fmt::Debug for DoubleWriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleWriteBuffer")
            .field("position", &self.shared.position.load())
            .field("buffered_pages", &self.shared.slots_hash.len())
            .finish()
    }
}

impl DoubleWriteBuffer {
    /// Sets up the buffer and its threads without creating it. Call
    /// [`load_and_recover_pages`](Self::load_and_recover_pages) on
    /// restart, or [`create`](Self::create) on a fresh database.
    pub fn open(
        config: &Config,
        volumes: Arc<dyn Volumes>,
    ) -> Result<DoubleWriteBuffer> {
        let enabled = config.dwb_geometry().is_some();

        let (flush_tx, flush_rx) = if enabled && config.dwb_flush_daemon {
            let (tx, rx) = unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (sync_tx, sync_rx) = if enabled && config.dwb_file_sync_helper {
            let (tx, rx) = unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            config: config.clone(),
            volumes,
            position: AtomicPosition::default(),
            arena: RwLock::new(None),
            slots_hash: SlotsHash::default(),
            structure_waiters: WaitQueue::default(),
            adders_in_flight: AtomicUsize::new(0),
            sizing: Mutex::new((
                config.double_write_buffer_size,
                config.double_write_buffer_blocks,
            )),
            global_error: AtomicPtr::default(),
            flush_daemon: flush_tx,
            sync_helper: sync_tx,
            #[cfg(feature = "for-internal-testing-only")]
            event_verifier: Default::default(),
        });

        let mut ret =
            DoubleWriteBuffer { shared: shared.clone(), threads: vec![], is_shut_down: false };

        if let Some(rx) = sync_rx {
            ret.threads.push(daemon::spawn_file_sync_helper(rx, shared.clone())?);
        }
        if let Some(rx) = flush_rx {
            ret.threads.push(daemon::spawn_flush_daemon(rx, shared)?);
        }

        Ok(ret)
    }

    fn shutdown_inner(&mut self) {
        // the flush daemon may still hand work to the sync helper, so
        // it goes first
        if let Some(daemon) = &self.shared.flush_daemon {
            let (tx, rx) = bounded(1);
            if daemon.send(FlushMessage::Shutdown(tx)).is_ok() {
                let _ = rx.recv();
            }
        }
        if let Some(helper) = &self.shared.sync_helper {
            let (tx, rx) = bounded(1);
            if helper.send(SyncMessage::Shutdown(tx)).is_ok() {
                let _ = rx.recv();
            }
        }

        for thread in self.threads.drain(..) {
            if let Err(e) = thread.join() {
                log::error!("double-write thread panicked: {:?}", e);
            }
        }
    }

    /// Creates the buffer and its file. A no-op when already created or
    /// when the configured size is zero.
    pub fn create(&self) -> Result<()> {
        let _guard = self.shared.start_structure_modification()?;
        self.shared.create_locked()
    }

    /// Drains every buffered page to its volume, then removes the
    /// buffer and its file. Later `add_page` calls report `Disabled`.
    pub fn destroy(&self) -> Result<()> {
        let _guard = self.shared.start_structure_modification()?;
        self.shared.destroy_locked()
    }

    /// Drains and rebuilds the buffer with new sizing. A size of zero
    /// leaves it disabled.
    pub fn recreate(&self, size: usize, blocks: usize) -> Result<()> {
        let _guard = self.shared.start_structure_modification()?;
        self.shared.destroy_locked()?;
        *self.shared.sizing.lock() = (size, blocks);
        self.shared.create_locked()
    }

    /// Stages a page image for writing. The image carries its own LSA
    /// in its header. A null `vpid` stages a padding page that is never
    /// written to any volume.
    pub fn add_page(&self, vpid: Vpid, page: &[u8]) -> Result<Staged> {
        self.shared.add_page(vpid, page)
    }

    /// Copies the most recently buffered image of `vpid` into `buf`.
    /// Returns `false` when the page is not buffered.
    pub fn read_page(&self, vpid: Vpid, buf: &mut [u8]) -> Result<bool> {
        self.shared.check_error()?;
        Ok(self.shared.read_page(vpid, buf))
    }

    /// Pushes every buffered page to its volume. Returns whether all
    /// pages are known to have reached their volumes.
    pub fn flush_force(&self) -> Result<bool> {
        self.shared.flush_force()
    }

    pub fn is_created(&self) -> bool {
        self.shared.position.load().created
    }

    /// Current sizing, `None` while not created.
    pub fn geometry(&self) -> Option<DwbGeometry> {
        self.shared.arena().map(|arena| arena.geometry)
    }

    /// Whether the index currently holds a buffered copy of `vpid`.
    pub fn is_buffered(&self, vpid: Vpid) -> bool {
        self.shared.slots_hash.get(vpid).is_some()
    }

    /// Number of pages currently indexed.
    pub fn buffered_pages(&self) -> usize {
        self.shared.slots_hash.len()
    }

    /// Returns the fatal error that disabled the buffer, if any.
    pub fn check_error(&self) -> Result<()> {
        Ok(self.shared.check_error()?)
    }

    pub fn page_size(&self) -> usize {
        self.shared.config.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{format_page, page_lsa};
    use crate::volume::FileVolumes;
    use crate::Lsa;

    const PAGE: usize = 4096;

    fn setup(daemons: bool) -> (Config, Arc<FileVolumes>, DoubleWriteBuffer) {
        let config = Config::tmp()
            .unwrap()
            .page_size(PAGE)
            .double_write_buffer_size(512 * 1024)
            .double_write_buffer_blocks(8)
            .dwb_flush_daemon(daemons)
            .dwb_file_sync_helper(daemons);
        let volumes = Arc::new(FileVolumes::open(&config.path, PAGE).unwrap());
        volumes.format(1, 64).unwrap();
        let dwb = DoubleWriteBuffer::open(&config, volumes.clone()).unwrap();
        dwb.create().unwrap();
        (config, volumes, dwb)
    }

    #[test]
    fn disabled_until_created() {
        let config = Config::tmp().unwrap().page_size(PAGE);
        let volumes = Arc::new(FileVolumes::open(&config.path, PAGE).unwrap());
        let dwb = DoubleWriteBuffer::open(&config, volumes).unwrap();
        let page = format_page(PAGE, Vpid::new(1, 1), Lsa::new(1, 0), b"x");
        assert_eq!(dwb.add_page(Vpid::new(1, 1), &page).unwrap(), Staged::Disabled);
        assert!(!dwb.is_created());
    }

    #[test]
    fn read_returns_newest_copy() {
        let (_config, _volumes, dwb) = setup(false);
        // 512k / 4k = 128 pages in 8 blocks of 16
        assert_eq!(dwb.geometry().unwrap().block_pages, 16);

        let vpid = Vpid::new(1, 3);
        for lsa in 1..=5 {
            let page = format_page(PAGE, vpid, Lsa::new(lsa, 0), &[lsa as u8]);
            assert_eq!(dwb.add_page(vpid, &page).unwrap(), Staged::Buffered);
        }

        let mut buf = vec![0; PAGE];
        assert!(dwb.read_page(vpid, &mut buf).unwrap());
        assert_eq!(page_lsa(&buf), Lsa::new(5, 0));
        assert_eq!(dwb.buffered_pages(), 1);
        assert!(!dwb.read_page(Vpid::new(1, 4), &mut buf).unwrap());
    }

    #[test]
    fn full_block_reaches_volume() {
        for daemons in [false, true] {
            let (_config, volumes, dwb) = setup(daemons);
            let block_pages = dwb.geometry().unwrap().block_pages as i32;

            for pageid in 0..block_pages {
                let vpid = Vpid::new(1, pageid);
                let page = format_page(PAGE, vpid, Lsa::new(9, pageid), b"data");
                dwb.add_page(vpid, &page).unwrap();
            }
            assert!(dwb.flush_force().unwrap());

            for pageid in 0..block_pages {
                let vpid = Vpid::new(1, pageid);
                assert!(!dwb.is_buffered(vpid));
                let mut buf = vec![0; PAGE];
                volumes.read_page(vpid, &mut buf).unwrap();
                assert_eq!(page_lsa(&buf), Lsa::new(9, pageid));
            }
        }
    }

    #[test]
    fn flush_force_pads_partial_block() {
        let (_config, volumes, dwb) = setup(true);
        let vpid = Vpid::new(1, 20);
        let page = format_page(PAGE, vpid, Lsa::new(3, 3), b"partial");
        dwb.add_page(vpid, &page).unwrap();
        assert!(dwb.is_buffered(vpid));

        assert!(dwb.flush_force().unwrap());
        assert!(!dwb.is_buffered(vpid));

        let mut buf = vec![0; PAGE];
        volumes.read_page(vpid, &mut buf).unwrap();
        assert_eq!(buf, page);
    }

    #[test]
    fn blocks_are_reused_around_the_ring() {
        let (config, volumes, dwb) = setup(false);
        let geometry = dwb.geometry().unwrap();
        let adds = (geometry.num_pages + 3) as i64;

        for i in 0..adds {
            let vpid = Vpid::new(1, (i % 32) as i32);
            let page = format_page(PAGE, vpid, Lsa::new(i, 0), &[i as u8]);
            dwb.add_page(vpid, &page).unwrap();
        }
        assert!(dwb.flush_force().unwrap());

        let mut buf = vec![0; PAGE];
        for pageid in 0..32_i64 {
            let last = (0..adds).filter(|i| i % 32 == pageid).max().unwrap();
            volumes.read_page(Vpid::new(1, pageid as i32), &mut buf).unwrap();
            assert_eq!(page_lsa(&buf), Lsa::new(last, 0));
        }

        // block 0 went around once, the file holds its second image
        let file = fs::read(config.path.join(DWB_FILE_NAME)).unwrap();
        assert_eq!(page_lsa(&file[..PAGE]), Lsa::new(geometry.num_pages as i64, 0));
    }

    #[test]
    fn second_create_keeps_the_filling_block() {
        for daemons in [false, true] {
            let (_config, volumes, dwb) = setup(daemons);
            let first = Vpid::new(1, 1);
            let second = Vpid::new(1, 2);

            let page = format_page(PAGE, first, Lsa::new(2, 0), b"first");
            dwb.add_page(first, &page).unwrap();
            dwb.create().unwrap();
            assert!(dwb.is_buffered(first));

            let page = format_page(PAGE, second, Lsa::new(2, 8), b"second");
            dwb.add_page(second, &page).unwrap();
            assert!(dwb.flush_force().unwrap());

            let mut buf = vec![0; PAGE];
            for (vpid, lsa) in [(first, Lsa::new(2, 0)), (second, Lsa::new(2, 8))] {
                assert!(!dwb.is_buffered(vpid));
                volumes.read_page(vpid, &mut buf).unwrap();
                assert_eq!(page_lsa(&buf), lsa);
            }
            assert!(dwb.load_and_recover_pages().is_err());
            assert!(dwb.flush_force().unwrap());
        }
    }

    #[test]
    fn destroy_drains_and_disables() {
        let (config, volumes, dwb) = setup(false);
        let vpid = Vpid::new(1, 2);
        let page = format_page(PAGE, vpid, Lsa::new(4, 0), b"drain me");
        dwb.add_page(vpid, &page).unwrap();

        dwb.destroy().unwrap();
        assert!(!dwb.is_created());
        assert!(!config.path.join(DWB_FILE_NAME).exists());

        let mut buf = vec![0; PAGE];
        volumes.read_page(vpid, &mut buf).unwrap();
        assert_eq!(buf, page);
        assert_eq!(dwb.add_page(vpid, &page).unwrap(), Staged::Disabled);
    }

    #[test]
    fn recreate_changes_geometry() {
        let (_config, _volumes, dwb) = setup(false);
        dwb.recreate(1024 * 1024, 2).unwrap();
        let geometry = dwb.geometry().unwrap();
        assert_eq!(geometry.num_blocks, 2);
        assert_eq!(geometry.block_pages, 128);

        dwb.recreate(0, 2).unwrap();
        assert!(!dwb.is_created());
    }

    #[test]
    fn concurrent_writers() {
        let (_config, volumes, dwb) = setup(true);
        let dwb = Arc::new(dwb);

        let mut threads = vec![];
        for t in 0..4_i32 {
            let dwb = dwb.clone();
            threads.push(thread::spawn(move || {
                for round in 0..50_i64 {
                    let vpid = Vpid::new(1, t * 8 + (round % 8) as i32);
                    let page =
                        format_page(PAGE, vpid, Lsa::new(round, t), &[t as u8]);
                    dwb.add_page(vpid, &page).unwrap();
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(dwb.flush_force().unwrap());
        assert_eq!(dwb.buffered_pages(), 0);

        for t in 0..4_i32 {
            for p in 0..8_i32 {
                let vpid = Vpid::new(1, t * 8 + p);
                let mut buf = vec![0; PAGE];
                volumes.read_page(vpid, &mut buf).unwrap();
                let lsa = page_lsa(&buf);
                // the last round that touched this page
                let last_round = (0..50_i64).filter(|r| r % 8 == p as i64).max().unwrap();
                assert_eq!(lsa, Lsa::new(last_round, t));
            }
        }
    }
}
