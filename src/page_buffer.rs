use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::dwb::{DoubleWriteBuffer, Staged};
use crate::page::{
    is_page_corrupted, page_lsa, set_page_lsa, set_page_vpid, stamp_checksum,
};
use crate::volume::Volumes;
use crate::{Error, Lsa, Result, Vpid, NULL_LSA};

/// One cached data page.
#[derive(Debug)]
pub struct Frame {
    vpid: Vpid,
    data: Box<[u8]>,
    dirty: bool,
}

impl Frame {
    pub fn vpid(&self) -> Vpid {
        self.vpid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn lsa(&self) -> Lsa {
        page_lsa(&self.data)
    }

    pub fn set_lsa(&mut self, lsa: Lsa) {
        set_page_lsa(&mut self.data, lsa);
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// A fixed page. Dropping the guard unfixes it.
pub type PageGuard = ArcMutexGuard<RawMutex, Frame>;

/// The page buffer recovery drives.
pub trait PageBuffer: Send + Sync {
    /// Fixes `vpid`, or returns `None` when no volume holds it.
    fn fix(&self, vpid: Vpid) -> Result<Option<PageGuard>>;

    /// Writes every dirty page out. The log must already be durable
    /// up to the highest page LSA.
    fn flush_all(&self) -> Result<()>;
}

/// Page cache that writes through the double-write buffer and
/// consults it before the volumes on a miss.
pub struct DwbPageBuffer {
    volumes: Arc<dyn Volumes>,
    dwb: Arc<DoubleWriteBuffer>,
    page_size: usize,
    frames: Mutex<FnvHashMap<Vpid, Arc<Mutex<Frame>>>>,
}

impl std::fmt::Debug for DwbPageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwbPageBuffer")
            .field("page_size", &self.page_size)
            .field("cached", &self.frames.lock().len())
            .finish()
    }
}

impl DwbPageBuffer {
    pub fn new(
        volumes: Arc<dyn Volumes>,
        dwb: Arc<DoubleWriteBuffer>,
    ) -> DwbPageBuffer {
        let page_size = dwb.page_size();
        DwbPageBuffer { volumes, dwb, page_size, frames: Mutex::default() }
    }

    pub fn cached_pages(&self) -> usize {
        self.frames.lock().len()
    }

    fn page_exists(&self, vpid: Vpid) -> Result<bool> {
        if vpid.is_null() || vpid.pageid < 0 {
            return Ok(false);
        }
        if !self.volumes.has_volume(vpid.volid) {
            return Ok(false);
        }
        Ok(vpid.pageid < self.volumes.num_pages(vpid.volid)?)
    }

    fn load(&self, vpid: Vpid) -> Result<Frame> {
        let mut data = vec![0_u8; self.page_size].into_boxed_slice();
        if !self.dwb.read_page(vpid, &mut data)? {
            self.volumes.read_page(vpid, &mut data)?;
        }

        if is_page_corrupted(&data) {
            if data.iter().all(|b| *b == 0) {
                // never written: hand out a blank page
                set_page_vpid(&mut data, vpid);
                set_page_lsa(&mut data, NULL_LSA);
            } else {
                log::error!("page {} failed its checksum on load", vpid);
                return Err(Error::CorruptedPage { vpid });
            }
        }

        Ok(Frame { vpid, data, dirty: false })
    }
}

impl PageBuffer for DwbPageBuffer {
    fn fix(&self, vpid: Vpid) -> Result<Option<PageGuard>> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&vpid) {
            let frame = frame.clone();
            drop(frames);
            return Ok(Some(frame.lock_arc()));
        }

        if !self.page_exists(vpid)? {
            return Ok(None);
        }

        let frame = Arc::new(Mutex::new(self.load(vpid)?));
        frames.insert(vpid, frame.clone());
        drop(frames);
        Ok(Some(frame.lock_arc()))
    }

    fn flush_all(&self) -> Result<()> {
        let mut frames: Vec<(Vpid, Arc<Mutex<Frame>>)> = self
            .frames
            .lock()
            .iter()
            .map(|(vpid, frame)| (*vpid, frame.clone()))
            .collect();
        frames.sort_unstable_by_key(|(vpid, _)| *vpid);

        let mut written_directly = FnvHashSet::default();
        let mut flushed = 0;
        for (_, frame) in frames {
            let mut frame = frame.lock();
            if !frame.dirty {
                continue;
            }
            let vpid = frame.vpid;
            stamp_checksum(&mut frame.data);
            match self.dwb.add_page(vpid, &frame.data)? {
                Staged::Buffered => {}
                Staged::Disabled => {
                    self.volumes.write_page(vpid, &frame.data)?;
                    written_directly.insert(vpid.volid);
                }
            }
            frame.dirty = false;
            flushed += 1;
        }

        if !self.dwb.flush_force()? {
            log::warn!("double-write buffer did not confirm every page on disk");
        }
        for volid in written_directly {
            self.volumes.sync(volid)?;
        }

        log::debug!("page buffer flushed {} dirty pages", flushed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::format_page;
    use crate::{Config, FileVolumes};

    const PAGE: usize = 4096;

    fn setup(dwb_size: usize) -> (Config, Arc<FileVolumes>, Arc<DoubleWriteBuffer>) {
        let config = Config::tmp()
            .unwrap()
            .page_size(PAGE)
            .double_write_buffer_size(dwb_size)
            .dwb_flush_daemon(false)
            .dwb_file_sync_helper(false);
        let volumes = Arc::new(FileVolumes::open(&config.path, PAGE).unwrap());
        volumes.format(1, 8).unwrap();
        let dwb = Arc::new(DoubleWriteBuffer::open(&config, volumes.clone()).unwrap());
        dwb.load_and_recover_pages().unwrap();
        (config, volumes, dwb)
    }

    #[test]
    fn blank_pages_and_missing_pages() {
        let (_config, volumes, dwb) = setup(1024 * 1024);
        let buffer = DwbPageBuffer::new(volumes, dwb);

        let page = buffer.fix(Vpid::new(1, 2)).unwrap().unwrap();
        assert!(page.lsa().is_null());
        assert_eq!(page.vpid(), Vpid::new(1, 2));
        drop(page);
        assert_eq!(buffer.cached_pages(), 1);

        assert!(buffer.fix(Vpid::new(1, 8)).unwrap().is_none());
        assert!(buffer.fix(Vpid::new(2, 0)).unwrap().is_none());
    }

    #[test]
    fn flush_goes_through_the_buffer() {
        for dwb_size in [1024 * 1024, 0] {
            let (_config, volumes, dwb) = setup(dwb_size);
            let buffer = DwbPageBuffer::new(volumes.clone(), dwb);

            let vpid = Vpid::new(1, 5);
            {
                let mut page = buffer.fix(vpid).unwrap().unwrap();
                page.data_mut()[100] = 42;
                page.set_lsa(Lsa::new(3, 16));
                page.set_dirty();
            }
            buffer.flush_all().unwrap();

            let mut on_disk = vec![0; PAGE];
            volumes.read_page(vpid, &mut on_disk).unwrap();
            assert!(!is_page_corrupted(&on_disk));
            assert_eq!(on_disk[100], 42);
            assert_eq!(page_lsa(&on_disk), Lsa::new(3, 16));
        }
    }

    #[test]
    fn flush_waits_out_a_fixed_page() {
        let (_config, volumes, dwb) = setup(1024 * 1024);
        let buffer = Arc::new(DwbPageBuffer::new(volumes.clone(), dwb));

        let (held, busy) = (Vpid::new(1, 3), Vpid::new(1, 4));
        for (vpid, byte) in [(held, 3), (busy, 4)] {
            let mut page = buffer.fix(vpid).unwrap().unwrap();
            page.data_mut()[200] = byte;
            page.set_lsa(Lsa::new(1, byte as i32));
            page.set_dirty();
        }

        let (fixed_tx, fixed_rx) = crossbeam_channel::bounded(0);
        let holder = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let page = buffer.fix(held).unwrap().unwrap();
                fixed_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(50));
                drop(page);
            })
        };
        fixed_rx.recv().unwrap();
        buffer.flush_all().unwrap();
        holder.join().unwrap();

        let mut on_disk = vec![0; PAGE];
        for (vpid, byte) in [(held, 3_u8), (busy, 4)] {
            volumes.read_page(vpid, &mut on_disk).unwrap();
            assert_eq!(on_disk[200], byte);
        }
    }

    #[test]
    fn torn_volume_page_is_an_error() {
        let (_config, volumes, dwb) = setup(1024 * 1024);
        let vpid = Vpid::new(1, 1);
        let mut torn = format_page(PAGE, vpid, Lsa::new(1, 0), b"x");
        torn[PAGE - 1] = 7;
        volumes.write_page(vpid, &torn).unwrap();

        let buffer = DwbPageBuffer::new(volumes, dwb);
        assert!(matches!(
            buffer.fix(vpid),
            Err(Error::CorruptedPage { vpid: at }) if at == vpid
        ));
    }
}
