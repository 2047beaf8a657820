use std::fs;
use std::io;

use fault_injection::{fallible, maybe};
use rayon::prelude::*;

use super::flush::{order_and_dedup, touched_volumes, OrderedSlot};
use super::{DoubleWriteBuffer, Shared};
use crate::page::{is_page_corrupted, page_lsa, page_vpid};
use crate::volume::sys_io;
use crate::{Result, Vpid};

/// Summary of a restart pass over the double-write file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredPages {
    /// Pages found in the file, including padding and torn ones.
    pub scanned: usize,
    /// Pages whose double-write copy was itself torn.
    pub torn_in_buffer: usize,
    /// Data pages that were rewritten from their double-write copy.
    pub restored: Vec<Vpid>,
}

impl Shared {
    fn read_dwb_file(&self) -> io::Result<Option<Vec<u8>>> {
        let path = self.file_path();
        let file = match maybe!(fs::File::open(&path)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let len = fallible!(file.metadata()).len() as usize;
        let usable = len - (len % self.config.page_size);
        let mut buf = vec![0_u8; usable];
        sys_io::read_exact_at(&file, &mut buf, 0)?;
        Ok(Some(buf))
    }

    /// Decides whether the data volume needs the buffered copy: only
    /// when its own copy is torn or unreadable.
    fn volume_page_needs_restore(&self, vpid: Vpid, scratch: &mut [u8]) -> Result<bool> {
        match self.volumes.read_page(vpid, scratch) {
            Ok(()) => Ok(is_page_corrupted(scratch)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn recover_pages(&self) -> Result<RecoveredPages> {
        let page_size = self.config.page_size;
        let buf = match self.read_dwb_file()? {
            Some(buf) => buf,
            None => {
                log::debug!("no double-write file to recover from");
                return Ok(RecoveredPages::default());
            }
        };

        let scanned = buf.len() / page_size;
        let mut ordered: Vec<OrderedSlot> = buf
            .par_chunks_exact(page_size)
            .enumerate()
            .filter_map(|(position_in_block, page)| {
                if is_page_corrupted(page) {
                    return None;
                }
                let vpid = page_vpid(page);
                if vpid.is_null() {
                    return None;
                }
                Some(OrderedSlot { vpid, lsa: page_lsa(page), position_in_block })
            })
            .collect();

        let torn_in_buffer = buf
            .par_chunks_exact(page_size)
            .filter(|page| is_page_corrupted(page))
            .count();

        order_and_dedup(&mut ordered);

        let mut restored = vec![];
        let mut scratch = vec![0_u8; page_size];
        for slot in &ordered {
            if slot.vpid.is_null() {
                continue;
            }
            if !self.volumes.has_volume(slot.vpid.volid) {
                log::warn!(
                    "skipping double-write copy of {}, its volume is gone",
                    slot.vpid
                );
                continue;
            }

            if !self.volume_page_needs_restore(slot.vpid, &mut scratch)? {
                continue;
            }

            let start = slot.position_in_block * page_size;
            self.volumes.write_page(slot.vpid, &buf[start..start + page_size])?;
            log::warn!(
                "restored torn page {} from the double-write buffer at lsa {}",
                slot.vpid,
                slot.lsa
            );
            restored.push(slot.vpid);
        }

        let mut volids = touched_volumes(&ordered);
        volids.retain(|volid| restored.iter().any(|vpid| vpid.volid == *volid));
        for volid in volids {
            self.volumes.sync(volid)?;
        }

        fallible!(fs::remove_file(self.file_path()));

        Ok(RecoveredPages { scanned, torn_in_buffer, restored })
    }
}

impl DoubleWriteBuffer {
    /// Restores torn data pages from the double-write file left by the
    /// previous run, then creates a fresh buffer. Must run before any
    /// page is added.
    pub fn load_and_recover_pages(&self) -> Result<RecoveredPages> {
        let _guard = self.shared.start_structure_modification()?;
        if self.shared.position.load().created {
            return Err(crate::Error::Unsupported(
                "double-write pages must be recovered before the buffer is created"
                    .to_string(),
            ));
        }

        let recovered = self.shared.recover_pages()?;
        log::info!(
            "double-write recovery scanned {} pages, restored {}",
            recovered.scanned,
            recovered.restored.len()
        );

        self.shared.create_locked()?;
        Ok(recovered)
    }
}
