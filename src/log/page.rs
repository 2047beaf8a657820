//! Fixed-size write-ahead log pages.
//!
//! ```text
//! 0..8    logical page id (i64 LE)
//! 8..12   offset of the first record starting on this page, -1 if none
//! 12..16  crc32 of the page with this field zeroed
//! 16..    record area
//! ```
//!
//! Fresh pages are filled with 0xFF so that a partially flushed page
//! shows its missing I/O blocks as runs of 0xFF.

/// Size of the header in front of every log page's record area.
pub const LOG_PAGE_HEADER_SIZE: usize = 16;

/// Byte every unwritten part of a log page carries.
pub const LOG_PAGE_INIT_VALUE: u8 = 0xFF;

/// Granularity at which the disk may tear a log page write.
pub const IO_BLOCK_SIZE: usize = 4096;

pub const NULL_OFFSET: i32 = -1;

const CHECKSUM_RANGE: std::ops::Range<usize> = 12..16;

#[derive(Clone, PartialEq, Eq)]
pub struct LogPage {
    buf: Box<[u8]>,
}

impl std::fmt::Debug for LogPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPage")
            .field("pageid", &self.logical_pageid())
            .field("first_record", &self.first_record_offset())
            .field("size", &self.buf.len())
            .finish()
    }
}

impl LogPage {
    /// An unwritten page: every byte 0xFF except the header.
    pub fn new(page_size: usize, pageid: i64) -> LogPage {
        let mut page = LogPage {
            buf: vec![LOG_PAGE_INIT_VALUE; page_size].into_boxed_slice(),
        };
        page.set_logical_pageid(pageid);
        page.set_first_record_offset(NULL_OFFSET);
        page
    }

    pub fn from_bytes(buf: Vec<u8>) -> LogPage {
        LogPage { buf: buf.into_boxed_slice() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn area_size(&self) -> usize {
        self.buf.len() - LOG_PAGE_HEADER_SIZE
    }

    pub fn area(&self) -> &[u8] {
        &self.buf[LOG_PAGE_HEADER_SIZE..]
    }

    pub fn area_mut(&mut self) -> &mut [u8] {
        &mut self.buf[LOG_PAGE_HEADER_SIZE..]
    }

    pub fn logical_pageid(&self) -> i64 {
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&self.buf[0..8]);
        i64::from_le_bytes(bytes)
    }

    pub fn set_logical_pageid(&mut self, pageid: i64) {
        self.buf[0..8].copy_from_slice(&pageid.to_le_bytes());
    }

    pub fn first_record_offset(&self) -> i32 {
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(&self.buf[8..12]);
        i32::from_le_bytes(bytes)
    }

    pub fn set_first_record_offset(&mut self, offset: i32) {
        self.buf[8..12].copy_from_slice(&offset.to_le_bytes());
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf[..CHECKSUM_RANGE.start]);
        hasher.update(&[0; 4]);
        hasher.update(&self.buf[CHECKSUM_RANGE.end..]);
        hasher.finalize()
    }

    /// Must run right before the page image is written out.
    pub fn stamp_checksum(&mut self) {
        let crc = self.compute_checksum();
        self.buf[CHECKSUM_RANGE].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn is_corrupted(&self) -> bool {
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(&self.buf[CHECKSUM_RANGE]);
        u32::from_le_bytes(bytes) != self.compute_checksum()
    }

    /// Index of the first I/O block made only of 0xFF bytes, if any.
    pub fn first_unwritten_block(&self) -> Option<usize> {
        self.buf
            .chunks(IO_BLOCK_SIZE)
            .position(|block| block.iter().all(|b| *b == LOG_PAGE_INIT_VALUE))
    }

    /// Whether the I/O block `block_index` is made only of 0xFF bytes.
    pub fn is_block_unwritten(&self, block_index: usize) -> bool {
        self.buf
            .chunks(IO_BLOCK_SIZE)
            .nth(block_index)
            .map(|block| block.iter().all(|b| *b == LOG_PAGE_INIT_VALUE))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_page_is_unwritten() {
        let mut page = LogPage::new(16 * 1024, 7);
        assert_eq!(page.logical_pageid(), 7);
        assert_eq!(page.first_record_offset(), NULL_OFFSET);
        assert_eq!(page.area_size(), 16 * 1024 - LOG_PAGE_HEADER_SIZE);
        // the header lives in block 0
        assert_eq!(page.first_unwritten_block(), Some(1));

        page.stamp_checksum();
        assert!(!page.is_corrupted());
    }

    #[test]
    fn torn_tail_is_detected() {
        let mut page = LogPage::new(16 * 1024, 0);
        page.area_mut()[..5000].fill(0xAB);
        page.stamp_checksum();
        assert!(!page.is_corrupted());
        assert_eq!(page.first_unwritten_block(), Some(2));

        let mut torn = page.as_bytes().to_vec();
        torn[3 * IO_BLOCK_SIZE..].fill(LOG_PAGE_INIT_VALUE);
        torn[100] = 0;
        let torn = LogPage::from_bytes(torn);
        assert!(torn.is_corrupted());
        assert!(torn.is_block_unwritten(3));
        assert!(!torn.is_block_unwritten(0));
    }
}
