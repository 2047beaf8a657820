//! Detection of a partially flushed log tail.
//!
//! A log page write may tear at I/O block granularity. Since fresh log
//! pages are filled with 0xFF, the blocks that never reached the disk
//! show up as runs of 0xFF. The first such block bounds what Analysis
//! may trust on that page.

use crate::log::{LogPage, RecordHeader, RecordType, IO_BLOCK_SIZE, LOG_PAGE_HEADER_SIZE};
use crate::{Lsa, NULL_LSA};

#[derive(Debug, Clone, Copy)]
pub(crate) struct CorruptionChecker {
    page_corrupted: bool,
    first_corrupted_lsa: Lsa,
}

/// Index of the I/O block holding area offset `offset`.
fn block_of(offset: i32) -> usize {
    (offset.max(0) as usize + LOG_PAGE_HEADER_SIZE - 1) / IO_BLOCK_SIZE
}

/// Area offset at which block `index` starts.
fn block_start(index: usize) -> i32 {
    if index == 0 {
        0
    } else {
        (index * IO_BLOCK_SIZE - LOG_PAGE_HEADER_SIZE) as i32
    }
}

impl CorruptionChecker {
    pub(crate) fn new() -> CorruptionChecker {
        CorruptionChecker { page_corrupted: false, first_corrupted_lsa: NULL_LSA }
    }

    pub(crate) fn is_page_corrupted(&self) -> bool {
        self.page_corrupted
    }

    pub(crate) fn first_corrupted_lsa(&self) -> Lsa {
        self.first_corrupted_lsa
    }

    /// Called for every page Analysis fetches.
    pub(crate) fn check_page(&mut self, page: &LogPage) {
        if !page.is_corrupted() {
            self.page_corrupted = false;
            self.first_corrupted_lsa = NULL_LSA;
            return;
        }

        self.page_corrupted = true;
        self.first_corrupted_lsa = match page.first_unwritten_block() {
            Some(index) => Lsa::new(page.logical_pageid(), block_start(index)),
            None => NULL_LSA,
        };
        log::warn!(
            "log page {} failed its checksum, first corrupted address {}",
            page.logical_pageid(),
            self.first_corrupted_lsa
        );
    }

    fn mark_corrupted_at(&mut self, lsa: Lsa) {
        self.page_corrupted = true;
        if self.first_corrupted_lsa.is_null() || lsa < self.first_corrupted_lsa {
            self.first_corrupted_lsa = lsa;
        }
    }

    /// Called for every record header Analysis reads from `page`.
    pub(crate) fn check_record(
        &mut self,
        page: &LogPage,
        record_lsa: Lsa,
        header: &RecordHeader,
    ) {
        if header.rtype == RecordType::Corrupted {
            self.mark_corrupted_at(record_lsa);
            return;
        }

        if header.forw_lsa.is_null() && header.rtype != RecordType::EndOfLog {
            self.mark_corrupted_at(record_lsa);
            return;
        }

        if header.forw_lsa.pageid == record_lsa.pageid {
            let start_block = block_of(record_lsa.offset);
            let end_block = block_of(header.forw_lsa.offset);
            if start_block != end_block && page.is_block_unwritten(end_block) {
                // the record runs into a block that never made it
                self.mark_corrupted_at(record_lsa);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NULL_TRANID;

    const PAGE: usize = 16 * 1024;

    fn put(page: &mut LogPage, at: i32, forw: Lsa, rtype: RecordType) {
        let header = RecordHeader {
            prev_tranlsa: NULL_LSA,
            back_lsa: NULL_LSA,
            forw_lsa: forw,
            trid: NULL_TRANID,
            rtype,
            body_len: 0,
        };
        let at = at as usize;
        header.write_to(&mut page.area_mut()[at..at + 48]);
    }

    #[test]
    fn intact_page_is_trusted() {
        let mut page = LogPage::new(PAGE, 4);
        put(&mut page, 0, Lsa::new(4, 48), RecordType::DummyHead);
        put(&mut page, 48, NULL_LSA, RecordType::EndOfLog);
        page.stamp_checksum();

        let mut checker = CorruptionChecker::new();
        checker.check_page(&page);
        assert!(!checker.is_page_corrupted());
        let header = RecordHeader::read_from(&page.area()[0..]);
        checker.check_record(&page, Lsa::new(4, 0), &header);
        assert!(!checker.is_page_corrupted());
        assert!(checker.first_corrupted_lsa().is_null());
    }

    #[test]
    fn torn_page_reports_first_unwritten_block() {
        let mut page = LogPage::new(PAGE, 9);
        put(&mut page, 0, Lsa::new(9, 5000), RecordType::RedoData);
        page.area_mut()[48..5000].fill(1);
        put(&mut page, 5000, Lsa::new(9, 9000), RecordType::RedoData);
        page.area_mut()[5048..9000].fill(1);
        put(&mut page, 9000, NULL_LSA, RecordType::EndOfLog);
        page.stamp_checksum();

        // the third block never reached the disk
        let mut torn = page.as_bytes().to_vec();
        torn[2 * IO_BLOCK_SIZE..3 * IO_BLOCK_SIZE].fill(0xFF);
        let torn = LogPage::from_bytes(torn);

        let mut checker = CorruptionChecker::new();
        checker.check_page(&torn);
        assert!(checker.is_page_corrupted());
        assert_eq!(
            checker.first_corrupted_lsa(),
            Lsa::new(9, (2 * IO_BLOCK_SIZE - LOG_PAGE_HEADER_SIZE) as i32)
        );

        // the second record ends in the unwritten block
        let second = RecordHeader::read_from(&torn.area()[5000..]);
        checker.check_record(&torn, Lsa::new(9, 5000), &second);
        assert_eq!(checker.first_corrupted_lsa(), Lsa::new(9, 5000));
    }

    #[test]
    fn dangling_forward_pointer_is_corruption() {
        let page = LogPage::new(PAGE, 2);
        let mut checker = CorruptionChecker::new();
        let header = RecordHeader::read_from(&page.area()[64..]);
        assert_eq!(header.rtype, RecordType::Corrupted);
        checker.check_record(&page, Lsa::new(2, 64), &header);
        assert!(checker.is_page_corrupted());
        assert_eq!(checker.first_corrupted_lsa(), Lsa::new(2, 64));
    }

    #[test]
    fn block_arithmetic() {
        assert_eq!(block_of(0), 0);
        assert_eq!(block_of(4080), 0);
        assert_eq!(block_of(4081), 1);
        assert_eq!(block_start(0), 0);
        assert_eq!(block_start(1), 4080);
    }
}
