//! Data page header helpers.
//!
//! Every data page starts with a fixed header:
//!
//! ```text
//! 0..8    page lsa, page id (i64 LE)
//! 8..12   page lsa, offset (i32 LE)
//! 12..14  volume id (i16 LE)
//! 14..16  reserved
//! 16..20  page id (i32 LE)
//! 20..24  crc32 of the page with this field zeroed
//! 24..32  reserved
//! ```
use crate::{Lsa, Vpid, NULL_LSA, NULL_VPID};

pub const PAGE_HEADER_SIZE: usize = 32;

const CHECKSUM_RANGE: std::ops::Range<usize> = 20..24;

fn read_i64(page: &[u8], at: usize) -> i64 {
    let mut buf = [0_u8; 8];
    buf.copy_from_slice(&page[at..at + 8]);
    i64::from_le_bytes(buf)
}

fn read_i32(page: &[u8], at: usize) -> i32 {
    let mut buf = [0_u8; 4];
    buf.copy_from_slice(&page[at..at + 4]);
    i32::from_le_bytes(buf)
}

fn read_i16(page: &[u8], at: usize) -> i16 {
    let mut buf = [0_u8; 2];
    buf.copy_from_slice(&page[at..at + 2]);
    i16::from_le_bytes(buf)
}

pub fn page_lsa(page: &[u8]) -> Lsa {
    Lsa { pageid: read_i64(page, 0), offset: read_i32(page, 8) }
}

pub fn set_page_lsa(page: &mut [u8], lsa: Lsa) {
    page[0..8].copy_from_slice(&lsa.pageid.to_le_bytes());
    page[8..12].copy_from_slice(&lsa.offset.to_le_bytes());
}

pub fn page_vpid(page: &[u8]) -> Vpid {
    Vpid { volid: read_i16(page, 12), pageid: read_i32(page, 16) }
}

pub fn set_page_vpid(page: &mut [u8], vpid: Vpid) {
    page[12..14].copy_from_slice(&vpid.volid.to_le_bytes());
    page[16..20].copy_from_slice(&vpid.pageid.to_le_bytes());
}

fn compute_checksum(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CHECKSUM_RANGE.start]);
    hasher.update(&[0; 4]);
    hasher.update(&page[CHECKSUM_RANGE.end..]);
    hasher.finalize()
}

/// Computes and stores the page checksum. Must be the last
/// modification before the page image is written anywhere.
pub fn stamp_checksum(page: &mut [u8]) {
    let crc = compute_checksum(page);
    page[CHECKSUM_RANGE].copy_from_slice(&crc.to_le_bytes());
}

/// A page is corrupted when its stored checksum disagrees with
/// its contents, which is what a torn write leaves behind.
pub fn is_page_corrupted(page: &[u8]) -> bool {
    if page.len() < PAGE_HEADER_SIZE {
        return true;
    }
    let stored = read_i32(page, CHECKSUM_RANGE.start) as u32;
    stored != compute_checksum(page)
}

/// Resets a buffer to the null page used to pad partially filled
/// double-write blocks.
pub fn init_null_page(page: &mut [u8]) {
    page.fill(0);
    set_page_lsa(page, NULL_LSA);
    set_page_vpid(page, NULL_VPID);
    stamp_checksum(page);
}

/// Builds a fresh, checksummed page image for `vpid` carrying `lsa`
/// and `body` right after the header.
pub fn format_page(page_size: usize, vpid: Vpid, lsa: Lsa, body: &[u8]) -> Vec<u8> {
    let mut page = vec![0_u8; page_size];
    set_page_vpid(&mut page, vpid);
    set_page_lsa(&mut page, lsa);
    let end = (PAGE_HEADER_SIZE + body.len()).min(page_size);
    page[PAGE_HEADER_SIZE..end]
        .copy_from_slice(&body[..end - PAGE_HEADER_SIZE]);
    stamp_checksum(&mut page);
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_round_trip() {
        let mut page = vec![0_u8; 4096];
        set_page_lsa(&mut page, Lsa::new(77, 1200));
        set_page_vpid(&mut page, Vpid::new(3, 91));
        assert_eq!(page_lsa(&page), Lsa::new(77, 1200));
        assert_eq!(page_vpid(&page), Vpid::new(3, 91));
    }

    #[test]
    fn torn_page_detected() {
        let mut page = format_page(4096, Vpid::new(1, 2), Lsa::new(5, 6), b"hello");
        assert!(!is_page_corrupted(&page));

        // second half of the page never made it to disk
        for byte in &mut page[2048..] {
            *byte = 0xFF;
        }
        assert!(is_page_corrupted(&page));
    }

    #[test]
    fn zeroed_page_is_corrupted() {
        let page = vec![0_u8; 4096];
        assert!(is_page_corrupted(&page));
    }

    #[test]
    fn null_page_is_sane() {
        let mut page = vec![0xAB_u8; 4096];
        init_null_page(&mut page);
        assert!(page_vpid(&page).is_null());
        assert!(page_lsa(&page).is_null());
        assert!(!is_page_corrupted(&page));
    }
}
