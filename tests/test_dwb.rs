mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use quickcheck::{QuickCheck, TestResult};

use keel::{
    format_page, is_page_corrupted, page_lsa, Config, DoubleWriteBuffer, FileVolumes, Lsa,
    Staged, Volumes, Vpid,
};

fn open(config: &Config, pages: i32) -> (Arc<FileVolumes>, DoubleWriteBuffer) {
    let volumes = Arc::new(FileVolumes::open(&config.path, config.page_size).unwrap());
    if !volumes.has_volume(1) {
        volumes.format(1, pages).unwrap();
    }
    let dwb = DoubleWriteBuffer::open(config, volumes.clone()).unwrap();
    dwb.load_and_recover_pages().unwrap();
    (volumes, dwb)
}

#[test]
fn forced_block_lands_on_its_volume() {
    common::setup_logger();
    let config = Config::tmp().unwrap();
    let (volumes, dwb) = open(&config, 32);
    let geometry = dwb.geometry().unwrap();
    assert_eq!(geometry.block_pages, 4);

    for pageid in 10..14 {
        let vpid = Vpid::new(1, pageid);
        let page = format_page(config.page_size, vpid, Lsa::new(1, pageid), b"e2e");
        assert_eq!(dwb.add_page(vpid, &page).unwrap(), Staged::Buffered);
    }
    assert!(dwb.flush_force().unwrap());

    let mut buf = vec![0; config.page_size];
    for pageid in 10..14 {
        let vpid = Vpid::new(1, pageid);
        assert!(!dwb.is_buffered(vpid));
        volumes.read_page(vpid, &mut buf).unwrap();
        assert!(!is_page_corrupted(&buf));
        assert_eq!(page_lsa(&buf), Lsa::new(1, pageid));
    }
    assert_eq!(dwb.buffered_pages(), 0);
}

#[test]
fn restart_repairs_a_torn_volume_page() {
    common::setup_logger();
    let config = Config::tmp()
        .unwrap()
        .page_size(4096)
        .dwb_flush_daemon(false)
        .dwb_file_sync_helper(false);

    let vpid = Vpid::new(1, 5);
    let page = format_page(4096, vpid, Lsa::new(3, 8), b"whole");
    {
        let (volumes, dwb) = open(&config, 16);
        dwb.add_page(vpid, &page).unwrap();
        assert!(dwb.flush_force().unwrap());

        // a later write of the same page tore half way
        let mut torn = page.clone();
        torn[2048..].fill(0xAB);
        volumes.write_page(vpid, &torn).unwrap();
    }

    let (volumes, dwb) = open(&config, 16);
    let mut buf = vec![0; 4096];
    volumes.read_page(vpid, &mut buf).unwrap();
    assert_eq!(buf, page);
    assert!(dwb.is_created());
}

#[test]
fn many_writers_share_the_buffer() {
    common::setup_logger();
    let config = Config::tmp().unwrap().page_size(4096);
    let (volumes, dwb) = open(&config, 256);
    let dwb = Arc::new(dwb);

    let writers: Vec<_> = (0..8)
        .map(|writer| {
            let dwb = dwb.clone();
            thread::spawn(move || {
                for round in 1..=50 {
                    let vpid = Vpid::new(1, writer * 32 + round % 32);
                    let page = format_page(4096, vpid, Lsa::new(round as i64, writer), b"w");
                    dwb.add_page(vpid, &page).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    assert!(dwb.flush_force().unwrap());
    dwb.check_error().unwrap();

    let mut buf = vec![0; 4096];
    for writer in 0..8 {
        for round in 19..=50 {
            let vpid = Vpid::new(1, writer * 32 + round % 32);
            volumes.read_page(vpid, &mut buf).unwrap();
            assert!(!is_page_corrupted(&buf));
            assert!(page_lsa(&buf).pageid >= 19);
        }
    }
}

#[test]
fn recreate_with_zero_size_disables() {
    common::setup_logger();
    let config = Config::tmp().unwrap().page_size(4096);
    let (volumes, dwb) = open(&config, 8);

    let vpid = Vpid::new(1, 2);
    let page = format_page(4096, vpid, Lsa::new(1, 0), b"before");
    dwb.add_page(vpid, &page).unwrap();
    dwb.recreate(0, 8).unwrap();
    assert!(!dwb.is_created());
    assert_eq!(dwb.add_page(vpid, &page).unwrap(), Staged::Disabled);

    let mut buf = vec![0; 4096];
    volumes.read_page(vpid, &mut buf).unwrap();
    assert_eq!(buf, page);

    dwb.recreate(1024 * 1024, 2).unwrap();
    assert_eq!(dwb.geometry().unwrap().num_blocks, 2);
    assert_eq!(dwb.add_page(vpid, &page).unwrap(), Staged::Buffered);
}

fn newest_copy_is_readable(writes: Vec<(u8, u8)>) -> TestResult {
    if writes.is_empty() {
        return TestResult::discard();
    }
    let config = Config::tmp()
        .unwrap()
        .page_size(4096)
        .dwb_flush_daemon(false)
        .dwb_file_sync_helper(false);
    let (volumes, dwb) = open(&config, 8);

    let mut newest = HashMap::new();
    for (seq, (pageid, tag)) in writes.into_iter().enumerate() {
        let vpid = Vpid::new(1, i32::from(pageid % 8));
        let page = format_page(4096, vpid, Lsa::new(seq as i64, 0), &[tag]);
        dwb.add_page(vpid, &page).unwrap();
        newest.insert(vpid, page);
    }

    let mut buf = vec![0; 4096];
    for (vpid, page) in newest {
        if !dwb.read_page(vpid, &mut buf).unwrap() {
            volumes.read_page(vpid, &mut buf).unwrap();
        }
        if buf != page {
            return TestResult::failed();
        }
    }
    TestResult::passed()
}

#[test]
fn quickcheck_newest_copy_is_readable() {
    QuickCheck::new()
        .tests(30)
        .max_tests(100)
        .quickcheck(newest_copy_is_readable as fn(Vec<(u8, u8)>) -> TestResult);
}
