use std::process::exit;
use std::thread;
use std::time::Duration;

use rand::Rng;

use keel::{Config, PageBuffer, RecoveryOptions, Vpid};

use crate::common::{self, Store, VOLID};

mod crash_checkpoints;
mod crash_transactions;

pub use crash_checkpoints::run_crash_checkpoints;
pub use crash_transactions::run_crash_transactions;

// test names, also used as dir names
pub const TRANSACTIONS_DIR: &str = "transactions";
pub const CHECKPOINTS_DIR: &str = "checkpoints";

const CRASH_DIR: &str = "crash_test_files";

/// Pages every transaction writes its counter to.
const SLOTS: i32 = 12;

fn spawn_killah() {
    thread::spawn(|| {
        let runtime = rand::rng().random_range(0..60_000);
        thread::sleep(Duration::from_micros(runtime));
        exit(9);
    });
}

pub fn config_for(dir: &str) -> Config {
    Config::new()
        .path(std::path::Path::new(CRASH_DIR).join(dir))
        .page_size(common::PAGE)
        .log_page_size(common::PAGE)
}

fn slot(pageid: i32) -> Vpid {
    Vpid::new(VOLID, pageid)
}

fn counter_at(store: &Store, pageid: i32) -> u32 {
    let bytes = store.read(slot(pageid), 0, 4);
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Every slot must carry the counter of the same committed
/// transaction. Returns that counter.
fn verify(store: &Store) -> u32 {
    let first = counter_at(store, 0);
    for pageid in 1..SLOTS {
        let value = counter_at(store, pageid);
        assert_eq!(
            value, first,
            "slot {} holds {} while slot 0 holds {}",
            pageid, value, first
        );
    }
    first
}

/// Opens the store, recovers it and checks the slots.
pub fn recover_and_verify(config: &Config) -> u32 {
    let mut store = Store::open(config);
    let outcome = store.recover(&common::functions(), RecoveryOptions::default());
    assert!(outcome.table.is_empty(), "transactions survived recovery: {:?}", outcome.table);
    verify(&store)
}

/// Writes transaction after transaction until the killer thread ends
/// the process. Some transactions push their pages out half way, so
/// a crash leaves uncommitted changes on disk.
fn run_inner(config: Config, checkpoint_every: Option<u32>) {
    let crash_during_initialization = rand::rng().random_bool(0.1);

    if crash_during_initialization {
        spawn_killah();
    }

    let functions = common::functions();
    let mut store = Store::open(&config);
    store.recover(&functions, RecoveryOptions::default());
    let mut counter = verify(&store);

    if !crash_during_initialization {
        spawn_killah();
    }

    loop {
        counter += 1;
        let mut tdes = store.begin();
        for pageid in 0..SLOTS {
            store.write(&mut tdes, slot(pageid), 0, &counter.to_le_bytes());
            if pageid == SLOTS / 2 && counter % 3 == 0 {
                store.log.flush().unwrap();
                store.page_buffer.flush_all().unwrap();
            }
        }
        store.commit(&mut tdes, i64::from(counter));

        if let Some(every) = checkpoint_every {
            if counter % every == 0 {
                let Store { log, meta, page_buffer, .. } = &mut store;
                log.checkpoint(&keel::TranTable::new(), meta, page_buffer).unwrap();
            }
        }
    }
}
