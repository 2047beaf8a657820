use std::thread;

use super::*;

pub fn run_crash_transactions() {
    let config = config_for(TRANSACTIONS_DIR);

    if let Err(e) = thread::spawn(|| run_inner(config, None)).join() {
        println!("worker thread failed: {:?}", e);
        std::process::exit(15);
    }
}
