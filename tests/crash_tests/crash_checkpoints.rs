use std::thread;

use super::*;

const CHECKPOINT_EVERY: u32 = 7;

/// Same workload, with a checkpoint between transactions every few
/// commits so restarts begin their analysis mid-log.
pub fn run_crash_checkpoints() {
    let config = config_for(CHECKPOINTS_DIR);

    if let Err(e) = thread::spawn(|| run_inner(config, Some(CHECKPOINT_EVERY))).join() {
        println!("worker thread failed: {:?}", e);
        std::process::exit(15);
    }
}
