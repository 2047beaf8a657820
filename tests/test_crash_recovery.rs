mod common;
mod crash_tests;

use std::env::{self, VarError};
use std::process::Command;
use std::thread;

use common::cleanup;

const TEST_ENV_VAR: &str = "KEEL_CRASH_TEST";
const N_TESTS: usize = 50;

const TESTS: [&str; 2] = [crash_tests::TRANSACTIONS_DIR, crash_tests::CHECKPOINTS_DIR];

fn main() {
    // Don't actually run this harness=false test under miri, as it requires
    // spawning and killing child processes.
    if cfg!(miri) {
        return;
    }

    common::setup_logger();

    match env::var(TEST_ENV_VAR) {
        Err(VarError::NotPresent) => {
            let filtered: Vec<&'static str> =
                if let Some(filter) = std::env::args().nth(1) {
                    TESTS
                        .iter()
                        .filter(|name| name.contains(&filter))
                        .cloned()
                        .collect()
                } else {
                    TESTS.to_vec()
                };

            let filtered_len = filtered.len();

            println!();
            println!(
                "running {} test{}",
                filtered.len(),
                if filtered.len() == 1 { "" } else { "s" },
            );

            let mut tests = vec![];
            for test_name in filtered.into_iter() {
                let test = thread::spawn(move || {
                    let res =
                        std::panic::catch_unwind(|| supervisor(test_name));
                    println!(
                        "test {} ... {}",
                        test_name,
                        if res.is_ok() { "ok" } else { "panicked" }
                    );
                    res.unwrap();
                });
                tests.push((test_name, test));
            }

            for (test_name, test) in tests.into_iter() {
                test.join().expect(test_name);
            }

            println!();
            println!(
                "test result: ok. {} passed; {} filtered out",
                filtered_len,
                TESTS.len() - filtered_len,
            );
            println!();
        }

        Ok(ref s) if s == crash_tests::TRANSACTIONS_DIR => {
            crash_tests::run_crash_transactions()
        }
        Ok(ref s) if s == crash_tests::CHECKPOINTS_DIR => {
            crash_tests::run_crash_checkpoints()
        }
        Ok(other) => panic!("invalid crash test case: {other}"),
        Err(e) => panic!("env var {TEST_ENV_VAR} unable to be read: {e:?}"),
    }
}

fn crash_dir(name: &str) -> String {
    format!("crash_test_files/{}", name)
}

fn run_child_process(name: &str) {
    let bin = env::current_exe().expect("could not get test binary path");

    let status_res = Command::new(bin)
        .env(TEST_ENV_VAR, name)
        .spawn()
        .unwrap_or_else(|_| {
            panic!("could not spawn child process for {} test", name)
        })
        .wait();

    match status_res {
        Ok(status) => {
            let code = status.code();

            if code.is_none() || code.unwrap() != 9 {
                cleanup(&crash_dir(name));
                panic!("{} test child exited abnormally", name);
            }
        }
        Err(e) => {
            cleanup(&crash_dir(name));
            panic!("error waiting for {} test child: {}", name, e);
        }
    }
}

fn supervisor(name: &str) {
    cleanup(&crash_dir(name));

    for _ in 0..N_TESTS {
        run_child_process(name);
    }

    let counter = crash_tests::recover_and_verify(&crash_tests::config_for(name));
    log::info!("{} survived {} crashes, last counter {}", name, N_TESTS, counter);

    cleanup(&crash_dir(name));
}
