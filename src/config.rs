use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempdir::TempDir;

macro_rules! builder {
    ($(($name:ident, $get:ident, $set:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc="Get "]
            #[doc=$desc]
            pub fn $get(&self) -> $t {
                self.$name.clone()
            }

            #[doc="Set "]
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc="Builder, set "]
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

pub(crate) const DWB_MIN_SIZE: usize = 512 * 1024;
pub(crate) const DWB_MAX_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const DWB_MIN_BLOCKS: usize = 1;
pub(crate) const DWB_MAX_BLOCKS: usize = 8;

/// Top-level configuration for the double-write buffer, the
/// log and the recovery manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// The base directory holding volumes, the log and the double-write file.
    pub path: PathBuf,
    /// Size of one data page in bytes.
    pub page_size: usize,
    /// Total size of the double-write buffer. Zero disables it.
    pub double_write_buffer_size: usize,
    /// Number of blocks the double-write buffer is split into.
    pub double_write_buffer_blocks: usize,
    /// Flush full blocks on a background thread instead of the
    /// thread that filled them.
    pub dwb_flush_daemon: bool,
    /// Fsync data volumes on a helper thread while the flusher moves on.
    pub dwb_file_sync_helper: bool,
    /// Size of one log page in bytes.
    pub log_page_size: usize,
    /// Number of redo worker threads. Zero replays on the recovery thread.
    pub recovery_parallel_count: usize,
    /// Upper bound on redo jobs in flight when replaying in parallel.
    pub recovery_job_pool_size: usize,
    /// Bound on every blocking wait before the waiter retries.
    pub wait_timeout_ms: u64,
    tempdir_deleter: Option<Arc<TempDir>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: "keel_storage".into(),
            page_size: 16 * 1024,
            double_write_buffer_size: DWB_MIN_SIZE,
            double_write_buffer_blocks: DWB_MAX_BLOCKS,
            dwb_flush_daemon: true,
            dwb_file_sync_helper: true,
            log_page_size: 16 * 1024,
            recovery_parallel_count: 0,
            recovery_job_pool_size: 1024,
            wait_timeout_ms: 20,
            tempdir_deleter: None,
        }
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Returns a config in a fresh temporary directory that is
    /// removed once the last clone of this `Config` is dropped.
    pub fn tmp() -> std::io::Result<Config> {
        let tempdir = TempDir::new("keel_tmp")?;

        Ok(Config {
            path: tempdir.path().into(),
            tempdir_deleter: Some(Arc::new(tempdir)),
            ..Config::default()
        })
    }

    /// Set the path of the storage directory.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    builder!(
        (page_size, get_page_size, set_page_size, usize, "size of one data page"),
        (double_write_buffer_size, get_double_write_buffer_size, set_double_write_buffer_size, usize, "total double-write buffer size, zero disables it"),
        (double_write_buffer_blocks, get_double_write_buffer_blocks, set_double_write_buffer_blocks, usize, "number of double-write blocks"),
        (dwb_flush_daemon, get_dwb_flush_daemon, set_dwb_flush_daemon, bool, "whether full blocks are flushed by a background thread"),
        (dwb_file_sync_helper, get_dwb_file_sync_helper, set_dwb_file_sync_helper, bool, "whether volume fsyncs are handed to a helper thread"),
        (log_page_size, get_log_page_size, set_log_page_size, usize, "size of one log page"),
        (recovery_parallel_count, get_recovery_parallel_count, set_recovery_parallel_count, usize, "number of redo worker threads"),
        (recovery_job_pool_size, get_recovery_job_pool_size, set_recovery_job_pool_size, usize, "maximum number of redo jobs in flight"),
        (wait_timeout_ms, get_wait_timeout_ms, set_wait_timeout_ms, u64, "bound on blocking waits before retrying")
    );

    pub(crate) fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }

    /// The double-write geometry after clamping: total pages and
    /// pages per block, both powers of two. `None` when disabled.
    pub(crate) fn dwb_geometry(&self) -> Option<DwbGeometry> {
        DwbGeometry::compute(
            self.double_write_buffer_size,
            self.double_write_buffer_blocks,
            self.page_size,
        )
    }
}

/// Derived double-write buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DwbGeometry {
    pub num_blocks: usize,
    pub num_pages: usize,
    pub block_pages: usize,
    pub log2_block_pages: u32,
}

impl DwbGeometry {
    pub(crate) fn compute(
        size: usize,
        blocks: usize,
        page_size: usize,
    ) -> Option<DwbGeometry> {
        if size == 0 || page_size == 0 {
            return None;
        }

        let size = size.clamp(DWB_MIN_SIZE, DWB_MAX_SIZE).next_power_of_two();
        let num_blocks =
            blocks.clamp(DWB_MIN_BLOCKS, DWB_MAX_BLOCKS).next_power_of_two();

        let num_pages = (size / page_size).next_power_of_two();
        if num_pages < num_blocks {
            return None;
        }
        let block_pages = num_pages / num_blocks;

        Some(DwbGeometry {
            num_blocks,
            num_pages,
            block_pages,
            log2_block_pages: block_pages.trailing_zeros(),
        })
    }
}
