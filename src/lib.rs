//! `keel` is the crash-safety core of a page-based storage engine.
//!
//! It has two halves:
//!
//! * the [`DoubleWriteBuffer`], which stages every page write in a
//!   sequential mirror file before the page reaches its real location,
//!   so a torn write can always be repaired at restart;
//! * ARIES-style recovery ([`recover`]), which scans the write-ahead
//!   log from the last checkpoint, replays it and rolls back the
//!   transactions that never finished.
//!
//! A minimal set of collaborators ships with the crate so it can be
//! driven on its own: [`FileVolumes`] for page I/O, [`LogManager`] for
//! the write-ahead log and [`DwbPageBuffer`] as a page cache that
//! writes through the double-write buffer.
//!
//! ```
//! use std::sync::Arc;
//!
//! use keel::{Config, DoubleWriteBuffer, FileVolumes, Staged, Volumes, Vpid};
//!
//! # fn main() -> keel::Result<()> {
//! let config = Config::tmp()?.page_size(4096);
//! let volumes = Arc::new(FileVolumes::open(&config.path, 4096)?);
//! volumes.format(1, 16)?;
//!
//! let dwb = DoubleWriteBuffer::open(&config, volumes.clone())?;
//! dwb.load_and_recover_pages()?;
//!
//! let vpid = Vpid::new(1, 3);
//! let page = keel::format_page(4096, vpid, keel::Lsa::new(0, 0), b"hello");
//! assert_eq!(dwb.add_page(vpid, &page)?, Staged::Buffered);
//! assert!(dwb.flush_force()?);
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod config;
mod dwb;
mod error;
#[cfg(feature = "for-internal-testing-only")]
mod event_verifier;
mod ids;
mod log;
mod meta;
mod page;
mod page_buffer;
mod recovery;
mod rv;
mod tdes;
mod volume;

pub use crate::checkpoint::{CheckpointInfo, SysopInfo, TranInfo};
pub use crate::config::{Config, DwbGeometry};
pub use crate::dwb::{DoubleWriteBuffer, RecoveredPages, Staged};
pub use crate::error::{Error, Result};
pub use crate::ids::{
    Lsa, MvccId, TranId, Vpid, MVCCID_NULL, NULL_LSA, NULL_TRANID, NULL_VPID,
};
pub use crate::log::{
    LogHeader, LogManager, LogRecord, PageOp, RecordBody, RecordHeader,
    RecordType, SysopEnd, SysopEndKind,
};
pub use crate::meta::Meta;
pub use crate::page::{
    format_page, is_page_corrupted, page_lsa, page_vpid, stamp_checksum,
    PAGE_HEADER_SIZE,
};
pub use crate::page_buffer::{DwbPageBuffer, Frame, PageBuffer, PageGuard};
pub use crate::recovery::{
    recover, RecoveryEnv, RecoveryOptions, RecoveryOutcome, ServerRole,
};
pub use crate::rv::{Rcv, RecoveryFunction, RecoveryFunctions, RvFn};
pub use crate::tdes::{Tdes, TopOp, TopOps, TranState, TranTable};
pub use crate::volume::{FileVolumes, Volumes};
