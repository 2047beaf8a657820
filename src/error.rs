use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::{Lsa, Vpid};

/// The top-level result type for the double-write buffer and
/// the recovery manager.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up
/// while buffering pages or while recovering after a crash.
#[derive(Debug)]
pub enum Error {
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An unexpected bug has happened. Please open an issue!
    ReportableBug(String),
    /// A read or write error has happened when interacting with the file
    /// system.
    Io(io::Error),
    /// Corruption has been detected in the write-ahead log.
    Corruption {
        /// The log address that corrupted data was found at.
        at: Lsa,
    },
    /// A data page failed its checksum and no intact copy was available.
    CorruptedPage {
        /// The page that failed the check.
        vpid: Vpid,
    },
    /// A log record referenced a recovery index with no registered functions.
    RecoveryFunctionMissing(u16),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
            Corruption { at } => Corruption { at: *at },
            CorruptedPage { vpid } => CorruptedPage { vpid: *vpid },
            RecoveryFunctionMissing(idx) => RecoveryFunctionMissing(*idx),
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (Unsupported(l), Unsupported(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (Corruption { at: l }, Corruption { at: r }) => l == r,
            (CorruptedPage { vpid: l }, CorruptedPage { vpid: r }) => l == r,
            (RecoveryFunctionMissing(l), RecoveryFunctionMissing(r)) => l == r,
            // io errors carry no meaningful equality
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(ioe) => Error::Io(ioe),
            other => Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unable to decode: {:?}", other),
            )),
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use self::Error::*;

        match error {
            Io(ioe) => ioe,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { at } => {
                write!(f, "Read corrupted log data at {}", at)
            }
            CorruptedPage { vpid } => {
                write!(f, "Page {} failed its checksum", vpid)
            }
            RecoveryFunctionMissing(idx) => {
                write!(f, "No recovery functions registered for index {}", idx)
            }
        }
    }
}
