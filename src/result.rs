use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::SegmentId;

/// The top-level result type for dealing with
/// the segment usage file.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up
/// in both the expected and unexpected operation of a
/// `SegmentUsageFile`.
#[derive(Debug)]
pub enum Error {
    /// A segment number, range, selector or configuration value
    /// was outside of what the file accepts.
    InvalidArgument(String),
    /// The entry for this segment lives in a block that has not been
    /// materialized, and the operation was not allowed to create it.
    Hole {
        /// The segment whose entry could not be reached.
        segnum: SegmentId,
    },
    /// Corruption has been detected in the segment usage metadata.
    Corruption(String),
    /// A read or write error has happened when interacting with the
    /// backing store or the block device.
    Io(io::Error),
    /// No clean segment is left to allocate, or not enough clean
    /// segments remain to shrink the file.
    OutOfSpace,
    /// A segment in the requested range is dirty or active.
    Busy {
        /// The first segment found to be in use.
        segnum: SegmentId,
    },
}

impl Error {
    pub(crate) fn invalid<S: Into<String>>(why: S) -> Error {
        Error::InvalidArgument(why.into())
    }

    pub(crate) fn corruption<S: Into<String>>(what: S) -> Error {
        Error::Corruption(what.into())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            InvalidArgument(why) => InvalidArgument(why.clone()),
            Hole { segnum } => Hole { segnum: *segnum },
            Corruption(what) => Corruption(what.clone()),
            OutOfSpace => OutOfSpace,
            Busy { segnum } => Busy { segnum: *segnum },
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (InvalidArgument(l), InvalidArgument(r)) => l == r,
            (Hole { segnum: l }, Hole { segnum: r }) => l == r,
            (Corruption(l), Corruption(r)) => l == r,
            (OutOfSpace, OutOfSpace) => true,
            (Busy { segnum: l }, Busy { segnum: r }) => l == r,
            // io errors are never considered equal
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
        Error::Corruption(format!("undecodable segment usage metadata: {}", e))
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            InvalidArgument(ref why) => write!(f, "Invalid argument: {}", why),
            Hole { segnum } => write!(
                f,
                "Segment usage for segment {} is in a hole block",
                segnum
            ),
            Corruption(ref what) => {
                write!(f, "Segment usage metadata is corrupted: {}", what)
            }
            Io(ref e) => write!(f, "IO error: {}", e),
            OutOfSpace => write!(f, "No clean segment left"),
            Busy { segnum } => {
                write!(f, "Segment {} is dirty or active", segnum)
            }
        }
    }
}

/// The failure of a vector update, along with the number of
/// segment numbers from the head of the vector that were
/// already processed when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    /// How many leading segment numbers were modified.
    pub done: usize,
    /// Why the rest were abandoned.
    pub error: Error,
}

impl From<BatchError> for Error {
    fn from(be: BatchError) -> Error {
        be.error
    }
}

impl StdError for BatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.error)
    }
}

impl Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} segments were updated)", self.error, self.done)
    }
}
