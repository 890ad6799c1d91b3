//! Crate-wide error taxonomy. Variants map one-to-one onto the failure
//! kinds the pipeline can hit: delimiting (`PartialBlock`,
//! `BufferOverflow`), extraction (`NoMatch`, `Form`), delivery (`Sink`),
//! the filesystem (`Io`), state keeping (`Track`), watching (`Watch`),
//! locking (`CannotLock`) and configuration (`Config`).

use glob;
use notify;
use regex;
use sled;
use std::io;
use std::path::PathBuf;
use std::result;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used by every fallible function in the crate.
pub type Result<T> = result::Result<T, Error>;

/// Everything that can go wrong between a source file and a sink.
#[derive(Debug, Error)]
pub enum Error {
    /// A block could not be completed before end of stream.
    #[error("{path:?}[{begin}:{end}] is a partial block")]
    PartialBlock {
        /// File the partial block was read from.
        path: PathBuf,
        /// Byte position at which the block began.
        begin: u64,
        /// Byte position at which the stream gave out.
        end: u64,
    },

    /// A block did not terminate within the configured buffer.
    #[error("{path:?}[{begin}:{end}] partial block exceeds buffer size {limit}")]
    BufferOverflow {
        /// File the over-long block was read from.
        path: PathBuf,
        /// Byte position at which the block began.
        begin: u64,
        /// Byte position the buffer was abandoned at.
        end: u64,
        /// The configured maximum buffer size.
        limit: usize,
    },

    /// A block did not match its source's extraction pattern.
    #[error("{source_name} {path:?}[{begin}:{end}] does not match pattern")]
    NoMatch {
        /// Name of the source whose pattern failed.
        source_name: String,
        /// File the block was read from.
        path: PathBuf,
        /// Byte position at which the block began.
        begin: u64,
        /// Byte position at which the block ended.
        end: u64,
    },

    /// A form rejected the fields extracted from a block.
    #[error("{path:?}[{begin}:{end}] form mapping failed: {errors:?}")]
    Form {
        /// File the block was read from.
        path: PathBuf,
        /// Byte position at which the block began.
        begin: u64,
        /// Byte position at which the block ended.
        end: u64,
        /// What the form found objectionable.
        errors: Vec<String>,
    },

    /// A path could not be resolved to any of a channel's sources.
    #[error("unable to match {path:?} to a source of channel {channel}")]
    NoSource {
        /// The channel that was asked.
        channel: String,
        /// The path nothing matched.
        path: PathBuf,
    },

    /// The sink failed while accepting or flushing.
    #[error("sink error: {0}")]
    Sink(String),

    /// An underlying file operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The offset store failed.
    #[error("tracker error: {0}")]
    Track(String),

    /// The filesystem watcher failed.
    #[error("watch error: {0}")]
    Watch(String),

    /// The channel lock could not be acquired in time.
    #[error("channel {channel} lock {path:?} cannot be acquired - \
             timeout={timeout:?}, attempts={attempts}")]
    CannotLock {
        /// The channel whose lock was contended.
        channel: String,
        /// The lock file.
        path: PathBuf,
        /// How long we were willing to wait.
        timeout: Option<Duration>,
        /// How many acquisition attempts were made.
        attempts: u32,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True when the error is a missing-file report, which the worker
    /// treats as an implicit delete of the path.
    pub fn is_not_found(&self) -> bool {
        match *self {
            Error::Io(ref e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Error {
        Error::Track(e.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(e: notify::Error) -> Error {
        Error::Watch(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Error {
        Error::Config(e.to_string())
    }
}

impl From<glob::PatternError> for Error {
    fn from(e: glob::PatternError) -> Error {
        Error::Config(e.to_string())
    }
}
