//! Error type shared by every logsig crate.
//!
//! The variants mirror the failure classes the task drivers distinguish:
//! only [`Error::VerificationFailure`] may be recovered per block (under
//! continue-on-fail), everything else aborts the current file.

use serde::Serialize;
use std::io;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure classes raised while processing log signature files.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Usage error: bad option, bad extract position list, and so on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed or truncated input stream.
    #[error("invalid input format: {0}")]
    InvalidInputFormat(String),

    /// A recomputed hash, link, time or signature did not check out.
    #[error("verification failed: {0}")]
    VerificationFailure(String),

    /// A bounded buffer would have to grow past its hard limit.
    #[error("{what} exceeds the limit of {limit} bytes")]
    IndexOverflow {
        /// What was being buffered.
        what: String,
        /// The configured cap.
        limit: usize,
    },

    /// File open/read/write/lock/rename failure.
    #[error("I/O error: {context}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The signing service declined to sign.
    #[error("signing failed: {0}")]
    SigningFailure(String),

    /// A precondition was not met and processing stopped without doing anything.
    #[error("skipped: {0}")]
    VerificationSkipped(String),
}

/// Payload-free discriminant of [`Error`], handy for exit codes and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// See [`Error::InvalidArgument`].
    InvalidArgument,
    /// See [`Error::InvalidInputFormat`].
    InvalidInputFormat,
    /// See [`Error::VerificationFailure`].
    VerificationFailure,
    /// See [`Error::IndexOverflow`].
    IndexOverflow,
    /// See [`Error::Io`].
    Io,
    /// See [`Error::SigningFailure`].
    SigningFailure,
    /// See [`Error::VerificationSkipped`].
    VerificationSkipped,
}

impl Error {
    /// Kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidInputFormat(_) => ErrorKind::InvalidInputFormat,
            Self::VerificationFailure(_) => ErrorKind::VerificationFailure,
            Self::IndexOverflow { .. } => ErrorKind::IndexOverflow,
            Self::Io { .. } => ErrorKind::Io,
            Self::SigningFailure(_) => ErrorKind::SigningFailure,
            Self::VerificationSkipped(_) => ErrorKind::VerificationSkipped,
        }
    }

    /// Shorthand for [`Error::InvalidInputFormat`].
    pub fn format(msg: impl Into<String>) -> Self {
        Self::InvalidInputFormat(msg.into())
    }

    /// Shorthand for [`Error::VerificationFailure`].
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::VerificationFailure(msg.into())
    }

    /// Shorthand for [`Error::InvalidArgument`].
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Wrap an I/O error with a description of the attempted operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Prefix the message with the block it refers to.
    ///
    /// I/O errors keep their context untouched apart from the prefix; the
    /// kind never changes.
    #[must_use]
    pub fn in_block(self, block_no: u64) -> Self {
        let prefix = |m: String| format!("block {block_no}: {m}");
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(prefix(m)),
            Self::InvalidInputFormat(m) => Self::InvalidInputFormat(prefix(m)),
            Self::VerificationFailure(m) => Self::VerificationFailure(prefix(m)),
            Self::SigningFailure(m) => Self::SigningFailure(prefix(m)),
            Self::VerificationSkipped(m) => Self::VerificationSkipped(prefix(m)),
            Self::Io { context, source } => Self::Io {
                context: prefix(context),
                source,
            },
            e @ Self::IndexOverflow { .. } => e,
        }
    }
}

/// Attach a description to a raw `io::Result`.
pub trait IoContext<T> {
    /// Map the error into [`Error::Io`] with a lazily built context.
    fn io_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::io(f(), e))
    }
}
