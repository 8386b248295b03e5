//! Crate-wide error taxonomy.
//!
//! Every fallible core operation returns one of these kinds (spec §7). The
//! variants are deliberately coarse — they identify *why* an operation ended,
//! not the low-level cause, which is carried in the `source` where one
//! exists.
use std::io;

use thiserror::Error;

/// Abstract error kind shared by every component in the core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// The operation succeeded. Used as a stop code, not returned from `Result`s.
    #[error("success")]
    Success,
    /// The owning service has been stopped.
    #[error("service stopped")]
    ServiceStopped,
    /// A precondition was violated (e.g. double start).
    #[error("operation failed")]
    OperationFailed,
    /// The requested item does not exist.
    #[error("not found")]
    NotFound,
    /// A filesystem operation failed.
    #[error("file system error")]
    FileSystem,
    /// Hostname resolution failed.
    #[error("resolve failed")]
    ResolveFailed,
    /// An inbound connection was rejected.
    #[error("accept failed")]
    AcceptFailed,
    /// A configured timer expired.
    #[error("channel timeout")]
    ChannelTimeout,
    /// The channel has stopped (used as a terminal broadcast code).
    #[error("channel stopped")]
    ChannelStopped,
    /// Malformed data was received on the wire.
    #[error("bad stream")]
    BadStream,
    /// The peer's address is blacklisted.
    #[error("address blocked")]
    AddressBlocked,
    /// The address is already registered (duplicate channel/nonce).
    #[error("address in use")]
    AddressInUse,
    /// Seeding did not yield any net-new addresses.
    #[error("peer throttling")]
    PeerThrottling,
}

impl Code {
    /// Terminal codes clear a protocol's event-handler slot permanently.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Code::ChannelStopped | Code::ServiceStopped)
    }
}

/// Crate error, wrapping a [`Code`] with an optional underlying cause.
#[derive(Error, Debug)]
pub enum Error {
    /// A plain abstract code, with no further context.
    #[error("{0}")]
    Code(Code),
    /// An I/O error occurred; mapped to [`Code::BadStream`] or
    /// [`Code::FileSystem`] by the caller depending on context.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The abstract code this error maps to.
    pub fn code(&self) -> Code {
        match self {
            Error::Code(c) => *c,
            Error::Io(_) => Code::FileSystem,
        }
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Error::Code(code)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
