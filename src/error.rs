//! Status codes and error type for the interop boundary
//!
//! The ABI reports `Status` values; the Rust API wraps the non-`Ok` ones
//! in `Error`. Contract violations (double close, out-of-order close,
//! wrong thread) are never represented here: there is no safe recovery
//! from a corrupted async stack, so those paths fail fast instead (see
//! `scope`).

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// C-ABI status codes. Stable across runtime-internal changes; addon code
/// compiled against one ABI version keeps working against later runtimes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    InvalidArg = 1,
    ObjectExpected = 2,
    StringExpected = 3,
    FunctionExpected = 4,
    NumberExpected = 5,
    GenericFailure = 6,
    PendingException = 7,
    Cancelled = 8,
    ScopeMismatch = 9,
}

impl Status {
    fn describe(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::InvalidArg => "invalid argument",
            Status::ObjectExpected => "an object was expected",
            Status::StringExpected => "a string was expected",
            Status::FunctionExpected => "a function was expected",
            Status::NumberExpected => "a number was expected",
            Status::GenericFailure => "no environment is bound to the current thread",
            Status::PendingException => "an exception is pending",
            Status::Cancelled => "the operation was cancelled",
            Status::ScopeMismatch => "scope open/close pairing mismatch",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Error carried by the Rust-side API. A thin wrapper so call sites see
/// the same taxonomy the ABI reports.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    status: Status,
}

impl Error {
    pub fn new(status: Status) -> Self {
        debug_assert!(status != Status::Ok, "Ok is not an error");
        Self { status }
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({:?})", self.status)
    }
}

impl std::error::Error for Error {}
