//! Kernel error codes
use core::fmt;

/// The error codes returned by kernel operations.
///
/// The discriminants are negative by convention so that a port or binding
/// layer can pass them through a C-style `isize` return channel unchanged.
#[repr(i8)]
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum Error {
    /// A precondition was violated (wrong object state, wrong owner, an
    /// oversized message), or the object was torn down while the caller was
    /// waiting on it.
    Failed = -1,

    /// A bounded wait expired before the resource became available.
    Timeout = -2,

    /// A non-blocking send found the mailbox or message queue at capacity.
    Full = -3,

    /// A non-blocking receive found the mailbox or message queue empty.
    Empty = -4,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Failed => "Failed",
            Self::Timeout => "Timeout",
            Self::Full => "Full",
            Self::Empty => "Empty",
        })
    }
}

/// The result type of kernel operations. `Ok(())` corresponds to the
/// conventional `EOK`.
pub type Result<T = ()> = core::result::Result<T, Error>;
