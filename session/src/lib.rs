//! Session-wide configuration and host services for the duracheck analysis
//! core.
//!
//! The analysis core runs embedded in an instrumentation host which serializes
//! every guest event through a single callback. This crate holds everything
//! that is shared across the analysis subsystems but owned by neither of them:
//! the configuration knobs ([Options]), the identifiers passed in event
//! arguments ([ThreadId], [TxId]), and the host stack-trace service
//! ([StackSource]) behind which captured callstacks stay opaque.

use core::fmt;

mod cacheline;
mod options;
mod stacks;

pub use self::{
    cacheline::{DEFAULT_CACHE_LINE, native_cache_line_size},
    options::Options,
    stacks::{ContextHandle, NullStackSource, StackSource, TraceTable},
};

/// Identifier of a guest thread, as delivered by the instrumentation host in
/// event arguments.
///
/// The core never inspects thread state; the id is only a key for the
/// thread-to-transaction mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ThreadId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Caller-supplied transaction identifier.
///
/// Callers commonly use the running thread id as the transaction id, but any
/// token is accepted; transactions with the same id nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ThreadId> for TxId {
    fn from(id: ThreadId) -> Self {
        Self(id.0)
    }
}
