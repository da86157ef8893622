//! Event dispatch for the duracheck analysis core.
//!
//! The instrumentation host funnels every observed guest event — stores,
//! cache-line flushes, fences, and user annotations — through a [Checker],
//! which applies the persistence filter, drives the store state machine and
//! the transaction tracker, emits the optional store log, and renders the
//! final report.

mod checker;
mod events;
mod log_stream;
mod report;
mod resolve;

pub use self::{
    checker::Checker,
    events::{Event, Outcome},
    resolve::{FdResolver, ProcSelfFd},
};
