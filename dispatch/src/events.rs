use duracheck_session::TxId;
use duracheck_track::RegionCover;
use duracheck_tx::TxError;
use smallvec::SmallVec;

/// The abstract event stream delivered by the instrumentation host.
///
/// Addresses and sizes are raw guest values; the running thread is passed
/// alongside the event, not inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new translation superblock was entered.
    SbEnter,
    /// A store of up to 64 bits.
    Store { addr: u64, size: u64, value: u64 },
    /// A wide vector store, already cut into 64-bit lanes by the host
    /// decoder, lowest-addressed lane first.
    VectorStore { addr: u64, lanes: SmallVec<[u64; 4]> },
    /// A cache-line writeback over a range.
    Flush { addr: u64, size: u64 },
    /// A store-ordering barrier.
    Fence,
    /// The platform commit primitive (full model only).
    Commit,
    RegisterMapping { addr: u64, size: u64 },
    RemoveMapping { addr: u64, size: u64 },
    CheckMapping { addr: u64, size: u64 },
    /// Begin a transaction; `None` uses the running thread id.
    BeginTx { tx: Option<TxId> },
    /// End a transaction; `None` uses the running thread id.
    EndTx { tx: Option<TxId> },
    AddObj { tx: TxId, addr: u64, size: u64 },
    RemoveObj { tx: TxId, addr: u64, size: u64 },
    AttachThread { tx: TxId },
    DetachThread { tx: TxId },
    AddLogRegion { addr: u64, size: u64 },
    RemoveLogRegion { addr: u64, size: u64 },
    EnableLogging,
    DisableLogging,
    AddGlobalExclude { addr: u64, size: u64 },
    /// Forget all tracked bytes in the range.
    SetClean { addr: u64, size: u64 },
    /// Pass an arbitrary marker through to the store log.
    EmitLog(String),
    /// Print the report on demand.
    WriteStats,
    RegisterFile { fd: i32, addr: u64, size: u64, offset: u64 },
}

/// Per-event reply of [Checker::handle_event](crate::Checker::handle_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event was consumed and produced no reply.
    Handled,
    /// Reply to [Event::CheckMapping].
    Cover(RegionCover),
    /// Result code of a transaction annotation.
    Tx(Result<(), TxError>),
    /// Whether a [Event::RegisterFile] resolved and was logged.
    FileRegistered(bool),
}
