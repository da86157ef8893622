use std::{
    io::{self, Write as _},
    sync::Arc,
};

use duracheck_session::{Options, StackSource, ThreadId, TxId};
use duracheck_track::{
    DiagnosticOverflow, MAX_STORE_SIZE, MemRegion, RegionCover, RegionRegistry, Store,
    StoreTracker, TrackerConfig,
};
use duracheck_tx::{TxError, TxTracker};

use crate::{
    events::{Event, Outcome},
    log_stream::EventLog,
    report,
    resolve::{FdResolver, ProcSelfFd},
};

/// The process-wide analysis context.
///
/// Owns the store tracker, the region registry, the transaction tracker, the
/// store log and the diagnostic buffers, and routes every host event to them.
/// The host serializes events, so no internal synchronization exists; one
/// `Checker` serves the whole analyzed process.
pub struct Checker {
    options: Options,
    stacks: Arc<dyn StackSource>,
    resolver: Box<dyn FdResolver>,
    /// Ordinal of the current translation superblock.
    sblocks: u64,
    registry: RegionRegistry,
    stores: StoreTracker,
    tx: TxTracker,
    log: EventLog,
    /// Runtime store-log toggle, seeded from `options.log_stores`.
    logging_on: bool,
}

impl Checker {
    /// Create a checker with the given options and host stack service.
    ///
    /// The store log goes to stdout and file descriptors resolve through
    /// `/proc/self/fd`; see [with_log_sink](Self::with_log_sink) and
    /// [with_fd_resolver](Self::with_fd_resolver).
    pub fn new(options: Options, stacks: Arc<dyn StackSource>) -> Self {
        let logging_on = options.log_stores;
        Self {
            stores: StoreTracker::new(TrackerConfig::from_options(&options)),
            tx: TxTracker::new(options.transactions_only),
            registry: RegionRegistry::new(),
            log: EventLog::new(Box::new(io::stdout())),
            resolver: Box::new(ProcSelfFd),
            logging_on,
            sblocks: 0,
            options,
            stacks,
        }
    }

    /// Redirect the store log to `sink`.
    pub fn with_log_sink(mut self, sink: Box<dyn io::Write>) -> Self {
        self.log = EventLog::new(sink);
        self
    }

    /// Replace the fd-to-path resolution service.
    pub fn with_fd_resolver(mut self, resolver: Box<dyn FdResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Route one event from the host stream.
    ///
    /// `thread` is the guest thread the event was observed on. The only
    /// error is a diagnostic buffer overflow, on which the host is expected
    /// to call [abort_with_report](Self::abort_with_report) or fail on its
    /// own terms; transaction result codes are part of the [Outcome].
    pub fn handle_event(
        &mut self,
        thread: ThreadId,
        event: Event,
    ) -> Result<Outcome, DiagnosticOverflow> {
        match event {
            Event::SbEnter => {
                self.enter_superblock();
                Ok(Outcome::Handled)
            }
            Event::Store { addr, size, value } => {
                self.store(thread, addr, size, value)?;
                Ok(Outcome::Handled)
            }
            Event::VectorStore { addr, lanes } => {
                self.vector_store(thread, addr, &lanes)?;
                Ok(Outcome::Handled)
            }
            Event::Flush { addr, size } => {
                self.flush(thread, addr, size)?;
                Ok(Outcome::Handled)
            }
            Event::Fence => {
                self.fence();
                Ok(Outcome::Handled)
            }
            Event::Commit => {
                self.commit();
                Ok(Outcome::Handled)
            }
            Event::RegisterMapping { addr, size } => {
                self.register_mapping(addr, size);
                Ok(Outcome::Handled)
            }
            Event::RemoveMapping { addr, size } => {
                self.remove_mapping(addr, size);
                Ok(Outcome::Handled)
            }
            Event::CheckMapping { addr, size } => Ok(Outcome::Cover(self.check_mapping(addr, size))),
            Event::BeginTx { tx } => {
                self.begin_tx(thread, tx);
                Ok(Outcome::Handled)
            }
            Event::EndTx { tx } => tx_outcome(self.end_tx(thread, tx)),
            Event::AddObj { tx, addr, size } => tx_outcome(self.add_obj(thread, tx, addr, size)),
            Event::RemoveObj { tx, addr, size } => {
                tx_outcome(self.remove_obj(thread, tx, addr, size))
            }
            Event::AttachThread { tx } => tx_outcome(self.attach_thread(thread, tx)),
            Event::DetachThread { tx } => tx_outcome(self.detach_thread(thread, tx)),
            Event::AddLogRegion { addr, size } => {
                self.add_log_region(addr, size);
                Ok(Outcome::Handled)
            }
            Event::RemoveLogRegion { addr, size } => {
                self.remove_log_region(addr, size);
                Ok(Outcome::Handled)
            }
            Event::EnableLogging => {
                self.set_logging(true);
                Ok(Outcome::Handled)
            }
            Event::DisableLogging => {
                self.set_logging(false);
                Ok(Outcome::Handled)
            }
            Event::AddGlobalExclude { addr, size } => {
                self.add_global_exclude(addr, size);
                Ok(Outcome::Handled)
            }
            Event::SetClean { addr, size } => {
                self.set_clean(addr, size);
                Ok(Outcome::Handled)
            }
            Event::EmitLog(marker) => {
                self.emit_log(&marker);
                Ok(Outcome::Handled)
            }
            Event::WriteStats => {
                let mut err = io::stderr().lock();
                if let Err(error) = report::write_report(self, &mut err) {
                    log::warn!(target: "dispatch", "failed to print report: {error}");
                }
                Ok(Outcome::Handled)
            }
            Event::RegisterFile {
                fd,
                addr,
                size,
                offset,
            } => Ok(Outcome::FileRegistered(self.register_file(fd, addr, size, offset))),
        }
    }

    /// Count a translation superblock entry.
    pub fn enter_superblock(&mut self) {
        self.sblocks += 1;
    }

    /// Handle an observed store of up to 64 bits.
    pub fn store(
        &mut self,
        thread: ThreadId,
        addr: u64,
        size: u64,
        value: u64,
    ) -> Result<(), DiagnosticOverflow> {
        debug_assert!((1..=MAX_STORE_SIZE).contains(&size), "store of {size} bytes");
        let region = MemRegion::new(addr, size);
        // fast path: stores outside registered persistent mappings
        if !self.registry.is_pmem_access(region) {
            return Ok(());
        }
        let context = self.stacks.capture(thread);
        let store = Store::dirty(region, value, self.sblocks, context);

        if self.logging_on || self.registry.loggable_covers(region) {
            let written = self.log_store_record(&store);
            log_emit(written);
        }

        self.stores.handle_store(store.clone(), self.stacks.as_ref())?;
        self.tx.handle_store(thread, &store)?;
        Ok(())
    }

    fn log_store_record(&mut self, store: &Store) -> io::Result<()> {
        self.log.store(store.region.addr, store.value, store.region.size)?;
        if self.options.log_store_traces {
            let frames = self.stacks.frames(store.context);
            self.log.store_trace(&frames, self.options.log_store_trace_depth)?;
        }
        Ok(())
    }

    /// Handle a wide vector store by decomposing it into 64-bit lanes, one
    /// narrow store per lane.
    pub fn vector_store(
        &mut self,
        thread: ThreadId,
        addr: u64,
        lanes: &[u64],
    ) -> Result<(), DiagnosticOverflow> {
        for (index, &lane) in lanes.iter().enumerate() {
            self.store(thread, addr + index as u64 * 8, 8, lane)?;
        }
        Ok(())
    }

    /// Handle a cache-line flush over a range.
    pub fn flush(
        &mut self,
        thread: ThreadId,
        addr: u64,
        size: u64,
    ) -> Result<(), DiagnosticOverflow> {
        let (addr, size) = self.options.align_flush(addr, size);
        let region = MemRegion::new(addr, size);
        if self.logging_on {
            log_emit(self.log.flush_record(addr, size));
        }
        let context = self.stacks.capture(thread);
        self.stores.flush(region, context)
    }

    /// Handle a store-ordering fence.
    pub fn fence(&mut self) {
        if self.logging_on {
            log_emit(self.log.fence());
        }
        self.stores.fence();
    }

    /// Handle the platform commit primitive.
    pub fn commit(&mut self) {
        if self.logging_on {
            log_emit(self.log.commit());
        }
        self.stores.commit();
    }

    pub fn register_mapping(&mut self, addr: u64, size: u64) {
        self.registry.register_mapping(MemRegion::new(addr, size));
    }

    pub fn remove_mapping(&mut self, addr: u64, size: u64) {
        self.registry.remove_mapping(MemRegion::new(addr, size));
    }

    pub fn check_mapping(&self, addr: u64, size: u64) -> RegionCover {
        self.registry.check_mapping(MemRegion::new(addr, size))
    }

    /// The registered persistent mappings, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = MemRegion> + '_ {
        self.registry.mappings()
    }

    /// Begin a transaction; without an explicit id the running thread id is
    /// used.
    pub fn begin_tx(&mut self, thread: ThreadId, tx: Option<TxId>) {
        let tx = tx.unwrap_or_else(|| thread.into());
        let context = self.stacks.capture(thread);
        self.tx.begin(thread, tx, context);
    }

    /// End a transaction; without an explicit id the running thread id is
    /// used.
    pub fn end_tx(&mut self, thread: ThreadId, tx: Option<TxId>) -> Result<(), TxError> {
        self.tx.end(tx.unwrap_or_else(|| thread.into()))
    }

    pub fn add_obj(
        &mut self,
        thread: ThreadId,
        tx: TxId,
        addr: u64,
        size: u64,
    ) -> Result<(), TxError> {
        let context = self.stacks.capture(thread);
        self.tx.add_obj(thread, tx, MemRegion::new(addr, size), context)
    }

    pub fn remove_obj(
        &mut self,
        thread: ThreadId,
        tx: TxId,
        addr: u64,
        size: u64,
    ) -> Result<(), TxError> {
        self.tx.remove_obj(thread, tx, MemRegion::new(addr, size))
    }

    pub fn attach_thread(&mut self, thread: ThreadId, tx: TxId) -> Result<(), TxError> {
        self.tx.attach_thread(thread, tx)
    }

    pub fn detach_thread(&mut self, thread: ThreadId, tx: TxId) -> Result<(), TxError> {
        self.tx.detach_thread(thread, tx)
    }

    pub fn add_log_region(&mut self, addr: u64, size: u64) {
        self.registry.add_log_region(MemRegion::new(addr, size));
    }

    pub fn remove_log_region(&mut self, addr: u64, size: u64) {
        self.registry.remove_log_region(MemRegion::new(addr, size));
    }

    /// Toggle the runtime store-log switch.
    pub fn set_logging(&mut self, on: bool) {
        self.logging_on = on;
    }

    pub fn add_global_exclude(&mut self, addr: u64, size: u64) {
        self.tx.add_exclude(MemRegion::new(addr, size));
    }

    /// Forget all tracked bytes in the range, without diagnostics.
    pub fn set_clean(&mut self, addr: u64, size: u64) {
        self.stores.set_clean(MemRegion::new(addr, size));
    }

    /// Pass a caller-supplied marker through to the store log.
    pub fn emit_log(&mut self, marker: &str) {
        if self.logging_on {
            log_emit(self.log.marker(marker));
        }
    }

    /// Resolve a mapped file descriptor and log the mapping.
    ///
    /// Returns false when the descriptor does not resolve to a path.
    pub fn register_file(&mut self, fd: i32, addr: u64, size: u64, offset: u64) -> bool {
        let Some(path) = self.resolver.resolve(fd) else {
            log::debug!(target: "dispatch", "cannot resolve file descriptor {fd}");
            return false;
        };
        if self.logging_on {
            log_emit(self.log.register_file(&path, addr, size, offset));
        }
        true
    }

    /// Render the report into `out`.
    pub fn write_report(&self, out: &mut dyn io::Write) -> io::Result<()> {
        report::write_report(self, out)
    }

    /// Enumerate the registered persistent mappings into `out`.
    pub fn write_mappings(&self, out: &mut dyn io::Write) -> io::Result<()> {
        report::write_mappings(self, out)
    }

    /// Aggregate error count across all diagnostic categories, dangling
    /// stores and leftover transactions included.
    pub fn error_count(&self) -> usize {
        self.stores.error_count() + self.tx.error_count()
    }

    /// Program-exit hook: terminate the store log and print the summary when
    /// configured to.
    pub fn finish(&mut self) -> io::Result<()> {
        self.log.finish()?;
        if self.options.print_summary {
            let mut err = io::stderr().lock();
            report::write_report(self, &mut err)?;
        }
        Ok(())
    }

    /// Diagnostic-buffer overflow handler: print the report and exit
    /// non-zero. The analysis cannot continue past this point.
    pub fn abort_with_report(&mut self, error: &DiagnosticOverflow) -> ! {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        let _ = report::write_report(self, &mut err);
        drop(err);
        let _ = self.log.finish();
        std::process::exit(1);
    }

    /// The store tracker, for report rendering and host introspection.
    pub fn store_tracker(&self) -> &StoreTracker {
        &self.stores
    }

    /// The transaction tracker, for report rendering and host introspection.
    pub fn tx_tracker(&self) -> &TxTracker {
        &self.tx
    }

    /// The host stack service this checker captures contexts with.
    pub fn stacks(&self) -> &dyn StackSource {
        self.stacks.as_ref()
    }
}

/// Best-effort store-log emission; failures are logged, not propagated.
fn log_emit(result: io::Result<()>) {
    if let Err(error) = result {
        log::warn!(target: "dispatch", "store log write failed: {error}");
    }
}

fn tx_outcome(result: Result<(), TxError>) -> Result<Outcome, DiagnosticOverflow> {
    match result {
        Err(TxError::LimitExceeded(overflow)) => Err(overflow),
        other => Ok(Outcome::Tx(other)),
    }
}
