//! Transaction tracking for the duracheck analysis core.
//!
//! Guest programs annotate logical transactions: begin/end markers, the
//! memory regions each transaction owns, and which threads contribute to it.
//! This crate keeps that picture — active transactions with their member
//! region sets, the many-to-many thread-to-transaction mapping, a global
//! exclude list — and checks every persistent store against it, recording
//! out-of-transaction stores and regions claimed by two live transactions at
//! once.

use std::collections::{BTreeMap, BTreeSet};

use duracheck_session::{ContextHandle, ThreadId, TxId};
use duracheck_track::{
    DiagnosticKind, DiagnosticOverflow, MemRegion, RegionSet, Store, WarningBuffer,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// A transaction annotation referred to a transaction the tracker does not
/// know, or a thread that does not participate in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("no such transaction: {0}")]
    NoSuchTx(TxId),
    #[error("thread {thread} does not participate in transaction {tx}")]
    ThreadNotInTx { thread: ThreadId, tx: TxId },
    #[error(transparent)]
    LimitExceeded(#[from] DiagnosticOverflow),
}

/// One side of a cross-transaction overlap: a region, the capture context of
/// its registration, and the owning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRegionRef {
    pub region: MemRegion,
    pub context: ContextHandle,
    pub tx: TxId,
}

/// A region registered in a live transaction while overlapping a region
/// already tracked by another live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossTxEvent {
    pub original: TxRegionRef,
    pub duplicate: TxRegionRef,
}

/// An active transaction.
#[derive(Debug)]
pub struct TxInfo {
    id: TxId,
    /// Begin/end nesting depth; the transaction dies when this drops to zero.
    nesting: u64,
    /// Stack at the first begin.
    context: ContextHandle,
    /// Member regions, each keeping the context of its registration.
    regions: RegionSet<ContextHandle>,
    /// Single-slot write-through cache for the most recently added region.
    cached: Option<CachedRegion>,
}

#[derive(Debug, Clone, Copy)]
struct CachedRegion {
    region: MemRegion,
    context: ContextHandle,
}

impl TxInfo {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn nesting(&self) -> u64 {
        self.nesting
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }
}

#[derive(Debug, Default)]
struct ThreadInfo {
    tx_ids: BTreeSet<TxId>,
}

/// Tracks active transactions, their member regions and contributing
/// threads, and classifies persistent stores against them.
#[derive(Debug)]
pub struct TxTracker {
    transactions: BTreeMap<TxId, TxInfo>,
    threads: FxHashMap<ThreadId, ThreadInfo>,
    excludes: RegionSet,
    oot_stores: WarningBuffer<Store>,
    cross_events: WarningBuffer<CrossTxEvent>,
    /// Treat stores on threads outside any transaction as errors too.
    transactions_only: bool,
}

impl TxTracker {
    pub fn new(transactions_only: bool) -> Self {
        Self {
            transactions: BTreeMap::new(),
            threads: FxHashMap::default(),
            excludes: RegionSet::new(),
            oot_stores: WarningBuffer::new(DiagnosticKind::OutOfTxStore),
            cross_events: WarningBuffer::new(DiagnosticKind::CrossTxOverlap),
            transactions_only,
        }
    }

    /// Begin (or nest into) transaction `tx` on the running thread.
    ///
    /// `context` is kept as the transaction's capture context only when this
    /// is the first begin.
    pub fn begin(&mut self, thread: ThreadId, tx: TxId, context: ContextHandle) {
        let info = self.transactions.entry(tx).or_insert_with(|| TxInfo {
            id: tx,
            nesting: 0,
            context,
            regions: RegionSet::new(),
            cached: None,
        });
        info.nesting += 1;
        log::debug!(target: "tx", "starting transaction {tx}, nesting {}", info.nesting);
        self.threads.entry(thread).or_default().tx_ids.insert(tx);
    }

    /// End one nesting level of transaction `tx`; the begin-matching end
    /// destroys it and detaches it from every thread.
    pub fn end(&mut self, tx: TxId) -> Result<(), TxError> {
        let info = self.transactions.get_mut(&tx).ok_or(TxError::NoSuchTx(tx))?;
        info.nesting -= 1;
        if info.nesting > 0 {
            log::debug!(target: "tx", "ending transaction {tx}, nesting {}", info.nesting);
            return Ok(());
        }
        log::debug!(target: "tx", "removing transaction {tx}");
        self.threads.retain(|_, thread_info| {
            thread_info.tx_ids.remove(&tx);
            !thread_info.tx_ids.is_empty()
        });
        self.transactions.remove(&tx);
        Ok(())
    }

    fn thread_in_tx(&self, thread: ThreadId, tx: TxId) -> bool {
        self.threads.get(&thread).is_some_and(|info| info.tx_ids.contains(&tx))
    }

    /// Track `region` as a member of transaction `tx`.
    ///
    /// The running thread must participate in the transaction. Overlaps with
    /// regions tracked by other live transactions are recorded as
    /// cross-transaction events.
    pub fn add_obj(
        &mut self,
        thread: ThreadId,
        tx: TxId,
        region: MemRegion,
        context: ContextHandle,
    ) -> Result<(), TxError> {
        if !self.transactions.contains_key(&tx) {
            return Err(TxError::NoSuchTx(tx));
        }
        if !self.thread_in_tx(thread, tx) {
            return Err(TxError::ThreadNotInTx { thread, tx });
        }

        // a region owned by two live transactions is a consistency hazard
        for (&other_id, other) in &self.transactions {
            if other_id == tx {
                continue;
            }
            let duplicate = TxRegionRef {
                region,
                context,
                tx,
            };
            let cached_hit =
                other.cached.as_ref().filter(|cached| cached.region.overlaps(&region));
            if let Some(cached) = cached_hit {
                self.cross_events.record(CrossTxEvent {
                    original: TxRegionRef {
                        region: cached.region,
                        context: cached.context,
                        tx: other_id,
                    },
                    duplicate,
                })?;
            } else if let Some((stored, &stored_context)) = other.regions.get_overlapping(region) {
                self.cross_events.record(CrossTxEvent {
                    original: TxRegionRef {
                        region: stored,
                        context: stored_context,
                        tx: other_id,
                    },
                    duplicate,
                })?;
            }
        }

        let Some(info) = self.transactions.get_mut(&tx) else {
            return Err(TxError::NoSuchTx(tx));
        };
        match info.cached {
            None => info.cached = Some(CachedRegion { region, context }),
            Some(cached) if !cached.region.overlaps(&region) => {
                info.regions.insert_coalescing(cached.region, cached.context);
                info.cached = Some(CachedRegion { region, context });
            }
            Some(cached) if cached.region.contains(&region) => {
                // the cache already covers the new region
            }
            Some(cached) if region.contains(&cached.region) => {
                info.cached = Some(CachedRegion { region, context });
            }
            Some(cached) => {
                // partial overlap: flush the cache, then cut the new range
                // out of the set so no stale sliver survives
                info.regions.insert_coalescing(cached.region, cached.context);
                info.regions.remove_splitting(region);
                info.cached = Some(CachedRegion { region, context });
            }
        }
        Ok(())
    }

    /// Stop tracking `region` as a member of transaction `tx`.
    pub fn remove_obj(
        &mut self,
        thread: ThreadId,
        tx: TxId,
        region: MemRegion,
    ) -> Result<(), TxError> {
        if !self.transactions.contains_key(&tx) {
            return Err(TxError::NoSuchTx(tx));
        }
        if !self.thread_in_tx(thread, tx) {
            return Err(TxError::ThreadNotInTx { thread, tx });
        }
        let Some(info) = self.transactions.get_mut(&tx) else {
            return Err(TxError::NoSuchTx(tx));
        };
        match info.cached {
            Some(cached) if cached.region == region => {
                info.cached = None;
                return Ok(());
            }
            Some(cached) if cached.region.overlaps(&region) => {
                // flush so the removal below sees a consistent view
                info.regions.insert_coalescing(cached.region, cached.context);
                info.cached = None;
            }
            _ => {}
        }
        info.regions.remove_splitting(region);
        Ok(())
    }

    /// Explicitly attach the running thread to transaction `tx`, without
    /// touching its nesting.
    pub fn attach_thread(&mut self, thread: ThreadId, tx: TxId) -> Result<(), TxError> {
        if !self.transactions.contains_key(&tx) {
            return Err(TxError::NoSuchTx(tx));
        }
        self.threads.entry(thread).or_default().tx_ids.insert(tx);
        Ok(())
    }

    /// Explicitly detach the running thread from transaction `tx`, without
    /// touching its nesting.
    pub fn detach_thread(&mut self, thread: ThreadId, tx: TxId) -> Result<(), TxError> {
        if !self.transactions.contains_key(&tx) {
            return Err(TxError::NoSuchTx(tx));
        }
        if !self.thread_in_tx(thread, tx) {
            return Err(TxError::ThreadNotInTx { thread, tx });
        }
        let Some(info) = self.threads.get_mut(&thread) else {
            return Err(TxError::ThreadNotInTx { thread, tx });
        };
        info.tx_ids.remove(&tx);
        if info.tx_ids.is_empty() {
            self.threads.remove(&thread);
        }
        Ok(())
    }

    /// Exclude `region` from transaction analysis altogether.
    pub fn add_exclude(&mut self, region: MemRegion) {
        self.excludes.insert_coalescing(region, ());
    }

    /// Check a persistent store against the running thread's transactions,
    /// recording it when it is covered by none of them.
    pub fn handle_store(
        &mut self,
        thread: ThreadId,
        store: &Store,
    ) -> Result<(), DiagnosticOverflow> {
        // only full containment in the exclude list silences the check
        if self.excludes.covers(store.region) {
            return Ok(());
        }

        let Some(thread_info) = self.threads.get(&thread) else {
            if self.transactions_only {
                self.record_oot_store(store)?;
            }
            log::debug!(target: "tx", "thread {thread} is not part of any transaction");
            return Ok(());
        };

        let tx_ids: SmallVec<[TxId; 4]> = thread_info.tx_ids.iter().copied().collect();
        for tx in tx_ids {
            if self.store_in_tx(store, tx) {
                return Ok(());
            }
        }
        self.record_oot_store(store)
    }

    /// Whether the store lies fully within a member region of `tx`.
    ///
    /// Misses flush the cache into the region set, so coalescing with the
    /// cached region is taken into account.
    fn store_in_tx(&mut self, store: &Store, tx: TxId) -> bool {
        let Some(info) = self.transactions.get_mut(&tx) else {
            return false;
        };
        if let Some(cached) = &info.cached {
            if cached.region.contains(&store.region) {
                return true;
            }
        }
        if let Some(cached) = info.cached.take() {
            info.regions.insert_coalescing(cached.region, cached.context);
        }
        info.regions.covers(store.region)
    }

    fn record_oot_store(&mut self, store: &Store) -> Result<(), DiagnosticOverflow> {
        log::debug!(target: "tx", "store outside of transaction at {}", store.region);
        self.oot_stores.record(store.clone())
    }

    /// Stores made without adding their target to a transaction.
    pub fn oot_stores(&self) -> &[Store] {
        self.oot_stores.as_slice()
    }

    /// Overlapping regions registered in different transactions.
    pub fn cross_events(&self) -> &[CrossTxEvent] {
        self.cross_events.as_slice()
    }

    /// The transactions still active, in id order.
    pub fn active(&self) -> impl Iterator<Item = &TxInfo> + '_ {
        self.transactions.values()
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    /// Total transaction-related errors: out-of-transaction stores,
    /// cross-transaction overlaps, and transactions never ended.
    pub fn error_count(&self) -> usize {
        self.oot_stores.len() + self.cross_events.len() + self.transactions.len()
    }
}
