use core::fmt;

use duracheck_session::{ContextHandle, StackSource};

use crate::region::MemRegion;

/// Largest single store the host may deliver, in bytes; wider accesses are
/// decomposed before they reach the tracker.
pub const MAX_STORE_SIZE: u64 = 256;

/// Durability state of a tracked store.
///
/// The clean state is not represented; a clean store is simply absent from
/// the store set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Written but not yet flushed out of the CPU caches.
    Dirty,
    /// Flushed, awaiting a store barrier.
    Flushed,
    /// Fenced, awaiting the platform commit (full model only).
    Fenced,
    /// Committed, dropped by the next fence (full model only).
    Committed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dirty => "DIRTY",
            Self::Flushed => "FLUSHED",
            Self::Fenced => "FENCED",
            Self::Committed => "COMMITTED",
        })
    }
}

/// A single observed write to persistent memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub region: MemRegion,
    /// Up to 64 bits of payload; only the low `region.size` bytes are
    /// meaningful for stores narrower than a word.
    pub value: u64,
    /// Ordinal of the translation superblock the store was generated in.
    pub block: u64,
    pub state: StoreState,
    /// Stack at the store site, owned by the host.
    pub context: ContextHandle,
}

impl Store {
    /// A freshly observed store in the dirty state.
    pub fn dirty(region: MemRegion, value: u64, block: u64, context: ContextHandle) -> Self {
        Self {
            region,
            value,
            block,
            state: StoreState::Dirty,
            context,
        }
    }

    /// The store's value restricted to its own width.
    pub fn masked_value(&self) -> u64 {
        self.value & value_mask(self.region.size)
    }
}

/// Bit mask covering the low `size_bytes` bytes of a word.
pub(crate) fn value_mask(size_bytes: u64) -> u64 {
    if size_bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (size_bytes * 8)) - 1
    }
}

/// Keep only the low `keep_bytes` bytes of `value`.
pub(crate) fn value_keep_low(value: u64, keep_bytes: u64) -> u64 {
    value & value_mask(keep_bytes)
}

/// Drop the low `cut_bytes` bytes of `value`.
pub(crate) fn value_drop_low(value: u64, cut_bytes: u64) -> u64 {
    if cut_bytes >= 8 {
        0
    } else {
        value >> (cut_bytes * 8)
    }
}

/// Compare two captured stack traces for equality, ignoring the top frame
/// when it belongs to a bulk memory primitive in both traces.
///
/// Equal handles always denote the same trace. Beyond that, traces are equal
/// iff they have the same depth and the same frame addresses at every level,
/// except that a differing top frame is tolerated when both top frames sit in
/// `memcpy`/`memset`-like code.
pub fn contexts_equal(stacks: &dyn StackSource, lhs: ContextHandle, rhs: ContextHandle) -> bool {
    if lhs == rhs {
        return true;
    }
    let a = stacks.frames(lhs);
    let b = stacks.frames(rhs);
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return false;
    }
    let skip_top = a[0] == b[0] || (stacks.is_bulk_frame(a[0]) && stacks.is_bulk_frame(b[0]));
    let from = usize::from(skip_top);
    a[from..] == b[from..]
}

#[cfg(test)]
mod tests {
    use duracheck_session::{ThreadId, TraceTable};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn value_masks() {
        assert_eq!(value_mask(1), 0xff);
        assert_eq!(value_mask(4), 0xffff_ffff);
        assert_eq!(value_mask(8), u64::MAX);
        assert_eq!(value_mask(32), u64::MAX);

        assert_eq!(value_keep_low(0x1122_3344_5566_7788, 2), 0x7788);
        assert_eq!(value_drop_low(0x1122_3344_5566_7788, 6), 0x1122);
        assert_eq!(value_drop_low(0x1122_3344_5566_7788, 9), 0);
    }

    #[test]
    fn masked_value_is_width_limited() {
        let store = Store::dirty(MemRegion::new(0, 2), 0xdead_beef, 0, ContextHandle::NULL);
        assert_eq!(store.masked_value(), 0xbeef);
    }

    fn capture(table: &TraceTable, frames: &[u64]) -> ContextHandle {
        table.set_stack(ThreadId(1), frames);
        table.capture(ThreadId(1))
    }

    #[test]
    fn context_equality_ignores_a_bulk_top_frame() {
        let table = TraceTable::new();
        table.mark_bulk_frame(0x10);
        table.mark_bulk_frame(0x11);

        let base = capture(&table, &[0x10, 0x200, 0x300]);
        let other_bulk_top = capture(&table, &[0x11, 0x200, 0x300]);
        let plain_top = capture(&table, &[0x12, 0x200, 0x300]);
        let deeper = capture(&table, &[0x10, 0x200, 0x300, 0x400]);
        let diverged = capture(&table, &[0x10, 0x201, 0x300]);

        assert!(contexts_equal(&table, base, base));
        assert!(contexts_equal(&table, base, other_bulk_top));
        assert!(!contexts_equal(&table, base, plain_top));
        assert!(!contexts_equal(&table, base, deeper));
        assert!(!contexts_equal(&table, base, diverged));
    }
}
