use std::{cell::RefCell, fmt::Write, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ThreadId;

/// Opaque handle for a captured stack trace.
///
/// Handles are owned by the host's [StackSource]; the analysis core only
/// stores and compares them. Equal handles always denote the same captured
/// trace, so identity comparison is a valid fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(u64);

impl ContextHandle {
    /// The handle used when no trace was captured.
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Host service that captures and resolves guest stack traces.
///
/// The core treats traces as opaque: it captures them at interesting points,
/// compares them when deciding whether stores merge, and hands them back for
/// symbolication when printing reports.
pub trait StackSource {
    /// Capture the current stack of the given guest thread.
    fn capture(&self, thread: ThreadId) -> ContextHandle;

    /// The frame addresses of a captured trace, outermost frame last.
    fn frames(&self, context: ContextHandle) -> Arc<[u64]>;

    /// Whether the code at `ip` belongs to a bulk memory primitive (a
    /// function with `memcpy` or `memset` in its name).
    fn is_bulk_frame(&self, ip: u64) -> bool;

    /// A human-readable rendering of the trace, one frame per line.
    fn describe(&self, context: ContextHandle) -> String;
}

/// A [StackSource] for hosts that do not capture traces.
///
/// Every capture yields [ContextHandle::NULL], so all contexts compare equal
/// by identity and reports carry no traces.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStackSource;

impl StackSource for NullStackSource {
    fn capture(&self, _thread: ThreadId) -> ContextHandle {
        ContextHandle::NULL
    }

    fn frames(&self, _context: ContextHandle) -> Arc<[u64]> {
        Arc::default()
    }

    fn is_bulk_frame(&self, _ip: u64) -> bool {
        false
    }

    fn describe(&self, _context: ContextHandle) -> String {
        String::new()
    }
}

/// An interning [StackSource] for hosts that deliver raw frame arrays.
///
/// The host keeps the per-thread guest stack up to date with [set_stack],
/// and flags instruction addresses belonging to bulk memory primitives with
/// [mark_bulk_frame]. Identical frame arrays intern to the same handle, which
/// keeps identity comparison of handles meaningful.
///
/// [set_stack]: TraceTable::set_stack
/// [mark_bulk_frame]: TraceTable::mark_bulk_frame
#[derive(Debug, Default)]
pub struct TraceTable {
    inner: RefCell<TraceTableInner>,
}

#[derive(Debug, Default)]
struct TraceTableInner {
    /// Interned traces; the handle is the 1-based index into this vector.
    traces: Vec<Arc<[u64]>>,
    interned: FxHashMap<Arc<[u64]>, u64>,
    current: FxHashMap<ThreadId, Vec<u64>>,
    bulk: FxHashSet<u64>,
}

impl TraceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current stack of `thread`; subsequent captures on that
    /// thread return a handle for this trace.
    pub fn set_stack(&self, thread: ThreadId, frames: &[u64]) {
        self.inner.borrow_mut().current.insert(thread, frames.to_vec());
    }

    /// Flag `ip` as belonging to a bulk memory primitive.
    pub fn mark_bulk_frame(&self, ip: u64) {
        self.inner.borrow_mut().bulk.insert(ip);
    }
}

impl StackSource for TraceTable {
    fn capture(&self, thread: ThreadId) -> ContextHandle {
        let mut inner = self.inner.borrow_mut();
        let frames: Arc<[u64]> =
            inner.current.get(&thread).map(|stack| Arc::from(stack.as_slice())).unwrap_or_default();
        if let Some(&handle) = inner.interned.get(&frames) {
            return ContextHandle(handle);
        }
        inner.traces.push(frames.clone());
        let handle = inner.traces.len() as u64;
        inner.interned.insert(frames, handle);
        ContextHandle(handle)
    }

    fn frames(&self, context: ContextHandle) -> Arc<[u64]> {
        if context.is_null() {
            return Arc::default();
        }
        let inner = self.inner.borrow();
        inner.traces.get(context.0 as usize - 1).cloned().unwrap_or_default()
    }

    fn is_bulk_frame(&self, ip: u64) -> bool {
        self.inner.borrow().bulk.contains(&ip)
    }

    fn describe(&self, context: ContextHandle) -> String {
        let mut out = String::new();
        for ip in self.frames(context).iter() {
            writeln!(out, "   at 0x{ip:x}").expect("write to String cannot fail");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: ThreadId = ThreadId(1);

    #[test]
    fn identical_stacks_intern_to_the_same_handle() {
        let table = TraceTable::new();
        table.set_stack(T0, &[0x100, 0x200]);
        let a = table.capture(T0);
        let b = table.capture(T0);
        assert_eq!(a, b);

        table.set_stack(T0, &[0x101, 0x200]);
        let c = table.capture(T0);
        assert_ne!(a, c);

        table.set_stack(T0, &[0x100, 0x200]);
        assert_eq!(table.capture(T0), a);
    }

    #[test]
    fn capture_without_a_stack_yields_the_empty_trace() {
        let table = TraceTable::new();
        let ctx = table.capture(ThreadId(7));
        assert!(!ctx.is_null());
        assert!(table.frames(ctx).is_empty());
    }

    #[test]
    fn bulk_frames_are_flagged() {
        let table = TraceTable::new();
        table.mark_bulk_frame(0xdead);
        assert!(table.is_bulk_frame(0xdead));
        assert!(!table.is_bulk_frame(0xbeef));
    }
}
