use core::fmt;

/// The user-visible diagnostic categories that accumulate in bounded
/// buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A dirty store was clobbered before it was flushed.
    Overwrite,
    /// A non-dirty store was flushed again.
    RedundantFlush,
    /// A flush covered no tracked store.
    SuperfluousFlush,
    /// A persistent store fell outside every active transaction.
    OutOfTxStore,
    /// Two live transactions tracked overlapping regions.
    CrossTxOverlap,
}

impl DiagnosticKind {
    /// The capacity of this category's buffer.
    pub const fn limit(self) -> usize {
        match self {
            Self::CrossTxOverlap => 1_000,
            _ => 10_000,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overwrite => "overwritten store",
            Self::RedundantFlush => "redundant flush",
            Self::SuperfluousFlush => "superfluous flush",
            Self::OutOfTxStore => "out-of-transaction store",
            Self::CrossTxOverlap => "cross-transaction overlap",
        })
    }
}

/// A diagnostic buffer filled up; the analysis cannot continue.
///
/// The host is expected to print the accumulated report and exit with a
/// non-zero code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("number of {kind} diagnostics exceeded the limit of {limit}")]
pub struct DiagnosticOverflow {
    pub kind: DiagnosticKind,
    pub limit: usize,
}

/// Bounded append-only log of diagnostic records.
///
/// Recording into a full buffer fails with [DiagnosticOverflow] and drops the
/// record; the caller escalates.
#[derive(Debug, Clone)]
pub struct WarningBuffer<T> {
    kind: DiagnosticKind,
    events: Vec<T>,
}

impl<T> WarningBuffer<T> {
    pub fn new(kind: DiagnosticKind) -> Self {
        Self {
            kind,
            events: Vec::new(),
        }
    }

    pub fn kind(&self) -> DiagnosticKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.events
    }

    /// Append a record, failing when the category limit is reached.
    pub fn record(&mut self, event: T) -> Result<(), DiagnosticOverflow> {
        if self.events.len() >= self.kind.limit() {
            return Err(DiagnosticOverflow {
                kind: self.kind,
                limit: self.kind.limit(),
            });
        }
        self.events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_past_the_limit_fails() {
        let mut buffer = WarningBuffer::new(DiagnosticKind::CrossTxOverlap);
        for i in 0..DiagnosticKind::CrossTxOverlap.limit() {
            buffer.record(i).unwrap();
        }
        let err = buffer.record(0).unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::CrossTxOverlap);
        assert_eq!(err.limit, 1_000);
        assert_eq!(buffer.len(), 1_000);
    }
}
