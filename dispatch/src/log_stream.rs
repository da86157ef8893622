use std::{
    io::{self, Write as _},
    path::Path,
};

/// Writer for the textual store log.
///
/// The log is a single byte stream starting with `START` and ending with
/// `STOP\n`; records are separated by `|` and are either a bare tag or
/// `TAG;arg;arg;...` with hexadecimal arguments.
pub(crate) struct EventLog {
    sink: Box<dyn io::Write>,
    started: bool,
}

impl EventLog {
    pub fn new(sink: Box<dyn io::Write>) -> Self {
        Self {
            sink,
            started: false,
        }
    }

    fn start(&mut self) -> io::Result<()> {
        if !self.started {
            self.started = true;
            write!(self.sink, "START")?;
        }
        Ok(())
    }

    pub fn store(&mut self, addr: u64, value: u64, size: u64) -> io::Result<()> {
        self.start()?;
        write!(self.sink, "|STORE;{addr:#x};{value:#x};{size:#x}")
    }

    /// Append a depth-limited stack trace to the current store record;
    /// `depth` 0 keeps the full trace.
    pub fn store_trace(&mut self, frames: &[u64], depth: u32) -> io::Result<()> {
        let limit = if depth == 0 { frames.len() } else { depth as usize };
        for ip in frames.iter().take(limit) {
            write!(self.sink, ";{ip:#x}")?;
        }
        Ok(())
    }

    pub fn flush_record(&mut self, addr: u64, size: u64) -> io::Result<()> {
        self.start()?;
        write!(self.sink, "|FLUSH;{addr:#x};{size:#x}")
    }

    pub fn fence(&mut self) -> io::Result<()> {
        self.start()?;
        write!(self.sink, "|FENCE")
    }

    pub fn commit(&mut self) -> io::Result<()> {
        self.start()?;
        write!(self.sink, "|COMMIT")
    }

    pub fn register_file(
        &mut self,
        path: &Path,
        addr: u64,
        size: u64,
        offset: u64,
    ) -> io::Result<()> {
        self.start()?;
        write!(
            self.sink,
            "|REGISTER_FILE;{};{addr:#x};{size:#x};{offset:#x}",
            path.display()
        )
    }

    pub fn marker(&mut self, marker: &str) -> io::Result<()> {
        self.start()?;
        write!(self.sink, "|{marker}")
    }

    /// Terminate the stream; a no-op when nothing was ever logged.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.started {
            write!(self.sink, "|STOP")?;
            writeln!(self.sink)?;
        }
        self.sink.flush()
    }
}
