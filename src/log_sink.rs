//! Serialized diagnostic output.
//!
//! Every connection handler appends lines to one shared sink. The sink
//! holds a single lock for the duration of one line, so lines from
//! concurrent handlers never interleave. The tracing subscriber installed
//! by the server binary writes through the same sink, keeping handler
//! lines and dispatcher events in one ordered stream.
//!
//! Output is best-effort: write and flush failures are swallowed and
//! never retried.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;

type Target = Box<dyn Write + Send>;

/// Cloneable handle to a process-wide, mutex-guarded output stream.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
    timestamps: bool,
}

impl LogSink {
    /// Sink writing to standard output.
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Sink writing to an arbitrary writer.
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            target: Arc::new(Mutex::new(Box::new(writer))),
            timestamps: false,
        }
    }

    /// Sink capturing everything in memory, with a handle to read it back.
    pub fn in_memory() -> (Self, CapturedLines) {
        let captured = CapturedLines::default();
        (Self::from_writer(captured.clone()), captured)
    }

    /// Prefix appended lines with the local time.
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Append one line, flushing before the lock is released.
    pub fn append(&self, line: impl AsRef<str>) {
        let mut target = self.lock();
        let result = if self.timestamps {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(target, "{now} {}", line.as_ref())
        } else {
            writeln!(target, "{}", line.as_ref())
        };
        if result.is_ok() {
            let _ = target.flush();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Target> {
        // A handler that panicked mid-line leaves the stream usable.
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("timestamps", &self.timestamps)
            .finish_non_exhaustive()
    }
}

/// Writer handed to the tracing subscriber; holds the sink lock for one event.
pub struct SinkWriter<'a> {
    guard: MutexGuard<'a, Target>,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

impl Drop for SinkWriter<'_> {
    fn drop(&mut self) {
        let _ = self.guard.flush();
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter { guard: self.lock() }
    }
}

/// In-memory buffer shared with a [`LogSink`] created by [`LogSink::in_memory`].
#[derive(Clone, Default)]
pub struct CapturedLines {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLines {
    /// All complete lines written so far.
    pub fn lines(&self) -> Vec<String> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer)
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Whether any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl Write for CapturedLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
