//! Asynchronous log output.
//!
//! Log records are queued by their producers and written by a single background thread, so
//! producers never wait on output I/O and lines from different producers never interleave.
//! [`SinkLayer`] connects the sink to `tracing`.

use chrono::{DateTime, Local};
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// A single log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub timestamp: DateTime<Local>,
    /// The component that produced the record.
    pub source: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Local::now(),
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S,%3f"),
            self.source,
            self.level,
            self.message
        )
    }
}

type Writer = Box<dyn Write + Send>;

/// Where records end up: everything goes to `stdout`, warnings and errors also go to `stderr`.
struct Output {
    stdout: Writer,
    stderr: Writer,
    failed: bool,
}

impl Output {
    fn emit(&mut self, record: &LogRecord) {
        let line = format!("{record}\n");

        let mut res = write_line(&mut self.stdout, &line);

        if record.level <= Level::WARN {
            res = res.and(write_line(&mut self.stderr, &line));
        }

        if let Err(e) = res {
            self.delivery_failed(e);
        }
    }

    /// Records that cannot be written are dropped; the first failure is reported once.
    fn delivery_failed(&mut self, e: io::Error) {
        if self.failed {
            return;
        }

        self.failed = true;

        let warning = LogRecord::new(
            Level::WARN,
            module_path!(),
            format!("failed to write log output ({e}), dropping records"),
        );
        let _ = write_line(&mut self.stderr, &format!("{warning}\n"));
    }
}

fn write_line(w: &mut Writer, line: &str) -> io::Result<()> {
    w.write_all(line.as_bytes())?;
    w.flush()
}

enum Command {
    Record(LogRecord),
    Drain,
}

enum State {
    /// The worker is running.
    Open(SyncSender<Command>),
    /// The worker is writing out the last of the queue; new records line up behind it.
    Draining(Vec<LogRecord>),
    /// The worker has drained the queue and handed the output back; records are written
    /// synchronously from now on.
    Closed(Output),
    /// The worker died without handing the output back.
    Gone,
}

struct Shared {
    state: Mutex<State>,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cheap, cloneable producer handle for a [`LogSink`].
#[derive(Clone)]
pub struct LogHandle {
    shared: Arc<Shared>,
}

impl LogHandle {
    /// Queue `record` for output.
    ///
    /// Never waits for I/O while the sink is running. If the queue is full the record is
    /// dropped and counted. Once the sink has shut down the record is written synchronously.
    pub fn submit(&self, record: LogRecord) {
        let mut state = self.shared.lock();

        match &mut *state {
            State::Open(tx) => match tx.try_send(Command::Record(record)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(Command::Record(record))) => {
                    eprintln!("{record}");
                }
                Err(TrySendError::Disconnected(Command::Drain)) => {}
            },
            State::Draining(pending) => pending.push(record),
            State::Closed(output) => output.emit(&record),
            State::Gone => eprintln!("{record}"),
        }
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle").finish_non_exhaustive()
    }
}

/// The log sink and its output worker.
///
/// Dropping the sink (or calling [`shutdown`](LogSink::shutdown)) drains every queued record.
pub struct LogSink {
    handle: LogHandle,
    worker: Option<JoinHandle<()>>,
}

impl LogSink {
    /// A sink writing to the process' standard output and standard error.
    pub fn stdio(capacity: usize) -> io::Result<Self> {
        Self::with_writers(io::stdout(), io::stderr(), capacity)
    }

    pub fn with_writers(
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
        capacity: usize,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Open(tx)),
            dropped: AtomicU64::new(0),
        });
        let output = Output {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            failed: false,
        };

        let worker = {
            let shared = Arc::clone(&shared);

            thread::Builder::new()
                .name("log-sink".into())
                .spawn(move || run_worker(rx, output, &shared))?
        };

        Ok(Self {
            handle: LogHandle { shared },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> LogHandle {
        self.handle.clone()
    }

    /// A `tracing` layer that submits every event to this sink.
    pub fn layer(&self) -> SinkLayer {
        SinkLayer {
            handle: self.handle(),
        }
    }

    /// Write out everything queued so far and stop the worker.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let tx = match &*self.handle.shared.lock() {
            State::Open(tx) => Some(tx.clone()),
            _ => None,
        };

        // Blocks only while the queue is full, which the worker is busy emptying.
        if let Some(tx) = tx {
            let _ = tx.send(Command::Drain);
        }

        if worker.join().is_err() {
            let mut state = self.handle.shared.lock();

            if matches!(*state, State::Open(_) | State::Draining(_)) {
                *state = State::Gone;
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.finish();
    }
}

fn run_worker(rx: Receiver<Command>, mut output: Output, shared: &Shared) {
    for cmd in rx.iter() {
        match cmd {
            Command::Record(record) => output.emit(&record),
            Command::Drain => break,
        }
    }

    // Producers need the lock to enqueue, so once the state has left `Open` nothing else
    // can reach the channel.
    let mut pending = {
        let mut state = shared.lock();
        let queued = rx
            .try_iter()
            .filter_map(|cmd| match cmd {
                Command::Record(record) => Some(record),
                Command::Drain => None,
            })
            .collect::<Vec<_>>();
        *state = State::Draining(Vec::new());
        queued
    };

    let dropped = shared.dropped.swap(0, Ordering::Relaxed);

    if dropped > 0 {
        pending.push(LogRecord::new(
            Level::WARN,
            module_path!(),
            format!("log queue overflowed, {dropped} record(s) dropped"),
        ));
    }

    loop {
        for record in &pending {
            output.emit(record);
        }

        let mut state = shared.lock();

        pending = match &mut *state {
            State::Draining(more) => mem::take(more),
            _ => Vec::new(),
        };

        if pending.is_empty() {
            *state = State::Closed(output);
            return;
        }
    }
}

/// A [`Layer`] that turns `tracing` events into [`LogRecord`]s.
///
/// The event's target becomes the record's source.
#[derive(Debug, Clone)]
pub struct SinkLayer {
    handle: LogHandle,
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.handle
            .submit(LogRecord::new(*meta.level(), meta.target(), visitor.finish()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
