//! Startup, supervision and shutdown of the daemon.
//!
//! The process moves through [`Phase::Starting`], [`Phase::Running`], [`Phase::Draining`] and
//! [`Phase::Terminated`]. The first interrupt or terminate signal starts draining: device
//! loops are cancelled and given a bounded time to unwind. A second signal while draining
//! gives up on the drain.

use crate::classify::classify_all;
use crate::device::{Evdev, InputBackend, InputDevice};
use crate::error::HotkeyError;
use crate::log_sink::{LogRecord, LogSink};
use crate::settings::Settings;
use crate::stream::{Event, StreamManager};
use crate::{config, enumerate, HotkeyResult};
use futures::{future, stream, Stream, StreamExt};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// The status used when a second signal cuts the shutdown short.
pub const EXIT_FORCED: i32 = 130;

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// How the daemon ended.
#[derive(Debug)]
pub enum Outcome {
    /// Shut down after a signal, with every device loop accounted for.
    Graceful,
    /// A second signal arrived while draining.
    Forced,
    Failed(HotkeyError),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Graceful => EXIT_SUCCESS,
            Outcome::Forced => EXIT_FORCED,
            Outcome::Failed(_) => EXIT_FAILURE,
        }
    }
}

/// `SIGINT` and `SIGTERM`, as a stream. Must be called from within a tokio runtime.
pub fn os_signals() -> io::Result<impl Stream<Item = ShutdownSignal> + Unpin> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let interrupt = stream::poll_fn(move |cx| {
        interrupt
            .poll_recv(cx)
            .map(|s| s.map(|()| ShutdownSignal::Interrupt))
    });
    let terminate = stream::poll_fn(move |cx| {
        terminate
            .poll_recv(cx)
            .map(|s| s.map(|()| ShutdownSignal::Terminate))
    });

    Ok(stream::select(interrupt, terminate))
}

/// Coordinates discovery, streaming and shutdown.
pub struct Daemon<B> {
    backend: B,
    drain_grace: Duration,
    phase: watch::Sender<Phase>,
}

impl<B: InputBackend> Daemon<B> {
    pub fn new(backend: B, drain_grace: Duration) -> Self {
        Self {
            backend,
            drain_grace,
            phase: watch::Sender::new(Phase::Starting),
        }
    }

    /// Follow the daemon's progress.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Stream every keyboard among `paths` to `downstream` until a signal arrives on `signals`.
    pub async fn run<I, S>(
        self,
        paths: I,
        mut signals: S,
        downstream: mpsc::Sender<Event>,
    ) -> Outcome
    where
        I: IntoIterator<Item = PathBuf>,
        S: Stream<Item = ShutdownSignal> + Unpin,
    {
        let mut manager = StreamManager::new(downstream);

        if let Err(e) = self.start(paths, &mut manager) {
            self.enter(Phase::Terminated);
            return Outcome::Failed(e);
        }

        self.enter(Phase::Running);
        info!("streaming {} keyboard(s)", manager.len());

        loop {
            tokio::select! {
                signal = next_signal(&mut signals) => {
                    info!("received {signal:?}, shutting down");
                    break;
                }
                exit = manager.next_exit() => {
                    if exit.is_none() || manager.is_empty() {
                        self.enter(Phase::Terminated);
                        return Outcome::Failed(HotkeyError::DeviceStreamsExited);
                    }
                }
            }
        }

        self.enter(Phase::Draining);
        manager.stop_accepting();

        let outcome = tokio::select! {
            biased;
            signal = next_signal(&mut signals) => {
                warn!("received {signal:?} while shutting down, exiting immediately");
                Outcome::Forced
            }
            abandoned = manager.shutdown(self.drain_grace) => {
                if abandoned > 0 {
                    warn!("{abandoned} device stream(s) abandoned");
                }
                Outcome::Graceful
            }
        };

        self.enter(Phase::Terminated);
        outcome
    }

    /// Classify `paths` and start a loop for every keyboard that can be opened.
    fn start<I>(&self, paths: I, manager: &mut StreamManager) -> HotkeyResult<()>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let keyboards = classify_all(&self.backend, paths)
            .into_iter()
            .filter(|(_, class)| class.is_keyboard())
            .map(|(path, _)| path);

        for path in keyboards {
            let device = self
                .backend
                .open(&path)
                .map_err(|source| HotkeyError::DeviceAccess {
                    path: path.clone(),
                    source,
                })
                .and_then(|handle| InputDevice::new(&path, handle));

            if let Err(e) = device.and_then(|device| manager.spawn(device)) {
                warn!("{e}");
            }
        }

        if manager.is_empty() {
            return Err(HotkeyError::NoKeyboardFound);
        }

        Ok(())
    }

    fn enter(&self, phase: Phase) {
        debug!("entering {phase:?}");
        self.phase.send_replace(phase);
    }
}

async fn next_signal<S>(signals: &mut S) -> ShutdownSignal
where
    S: Stream<Item = ShutdownSignal> + Unpin,
{
    match signals.next().await {
        Some(signal) => signal,
        // No more signals can arrive.
        None => future::pending().await,
    }
}

/// Run the daemon against the real devices and exit status conventions.
///
/// Returns the process exit status. A forced shutdown exits the process directly without
/// waiting for the log to drain.
pub fn run() -> i32 {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("hotkeyd: {e}");
            return EXIT_FAILURE;
        }
    };

    let sink = match LogSink::stdio(settings.log_queue_capacity) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("hotkeyd: cannot start log output: {e}");
            return EXIT_FAILURE;
        }
    };

    let filter = EnvFilter::try_new(&settings.log_filter).unwrap_or_else(|e| {
        eprintln!("hotkeyd: invalid log filter {:?}: {e}", settings.log_filter);
        EnvFilter::new("info")
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(sink.layer())
        .try_init()
    {
        eprintln!("hotkeyd: cannot install logger: {e}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("hotkeyd: cannot start runtime: {e}");
            sink.shutdown();
            return EXIT_FAILURE;
        }
    };

    let code = runtime.block_on(async {
        let paths = enumerate::list_in(settings.input_dir.clone());

        match os_signals() {
            Ok(mut signals) => run_with(settings, sink, Evdev, paths, &mut signals).await,
            Err(e) => {
                let failed = Err::<Vec<PathBuf>, _>(e.into());
                run_with(settings, sink, Evdev, failed, &mut stream::pending()).await
            }
        }
    });

    // The signal handlers live as long as the runtime; leave before it is torn down.
    if code == EXIT_FORCED {
        std::process::exit(code);
    }

    code
}

/// Load the bindings, stream the keyboards among `paths` until a signal arrives on `signals`,
/// then drain `sink`.
///
/// A signal that arrives while the sink is draining abandons the drain and returns
/// [`EXIT_FORCED`]. Fatal errors are written to the sink regardless of the log filter.
pub async fn run_with<B, I, S>(
    settings: Settings,
    sink: LogSink,
    backend: B,
    paths: HotkeyResult<I>,
    signals: &mut S,
) -> i32
where
    B: InputBackend,
    I: IntoIterator<Item = PathBuf>,
    S: Stream<Item = ShutdownSignal> + Unpin,
{
    let outcome = serve(&settings, backend, paths, &mut *signals).await;

    match &outcome {
        Outcome::Graceful => info!("gracefully quitting"),
        Outcome::Forced => return EXIT_FORCED,
        Outcome::Failed(e) => sink.handle().submit(LogRecord::new(
            Level::ERROR,
            module_path!(),
            e.to_string(),
        )),
    }

    let code = outcome.exit_code();
    let drain = tokio::task::spawn_blocking(move || sink.shutdown());

    tokio::select! {
        biased;
        _ = next_signal(signals) => EXIT_FORCED,
        _ = drain => code,
    }
}

async fn serve<B, I, S>(
    settings: &Settings,
    backend: B,
    paths: HotkeyResult<I>,
    signals: S,
) -> Outcome
where
    B: InputBackend,
    I: IntoIterator<Item = PathBuf>,
    S: Stream<Item = ShutdownSignal> + Unpin,
{
    let candidates = config::candidates(settings.config_path.as_deref(), |name| {
        std::env::var(name).ok()
    });

    // The bindings themselves are for the matcher; the daemon only insists they exist.
    if let Err(e) = config::load_first(&candidates) {
        return Outcome::Failed(e);
    }

    let paths = match paths {
        Ok(paths) => paths,
        Err(e) => return Outcome::Failed(e),
    };

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    tokio::spawn(log_events(rx));

    Daemon::new(backend, settings.drain_grace)
        .run(paths, signals, tx)
        .await
}

async fn log_events(mut events: mpsc::Receiver<Event>) {
    while let Some(ev) = events.recv().await {
        match ev.key() {
            Some((code, cause)) => {
                debug!("{}: key {code} {cause:?}", ev.device.display())
            }
            None => trace!(
                "{}: type {} code {} value {}",
                ev.device.display(),
                ev.ty,
                ev.code,
                ev.value
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::encode;
    use crate::device::event_codes::*;
    use crate::device::RawEvent;
    use crate::log_sink::tests::SharedBuf;
    use crate::stream::KeyEventCause;
    use futures::channel::mpsc::unbounded;
    use std::collections::{HashMap, HashSet};
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    /// Keyboards are backed by socket pairs; the test keeps the other ends.
    #[derive(Default)]
    struct Fake {
        keyboards: Mutex<HashMap<PathBuf, UnixStream>>,
        others: HashSet<PathBuf>,
    }

    impl Fake {
        fn keyboard(&mut self, path: &str) -> UnixStream {
            let (peer, handle) = UnixStream::pair().unwrap();
            self.keyboards.lock().unwrap().insert(path.into(), handle);
            peer
        }
    }

    impl InputBackend for Fake {
        type Handle = UnixStream;

        fn supports_key(&self, path: &Path, _code: u16) -> io::Result<bool> {
            if self.keyboards.lock().unwrap().contains_key(path) {
                Ok(true)
            } else if self.others.contains(path) {
                Ok(false)
            } else {
                Err(io::ErrorKind::PermissionDenied.into())
            }
        }

        fn open(&self, path: &Path) -> io::Result<UnixStream> {
            self.keyboards
                .lock()
                .unwrap()
                .remove(path)
                .ok_or_else(|| io::ErrorKind::NotFound.into())
        }
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[tokio::test]
    async fn signal_drains_and_exits_cleanly() {
        let mut backend = Fake::default();
        let mut peer = backend.keyboard("/dev/input/event7");
        let daemon = Daemon::new(backend, WAIT);
        let mut phase = daemon.phase();
        let (signal_tx, signals) = unbounded();
        let (tx, mut rx) = mpsc::channel(16);

        let test = async {
            let _ = phase.wait_for(|p| *p == Phase::Running).await;

            peer.write_all(&encode(&[
                RawEvent::new(EV_KEY, 30, 1),
                RawEvent::new(EV_SYN, SYN_REPORT, 0),
            ]))
            .unwrap();
            let ev = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();

            signal_tx.unbounded_send(ShutdownSignal::Terminate).unwrap();
            ev
        };

        let (outcome, ev) = tokio::join!(
            daemon.run(paths(&["/dev/input/event7"]), signals, tx),
            test
        );

        assert!(matches!(outcome, Outcome::Graceful));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(ev.key(), Some((30, KeyEventCause::Press)));
        assert_eq!(*phase.borrow(), Phase::Terminated);
    }

    #[tokio::test]
    async fn second_signal_forces_exit() {
        let mut backend = Fake::default();
        let _peer = backend.keyboard("/dev/input/event7");
        let (signal_tx, signals) = unbounded();
        let (tx, _rx) = mpsc::channel(16);

        signal_tx.unbounded_send(ShutdownSignal::Interrupt).unwrap();
        signal_tx.unbounded_send(ShutdownSignal::Interrupt).unwrap();

        let outcome = Daemon::new(backend, WAIT)
            .run(paths(&["/dev/input/event7"]), signals, tx)
            .await;

        assert!(matches!(outcome, Outcome::Forced));
        assert_eq!(outcome.exit_code(), EXIT_FORCED);
    }

    #[tokio::test]
    async fn no_keyboard_is_fatal() {
        let mut backend = Fake::default();
        backend.others.insert("/dev/input/event3".into());
        let (_signal_tx, signals) = unbounded();
        let (tx, _rx) = mpsc::channel(16);

        let daemon = Daemon::new(backend, WAIT);
        let phase = daemon.phase();
        let outcome = daemon
            .run(
                paths(&["/dev/input/event3", "/dev/input/event4"]),
                signals,
                tx,
            )
            .await;

        assert!(matches!(outcome, Outcome::Failed(HotkeyError::NoKeyboardFound)));
        assert_eq!(outcome.exit_code(), EXIT_FAILURE);
        assert_eq!(*phase.borrow(), Phase::Terminated);
    }

    #[tokio::test]
    async fn losing_every_device_is_fatal() {
        let mut backend = Fake::default();
        let peer = backend.keyboard("/dev/input/event7");
        let daemon = Daemon::new(backend, WAIT);
        let mut phase = daemon.phase();
        let (_signal_tx, signals) = unbounded();
        let (tx, _rx) = mpsc::channel(16);

        let unplug = async {
            let _ = phase.wait_for(|p| *p == Phase::Running).await;
            drop(peer);
        };

        let (outcome, ()) = tokio::join!(
            daemon.run(paths(&["/dev/input/event7"]), signals, tx),
            unplug
        );

        assert!(matches!(
            outcome,
            Outcome::Failed(HotkeyError::DeviceStreamsExited)
        ));
    }

    #[tokio::test]
    async fn unopenable_keyboard_is_skipped() {
        let mut backend = Fake::default();
        let _peer = backend.keyboard("/dev/input/event7");
        let (signal_tx, signals) = unbounded();
        let (tx, _rx) = mpsc::channel(16);
        signal_tx.unbounded_send(ShutdownSignal::Terminate).unwrap();

        // event7 is listed twice: the second open finds nothing left to open.
        let outcome = Daemon::new(backend, WAIT)
            .run(
                paths(&["/dev/input/event7", "/dev/input/event7"]),
                signals,
                tx,
            )
            .await;

        assert!(matches!(outcome, Outcome::Graceful));
    }

    fn settings_with_bindings(name: &str) -> (Settings, PathBuf) {
        let dir = std::env::temp_dir().join(format!("hotkeyd-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let bindings = dir.join("hotkeyd.json");
        std::fs::write(&bindings, r#"[{"keys": "super+Return", "command": "term"}]"#).unwrap();

        let settings = Settings {
            config_path: Some(bindings),
            drain_grace: WAIT,
            ..Settings::default()
        };

        (settings, dir)
    }

    #[tokio::test]
    async fn terminate_flushes_earlier_records_and_exits_zero() {
        let (settings, dir) = settings_with_bindings("run-terminate");
        let (out, err) = (SharedBuf::default(), SharedBuf::default());
        let sink = LogSink::with_writers(out.clone(), err.clone(), 64).unwrap();
        let log = sink.handle();
        let mut backend = Fake::default();
        let _peer = backend.keyboard("/dev/input/event7");
        let (signal_tx, mut signals) = unbounded();

        for n in 0..20 {
            log.submit(LogRecord::new(Level::INFO, "test", format!("before signal {n}")));
        }
        signal_tx.unbounded_send(ShutdownSignal::Terminate).unwrap();

        let code = run_with(
            settings,
            sink,
            backend,
            Ok(paths(&["/dev/input/event7"])),
            &mut signals,
        )
        .await;
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(code, EXIT_SUCCESS);
        let messages = out
            .contents()
            .lines()
            .map(|l| l.rsplit(" - ").next().unwrap().to_string())
            .collect::<Vec<_>>();
        let expected = (0..20)
            .map(|n| format!("before signal {n}"))
            .collect::<Vec<_>>();
        assert_eq!(messages, expected);
        assert!(err.contents().is_empty());
    }

    #[tokio::test]
    async fn fatal_error_is_written_to_stderr() {
        let (settings, dir) = settings_with_bindings("run-fatal");
        let (out, err) = (SharedBuf::default(), SharedBuf::default());
        let sink = LogSink::with_writers(out, err.clone(), 64).unwrap();
        let mut backend = Fake::default();
        backend.others.insert("/dev/input/event3".into());
        let (_signal_tx, mut signals) = unbounded();

        let code = run_with(
            settings,
            sink,
            backend,
            Ok(paths(&["/dev/input/event3"])),
            &mut signals,
        )
        .await;
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(code, EXIT_FAILURE);
        let err = err.contents();
        assert!(
            err.contains(" - hotkeyd::lifecycle - ERROR - no keyboard devices found\n"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn missing_bindings_are_fatal() {
        let (mut settings, dir) = settings_with_bindings("run-no-bindings");
        settings.config_path = Some(dir.join("missing.json"));
        let err = SharedBuf::default();
        let sink = LogSink::with_writers(SharedBuf::default(), err.clone(), 64).unwrap();
        let mut backend = Fake::default();
        let _peer = backend.keyboard("/dev/input/event7");
        let (_signal_tx, mut signals) = unbounded();

        let code = run_with(
            settings,
            sink,
            backend,
            Ok(paths(&["/dev/input/event7"])),
            &mut signals,
        )
        .await;
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(code, EXIT_FAILURE);
        assert!(err.contents().contains(" - ERROR - no configuration file found"));
    }

    /// Stalls the write of the first line containing `needle` until `release` yields.
    struct StallOn {
        needle: &'static str,
        reached: futures::channel::mpsc::UnboundedSender<()>,
        release: std::sync::mpsc::Receiver<()>,
    }

    impl Write for StallOn {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if String::from_utf8_lossy(buf).contains(self.needle) {
                let _ = self.reached.unbounded_send(());
                let _ = self.release.recv();
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn signal_during_log_drain_forces_exit() {
        use tracing_subscriber::layer::SubscriberExt;

        let (settings, dir) = settings_with_bindings("run-drain-signal");
        let (reached, mut stalled) = unbounded();
        let (release, release_rx) = std::sync::mpsc::channel();
        let stdout = StallOn {
            needle: "gracefully quitting",
            reached,
            release: release_rx,
        };
        let sink = LogSink::with_writers(stdout, SharedBuf::default(), 64).unwrap();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(sink.layer()),
        );
        let mut backend = Fake::default();
        let _peer = backend.keyboard("/dev/input/event7");
        let (signal_tx, mut signals) = unbounded();
        signal_tx.unbounded_send(ShutdownSignal::Terminate).unwrap();

        // The second signal arrives only once the sink is stuck writing the final record.
        tokio::spawn(async move {
            stalled.next().await;
            let _ = signal_tx.unbounded_send(ShutdownSignal::Interrupt);
        });

        let code = tokio::time::timeout(
            WAIT,
            run_with(
                settings,
                sink,
                backend,
                Ok(paths(&["/dev/input/event7"])),
                &mut signals,
            ),
        )
        .await;
        drop(release);
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(code.unwrap(), EXIT_FORCED);
    }
}
