//! Concurrent per-device event streaming.
//!
//! Every keyboard gets its own task reading from its own handle, so an idle device never holds
//! up another one. Decoded events from all devices are sent to a single downstream channel;
//! events from one device arrive there in the order the kernel reported them.

mod decode;

pub use decode::{Event, KeyEventCause};

use crate::device::{InputDevice, RawEvent};
use crate::error::HotkeyError;
use crate::HotkeyResult;
use chrono::Utc;
use decode::{Decoded, Decoder};
use futures::{ready, Stream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The decoded events of a single device.
///
/// Yields an error once if reading from the device fails, and ends after that.
#[derive(Debug)]
pub struct EventStream<F: AsRawFd = File> {
    device: InputDevice<F>,
    decoder: Decoder,
    pending: VecDeque<Event>,
    done: bool,
}

impl<F: AsRawFd> EventStream<F> {
    pub fn new(device: InputDevice<F>) -> Self {
        Self {
            decoder: Decoder::new(device.shared_path()),
            device,
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub fn device(&self) -> &InputDevice<F> {
        &self.device
    }

    fn decode(&mut self, raw: &RawEvent) {
        match self.decoder.feed(raw) {
            Ok(Decoded::Event(ev)) => self.pending.push_back(ev),
            Ok(Decoded::Skipped) => {}
            Ok(Decoded::Dropped) => {
                warn!(
                    "{}: kernel dropped input events, resynchronizing",
                    self.device.path().display()
                );
            }
            Ok(Decoded::Resynced) => match self.device.key_state() {
                Ok(held) => {
                    let events = self.decoder.reconcile(&held, Utc::now());
                    debug!(
                        "{}: resynchronized, {} key state change(s)",
                        self.device.path().display(),
                        events.len()
                    );
                    self.pending.extend(events);
                }
                Err(e) => {
                    debug!(
                        "{}: key state unavailable ({e}), resuming without reconciliation",
                        self.device.path().display()
                    );
                }
            },
            Err(e) => {
                warn!("{}: discarding record: {e}", self.device.path().display());
            }
        }
    }
}

impl<F: AsRawFd + Unpin> Stream for EventStream<F> {
    type Item = HotkeyResult<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(ev) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }

            if this.done {
                return Poll::Ready(None);
            }

            match ready!(this.device.poll_read_batch(cx)) {
                Ok(batch) => {
                    for raw in &batch {
                        this.decode(raw);
                    }
                }
                Err(source) => {
                    this.done = true;

                    return Poll::Ready(Some(Err(HotkeyError::DeviceDisconnected {
                        path: this.device.path().to_path_buf(),
                        source,
                    })));
                }
            }
        }
    }
}

/// Why a device loop ended.
#[derive(Debug)]
pub enum ExitReason {
    /// The loop was asked to stop.
    Cancelled,
    /// Reading from the device failed.
    Disconnected(HotkeyError),
    /// Nobody is listening for events anymore.
    DownstreamClosed,
}

#[derive(Debug)]
pub struct DeviceExit {
    pub path: PathBuf,
    pub reason: ExitReason,
}

/// Removes its path from the active set when the loop that owns it is gone, however it ended.
struct ActiveGuard {
    path: PathBuf,
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Runs and supervises one read loop per device.
#[derive(Debug)]
pub struct StreamManager {
    tasks: JoinSet<DeviceExit>,
    cancel: watch::Sender<bool>,
    active: Arc<Mutex<HashSet<PathBuf>>>,
    downstream: mpsc::Sender<Event>,
    accepting: bool,
}

impl StreamManager {
    pub fn new(downstream: mpsc::Sender<Event>) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: watch::Sender::new(false),
            active: Arc::default(),
            downstream,
            accepting: true,
        }
    }

    /// Whether a loop is currently reading from `path`.
    pub fn is_streaming(&self, path: &Path) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    /// The number of loops that have not been reaped yet.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start streaming events from `device`.
    ///
    /// Fails if another loop is already reading from the same path, or if the manager is
    /// shutting down. In both cases `device` is dropped, closing its handle.
    pub fn spawn<F>(&mut self, device: InputDevice<F>) -> HotkeyResult<()>
    where
        F: AsRawFd + Unpin + Send + Sync + 'static,
    {
        if !self.accepting {
            return Err(HotkeyError::NotAccepting);
        }

        let path = device.path().to_path_buf();

        if !self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone())
        {
            return Err(HotkeyError::AlreadyStreaming(path));
        }

        let guard = ActiveGuard {
            path,
            active: Arc::clone(&self.active),
        };

        self.tasks.spawn(run_device(
            EventStream::new(device),
            self.downstream.clone(),
            self.cancel.subscribe(),
            guard,
        ));

        Ok(())
    }

    /// Wait for the next loop to end.
    ///
    /// Returns `None` once no loops are left.
    pub async fn next_exit(&mut self) -> Option<DeviceExit> {
        loop {
            match self.tasks.join_next().await? {
                Ok(exit) => return Some(exit),
                Err(e) if e.is_cancelled() => continue,
                Err(e) => error!("device stream task failed: {e}"),
            }
        }
    }

    /// Refuse any further [`spawn`](Self::spawn)s.
    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    /// Cancel every loop and wait up to `grace` for them to unwind.
    ///
    /// Loops still running after that are aborted. Returns how many had to be aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> usize {
        self.stop_accepting();
        self.cancel.send_replace(true);

        let drained = tokio::time::timeout(grace, async {
            while self.next_exit().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            return 0;
        }

        let abandoned = self.tasks.len();
        warn!("abandoning {abandoned} device stream(s) that did not stop in {grace:?}");

        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        abandoned
    }
}

async fn run_device<F>(
    events: EventStream<F>,
    downstream: mpsc::Sender<Event>,
    cancel: watch::Receiver<bool>,
    _guard: ActiveGuard,
) -> DeviceExit
where
    F: AsRawFd + Unpin,
{
    let path = events.device().path().to_path_buf();

    info!(
        "streaming events from {} ({})",
        path.display(),
        events.device().name().unwrap_or("unnamed device")
    );

    let reason = stream_device(events, downstream, cancel).await;

    match &reason {
        ExitReason::Cancelled => debug!("{}: stream cancelled", path.display()),
        ExitReason::Disconnected(e) => warn!("{e}"),
        ExitReason::DownstreamClosed => debug!("{}: downstream closed", path.display()),
    }

    DeviceExit { path, reason }
}

/// Forward events until the device fails, the receiver goes away, or `cancel` is set.
///
/// `events` (and with it the device handle) is dropped on return.
async fn stream_device<F>(
    mut events: EventStream<F>,
    downstream: mpsc::Sender<Event>,
    mut cancel: watch::Receiver<bool>,
) -> ExitReason
where
    F: AsRawFd + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return ExitReason::Cancelled,
            next = events.next() => next,
        };

        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => return ExitReason::Disconnected(e),
            None => {
                return ExitReason::Disconnected(HotkeyError::DeviceDisconnected {
                    path: events.device().path().to_path_buf(),
                    source: io::ErrorKind::UnexpectedEof.into(),
                })
            }
        };

        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return ExitReason::Cancelled,
            sent = downstream.send(ev) => {
                if sent.is_err() {
                    return ExitReason::DownstreamClosed;
                }
            }
        }
    }
}

/// Resolves once cancellation is requested, or once the manager is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::event_codes::*;
    use crate::device::encode;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    const KEY_A: u16 = 30;
    const KEY_B: u16 = 48;
    const WAIT: Duration = Duration::from_secs(5);

    fn device(path: &str) -> (UnixStream, InputDevice<UnixStream>) {
        let (peer, handle) = UnixStream::pair().unwrap();

        (peer, InputDevice::new(path, handle).unwrap())
    }

    async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn forwards_only_meaningful_events_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut manager = StreamManager::new(tx);
        let (mut peer, dev) = device("/dev/input/event7");
        manager.spawn(dev).unwrap();

        let raw = [
            RawEvent::new(EV_MSC, MSC_SCAN, 0x70004),
            RawEvent::new(EV_KEY, KEY_A, 1),
            RawEvent::new(EV_SYN, SYN_REPORT, 0),
            RawEvent::new(EV_KEY, KEY_B, 1),
            RawEvent::new(EV_SYN, SYN_REPORT, 0),
            RawEvent::new(EV_MSC, MSC_SCAN, 0x70004),
            RawEvent::new(EV_KEY, KEY_A, 0),
            RawEvent::new(EV_SYN, SYN_REPORT, 0),
        ];
        peer.write_all(&encode(&raw)).unwrap();

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(recv(&mut rx).await.key().unwrap());
        }

        assert_eq!(
            got,
            vec![
                (KEY_A, KeyEventCause::Press),
                (KEY_B, KeyEventCause::Press),
                (KEY_A, KeyEventCause::Release),
            ]
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_only_that_loop() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut manager = StreamManager::new(tx);
        let (gone, dev) = device("/dev/input/event3");
        manager.spawn(dev).unwrap();
        let (mut alive, dev) = device("/dev/input/event7");
        manager.spawn(dev).unwrap();

        drop(gone);

        let exit = tokio::time::timeout(WAIT, manager.next_exit())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.path, Path::new("/dev/input/event3"));
        assert!(matches!(
            exit.reason,
            ExitReason::Disconnected(HotkeyError::DeviceDisconnected { .. })
        ));
        assert!(!manager.is_streaming(Path::new("/dev/input/event3")));
        assert!(manager.is_streaming(Path::new("/dev/input/event7")));

        alive
            .write_all(&encode(&[RawEvent::new(EV_KEY, KEY_A, 1)]))
            .unwrap();
        let ev = recv(&mut rx).await;
        assert_eq!(&*ev.device, Path::new("/dev/input/event7"));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_idle_loops() {
        let (tx, _rx) = mpsc::channel(16);
        let mut manager = StreamManager::new(tx);
        let (_peer3, dev) = device("/dev/input/event3");
        manager.spawn(dev).unwrap();
        let (_peer7, dev) = device("/dev/input/event7");
        manager.spawn(dev).unwrap();

        assert_eq!(manager.shutdown(WAIT).await, 0);
        assert!(manager.is_empty());
        assert!(!manager.is_streaming(Path::new("/dev/input/event7")));

        let (_peer, dev) = device("/dev/input/event9");
        assert!(matches!(manager.spawn(dev), Err(HotkeyError::NotAccepting)));
    }

    #[tokio::test]
    async fn shutdown_releases_the_handle() {
        let (tx, _rx) = mpsc::channel(16);
        let mut manager = StreamManager::new(tx);
        let (mut peer, dev) = device("/dev/input/event7");
        manager.spawn(dev).unwrap();

        manager.shutdown(WAIT).await;

        // The other end of a closed socket can no longer be written to.
        let written = peer.write_all(&encode(&[RawEvent::new(EV_KEY, KEY_A, 1)]));
        assert!(written.is_err());
    }

    #[tokio::test]
    async fn a_path_is_streamed_at_most_once() {
        let (tx, _rx) = mpsc::channel(16);
        let mut manager = StreamManager::new(tx);
        let (_first, dev) = device("/dev/input/event7");
        manager.spawn(dev).unwrap();
        let (_second, dev) = device("/dev/input/event7");

        assert!(matches!(
            manager.spawn(dev),
            Err(HotkeyError::AlreadyStreaming(path)) if path == Path::new("/dev/input/event7")
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn dropped_records_are_discarded_up_to_the_report_boundary() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut manager = StreamManager::new(tx);
        let (mut peer, dev) = device("/dev/input/event7");
        manager.spawn(dev).unwrap();

        let raw = [
            RawEvent::new(EV_SYN, SYN_DROPPED, 0),
            RawEvent::new(EV_KEY, KEY_A, 1),
            RawEvent::new(EV_SYN, SYN_REPORT, 0),
            RawEvent::new(EV_KEY, KEY_B, 1),
        ];
        peer.write_all(&encode(&raw)).unwrap();

        assert_eq!(
            recv(&mut rx).await.key(),
            Some((KEY_B, KeyEventCause::Press))
        );
    }
}
