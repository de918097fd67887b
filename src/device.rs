//! Raw access to evdev character devices.

pub mod event_codes;
mod ioctl;

pub(crate) use ioctl::KeyBits;

use crate::error::HotkeyError;
use crate::HotkeyResult;
use std::fs::{File, OpenOptions};
use std::future::poll_fn;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;

/// One undecoded kernel record, as read from an evdev node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub sec: i64,
    pub usec: i64,
    pub ty: u16,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn new(ty: u16, code: u16, value: i32) -> Self {
        Self {
            sec: 0,
            usec: 0,
            ty,
            code,
            value,
        }
    }

    pub fn at(mut self, sec: i64, usec: i64) -> Self {
        self.sec = sec;
        self.usec = usec;
        self
    }
}

impl From<&libc::input_event> for RawEvent {
    fn from(ev: &libc::input_event) -> Self {
        Self {
            sec: ev.time.tv_sec as i64,
            usec: ev.time.tv_usec as i64,
            ty: ev.type_,
            code: ev.code,
            value: ev.value,
        }
    }
}

impl From<&RawEvent> for libc::input_event {
    fn from(ev: &RawEvent) -> Self {
        libc::input_event {
            time: libc::timeval {
                tv_sec: ev.sec as libc::time_t,
                tv_usec: ev.usec as libc::suseconds_t,
            },
            type_: ev.ty,
            code: ev.code,
            value: ev.value,
        }
    }
}

/// Serialize `events` in the kernel's `input_event` layout.
///
/// This is the byte stream an evdev node produces; it is mostly useful for feeding synthetic
/// events through a socket or pipe.
pub fn encode(events: &[RawEvent]) -> Vec<u8> {
    let size = mem::size_of::<libc::input_event>();
    let mut buf = Vec::with_capacity(events.len() * size);

    for ev in events {
        let ev = libc::input_event::from(ev);
        // input_event is plain old data:
        let bytes =
            unsafe { std::slice::from_raw_parts(&ev as *const _ as *const u8, size) };
        buf.extend_from_slice(bytes);
    }

    buf
}

/// Where device nodes come from.
///
/// [`Evdev`] is the real implementation; anything else is a stand-in (for example a socket
/// that carries encoded [`RawEvent`]s).
pub trait InputBackend {
    type Handle: AsRawFd + Send + Sync + Unpin + 'static;

    /// Check whether the device at `path` can report the key `code`.
    ///
    /// Any handle opened for the query must be released before returning.
    fn supports_key(&self, path: &Path, code: u16) -> io::Result<bool>;

    /// Open `path` for streaming.
    fn open(&self, path: &Path) -> io::Result<Self::Handle>;
}

/// The kernel's evdev interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct Evdev;

impl InputBackend for Evdev {
    type Handle = File;

    fn supports_key(&self, path: &Path, code: u16) -> io::Result<bool> {
        let file = File::open(path)?;
        let keys = ioctl::read_key_capabilities(file.as_raw_fd())?;

        Ok(keys.contains(code))
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
    }
}

/// An open input device registered with the tokio reactor.
///
/// The handle is closed when the `InputDevice` is dropped.
#[derive(Debug)]
pub struct InputDevice<F: AsRawFd = File> {
    name: Option<String>,
    path: Arc<Path>,
    async_fd: AsyncFd<F>,
}

impl<F: AsRawFd> InputDevice<F> {
    /// Wrap an already opened `handle`. Must be called from within a tokio runtime.
    pub fn new(path: impl Into<PathBuf>, handle: F) -> HotkeyResult<Self> {
        let path: PathBuf = path.into();
        let access = |source| HotkeyError::DeviceAccess {
            path: path.clone(),
            source,
        };

        ioctl::set_nonblocking(handle.as_raw_fd()).map_err(access)?;
        let name = ioctl::read_name(handle.as_raw_fd()).ok();
        let async_fd = AsyncFd::new(handle).map_err(access)?;

        Ok(Self {
            name,
            path: path.into(),
            async_fd,
        })
    }

    /// The name reported by the driver, if the handle is a real evdev node.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn shared_path(&self) -> Arc<Path> {
        Arc::clone(&self.path)
    }

    /// Read the keys currently held down.
    pub(crate) fn key_state(&self) -> io::Result<KeyBits> {
        ioctl::read_key_state(self.async_fd.get_ref().as_raw_fd())
    }

    /// Poll for the next batch of raw records.
    ///
    /// An empty batch is never returned: end of file is reported as
    /// [`io::ErrorKind::UnexpectedEof`].
    pub fn poll_read_batch(&self, cx: &mut Context<'_>) -> Poll<io::Result<Vec<RawEvent>>> {
        loop {
            let mut guard = futures::ready!(self.async_fd.poll_read_ready(cx))?;

            match guard.try_io(|inner| read_input_events(inner.get_ref().as_raw_fd())) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn read_batch(&self) -> io::Result<Vec<RawEvent>> {
        poll_fn(|cx| self.poll_read_batch(cx)).await
    }
}

/// Read up to `MAX_INPUT_EV` [`libc::input_event`s](libc::input_event) from `fd`.
fn read_input_events(fd: RawFd) -> io::Result<Vec<RawEvent>> {
    const MAX_INPUT_EV: usize = 64;

    let size = mem::size_of::<libc::input_event>();
    let mut input_events = [mem::MaybeUninit::<libc::input_event>::uninit(); MAX_INPUT_EV];

    let n = unsafe {
        libc::read(
            fd,
            input_events.as_mut_ptr() as *mut libc::c_void,
            MAX_INPUT_EV * size,
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    let n = (n as usize) / size;

    // The first n elements of the array are initialized:
    Ok(input_events[..n]
        .iter()
        .map(|e| RawEvent::from(unsafe { &e.assume_init() }))
        .collect())
}
