//! The device side of a keyboard hotkey daemon for Linux.
//!
//! Evdev nodes are listed with [`enumerate::list`], sorted into keyboards and everything else
//! with [`classify`], and every keyboard is read by its own loop in a [`StreamManager`]. The
//! decoded [`Event`]s of all keyboards arrive on one channel. A [`Daemon`] ties this together
//! and shuts it down on `SIGINT`/`SIGTERM`. Log output goes through a [`LogSink`], which writes
//! from a background thread so that logging never stalls event delivery.
//!
//! # Example
//!
//! Print the key events of every keyboard until interrupted. Reading input devices usually
//! requires root privileges or membership in the `input` group.
//!
//! ```no_run
//! use hotkeyd::{enumerate, lifecycle, Daemon, Evdev};
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), hotkeyd::HotkeyError> {
//!     let (tx, mut rx) = mpsc::channel::<hotkeyd::Event>(64);
//!
//!     tokio::spawn(async move {
//!         while let Some(ev) = rx.recv().await {
//!             println!("[{}]: {:?}", ev.device.display(), ev.key());
//!         }
//!     });
//!
//!     let outcome = Daemon::new(Evdev, Duration::from_secs(2))
//!         .run(enumerate::list()?, lifecycle::os_signals()?, tx)
//!         .await;
//!
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux");

pub mod classify;
pub mod config;
pub mod device;
pub mod enumerate;
mod error;
pub mod lifecycle;
pub mod log_sink;
pub mod settings;
pub mod stream;

pub use classify::{classify, Classification};
pub use device::{Evdev, InputBackend, InputDevice, RawEvent};
pub use error::HotkeyError;
pub use lifecycle::{run, Daemon, Outcome, Phase, ShutdownSignal};
pub use log_sink::{LogRecord, LogSink};
pub use settings::Settings;
pub use stream::{DeviceExit, Event, EventStream, ExitReason, KeyEventCause, StreamManager};

pub type HotkeyResult<T> = Result<T, HotkeyError>;
