use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotkeyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot access {}: {source}", path.display())]
    DeviceAccess { path: PathBuf, source: io::Error },
    #[error("device {} disconnected: {source}", path.display())]
    DeviceDisconnected { path: PathBuf, source: io::Error },
    #[error("no configuration file found (tried {})", display_paths(.0))]
    ConfigNotFound(Vec<PathBuf>),
    #[error("malformed configuration file {}: {reason}", path.display())]
    ConfigMalformed { path: PathBuf, reason: String },
    #[error("no keyboard devices found")]
    NoKeyboardFound,
    #[error("invalid timestamp: {0}s {1}us")]
    InvalidTimestamp(i64, i64),
    #[error("{} is already being streamed", .0.display())]
    AlreadyStreaming(PathBuf),
    #[error("not accepting new device streams")]
    NotAccepting,
    #[error("all device streams exited")]
    DeviceStreamsExited,
    #[error("invalid value for {name}: {value:?}")]
    InvalidSetting { name: &'static str, value: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
