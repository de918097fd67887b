//! Runtime settings, read from the environment.

use crate::enumerate::INPUT_DIR;
use crate::error::HotkeyError;
use crate::log_sink::DEFAULT_QUEUE_CAPACITY;
use crate::HotkeyResult;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const INPUT_DIR_VAR: &str = "HOTKEYD_INPUT_DIR";
pub const CONFIG_VAR: &str = "HOTKEYD_CONFIG";
pub const LOG_VAR: &str = "HOTKEYD_LOG";
pub const DRAIN_MS_VAR: &str = "HOTKEYD_DRAIN_MS";
pub const LOG_QUEUE_VAR: &str = "HOTKEYD_LOG_QUEUE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Where to look for evdev nodes.
    pub input_dir: PathBuf,
    /// An explicit bindings file, tried instead of the default locations.
    pub config_path: Option<PathBuf>,
    /// A `tracing` filter directive.
    pub log_filter: String,
    /// How long shutdown waits for device loops to unwind.
    pub drain_grace: Duration,
    /// How many log records may be queued before new ones are dropped.
    pub log_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(INPUT_DIR),
            config_path: None,
            log_filter: "info".into(),
            drain_grace: Duration::from_millis(2000),
            log_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Settings {
    pub fn from_env() -> HotkeyResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the settings from the variables `env` returns, falling back to the defaults.
    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> HotkeyResult<Self> {
        let mut settings = Self::default();

        if let Some(dir) = env(INPUT_DIR_VAR) {
            settings.input_dir = dir.into();
        }

        settings.config_path = env(CONFIG_VAR).filter(|p| !p.is_empty()).map(PathBuf::from);

        if let Some(filter) = env(LOG_VAR) {
            settings.log_filter = filter;
        }

        if let Some(ms) = env(DRAIN_MS_VAR) {
            settings.drain_grace = Duration::from_millis(parse(DRAIN_MS_VAR, ms)?);
        }

        if let Some(capacity) = env(LOG_QUEUE_VAR) {
            settings.log_queue_capacity = parse(LOG_QUEUE_VAR, capacity)?;

            if settings.log_queue_capacity == 0 {
                return Err(HotkeyError::InvalidSetting {
                    name: LOG_QUEUE_VAR,
                    value: "0".into(),
                });
            }
        }

        Ok(settings)
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> HotkeyResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| HotkeyError::InvalidSetting { name, value })
}
