//! Keyboard detection.
//!
//! A device counts as a keyboard if it can report `KEY_ENTER`. Keyboards without an Enter key
//! are therefore missed, but nothing that is not a keyboard reports that key.

use crate::device::event_codes::KEY_ENTER;
use crate::device::{Evdev, InputBackend};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// The key whose presence marks a device as a keyboard.
pub const KEYBOARD_MARKER_KEY: u16 = KEY_ENTER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Keyboard,
    NonKeyboard,
    /// The device could not be queried.
    Unknown(String),
}

impl Classification {
    pub fn is_keyboard(&self) -> bool {
        matches!(self, Classification::Keyboard)
    }
}

/// Classify the evdev node at `path`.
pub fn classify(path: &Path) -> Classification {
    classify_with(&Evdev, path)
}

/// Classify `path` by querying its key capabilities through `backend`.
pub fn classify_with<B: InputBackend + ?Sized>(backend: &B, path: &Path) -> Classification {
    match backend.supports_key(path, KEYBOARD_MARKER_KEY) {
        Ok(true) => Classification::Keyboard,
        Ok(false) => Classification::NonKeyboard,
        Err(e) => Classification::Unknown(e.to_string()),
    }
}

/// Classify each of `paths` exactly once, logging the outcome.
pub fn classify_all<B, I>(backend: &B, paths: I) -> Vec<(PathBuf, Classification)>
where
    B: InputBackend + ?Sized,
    I: IntoIterator<Item = PathBuf>,
{
    paths
        .into_iter()
        .map(|path| {
            let class = classify_with(backend, &path);

            match &class {
                Classification::Keyboard => debug!("{} is a keyboard", path.display()),
                Classification::NonKeyboard => trace!("{} is not a keyboard", path.display()),
                Classification::Unknown(reason) => {
                    warn!("skipping {}: {reason}", path.display())
                }
            }

            (path, class)
        })
        .collect()
}
