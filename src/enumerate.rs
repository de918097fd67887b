//! Listing of candidate input device nodes.

use crate::HotkeyResult;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// The directory the kernel exposes evdev nodes in.
pub const INPUT_DIR: &str = "/dev/input";

/// List the evdev nodes currently present in [`INPUT_DIR`].
pub fn list() -> HotkeyResult<impl Iterator<Item = PathBuf>> {
    list_in(INPUT_DIR)
}

/// List the `event<N>` character devices in `dir`.
///
/// The directory is read lazily; nodes that disappear while iterating are skipped.
pub fn list_in(dir: impl AsRef<Path>) -> HotkeyResult<impl Iterator<Item = PathBuf>> {
    Ok(fs::read_dir(dir)?.filter_map(|entry| {
        let entry = entry.ok()?;

        if !is_event_node(&entry.file_name()) {
            return None;
        }

        let path = entry.path();
        let file_type = fs::metadata(&path).ok()?.file_type();

        file_type.is_char_device().then_some(path)
    }))
}

fn is_event_node(name: &OsStr) -> bool {
    name.to_str()
        .and_then(|name| name.strip_prefix("event"))
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
