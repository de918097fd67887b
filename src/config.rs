//! Locating and reading the bindings file.
//!
//! The file is a JSON array of objects. Every object is one binding; its values, in the
//! order they appear in the file, are handed on as a list of strings.

use crate::error::HotkeyError;
use crate::HotkeyResult;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CONFIG_FILE_NAME: &str = "hotkeyd.json";
const SYSTEM_CONFIG_DIR: &str = "/etc/hotkeyd";

/// One binding: the string values of one object in the bindings file.
pub type Binding = Vec<String>;

/// The files to try, most specific first.
///
/// An explicit `override_path` is the only candidate. Otherwise `$XDG_CONFIG_HOME`, then
/// `$HOME/.config`, then the system directory are tried. `env` looks up environment variables.
pub fn candidates(
    override_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Vec<PathBuf> {
    if let Some(path) = override_path {
        return vec![path.to_path_buf()];
    }

    let mut paths = Vec::with_capacity(3);

    if let Some(dir) = env("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        paths.push(Path::new(&dir).join("hotkeyd").join(CONFIG_FILE_NAME));
    }

    if let Some(home) = env("HOME").filter(|h| !h.is_empty()) {
        paths.push(
            Path::new(&home)
                .join(".config")
                .join("hotkeyd")
                .join(CONFIG_FILE_NAME),
        );
    }

    paths.push(Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME));
    paths
}

/// Load the bindings from the first candidate that exists and parses.
///
/// Missing candidates are logged at debug level and malformed ones as warnings; either way the
/// next candidate is tried. Fails only once every candidate has been tried.
pub fn load_first(candidates: &[PathBuf]) -> HotkeyResult<Vec<Binding>> {
    let mut last_malformed = None;

    for path in candidates {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no configuration at {}", path.display());
                continue;
            }
            Err(e) => {
                warn!("cannot read {}: {e}", path.display());
                last_malformed = Some(HotkeyError::ConfigMalformed {
                    path: path.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match parse(&contents) {
            Ok(bindings) => {
                info!(
                    "loaded {} binding(s) from {}",
                    bindings.len(),
                    path.display()
                );
                return Ok(bindings);
            }
            Err(reason) => {
                warn!("ignoring {}: {reason}", path.display());
                last_malformed = Some(HotkeyError::ConfigMalformed {
                    path: path.clone(),
                    reason,
                });
            }
        }
    }

    Err(last_malformed.unwrap_or_else(|| HotkeyError::ConfigNotFound(candidates.to_vec())))
}

/// Extract the bindings from the contents of a bindings file.
pub fn parse(contents: &str) -> Result<Vec<Binding>, String> {
    let root: Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;
    let Value::Array(entries) = root else {
        return Err("expected an array of bindings".into());
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| -> Result<Binding, String> {
            let Value::Object(fields) = entry else {
                return Err(format!("binding {i} is not an object"));
            };

            fields
                .into_iter()
                .map(|(key, value)| match value {
                    Value::String(s) => Ok(s),
                    other => Err(format!("binding {i}: {key:?} is not a string: {other}")),
                })
                .collect()
        })
        .collect()
}
