//! Session map: the hook's write target, the monitor's read source.
//!
//! `session_map.json` links tmux windows to agent sessions. Keys are
//! `"<mux_session>:<window_id>"`; the SessionStart hook is the sole writer,
//! the bridge only reads. A mutex-free cached reader keeps the 2 s monitor
//! tick and the routing hub off the disk when nothing changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::write_json_atomic;

/// One hook-written entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMapEntry {
    pub session_id: String,
    pub cwd: String,
    #[serde(default)]
    pub window_name: String,
}

/// Parsed view: window_id → entry, filtered to one mux session.
pub type SessionMapView = HashMap<String, SessionMapEntry>;

fn parse_session_map(raw: &HashMap<String, SessionMapEntry>, mux_session: &str) -> SessionMapView {
    let prefix = format!("{mux_session}:");
    raw.iter()
        .filter_map(|(key, entry)| {
            let window_id = key.strip_prefix(&prefix)?;
            if entry.session_id.is_empty() {
                return None;
            }
            Some((window_id.to_string(), entry.clone()))
        })
        .collect()
}

/// Read-mostly store over the session map file.
pub struct SessionMapStore {
    path: PathBuf,
    mux_session: String,
    cache: RwLock<(Option<SystemTime>, SessionMapView)>,
}

impl SessionMapStore {
    pub fn new(path: PathBuf, mux_session: impl Into<String>) -> Self {
        Self {
            path,
            mux_session: mux_session.into(),
            cache: RwLock::new((None, SessionMapView::new())),
        }
    }

    /// Current view, re-reading the file only when its mtime moved.
    pub fn load(&self) -> SessionMapView {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();

        {
            let cache = self.cache.read().expect("session map cache poisoned");
            if cache.0.is_some() && cache.0 == mtime {
                return cache.1.clone();
            }
        }

        let view = match std::fs::read(&self.path) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, SessionMapEntry>>(&data) {
                Ok(raw) => parse_session_map(&raw, &self.mux_session),
                Err(e) => {
                    warn!(
                        component = "session_map",
                        event = "session_map.parse_failed",
                        path = %self.path.display(),
                        error = %e,
                        "Failed to parse session map, keeping previous view"
                    );
                    return self.cache.read().expect("session map cache poisoned").1.clone();
                }
            },
            Err(_) => SessionMapView::new(),
        };

        let mut cache = self.cache.write().expect("session map cache poisoned");
        *cache = (mtime, view.clone());
        view
    }

    /// Session id currently associated with a window, if any.
    pub fn session_for_window(&self, window_id: &str) -> Option<String> {
        self.load().get(window_id).map(|e| e.session_id.clone())
    }
}

/// Merge one entry into the session map file (hook path; read + atomic
/// rewrite). The hook never holds bridge state, so this is a free function.
pub fn write_entry(
    path: &Path,
    mux_session: &str,
    window_id: &str,
    entry: SessionMapEntry,
) -> anyhow::Result<()> {
    let mut raw: HashMap<String, SessionMapEntry> = match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => HashMap::new(),
    };
    raw.insert(format!("{mux_session}:{window_id}"), entry);
    write_json_atomic(path, &raw)
}
