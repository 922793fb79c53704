//! Persistent byte offsets for tracked transcript files.
//!
//! One row per agent session the monitor watches. Rows are the only thing
//! the bridge persists about agent output — content is never stored, and an
//! offset that has advanced past a line is never rewound (except the
//! truncation reset, which the monitor drives).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{load_json_or_default, write_json_atomic};

/// One watched session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSession {
    pub session_id: String,
    pub file_path: PathBuf,
    pub last_byte_offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedOffsets {
    sessions: HashMap<String, TrackedSession>,
}

/// In-memory offset table with dirty-flagged atomic flush.
pub struct OffsetStore {
    path: PathBuf,
    sessions: HashMap<String, TrackedSession>,
    dirty: bool,
}

impl OffsetStore {
    pub fn load(path: &Path) -> Self {
        let persisted: PersistedOffsets = load_json_or_default(path);
        Self {
            path: path.to_path_buf(),
            sessions: persisted.sessions,
            dirty: false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&TrackedSession> {
        self.sessions.get(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Begin tracking a session at the given offset.
    pub fn track(&mut self, session_id: &str, file_path: PathBuf, offset: u64) {
        self.sessions.insert(
            session_id.to_string(),
            TrackedSession {
                session_id: session_id.to_string(),
                file_path,
                last_byte_offset: offset,
            },
        );
        self.dirty = true;
    }

    /// Move a session's offset. Forward moves and the truncation reset to 0
    /// are accepted; any other backward move is ignored.
    pub fn set_offset(&mut self, session_id: &str, offset: u64) {
        if let Some(row) = self.sessions.get_mut(session_id) {
            if offset >= row.last_byte_offset || offset == 0 {
                if row.last_byte_offset != offset {
                    row.last_byte_offset = offset;
                    self.dirty = true;
                }
            } else {
                warn!(
                    component = "offsets",
                    event = "offsets.backward_move_ignored",
                    session_id = %session_id,
                    current = row.last_byte_offset,
                    requested = offset,
                    "Ignoring backward offset move"
                );
            }
        }
    }

    /// Drop a session's row (session ended or rotated).
    pub fn remove(&mut self, session_id: &str) -> Option<TrackedSession> {
        let removed = self.sessions.remove(session_id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Write the table out if anything changed since the last flush.
    pub fn flush_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        let persisted = PersistedOffsets {
            sessions: self.sessions.clone(),
        };
        match write_json_atomic(&self.path, &persisted) {
            Ok(()) => self.dirty = false,
            Err(e) => {
                warn!(
                    component = "offsets",
                    event = "offsets.flush_failed",
                    path = %self.path.display(),
                    error = %e,
                    "Failed writing offset state"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ccbot-offsets-{name}-{}", std::process::id()))
    }

    #[test]
    fn offsets_survive_reload() {
        let path = scratch("reload");
        let _ = std::fs::remove_file(&path);

        let mut store = OffsetStore::load(&path);
        store.track("sid-1", PathBuf::from("/tmp/a.jsonl"), 0);
        store.set_offset("sid-1", 512);
        store.flush_if_dirty();

        let store2 = OffsetStore::load(&path);
        assert_eq!(store2.get("sid-1").unwrap().last_byte_offset, 512);
        assert_eq!(store2.get("sid-1").unwrap().file_path, PathBuf::from("/tmp/a.jsonl"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn offset_never_decreases_except_reset() {
        let path = scratch("monotonic");
        let mut store = OffsetStore::load(&path);
        store.track("sid", PathBuf::from("/tmp/t.jsonl"), 100);

        store.set_offset("sid", 50);
        assert_eq!(store.get("sid").unwrap().last_byte_offset, 100);

        store.set_offset("sid", 200);
        assert_eq!(store.get("sid").unwrap().last_byte_offset, 200);

        // truncation reset is the one allowed rewind
        store.set_offset("sid", 0);
        assert_eq!(store.get("sid").unwrap().last_byte_offset, 0);
    }

    #[test]
    fn remove_marks_dirty_and_deletes_row() {
        let path = scratch("remove");
        let _ = std::fs::remove_file(&path);

        let mut store = OffsetStore::load(&path);
        store.track("gone", PathBuf::from("/tmp/g.jsonl"), 9);
        store.flush_if_dirty();

        assert!(store.remove("gone").is_some());
        store.flush_if_dirty();

        let store2 = OffsetStore::load(&path);
        assert!(!store2.contains("gone"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn flush_is_noop_when_clean() {
        let path = scratch("clean");
        let _ = std::fs::remove_file(&path);

        let mut store = OffsetStore::load(&path);
        store.flush_if_dirty();
        // nothing tracked, nothing written
        assert!(!path.exists());
    }
}
