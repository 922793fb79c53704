//! Routing state hub.
//!
//! Owns every persistent mapping between chat topics, tmux windows, and
//! agent sessions, and is the single point of mutation for bindings. The
//! forward map `(user, topic) → window` and the eagerly-maintained reverse
//! index `(user, window) → topic` must agree at all times; `bind` enforces
//! the bijection (one window per topic, one topic per window).
//!
//! Every mutating operation takes the internal lock, applies the change,
//! and persists `state.json` atomically before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ccbot_mux::{is_window_id, MuxWindow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::session_map::SessionMapView;
use crate::store::{load_json_or_default, write_json_atomic};

/// Persistent state for one tmux window the bridge knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub cwd: String,
    pub window_name: String,
}

/// One (user, topic) pair currently receiving a session's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub user_id: i64,
    pub topic_id: i64,
    pub chat_id: i64,
    pub window_id: String,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("window {window_id} is already bound to another topic")]
    WindowAlreadyBound { window_id: String },

    #[error("this topic is already bound to window {window_id}")]
    TopicAlreadyBound { window_id: String },

    #[error("invalid window id '{0}'")]
    InvalidWindowId(String),

    #[error("user and topic ids must be positive")]
    InvalidIds,
}

/// On-disk shape of `state.json`. Composite keys are flattened to
/// `"user:topic"` / `"user:window"` strings for JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    window_states: HashMap<String, WindowState>,
    thread_bindings: HashMap<String, String>,
    user_window_offsets: HashMap<String, HashMap<String, u64>>,
    group_chat_ids: HashMap<String, i64>,
    window_display_names: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct HubInner {
    window_states: HashMap<String, WindowState>,
    bindings: HashMap<(i64, i64), String>,
    reverse: HashMap<(i64, String), i64>,
    chat_ids: HashMap<(i64, i64), i64>,
    read_cursors: HashMap<(i64, String), u64>,
    display_names: HashMap<String, String>,
}

pub struct RouterHub {
    path: PathBuf,
    inner: Mutex<HubInner>,
}

fn pair_key(a: i64, b: &str) -> String {
    format!("{a}:{b}")
}

fn parse_pair_key(key: &str) -> Option<(i64, &str)> {
    let (left, right) = key.split_once(':')?;
    Some((left.parse().ok()?, right))
}

impl RouterHub {
    pub fn load(path: &Path) -> Self {
        let persisted: PersistedState = load_json_or_default(path);
        let mut inner = HubInner {
            window_states: persisted.window_states,
            display_names: persisted.window_display_names,
            ..Default::default()
        };

        for (key, window_id) in &persisted.thread_bindings {
            let Some((user_id, topic_str)) = parse_pair_key(key) else {
                continue;
            };
            let Ok(topic_id) = topic_str.parse::<i64>() else {
                continue;
            };
            inner.bindings.insert((user_id, topic_id), window_id.clone());
            inner.reverse.insert((user_id, window_id.clone()), topic_id);
        }
        for (key, chat_id) in &persisted.group_chat_ids {
            let Some((user_id, topic_str)) = parse_pair_key(key) else {
                continue;
            };
            let Ok(topic_id) = topic_str.parse::<i64>() else {
                continue;
            };
            inner.chat_ids.insert((user_id, topic_id), *chat_id);
        }
        for (user_key, offsets) in &persisted.user_window_offsets {
            let Ok(user_id) = user_key.parse::<i64>() else {
                continue;
            };
            for (window_id, offset) in offsets {
                inner
                    .read_cursors
                    .insert((user_id, window_id.clone()), *offset);
            }
        }

        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        }
    }

    fn save(&self, inner: &HubInner) {
        let mut persisted = PersistedState {
            window_states: inner.window_states.clone(),
            window_display_names: inner.display_names.clone(),
            ..Default::default()
        };
        for ((user_id, topic_id), window_id) in &inner.bindings {
            persisted
                .thread_bindings
                .insert(format!("{user_id}:{topic_id}"), window_id.clone());
        }
        for ((user_id, topic_id), chat_id) in &inner.chat_ids {
            persisted
                .group_chat_ids
                .insert(format!("{user_id}:{topic_id}"), *chat_id);
        }
        for ((user_id, window_id), offset) in &inner.read_cursors {
            persisted
                .user_window_offsets
                .entry(user_id.to_string())
                .or_default()
                .insert(window_id.clone(), *offset);
        }

        if let Err(e) = write_json_atomic(&self.path, &persisted) {
            warn!(
                component = "hub",
                event = "hub.state_persist_failed",
                path = %self.path.display(),
                error = %e,
                "Failed writing bridge state"
            );
        }
    }

    /// Atomically create a binding plus its dependent entries.
    pub fn bind(
        &self,
        user_id: i64,
        topic_id: i64,
        window_id: &str,
        display_name: &str,
        cwd: &str,
        chat_id: i64,
    ) -> Result<(), HubError> {
        if user_id < 1 || topic_id < 1 {
            return Err(HubError::InvalidIds);
        }
        if !is_window_id(window_id) {
            return Err(HubError::InvalidWindowId(window_id.to_string()));
        }

        let mut inner = self.inner.lock().expect("hub lock poisoned");

        if let Some(existing) = inner.bindings.get(&(user_id, topic_id)) {
            if existing != window_id {
                return Err(HubError::TopicAlreadyBound {
                    window_id: existing.clone(),
                });
            }
        }
        let taken_elsewhere = inner
            .bindings
            .iter()
            .any(|(k, w)| w == window_id && *k != (user_id, topic_id));
        if taken_elsewhere {
            return Err(HubError::WindowAlreadyBound {
                window_id: window_id.to_string(),
            });
        }

        inner
            .bindings
            .insert((user_id, topic_id), window_id.to_string());
        inner
            .reverse
            .insert((user_id, window_id.to_string()), topic_id);
        inner.chat_ids.insert((user_id, topic_id), chat_id);
        inner
            .display_names
            .insert(window_id.to_string(), display_name.to_string());
        let state = inner.window_states.entry(window_id.to_string()).or_default();
        if state.cwd.is_empty() {
            state.cwd = cwd.to_string();
        }
        if state.window_name.is_empty() {
            state.window_name = display_name.to_string();
        }

        info!(
            component = "hub",
            event = "hub.bound",
            user_id = user_id,
            topic_id = topic_id,
            window_id = %window_id,
            display_name = %display_name,
            "Bound topic to window"
        );
        self.save(&inner);
        Ok(())
    }

    /// Remove a binding and its dependent entries. Does not kill the window;
    /// the caller decides that.
    pub fn unbind(&self, user_id: i64, topic_id: i64) -> Option<String> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let window_id = inner.bindings.remove(&(user_id, topic_id))?;
        inner.reverse.remove(&(user_id, window_id.clone()));
        inner.chat_ids.remove(&(user_id, topic_id));
        inner.read_cursors.remove(&(user_id, window_id.clone()));

        info!(
            component = "hub",
            event = "hub.unbound",
            user_id = user_id,
            topic_id = topic_id,
            window_id = %window_id,
            "Unbound topic"
        );
        self.save(&inner);
        Some(window_id)
    }

    pub fn resolve_topic(&self, user_id: i64, topic_id: i64) -> Option<String> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .bindings
            .get(&(user_id, topic_id))
            .cloned()
    }

    pub fn topic_for_window(&self, user_id: i64, window_id: &str) -> Option<i64> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .reverse
            .get(&(user_id, window_id.to_string()))
            .copied()
    }

    pub fn chat_for(&self, user_id: i64, topic_id: i64) -> Option<i64> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .chat_ids
            .get(&(user_id, topic_id))
            .copied()
    }

    pub fn window_state(&self, window_id: &str) -> Option<WindowState> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .window_states
            .get(window_id)
            .cloned()
    }

    /// Every current binding as (user, topic, chat, window) rows; the status
    /// poller iterates this.
    pub fn bound_windows(&self) -> Vec<Subscriber> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        let mut rows: Vec<Subscriber> = inner
            .bindings
            .iter()
            .filter_map(|((user_id, topic_id), window_id)| {
                let chat_id = *inner.chat_ids.get(&(*user_id, *topic_id))?;
                Some(Subscriber {
                    user_id: *user_id,
                    topic_id: *topic_id,
                    chat_id,
                    window_id: window_id.clone(),
                })
            })
            .collect();
        rows.sort_by_key(|s| (s.user_id, s.topic_id));
        rows
    }

    pub fn is_window_bound(&self, window_id: &str) -> bool {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .bindings
            .values()
            .any(|w| w == window_id)
    }

    /// All (user, topic, chat, window) rows whose window currently maps to
    /// this agent session.
    pub fn find_subscribers(&self, session_id: &str) -> Vec<Subscriber> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        let mut rows: Vec<Subscriber> = inner
            .bindings
            .iter()
            .filter(|(_, window_id)| {
                inner
                    .window_states
                    .get(*window_id)
                    .and_then(|s| s.session_id.as_deref())
                    == Some(session_id)
            })
            .filter_map(|((user_id, topic_id), window_id)| {
                let chat_id = *inner.chat_ids.get(&(*user_id, *topic_id))?;
                Some(Subscriber {
                    user_id: *user_id,
                    topic_id: *topic_id,
                    chat_id,
                    window_id: window_id.clone(),
                })
            })
            .collect();
        rows.sort_by_key(|s| (s.user_id, s.topic_id));
        rows
    }

    /// Fold the hook-written session map into window states. Entries for
    /// windows absent from the map are dropped unless a binding still
    /// references them (the hook may simply not have fired yet).
    pub fn apply_session_map(&self, view: &SessionMapView) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let mut changed = false;

        for (window_id, entry) in view {
            let state = inner.window_states.entry(window_id.clone()).or_default();
            let session = Some(entry.session_id.clone());
            if state.session_id != session
                || state.cwd != entry.cwd
                || (!entry.window_name.is_empty() && state.window_name != entry.window_name)
            {
                state.session_id = session;
                state.cwd = entry.cwd.clone();
                if !entry.window_name.is_empty() {
                    state.window_name = entry.window_name.clone();
                }
                changed = true;
            }
        }

        let bound: Vec<String> = inner.bindings.values().cloned().collect();
        let stale: Vec<String> = inner
            .window_states
            .keys()
            .filter(|w| !view.contains_key(*w) && !bound.contains(*w))
            .cloned()
            .collect();
        for window_id in stale {
            inner.window_states.remove(&window_id);
            inner.display_names.remove(&window_id);
            changed = true;
        }

        if changed {
            self.save(&inner);
        }
    }

    /// Forget a window's session association (sent `/clear`); the monitor
    /// picks up the replacement session id from the next hook write.
    pub fn clear_window_session(&self, window_id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let cleared = inner
            .window_states
            .get_mut(window_id)
            .map(|state| state.session_id.take().is_some())
            .unwrap_or(false);
        if cleared {
            self.save(&inner);
        }
    }

    /// Drop a window's state entirely (killed).
    pub fn remove_window(&self, window_id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let a = inner.window_states.remove(window_id).is_some();
        let b = inner.display_names.remove(window_id).is_some();
        if a || b {
            self.save(&inner);
        }
    }

    pub fn read_cursor(&self, user_id: i64, window_id: &str) -> Option<u64> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .read_cursors
            .get(&(user_id, window_id.to_string()))
            .copied()
    }

    /// Monotonic: attempts to move a cursor backward are no-ops.
    pub fn advance_cursor(&self, user_id: i64, window_id: &str, new_offset: u64) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let key = (user_id, window_id.to_string());
        let current = inner.read_cursors.get(&key).copied().unwrap_or(0);
        if new_offset > current || !inner.read_cursors.contains_key(&key) {
            inner.read_cursors.insert(key, new_offset.max(current));
            self.save(&inner);
        }
    }

    /// Re-resolve bindings whose window id no longer exists, using the
    /// stored display name as a secondary key. Runs once at startup after
    /// the multiplexer connection is up; running it twice is a no-op.
    ///
    /// When two stale bindings resolve to the same display name the first in
    /// (user, topic) order claims the window and the second is dropped.
    pub fn resolve_stale_ids(&self, live: &[MuxWindow]) -> (usize, usize) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");

        let live_ids: Vec<&str> = live.iter().map(|w| w.window_id.as_str()).collect();
        let mut live_by_name: HashMap<&str, &MuxWindow> = HashMap::new();
        let mut sorted_live: Vec<&MuxWindow> = live.iter().collect();
        sorted_live.sort_by_key(|w| w.window_id.clone());
        for w in sorted_live {
            live_by_name.entry(w.name.as_str()).or_insert(w);
        }

        let mut claimed: Vec<String> = inner
            .bindings
            .values()
            .filter(|w| live_ids.contains(&w.as_str()))
            .cloned()
            .collect();

        let mut keys: Vec<(i64, i64)> = inner.bindings.keys().copied().collect();
        keys.sort_unstable();

        let mut remapped = 0usize;
        let mut dropped = 0usize;

        for (user_id, topic_id) in keys {
            let window_id = inner.bindings[&(user_id, topic_id)].clone();
            if live_ids.contains(&window_id.as_str()) {
                continue;
            }

            let replacement = inner
                .display_names
                .get(&window_id)
                .and_then(|name| live_by_name.get(name.as_str()))
                .filter(|w| !claimed.contains(&w.window_id))
                .map(|w| (w.window_id.clone(), w.cwd.clone()));

            match replacement {
                Some((new_id, cwd)) => {
                    inner.bindings.insert((user_id, topic_id), new_id.clone());
                    inner.reverse.remove(&(user_id, window_id.clone()));
                    inner.reverse.insert((user_id, new_id.clone()), topic_id);

                    if let Some(mut state) = inner.window_states.remove(&window_id) {
                        state.session_id = None;
                        if state.cwd.is_empty() {
                            state.cwd = cwd;
                        }
                        inner.window_states.entry(new_id.clone()).or_insert(state);
                    }
                    if let Some(name) = inner.display_names.remove(&window_id) {
                        inner.display_names.insert(new_id.clone(), name);
                    }
                    if let Some(offset) = inner.read_cursors.remove(&(user_id, window_id.clone())) {
                        inner.read_cursors.insert((user_id, new_id.clone()), offset);
                    }

                    info!(
                        component = "hub",
                        event = "hub.stale_id_remapped",
                        user_id = user_id,
                        topic_id = topic_id,
                        old_window_id = %window_id,
                        new_window_id = %new_id,
                        "Re-resolved stale window id by display name"
                    );
                    claimed.push(new_id);
                    remapped += 1;
                }
                None => {
                    inner.bindings.remove(&(user_id, topic_id));
                    inner.reverse.remove(&(user_id, window_id.clone()));
                    inner.chat_ids.remove(&(user_id, topic_id));
                    inner.read_cursors.remove(&(user_id, window_id.clone()));
                    inner.window_states.remove(&window_id);
                    inner.display_names.remove(&window_id);

                    warn!(
                        component = "hub",
                        event = "hub.stale_binding_dropped",
                        user_id = user_id,
                        topic_id = topic_id,
                        window_id = %window_id,
                        "Dropped binding for vanished window"
                    );
                    dropped += 1;
                }
            }
        }

        if remapped > 0 || dropped > 0 {
            self.save(&inner);
        }
        (remapped, dropped)
    }
}
