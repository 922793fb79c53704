//! Central path resolution for all ccbot data files.
//!
//! Resolved once at startup from: `CCBOT_DIR` env > `~/.ccbot`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `CCBOT_DIR` env > `~/.ccbot` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("CCBOT_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".ccbot")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn state_path() -> PathBuf {
    data_dir().join("state.json")
}

pub fn session_map_path() -> PathBuf {
    data_dir().join("session_map.json")
}

pub fn monitor_state_path() -> PathBuf {
    data_dir().join("monitor_state.json")
}

pub fn notify_path() -> PathBuf {
    data_dir().join("notify.json")
}

pub fn skills_path() -> PathBuf {
    data_dir().join("skills.json")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn env_file_path() -> PathBuf {
    data_dir().join(".env")
}

/// Where Claude Code keeps per-project transcript files.
pub fn claude_projects_dir() -> PathBuf {
    dirs::home_dir()
        .expect("HOME directory not found")
        .join(".claude")
        .join("projects")
}

/// Claude Code's prompt history, used by the resume picker.
pub fn claude_history_path() -> PathBuf {
    dirs::home_dir()
        .expect("HOME directory not found")
        .join(".claude")
        .join("history.jsonl")
}

/// Claude Code's settings file, target of `hook --install`.
pub fn claude_settings_path() -> PathBuf {
    dirs::home_dir()
        .expect("HOME directory not found")
        .join(".claude")
        .join("settings.json")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Reset data dir — for test isolation only.
#[cfg(test)]
pub fn reset_data_dir() {
    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = None;
}
