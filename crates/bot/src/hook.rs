//! `ccbot hook` — the SessionStart hook and its installer.
//!
//! Claude Code invokes `ccbot hook` with a SessionStart payload on stdin.
//! The hook resolves which tmux window its pane lives in and records the
//! `window → session` association in `session_map.json`. It runs inside the
//! agent's pane where bot environment variables are absent, so it must never
//! touch the bridge configuration.
//!
//! `ccbot hook --install` idempotently merges the hook declaration into
//! `~/.claude/settings.json`.

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use serde_json::{json, Value};

use crate::paths;
use crate::session_map::{self, SessionMapEntry};

/// Suffix used to detect an existing installation regardless of path.
const HOOK_COMMAND_SUFFIX: &str = "ccbot hook";

fn is_uuid_like(value: &str) -> bool {
    if value.len() != 36 {
        return false;
    }
    for (idx, ch) in value.chars().enumerate() {
        let is_dash = matches!(idx, 8 | 13 | 18 | 23);
        if is_dash {
            if ch != '-' {
                return false;
            }
        } else if !ch.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}

/// Validate a SessionStart payload, returning `(session_id, cwd)`.
/// Anything else — wrong event, malformed id, relative cwd — is ignored.
fn validate_payload(payload: &Value) -> Option<(String, String)> {
    if payload.get("hook_event_name").and_then(Value::as_str) != Some("SessionStart") {
        return None;
    }
    let session_id = payload.get("session_id").and_then(Value::as_str)?;
    if !is_uuid_like(session_id) {
        return None;
    }
    let cwd = payload.get("cwd").and_then(Value::as_str).unwrap_or("");
    if !cwd.is_empty() && !cwd.starts_with('/') {
        return None;
    }
    Some((session_id.to_string(), cwd.to_string()))
}

/// Process one hook invocation: stdin payload → one session-map entry.
///
/// Always exits 0 — a misbehaving hook must never break the agent's startup.
pub async fn run_hook() -> i32 {
    let mut raw = String::new();
    if std::io::stdin().read_to_string(&mut raw).is_err() {
        return 0;
    }
    let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
        return 0;
    };
    let Some((session_id, cwd)) = validate_payload(&payload) else {
        return 0;
    };

    // TMUX_PANE is set by tmux for every process inside a pane; without it
    // the agent runs outside the bridge's session and is none of our business.
    let Ok(pane_id) = std::env::var("TMUX_PANE") else {
        return 0;
    };
    let Ok(location) = ccbot_mux::display_message(
        &pane_id,
        "#{session_name}\t#{window_id}\t#{window_name}",
    )
    .await
    else {
        return 0;
    };

    let mut fields = location.splitn(3, '\t');
    let (Some(mux_session), Some(window_id), Some(window_name)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return 0;
    };
    if !ccbot_mux::is_window_id(window_id) {
        return 0;
    }

    let map_path = paths::session_map_path();
    let entry = SessionMapEntry {
        session_id,
        cwd,
        window_name: window_name.to_string(),
    };
    let _ = session_map::write_entry(&map_path, mux_session, window_id, entry);
    0
}

fn is_hook_installed(settings: &Value) -> bool {
    let Some(session_start) = settings
        .get("hooks")
        .and_then(|h| h.get("SessionStart"))
        .and_then(Value::as_array)
    else {
        return false;
    };

    for entry in session_start {
        let Some(inner) = entry.get("hooks").and_then(Value::as_array) else {
            continue;
        };
        for hook in inner {
            let command = hook.get("command").and_then(Value::as_str).unwrap_or("");
            if command == HOOK_COMMAND_SUFFIX
                || command.ends_with(&format!("/{HOOK_COMMAND_SUFFIX}"))
            {
                return true;
            }
        }
    }
    false
}

/// Merge the hook declaration into a settings document. Returns
/// `(updated, changed)`.
fn install_into(mut settings: Value, hook_command: &str) -> anyhow::Result<(Value, bool)> {
    if is_hook_installed(&settings) {
        return Ok((settings, false));
    }

    let obj = settings
        .as_object_mut()
        .context("settings.json is not a JSON object")?;

    let hooks = obj.entry("hooks").or_insert_with(|| json!({}));
    let hooks_obj = hooks
        .as_object_mut()
        .context("settings.json 'hooks' is not an object")?;
    let session_start = hooks_obj
        .entry("SessionStart")
        .or_insert_with(|| json!([]));
    let array = session_start
        .as_array_mut()
        .context("settings.json 'hooks.SessionStart' is not an array")?;

    array.push(json!({
        "hooks": [{
            "type": "command",
            "command": hook_command,
            "timeout": 5
        }]
    }));

    Ok((settings, true))
}

/// `ccbot hook --install`: append the hook to the agent's settings file.
pub fn install_hook(settings_path: Option<&Path>) -> anyhow::Result<i32> {
    let settings_file = settings_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(paths::claude_settings_path);

    let existing = if settings_file.exists() {
        let content = std::fs::read_to_string(&settings_file)
            .with_context(|| format!("read {}", settings_file.display()))?;
        serde_json::from_str::<Value>(&content)
            .with_context(|| format!("parse {}", settings_file.display()))?
    } else {
        json!({})
    };

    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.into_os_string().into_string().ok())
        .unwrap_or_else(|| "ccbot".to_string());
    let hook_command = format!("{exe} hook");

    let (updated, changed) = install_into(existing, &hook_command)?;
    if !changed {
        println!("Hook already installed in {}", settings_file.display());
        return Ok(0);
    }

    if let Some(parent) = settings_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut rendered = serde_json::to_string_pretty(&updated)?;
    rendered.push('\n');
    std::fs::write(&settings_file, rendered)
        .with_context(|| format!("write {}", settings_file.display()))?;

    println!("Hook installed successfully in {}", settings_file.display());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_validation() {
        assert!(is_uuid_like("0b5c1e2f-1234-4abc-9def-0123456789ab"));
        assert!(!is_uuid_like("0b5c1e2f-1234-4abc-9def-0123456789a"));
        assert!(!is_uuid_like("not-a-uuid-at-all-not-a-uuid-at-all!"));
        assert!(!is_uuid_like(""));
    }

    #[test]
    fn payload_validation_accepts_session_start() {
        let payload = json!({
            "hook_event_name": "SessionStart",
            "session_id": "0b5c1e2f-1234-4abc-9def-0123456789ab",
            "cwd": "/data/code/proj"
        });
        let (sid, cwd) = validate_payload(&payload).unwrap();
        assert_eq!(sid, "0b5c1e2f-1234-4abc-9def-0123456789ab");
        assert_eq!(cwd, "/data/code/proj");
    }

    #[test]
    fn payload_validation_rejects_bad_input() {
        // wrong event
        assert!(validate_payload(&json!({
            "hook_event_name": "SessionEnd",
            "session_id": "0b5c1e2f-1234-4abc-9def-0123456789ab"
        }))
        .is_none());
        // malformed session id
        assert!(validate_payload(&json!({
            "hook_event_name": "SessionStart",
            "session_id": "short"
        }))
        .is_none());
        // relative cwd
        assert!(validate_payload(&json!({
            "hook_event_name": "SessionStart",
            "session_id": "0b5c1e2f-1234-4abc-9def-0123456789ab",
            "cwd": "relative/path"
        }))
        .is_none());
    }

    #[test]
    fn install_is_idempotent() {
        let (once, changed) = install_into(json!({}), "/usr/local/bin/ccbot hook").unwrap();
        assert!(changed);
        assert!(is_hook_installed(&once));

        let (twice, changed_again) = install_into(once.clone(), "/opt/ccbot hook").unwrap();
        assert!(!changed_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn install_preserves_existing_hooks() {
        let existing = json!({
            "hooks": {
                "SessionStart": [
                    {"hooks": [{"type": "command", "command": "other-tool session-start"}]}
                ],
                "Stop": [
                    {"hooks": [{"type": "command", "command": "other-tool stop"}]}
                ]
            },
            "model": "opus"
        });
        let (updated, changed) = install_into(existing, "ccbot hook").unwrap();
        assert!(changed);

        let session_start = updated["hooks"]["SessionStart"].as_array().unwrap();
        assert_eq!(session_start.len(), 2);
        assert_eq!(updated["hooks"]["Stop"].as_array().unwrap().len(), 1);
        assert_eq!(updated["model"], "opus");
    }

    #[test]
    fn detects_full_path_installation() {
        let settings = json!({
            "hooks": {"SessionStart": [
                {"hooks": [{"type": "command", "command": "/home/me/.venv/bin/ccbot hook"}]}
            ]}
        });
        assert!(is_hook_installed(&settings));
    }
}
