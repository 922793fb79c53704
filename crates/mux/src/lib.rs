//! ccbot Mux
//!
//! Control-plane adapter for the terminal multiplexer. One persistent tmux
//! session (named by configuration) hosts every agent window; a home window
//! keeps the session alive and is hidden from all enumeration.
//!
//! Every operation shells out to `tmux` and may block on subprocess I/O, so
//! callers run them off the event thread (they are all async and awaited).

use std::collections::HashSet;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Window that anchors the session; never listed, never killed by the bridge.
pub const HOME_WINDOW: &str = "__main__";

/// Errors that can occur talking to the multiplexer
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("failed to spawn tmux: {0}")]
    Io(#[from] std::io::Error),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("window not found: {0}")]
    WindowNotFound(String),

    #[error("tmux session unavailable: {0}")]
    SessionUnavailable(String),
}

/// One live window in the bridge's tmux session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxWindow {
    /// Opaque tmux handle, `@` followed by digits
    pub window_id: String,
    pub name: String,
    pub cwd: String,
    pub pane_command: String,
}

/// Validate the `@[0-9]+` window-id shape before it enters persisted state.
pub fn is_window_id(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next() == Some('@') && {
        let rest = chars.as_str();
        !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Append `-2`, `-3`, … until the name is not taken.
fn dedupe_window_name(desired: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(desired) {
        return desired.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{desired}-{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Parse one `list-windows` output line in our tab-separated format.
fn parse_window_line(line: &str) -> Option<MuxWindow> {
    let mut fields = line.splitn(4, '\t');
    let window_id = fields.next()?.to_string();
    let name = fields.next()?.to_string();
    let cwd = fields.next()?.to_string();
    let pane_command = fields.next().unwrap_or("").to_string();
    if !is_window_id(&window_id) {
        return None;
    }
    Some(MuxWindow {
        window_id,
        name,
        cwd,
        pane_command,
    })
}

/// Resolve `#{...}` format values for the pane running the caller.
///
/// Used by the SessionStart hook, which runs inside a tmux pane with
/// `$TMUX_PANE` set and no bridge session context.
pub async fn display_message(pane_id: &str, format: &str) -> Result<String, MuxError> {
    let output = Command::new("tmux")
        .args(["display-message", "-t", pane_id, "-p", format])
        .output()
        .await?;
    if !output.status.success() {
        return Err(MuxError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Handle to the bridge's tmux session (cheap to Clone).
#[derive(Debug, Clone)]
pub struct MuxClient {
    session: String,
}

impl MuxClient {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Run one tmux subcommand, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String, MuxError> {
        let output = Command::new("tmux").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(
                component = "mux",
                event = "mux.command_failed",
                args = ?args,
                stderr = %stderr,
                "tmux command failed"
            );
            if stderr.contains("can't find window") || stderr.contains("can't find pane") {
                return Err(MuxError::WindowNotFound(stderr));
            }
            if stderr.contains("can't find session") || stderr.contains("no server running") {
                return Err(MuxError::SessionUnavailable(stderr));
            }
            return Err(MuxError::CommandFailed(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_string())
    }

    /// Create the detached session with its home window if it does not exist.
    /// Called once at startup; failure here is fatal for the bridge.
    pub async fn ensure_session(&self) -> Result<(), MuxError> {
        let exact = format!("={}", self.session);
        let probe = Command::new("tmux")
            .args(["has-session", "-t", exact.as_str()])
            .output()
            .await?;
        if probe.status.success() {
            return Ok(());
        }
        self.run(&[
            "new-session",
            "-d",
            "-s",
            &self.session,
            "-n",
            HOME_WINDOW,
        ])
        .await
        .map_err(|e| MuxError::SessionUnavailable(e.to_string()))?;
        debug!(
            component = "mux",
            event = "mux.session_created",
            session = %self.session,
            "Created tmux session"
        );
        Ok(())
    }

    /// All windows in the session except the home window.
    pub async fn list_windows(&self) -> Result<Vec<MuxWindow>, MuxError> {
        let target = format!("{}:", self.session);
        let out = self
            .run(&[
                "list-windows",
                "-t",
                &target,
                "-F",
                "#{window_id}\t#{window_name}\t#{pane_current_path}\t#{pane_current_command}",
            ])
            .await?;
        Ok(out
            .lines()
            .filter_map(parse_window_line)
            .filter(|w| w.name != HOME_WINDOW)
            .collect())
    }

    pub async fn find_by_id(&self, window_id: &str) -> Result<Option<MuxWindow>, MuxError> {
        Ok(self
            .list_windows()
            .await?
            .into_iter()
            .find(|w| w.window_id == window_id))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<MuxWindow>, MuxError> {
        Ok(self
            .list_windows()
            .await?
            .into_iter()
            .find(|w| w.name == name))
    }

    /// Open a window at `cwd`, start the agent command in it, and return
    /// `(window_id, final_name)`. Name collisions get a numeric suffix.
    pub async fn create_window(
        &self,
        cwd: &str,
        desired_name: &str,
        start_command: &str,
    ) -> Result<(String, String), MuxError> {
        let taken: HashSet<String> = self
            .list_windows()
            .await?
            .into_iter()
            .map(|w| w.name)
            .collect();
        let name = dedupe_window_name(desired_name, &taken);

        let target = format!("{}:", self.session);
        let window_id = self
            .run(&[
                "new-window", "-d", "-t", &target, "-n", &name, "-c", cwd, "-P", "-F",
                "#{window_id}",
            ])
            .await?;
        if !is_window_id(&window_id) {
            return Err(MuxError::CommandFailed(format!(
                "unexpected new-window output: {window_id}"
            )));
        }

        if !start_command.is_empty() {
            self.send_keys(&window_id, start_command, true, true).await?;
        }

        debug!(
            component = "mux",
            event = "mux.window_created",
            window_id = %window_id,
            name = %name,
            cwd = %cwd,
            "Created window"
        );
        Ok((window_id, name))
    }

    /// Idempotent: a window that is already gone counts as killed.
    pub async fn kill_window(&self, window_id: &str) -> Result<(), MuxError> {
        match self.run(&["kill-window", "-t", window_id]).await {
            Ok(_) => Ok(()),
            Err(MuxError::WindowNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send keystrokes into the window's active pane.
    ///
    /// `literal` suppresses tmux key-name interpretation (`-l`), so user text
    /// like "Enter the value" is typed verbatim. The trailing Enter is issued
    /// as a second send only after the content landed.
    pub async fn send_keys(
        &self,
        window_id: &str,
        keys: &str,
        append_enter: bool,
        literal: bool,
    ) -> Result<(), MuxError> {
        if literal {
            self.run(&["send-keys", "-t", window_id, "-l", "--", keys])
                .await?;
        } else {
            self.run(&["send-keys", "-t", window_id, "--", keys]).await?;
        }
        if append_enter {
            self.run(&["send-keys", "-t", window_id, "Enter"]).await?;
        }
        Ok(())
    }

    /// Visible pane text, optionally with ANSI SGR sequences.
    pub async fn capture_pane(&self, window_id: &str, with_ansi: bool) -> Result<String, MuxError> {
        let out = if with_ansi {
            self.run(&["capture-pane", "-p", "-e", "-t", window_id]).await
        } else {
            self.run(&["capture-pane", "-p", "-t", window_id]).await
        };
        match out {
            Ok(text) => Ok(text),
            Err(e @ MuxError::WindowNotFound(_)) => Err(e),
            Err(e) => {
                warn!(
                    component = "mux",
                    event = "mux.capture_failed",
                    window_id = %window_id,
                    error = %e,
                    "Pane capture failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_id_shape() {
        assert!(is_window_id("@0"));
        assert!(is_window_id("@17"));
        assert!(!is_window_id("@"));
        assert!(!is_window_id("17"));
        assert!(!is_window_id("@1a"));
        assert!(!is_window_id("%3"));
        assert!(!is_window_id(""));
    }

    #[test]
    fn dedupe_appends_numeric_suffix() {
        let mut taken = HashSet::new();
        assert_eq!(dedupe_window_name("proj", &taken), "proj");

        taken.insert("proj".to_string());
        assert_eq!(dedupe_window_name("proj", &taken), "proj-2");

        taken.insert("proj-2".to_string());
        taken.insert("proj-3".to_string());
        assert_eq!(dedupe_window_name("proj", &taken), "proj-4");
    }

    #[test]
    fn parses_list_windows_line() {
        let w = parse_window_line("@3\tproj\t/tmp/proj\tclaude").unwrap();
        assert_eq!(w.window_id, "@3");
        assert_eq!(w.name, "proj");
        assert_eq!(w.cwd, "/tmp/proj");
        assert_eq!(w.pane_command, "claude");
    }

    #[test]
    fn rejects_malformed_list_line() {
        assert!(parse_window_line("garbage").is_none());
        assert!(parse_window_line("notid\tname\t/cwd\tsh").is_none());
    }

    #[test]
    fn parses_line_with_missing_pane_command() {
        let w = parse_window_line("@9\tapi\t/srv/api").unwrap();
        assert_eq!(w.pane_command, "");
    }
}
