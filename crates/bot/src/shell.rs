//! Shell executor for user-initiated `!` commands.
//!
//! Runs commands in a window's working directory and captures output.
//! Bounded in both wall-clock time and captured bytes; the agent process in
//! the pane is never involved.

use std::time::Instant;

use tokio::process::Command;

/// Output beyond this many characters is cut with a marker.
const MAX_CAPTURE_CHARS: usize = 8_000;

/// Result of a shell command execution
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ShellResult {
    /// One text block for delivery: stdout, then stderr, then a non-zero
    /// exit marker.
    pub fn render(&self, command: &str) -> String {
        let mut out = format!("$ {command}\n");
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str(&self.stderr);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        match self.exit_code {
            Some(0) => {}
            Some(code) => out.push_str(&format!("[exit {code}]")),
            None => out.push_str("[no exit status]"),
        }
        out.trim_end().to_string()
    }
}

/// Execute a shell command with a timeout.
///
/// Spawns `sh -c <command>` in the given `cwd` and captures stdout + stderr.
/// Returns after the process exits or the timeout fires.
pub async fn execute(command: &str, cwd: &str, timeout_secs: u64) -> ShellResult {
    let start = Instant::now();

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(timeout_secs),
        run_command(command, cwd),
    )
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok((stdout, stderr, exit_code))) => ShellResult {
            stdout: cap(stdout),
            stderr: cap(stderr),
            exit_code: Some(exit_code),
            duration_ms,
        },
        Ok(Err(e)) => ShellResult {
            stdout: String::new(),
            stderr: format!("Failed to execute command: {e}"),
            exit_code: None,
            duration_ms,
        },
        Err(_) => ShellResult {
            stdout: String::new(),
            stderr: format!("Command timed out after {timeout_secs}s"),
            exit_code: None,
            duration_ms,
        },
    }
}

async fn run_command(command: &str, cwd: &str) -> Result<(String, String, i32), std::io::Error> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);

    Ok((stdout, stderr, exit_code))
}

fn cap(text: String) -> String {
    if text.chars().count() <= MAX_CAPTURE_CHARS {
        return text;
    }
    let kept: String = text.chars().take(MAX_CAPTURE_CHARS).collect();
    format!("{kept}\n… (output truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = execute("echo hello", "/tmp", 10).await;
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn captures_nonzero_exit() {
        let result = execute("exit 3", "/tmp", 10).await;
        assert_eq!(result.exit_code, Some(3));
        assert!(result.render("exit 3").contains("[exit 3]"));
    }

    #[tokio::test]
    async fn runs_in_requested_cwd() {
        let result = execute("pwd", "/tmp", 10).await;
        assert_eq!(result.stdout.trim(), "/tmp");
    }

    #[tokio::test]
    async fn timeout_produces_error_result() {
        let result = execute("sleep 5", "/tmp", 1).await;
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn output_is_capped() {
        let result = execute("yes x | head -c 100000", "/tmp", 10).await;
        assert!(result.stdout.chars().count() < 10_000);
        assert!(result.stdout.contains("… (output truncated)"));
    }

    #[test]
    fn render_includes_command_and_streams() {
        let result = ShellResult {
            stdout: "out\n".into(),
            stderr: "err\n".into(),
            exit_code: Some(1),
            duration_ms: 5,
        };
        let text = result.render("make");
        assert!(text.starts_with("$ make"));
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(text.ends_with("[exit 1]"));
    }
}
