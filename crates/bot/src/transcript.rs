//! Transcript line decoding.
//!
//! Each line of an agent session's JSONL transcript decodes to zero or more
//! typed entries. The parser never truncates payloads — size handling lives
//! in the delivery layer — and never fails a poll: a malformed line is the
//! caller's problem to log and skip.

use ccbot_protocol::{ContentType, Role};
use serde_json::Value;

/// Error sentinels inside tool-result payloads.
const ERROR_PREFIX: &str = "Error:";
const INTERRUPT_MARKER: &str = "[Request interrupted";

/// One decoded transcript entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub role: Role,
    pub content_type: ContentType,
    pub text: String,
    pub timestamp: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
}

/// Decode one raw line. `None` means the line is not valid JSON; an empty
/// vec means a valid line with nothing to deliver (summaries, meta rows).
pub fn parse_line(line: &str) -> Option<Vec<ParsedEntry>> {
    let line = line.trim();
    if line.is_empty() {
        return Some(Vec::new());
    }
    let json: Value = serde_json::from_str(line).ok()?;
    Some(parse_value(&json))
}

fn parse_value(json: &Value) -> Vec<ParsedEntry> {
    // Meta rows (hook echoes, environment snapshots) carry no user-facing content.
    if json.get("isMeta").and_then(Value::as_bool).unwrap_or(false) {
        return Vec::new();
    }

    let timestamp = json
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);

    match json.get("type").and_then(Value::as_str) {
        Some("assistant") => parse_assistant(json, &timestamp),
        Some("user") => parse_user(json, &timestamp),
        _ => Vec::new(),
    }
}

fn parse_assistant(json: &Value, timestamp: &Option<String>) -> Vec<ParsedEntry> {
    let Some(blocks) = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                if !text.trim().is_empty() {
                    entries.push(ParsedEntry {
                        role: Role::Assistant,
                        content_type: ContentType::Text,
                        text: text.to_string(),
                        timestamp: timestamp.clone(),
                        tool_use_id: None,
                        tool_name: None,
                    });
                }
            }
            Some("thinking") => {
                let text = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                if !text.trim().is_empty() {
                    entries.push(ParsedEntry {
                        role: Role::Assistant,
                        content_type: ContentType::Thinking,
                        text: text.to_string(),
                        timestamp: timestamp.clone(),
                        tool_use_id: None,
                        tool_name: None,
                    });
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let summary = summarize_tool_input(name, block.get("input"));
                let text = if summary.is_empty() {
                    format!("**{name}**")
                } else {
                    format!("**{name}** {summary}")
                };
                entries.push(ParsedEntry {
                    role: Role::Assistant,
                    content_type: ContentType::ToolUse,
                    text,
                    timestamp: timestamp.clone(),
                    tool_use_id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    tool_name: Some(name.to_string()),
                });
            }
            _ => {}
        }
    }
    entries
}

fn parse_user(json: &Value, timestamp: &Option<String>) -> Vec<ParsedEntry> {
    let Some(message) = json.get("message") else {
        return Vec::new();
    };

    match message.get("content") {
        // Plain string content: a typed user message or a local command echo.
        Some(Value::String(text)) => parse_user_text(text, timestamp).into_iter().collect(),

        // Block content: tool results (and occasionally typed text blocks).
        Some(Value::Array(blocks)) => {
            let mut entries = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_result") => {
                        let text = tool_result_text(block);
                        let is_error = block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                            || has_error_sentinel(&text);
                        entries.push(ParsedEntry {
                            role: Role::User,
                            content_type: if is_error {
                                ContentType::ToolError
                            } else {
                                ContentType::ToolResult
                            },
                            text,
                            timestamp: timestamp.clone(),
                            tool_use_id: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            tool_name: None,
                        });
                    }
                    Some("text") => {
                        let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                        if let Some(entry) = parse_user_text(text, timestamp) {
                            entries.push(entry);
                        }
                    }
                    _ => {}
                }
            }
            entries
        }
        _ => Vec::new(),
    }
}

/// Classify a plain user string: slash-command echoes are `local_command`,
/// everything else is a user message.
fn parse_user_text(text: &str, timestamp: &Option<String>) -> Option<ParsedEntry> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(command) = extract_tag(trimmed, "command-name") {
        let args = extract_tag(trimmed, "command-args").unwrap_or_default();
        let text = if args.is_empty() {
            command
        } else {
            format!("{command} {args}")
        };
        return Some(ParsedEntry {
            role: Role::User,
            content_type: ContentType::LocalCommand,
            text,
            timestamp: timestamp.clone(),
            tool_use_id: None,
            tool_name: None,
        });
    }

    if let Some(stdout) = extract_tag(trimmed, "local-command-stdout") {
        if stdout.trim().is_empty() {
            return None;
        }
        return Some(ParsedEntry {
            role: Role::User,
            content_type: ContentType::LocalCommand,
            text: stdout,
            timestamp: timestamp.clone(),
            tool_use_id: None,
            tool_name: None,
        });
    }

    Some(ParsedEntry {
        role: Role::User,
        content_type: ContentType::User,
        text: trimmed.to_string(),
        timestamp: timestamp.clone(),
        tool_use_id: None,
        tool_name: None,
    })
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim().to_string())
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => {
            let mut parts = Vec::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn has_error_sentinel(text: &str) -> bool {
    text.trim_start().starts_with(ERROR_PREFIX) || text.contains(INTERRUPT_MARKER)
}

/// Compact one-line argument summary for a tool call.
pub fn summarize_tool_input(name: &str, input: Option<&Value>) -> String {
    let Some(input) = input else {
        return String::new();
    };

    let picked = match name {
        "Bash" => input.get("command").and_then(Value::as_str),
        "Read" | "Write" | "Edit" | "NotebookEdit" => {
            input.get("file_path").and_then(Value::as_str)
        }
        "Grep" | "Glob" => input.get("pattern").and_then(Value::as_str),
        "Task" => input.get("description").and_then(Value::as_str),
        "WebFetch" | "WebSearch" => input
            .get("url")
            .or_else(|| input.get("query"))
            .and_then(Value::as_str),
        _ => None,
    };

    let summary = match picked {
        Some(v) => v.to_string(),
        None => {
            // Generic fallback: key=value pairs for scalar fields.
            let Some(obj) = input.as_object() else {
                return String::new();
            };
            let mut parts = Vec::new();
            for (key, value) in obj {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                parts.push(format!("{key}={rendered}"));
            }
            parts.join(" ")
        }
    };

    one_line(&summary, 100)
}

/// First line only, hard-capped with an ellipsis.
fn one_line(text: &str, max: usize) -> String {
    let first = text.lines().next().unwrap_or("").trim();
    if first.chars().count() <= max {
        return first.to_string();
    }
    let truncated: String = first.chars().take(max).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_text_block() {
        let line = json!({
            "type": "assistant",
            "timestamp": "2026-01-15T14:32:00.000Z",
            "message": {"role": "assistant", "content": [{"type": "text", "text": "Hello"}]}
        })
        .to_string();

        let entries = parse_line(&line).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content_type, ContentType::Text);
        assert_eq!(entries[0].role, Role::Assistant);
        assert_eq!(entries[0].text, "Hello");
        assert_eq!(entries[0].timestamp.as_deref(), Some("2026-01-15T14:32:00.000Z"));
    }

    #[test]
    fn assistant_thinking_block() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [{"type": "thinking", "thinking": "pondering"}]}
        })
        .to_string();

        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::Thinking);
        assert_eq!(entries[0].text, "pondering");
    }

    #[test]
    fn tool_use_renders_bold_name_and_summary() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [{
                "type": "tool_use",
                "id": "toolu_01",
                "name": "Read",
                "input": {"file_path": "/tmp/proj/main.rs"}
            }]}
        })
        .to_string();

        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::ToolUse);
        assert_eq!(entries[0].text, "**Read** /tmp/proj/main.rs");
        assert_eq!(entries[0].tool_use_id.as_deref(), Some("toolu_01"));
        assert_eq!(entries[0].tool_name.as_deref(), Some("Read"));
    }

    #[test]
    fn tool_result_matches_by_id() {
        let line = json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result",
                "tool_use_id": "toolu_01",
                "content": "Read 50 lines"
            }]}
        })
        .to_string();

        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::ToolResult);
        assert_eq!(entries[0].text, "Read 50 lines");
        assert_eq!(entries[0].tool_use_id.as_deref(), Some("toolu_01"));
    }

    #[test]
    fn tool_result_error_sentinel_reclassifies() {
        for text in ["Error: no such file", "foo\n[Request interrupted by user]"] {
            let line = json!({
                "type": "user",
                "message": {"content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_02",
                    "content": text
                }]}
            })
            .to_string();
            let entries = parse_line(&line).unwrap();
            assert_eq!(entries[0].content_type, ContentType::ToolError, "{text}");
        }
    }

    #[test]
    fn tool_result_is_error_flag_reclassifies() {
        let line = json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result",
                "tool_use_id": "toolu_03",
                "is_error": true,
                "content": "boom"
            }]}
        })
        .to_string();
        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::ToolError);
    }

    #[test]
    fn tool_result_block_array_content_joined() {
        let line = json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result",
                "tool_use_id": "toolu_04",
                "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
            }]}
        })
        .to_string();
        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].text, "a\nb");
    }

    #[test]
    fn plain_user_message() {
        let line = json!({
            "type": "user",
            "message": {"role": "user", "content": "fix the tests"}
        })
        .to_string();
        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::User);
        assert_eq!(entries[0].role, Role::User);
    }

    #[test]
    fn command_echo_becomes_local_command() {
        let line = json!({
            "type": "user",
            "message": {"content": "<command-name>/clear</command-name><command-message>clear</command-message><command-args></command-args>"}
        })
        .to_string();
        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::LocalCommand);
        assert_eq!(entries[0].text, "/clear");
    }

    #[test]
    fn command_stdout_becomes_local_command() {
        let line = json!({
            "type": "user",
            "message": {"content": "<local-command-stdout>3 files changed</local-command-stdout>"}
        })
        .to_string();
        let entries = parse_line(&line).unwrap();
        assert_eq!(entries[0].content_type, ContentType::LocalCommand);
        assert_eq!(entries[0].text, "3 files changed");
    }

    #[test]
    fn empty_command_stdout_is_dropped() {
        let line = json!({
            "type": "user",
            "message": {"content": "<local-command-stdout></local-command-stdout>"}
        })
        .to_string();
        assert!(parse_line(&line).unwrap().is_empty());
    }

    #[test]
    fn summary_and_meta_lines_yield_nothing() {
        let summary = json!({"type": "summary", "summary": "Earlier work"}).to_string();
        assert!(parse_line(&summary).unwrap().is_empty());

        let meta = json!({
            "type": "user",
            "isMeta": true,
            "message": {"content": "<environment_context>…</environment_context>"}
        })
        .to_string();
        assert!(parse_line(&meta).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_none() {
        assert!(parse_line("{not json").is_none());
        assert_eq!(parse_line("").unwrap().len(), 0);
    }

    #[test]
    fn multiple_blocks_yield_multiple_entries() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "hm"},
                {"type": "text", "text": "answer"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls -la"}}
            ]}
        })
        .to_string();
        let entries = parse_line(&line).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].text, "**Bash** ls -la");
    }

    #[test]
    fn bash_summary_takes_first_line_and_caps_length() {
        let input = json!({"command": format!("{} && echo done", "x".repeat(200))});
        let summary = summarize_tool_input("Bash", Some(&input));
        assert!(summary.chars().count() <= 101);
        assert!(summary.ends_with('…'));

        let multi = json!({"command": "echo one\necho two"});
        assert_eq!(summarize_tool_input("Bash", Some(&multi)), "echo one");
    }

    #[test]
    fn unknown_tool_falls_back_to_key_value_pairs() {
        let input = json!({"depth": 3, "verbose": true});
        let summary = summarize_tool_input("Mystery", Some(&input));
        assert!(summary.contains("depth=3"));
        assert!(summary.contains("verbose=true"));
    }
}
