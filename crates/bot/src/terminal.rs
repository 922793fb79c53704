//! Terminal-pane interpretation.
//!
//! Classifies captured pane text as idle, status line, or interactive
//! prompt, and extracts the pieces the bridge relays: the spinner status
//! phrase, the content of interactive dialogs, the context meter, and the
//! echoed output of `!` shell commands.

use std::sync::LazyLock;

use regex::Regex;

/// Spinner characters that open a Claude Code status line.
const STATUS_SPINNERS: [char; 6] = ['·', '✻', '✽', '✶', '✳', '✢'];

/// Status line can sit above separators and the input box; scan this many
/// lines up from the bottom.
const STATUS_SCAN_LINES: usize = 15;

/// Prompt-box chrome only ever occupies the pane footer.
const CHROME_SCAN_LINES: usize = 10;

/// An interactive dialog template: the pane is in that dialog when a line
/// matches `top`, a later line matches `bottom`, and enough rows sit between
/// them to hold the dialog body.
struct PromptTemplate {
    name: &'static str,
    top: Regex,
    bottom: Regex,
    min_gap: usize,
}

static TEMPLATES: LazyLock<Vec<PromptTemplate>> = LazyLock::new(|| {
    let t = |name, top: &str, bottom: &str, min_gap| PromptTemplate {
        name,
        top: Regex::new(top).expect("template top regex"),
        bottom: Regex::new(bottom).expect("template bottom regex"),
        min_gap,
    };
    vec![
        t(
            "ExitPlanMode",
            r"(Would you like to proceed\?|has written up a plan|Ready to code\?)",
            r"(ctrl-g to edit|Esc to cancel|esc to go back)",
            2,
        ),
        t(
            "AskUserQuestion",
            r"(☐|✔|❯\s*\d+\.)",
            r"(Enter to select|Submit|tab to cycle|← / → to navigate)",
            2,
        ),
        t(
            "PermissionPrompt",
            r"Do you want to (proceed|run|make|allow)",
            r"(❯\s*\d+\.|\d+\.\s*(Yes|No)|Esc to cancel)",
            2,
        ),
        t(
            "RestoreCheckpoint",
            r"Restore the code",
            r"(Enter to continue|Esc to cancel)",
            2,
        ),
        t(
            "Settings",
            r"Settings:",
            r"(Esc to cancel|Enter to confirm)",
            2,
        ),
    ]
});

static CONTEXT_BRACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\]\s*Context:\s*(\d{1,3})%").expect("context regex"));
static CONTEXT_LEFT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%\s*context left").expect("context regex"));

/// Extracted interactive dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveContent {
    pub name: &'static str,
    pub content: String,
}

/// Parsed context meter from the pane footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInfo {
    pub context_percent: u8,
}

/// Extract the spinner status phrase, scanning bottom-up.
/// The spinner character itself is stripped from the returned text.
pub fn parse_status_line(pane_text: &str) -> Option<String> {
    if pane_text.is_empty() {
        return None;
    }

    let lines: Vec<&str> = pane_text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STATUS_SCAN_LINES);
    for line in lines[start..].iter().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut chars = line.chars();
        if let Some(first) = chars.next() {
            if STATUS_SPINNERS.contains(&first) {
                return Some(chars.as_str().trim().to_string());
            }
        }
    }
    None
}

/// Parse the context meter, either the bracketed `[Model] Context: NN%`
/// format or the bare `NN% context left` format.
pub fn parse_context_info(pane_text: &str) -> Option<ContextInfo> {
    if pane_text.is_empty() {
        return None;
    }
    for line in pane_text.lines() {
        let captures = CONTEXT_BRACKET_RE
            .captures(line)
            .or_else(|| CONTEXT_LEFT_RE.captures(line));
        if let Some(caps) = captures {
            if let Ok(pct) = caps[1].parse::<u8>() {
                if pct <= 100 {
                    return Some(ContextInfo {
                        context_percent: pct,
                    });
                }
            }
        }
    }
    None
}

/// Match the pane against the interactive dialog templates and extract the
/// enclosed content (delimiters included, so hints like "Esc to cancel"
/// reach the user).
pub fn extract_interactive_content(pane_text: &str) -> Option<InteractiveContent> {
    if pane_text.is_empty() {
        return None;
    }
    let lines: Vec<&str> = pane_text.trim_end().lines().collect();
    if lines.len() < 3 {
        return None;
    }

    for template in TEMPLATES.iter() {
        let Some(top_idx) = lines.iter().position(|l| template.top.is_match(l)) else {
            continue;
        };
        let Some(bottom_rel) = lines[top_idx + 1..]
            .iter()
            .rposition(|l| template.bottom.is_match(l))
        else {
            continue;
        };
        let bottom_idx = top_idx + 1 + bottom_rel;
        if bottom_idx - top_idx < template.min_gap {
            continue;
        }
        let content = lines[top_idx..=bottom_idx]
            .iter()
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n");
        return Some(InteractiveContent {
            name: template.name,
            content,
        });
    }
    None
}

/// Quick check used by the status poller before full extraction.
pub fn is_interactive_ui(pane_text: &str) -> bool {
    extract_interactive_content(pane_text).is_some()
}

fn is_separator_line(line: &str, min_len: usize) -> bool {
    let clean = line.trim();
    let total = clean.chars().count();
    if total < min_len {
        return false;
    }
    let dashes = clean.chars().filter(|c| matches!(c, '─' | '━' | '═')).count();
    dashes * 10 > total * 8
}

/// Drop the input prompt box (separator + `❯` + context chrome) from the
/// pane tail. Only the last few lines are considered so horizontal rules in
/// real output survive.
pub fn strip_pane_chrome(lines: &[String]) -> Vec<String> {
    let window_start = lines.len().saturating_sub(CHROME_SCAN_LINES);
    for (offset, line) in lines[window_start..].iter().enumerate() {
        if is_separator_line(line, 20) {
            return lines[..window_start + offset].to_vec();
        }
    }
    lines.to_vec()
}

/// Locate the echoed `! command` block in the pane and return it with the
/// output lines that follow. tmux truncates long echoes with `…`, so prefix
/// matching runs both ways.
pub fn extract_bash_output(pane_text: &str, command: &str) -> Option<String> {
    if pane_text.is_empty() {
        return None;
    }
    let lines: Vec<String> = pane_text.lines().map(str::to_string).collect();
    let lines = strip_pane_chrome(&lines);

    let mut start_idx = None;
    for (i, line) in lines.iter().enumerate().rev() {
        let trimmed = line.trim_start();
        let Some(echoed) = trimmed.strip_prefix("! ") else {
            continue;
        };
        let echoed = echoed.trim_end().trim_end_matches('…');
        if command.starts_with(echoed) || echoed.starts_with(command) {
            start_idx = Some(i);
            break;
        }
    }

    let start = start_idx?;
    let mut block: Vec<&str> = lines[start..].iter().map(|s| s.as_str()).collect();
    while block.last().is_some_and(|l| l.trim().is_empty()) {
        block.pop();
    }
    if block.is_empty() {
        return None;
    }
    Some(block.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_status_line ────────────────────────────────────────────

    #[test]
    fn status_line_spinner_variants() {
        for (spinner, rest, expected) in [
            ('·', "Working on task", "Working on task"),
            ('✻', "  Reading file  ", "Reading file"),
            ('✽', "Thinking deeply", "Thinking deeply"),
            ('✶', "Analyzing code", "Analyzing code"),
            ('✳', "Processing input", "Processing input"),
            ('✢', "Building project", "Building project"),
        ] {
            let pane = format!("some output\n{spinner}{rest}\n");
            assert_eq!(parse_status_line(&pane).as_deref(), Some(expected));
        }
    }

    #[test]
    fn status_line_absent() {
        assert_eq!(parse_status_line("just normal text\nno spinners here\n"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[test]
    fn status_line_scan_skips_trailing_blanks() {
        let pane = "output\n✻ Doing work\n\n\n\n";
        assert_eq!(parse_status_line(pane).as_deref(), Some("Doing work"));
    }

    #[test]
    fn status_line_only_scans_pane_tail() {
        let mut pane = String::from("✻ Old status\n");
        for i in 0..20 {
            pane.push_str(&format!("filler line {i}\n"));
        }
        assert_eq!(parse_status_line(&pane), None);
    }

    // ── parse_context_info ───────────────────────────────────────────

    #[test]
    fn context_bracket_format() {
        let pane = format!(
            "some output\n{}\n❯\n{}\n  [Opus 4.6] Context: 34%\n  ⏵⏵ bypass permissions…\n",
            "─".repeat(30),
            "─".repeat(30)
        );
        assert_eq!(
            parse_context_info(&pane),
            Some(ContextInfo { context_percent: 34 })
        );
    }

    #[test]
    fn context_left_format() {
        let pane = "some output\n\n  49% context left\n\n";
        assert_eq!(
            parse_context_info(pane),
            Some(ContextInfo { context_percent: 49 })
        );
        assert_eq!(
            parse_context_info("output\n  0% context left\n"),
            Some(ContextInfo { context_percent: 0 })
        );
    }

    #[test]
    fn context_absent() {
        assert_eq!(parse_context_info("just normal text\nno context info here\n"), None);
        assert_eq!(parse_context_info(""), None);
    }

    // ── extract_interactive_content ──────────────────────────────────

    #[test]
    fn exit_plan_mode_dialog() {
        let pane = "  Would you like to proceed?\n  ❯ 1. Yes\n    2. No\n  ctrl-g to edit in editor\n";
        let result = extract_interactive_content(pane).unwrap();
        assert_eq!(result.name, "ExitPlanMode");
        assert!(result.content.contains("Would you like to proceed?"));
        assert!(result.content.contains("ctrl-g to edit in"));
    }

    #[test]
    fn exit_plan_mode_variant() {
        let pane = "  Claude has written up a plan\n  ─────\n  Details here\n  Esc to cancel\n";
        let result = extract_interactive_content(pane).unwrap();
        assert_eq!(result.name, "ExitPlanMode");
        assert!(result.content.contains("Claude has written up a plan"));
    }

    #[test]
    fn ask_user_question_dialog() {
        let pane = "  ☐ Option A\n  ✔ Option B\n  Continue?\n  Enter to select · Submit\n";
        let result = extract_interactive_content(pane).unwrap();
        assert_eq!(result.name, "AskUserQuestion");
        assert!(result.content.contains("Enter to select"));
    }

    #[test]
    fn permission_prompt_dialog() {
        let pane = "  Do you want to proceed?\n  ❯ 1. Yes\n    2. No, tell Claude what to do\n";
        let result = extract_interactive_content(pane).unwrap();
        assert_eq!(result.name, "PermissionPrompt");
        assert!(result.content.contains("Do you want to proceed?"));
    }

    #[test]
    fn restore_checkpoint_dialog() {
        let pane = "  Restore the code to a previous state?\n  ─────\n  Some details\n  Enter to continue\n";
        let result = extract_interactive_content(pane).unwrap();
        assert_eq!(result.name, "RestoreCheckpoint");
        assert!(result.content.contains("Restore the code"));
    }

    #[test]
    fn settings_dialog() {
        let pane = "  Settings: press tab to cycle\n  ─────\n  Option 1\n  Esc to cancel\n";
        let result = extract_interactive_content(pane).unwrap();
        assert_eq!(result.name, "Settings");
        assert!(result.content.contains("Settings:"));
    }

    #[test]
    fn no_dialog_in_plain_output() {
        assert_eq!(extract_interactive_content("$ echo hello\nhello\n$\n"), None);
        assert_eq!(extract_interactive_content(""), None);
    }

    #[test]
    fn min_gap_too_small_is_not_a_dialog() {
        let pane = "  Do you want to proceed?\n  Esc to cancel\n";
        assert_eq!(extract_interactive_content(pane), None);
    }

    #[test]
    fn is_interactive_ui_matches_extraction() {
        let pane = "  Do you want to proceed?\n  ❯ 1. Yes\n    2. No\n";
        assert!(is_interactive_ui(pane));
        assert!(!is_interactive_ui("build finished\n"));
    }

    // ── strip_pane_chrome ────────────────────────────────────────────

    #[test]
    fn strips_from_separator() {
        let lines: Vec<String> = vec![
            "some output".into(),
            "more output".into(),
            "─".repeat(30),
            "❯".into(),
            "─".repeat(30),
            "  [Opus 4.6] Context: 34%".into(),
        ];
        assert_eq!(
            strip_pane_chrome(&lines),
            vec!["some output".to_string(), "more output".to_string()]
        );
    }

    #[test]
    fn no_separator_returns_all() {
        let lines: Vec<String> = vec!["line 1".into(), "line 2".into(), "line 3".into()];
        assert_eq!(strip_pane_chrome(&lines), lines);
    }

    #[test]
    fn short_separator_not_triggered() {
        let lines: Vec<String> = vec!["output".into(), "─".repeat(10), "more output".into()];
        assert_eq!(strip_pane_chrome(&lines), lines);
    }

    #[test]
    fn only_searches_last_lines() {
        let mut lines: Vec<String> = vec!["─".repeat(30)];
        for i in 0..14 {
            lines.push(format!("line {i}"));
        }
        assert_eq!(strip_pane_chrome(&lines), lines);
    }

    // ── extract_bash_output ──────────────────────────────────────────

    #[test]
    fn extracts_command_output() {
        let pane = "some context\n! echo hello\n⎿ hello\n";
        let result = extract_bash_output(pane, "echo hello").unwrap();
        assert!(result.contains("! echo hello"));
        assert!(result.contains("hello"));
    }

    #[test]
    fn command_not_found_returns_none() {
        assert_eq!(
            extract_bash_output("some context\njust normal output\n", "echo hello"),
            None
        );
    }

    #[test]
    fn chrome_stripped_from_bash_output() {
        let pane = format!(
            "some context\n! ls\n⎿ file.txt\n{}\n❯\n{}\n  [Opus 4.6] Context: 34%\n",
            "─".repeat(30),
            "─".repeat(30)
        );
        let result = extract_bash_output(&pane, "ls").unwrap();
        assert!(result.contains("file.txt"));
        assert!(!result.contains("Opus"));
    }

    #[test]
    fn prefix_match_tolerates_truncated_echo() {
        let pane = "! long_comma…\n⎿ output\n";
        let result = extract_bash_output(pane, "long_command_that_gets_truncated").unwrap();
        assert!(result.contains("output"));
    }

    #[test]
    fn trailing_blank_lines_stripped() {
        let result = extract_bash_output("! echo hi\n⎿ hi\n\n\n", "echo hi").unwrap();
        assert!(!result.ends_with('\n'));
    }
}
