//! Skill-command sync and alias lookup.
//!
//! `ccbot sync <project_dir>` scans the project's `.claude/commands/`
//! directory for markdown files with YAML frontmatter and writes
//! `skills.json`, mapping chat-safe command names to the agent's native
//! slash commands. The router loads that file at startup to translate
//! `/gsd_progress` into `/gsd:progress` before forwarding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{load_json_or_default, write_json_atomic};

/// Chat platform command names: lowercase letters, digits, underscores,
/// 1-32 chars, starting with a letter.
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,31}$").expect("skill name regex"));

/// Commands handled natively by the bridge or its forwarding menu — a skill
/// may not shadow these.
pub const NATIVE_COMMANDS: &[&str] = &[
    "start",
    "history",
    "resume",
    "screenshot",
    "esc",
    "new",
    "clear",
    "compact",
    "cost",
    "help",
    "memory",
];

/// One skill entry in `skills.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub command: String,
    #[serde(default)]
    pub description: String,
}

pub type SkillMap = BTreeMap<String, Skill>;

/// Convert a native slash-command name to a chat-safe alias:
/// `/gsd:progress` → `gsd_progress`, `/review-pr` → `review_pr`.
pub fn to_chat_name(native_command: &str) -> String {
    native_command
        .trim_start_matches('/')
        .replace([':', '-', '.'], "_")
        .to_lowercase()
}

/// Extract YAML frontmatter key-value pairs from a markdown file.
/// Handles single-line values and multi-line `>-` continuation blocks.
fn parse_frontmatter(text: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    let Some(rest) = text.strip_prefix("---") else {
        return result;
    };
    let Some(end) = rest.find("---") else {
        return result;
    };
    let block = &rest[..end];

    let key_re = Regex::new(r"^(\w+):\s*(>-|.*)$").expect("frontmatter regex");
    let mut current_key = String::new();
    let mut current_val = String::new();

    for line in block.lines() {
        if let Some(caps) = key_re.captures(line) {
            if !current_key.is_empty() {
                result.insert(current_key.clone(), current_val.trim().to_string());
            }
            current_key = caps[1].to_string();
            let val = &caps[2];
            current_val = if val == ">-" { String::new() } else { val.to_string() };
        } else if !current_key.is_empty() && line.starts_with("  ") {
            current_val.push(' ');
            current_val.push_str(line.trim());
        }
    }
    if !current_key.is_empty() {
        result.insert(current_key, current_val.trim().to_string());
    }
    result
}

fn collect_markdown_files(root: &Path) -> Vec<PathBuf> {
    let mut result = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|s| s.to_str()) == Some("md") {
                result.push(path);
            }
        }
    }
    result.sort();
    result
}

/// Scan `<project_dir>/.claude/commands/` and build the skill map.
pub fn scan_commands(project_dir: &Path) -> SkillMap {
    let commands_dir = project_dir.join(".claude").join("commands");
    let mut skills = SkillMap::new();
    if !commands_dir.is_dir() {
        return skills;
    }

    for md_file in collect_markdown_files(&commands_dir) {
        let Ok(text) = std::fs::read_to_string(&md_file) else {
            continue;
        };
        let fm = parse_frontmatter(&text);

        let native_command = match fm.get("name") {
            Some(name) => format!("/{name}"),
            None => {
                let Ok(rel) = md_file.strip_prefix(&commands_dir) else {
                    continue;
                };
                let stem = rel.with_extension("");
                let joined = stem
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(":");
                format!("/{joined}")
            }
        };

        let mut description = fm.get("description").cloned().unwrap_or_default();
        if description.chars().count() > 200 {
            description = description.chars().take(197).collect::<String>() + "...";
        }

        let chat_name = to_chat_name(&native_command);
        if !NAME_RE.is_match(&chat_name) {
            warn!(
                component = "skills",
                event = "skills.invalid_name",
                native_command = %native_command,
                chat_name = %chat_name,
                "Skipping skill with chat-unsafe name"
            );
            continue;
        }
        if NATIVE_COMMANDS.contains(&chat_name.as_str()) {
            continue;
        }

        skills.insert(
            chat_name,
            Skill {
                command: native_command,
                description,
            },
        );
    }

    skills
}

/// Write the skill map to `path`.
pub fn write_skills(path: &Path, skills: &SkillMap) -> anyhow::Result<()> {
    write_json_atomic(path, skills)
}

/// Load the skill map for alias translation; absent file means no aliases.
pub fn load_skills(path: &Path) -> SkillMap {
    load_json_or_default(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ccbot-skills-{name}-{}", std::process::id()))
    }

    fn write_command(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(".claude").join("commands").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn chat_name_conversion() {
        assert_eq!(to_chat_name("/gsd:progress"), "gsd_progress");
        assert_eq!(to_chat_name("/review-pr"), "review_pr");
        assert_eq!(to_chat_name("/speckit.analyze"), "speckit_analyze");
    }

    #[test]
    fn frontmatter_single_line_values() {
        let fm = parse_frontmatter("---\nname: gsd:progress\ndescription: Show progress\n---\nbody");
        assert_eq!(fm.get("name").map(String::as_str), Some("gsd:progress"));
        assert_eq!(fm.get("description").map(String::as_str), Some("Show progress"));
    }

    #[test]
    fn frontmatter_continuation_block() {
        let fm = parse_frontmatter(
            "---\ndescription: >-\n  first piece\n  second piece\n---\n",
        );
        assert_eq!(
            fm.get("description").map(String::as_str),
            Some("first piece second piece")
        );
    }

    #[test]
    fn no_frontmatter_is_empty() {
        assert!(parse_frontmatter("# just markdown\n").is_empty());
    }

    #[test]
    fn scan_derives_name_from_path_when_frontmatter_lacks_it() {
        let dir = scratch("derive");
        let _ = std::fs::remove_dir_all(&dir);
        write_command(&dir, "gsd/progress.md", "---\ndescription: Track it\n---\n");

        let skills = scan_commands(&dir);
        let skill = skills.get("gsd_progress").expect("skill present");
        assert_eq!(skill.command, "/gsd:progress");
        assert_eq!(skill.description, "Track it");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn scan_skips_native_collisions_and_bad_names() {
        let dir = scratch("skip");
        let _ = std::fs::remove_dir_all(&dir);
        write_command(&dir, "history.md", "---\ndescription: shadows native\n---\n");
        write_command(&dir, "0bad.md", "---\ndescription: bad leading digit\n---\n");
        write_command(&dir, "fine.md", "---\ndescription: ok\n---\n");

        let skills = scan_commands(&dir);
        assert!(!skills.contains_key("history"));
        assert!(!skills.contains_key("0bad"));
        assert!(skills.contains_key("fine"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_and_load_round_trip() {
        let dir = scratch("roundtrip");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("skills.json");

        let mut skills = SkillMap::new();
        skills.insert(
            "gsd_progress".into(),
            Skill {
                command: "/gsd:progress".into(),
                description: "Track".into(),
            },
        );
        write_skills(&path, &skills).unwrap();
        assert_eq!(load_skills(&path), skills);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn long_description_is_truncated() {
        let dir = scratch("longdesc");
        let _ = std::fs::remove_dir_all(&dir);
        write_command(
            &dir,
            "verbose.md",
            &format!("---\ndescription: {}\n---\n", "d".repeat(300)),
        );
        let skills = scan_commands(&dir);
        let desc = &skills.get("verbose").unwrap().description;
        assert_eq!(desc.chars().count(), 200);
        assert!(desc.ends_with("..."));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
