//! Outbound message shaping: chunking and per-content-type decoration.
//!
//! The delivery queue carries pre-split parts so the worker never has to
//! think about platform limits mid-send. Splitting prefers newline
//! boundaries; only a single overlong line is cut mid-line.

use ccbot_protocol::{ContentType, Role};

/// Platform hard limit is 4096; parts stay well under it so merged sends and
/// markup decoration have headroom.
pub const MAX_PART_LEN: usize = 3000;

/// Thinking blocks are collapsed to a short excerpt.
const MAX_THINKING_LEN: usize = 500;
const THINKING_PREFIX: &str = "∴ Thinking…";
const USER_PREFIX: &str = "👤 ";

/// Split text into chunks of at most `max_length` characters, preferring
/// newline boundaries.
pub fn split_message(text: &str, max_length: usize) -> Vec<String> {
    if text.chars().count() <= max_length {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        if line_len > max_length {
            if !current.is_empty() {
                chunks.push(current.trim_end_matches('\n').to_string());
                current.clear();
                current_len = 0;
            }
            // Cut the overlong line into fixed-size pieces.
            let mut rest: Vec<char> = line.chars().collect();
            while !rest.is_empty() {
                let take = rest.len().min(max_length);
                chunks.push(rest[..take].iter().collect());
                rest.drain(..take);
            }
        } else if current_len + line_len + 1 > max_length {
            chunks.push(current.trim_end_matches('\n').to_string());
            current = format!("{line}\n");
            current_len = line_len + 1;
        } else {
            current.push_str(line);
            current.push('\n');
            current_len += line_len + 1;
        }
    }

    if !current.is_empty() {
        chunks.push(current.trim_end_matches('\n').to_string());
    }

    chunks
}

/// Truncate to a character budget with an ellipsis marker.
fn truncate_chars(text: &str, max: usize, marker: &str) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}{marker}")
}

/// Build the platform-sized message parts for one transcript event.
///
/// Multi-part messages carry a `[i/N]` suffix; user messages get the 👤
/// prefix; thinking gets its excerpt treatment.
pub fn build_response_parts(text: &str, content_type: ContentType, role: Role) -> Vec<String> {
    let text = text.trim();

    if role == Role::User && content_type == ContentType::User {
        return vec![format!(
            "{USER_PREFIX}{}",
            truncate_chars(text, MAX_PART_LEN, "…")
        )];
    }

    let (prefix, body) = if content_type == ContentType::Thinking {
        (
            format!("{THINKING_PREFIX}\n"),
            truncate_chars(text, MAX_THINKING_LEN, "\n\n… (thinking truncated)"),
        )
    } else {
        (String::new(), text.to_string())
    };

    let budget = MAX_PART_LEN.saturating_sub(prefix.chars().count());
    let chunks = split_message(&body, budget);
    let total = chunks.len();

    if total == 1 {
        return vec![format!("{prefix}{}", chunks[0])];
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("{prefix}{chunk}\n\n[{}/{total}]", i + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn splits_on_newline_boundaries() {
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(60));
        assert_eq!(chunks[1], "b".repeat(60));
    }

    #[test]
    fn cuts_overlong_single_line() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn user_message_gets_prefix() {
        let parts = build_response_parts("hi there", ContentType::User, Role::User);
        assert_eq!(parts, vec!["👤 hi there"]);
    }

    #[test]
    fn thinking_is_truncated_with_marker() {
        let long = "t".repeat(900);
        let parts = build_response_parts(&long, ContentType::Thinking, Role::Assistant);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].starts_with("∴ Thinking…\n"));
        assert!(parts[0].contains("… (thinking truncated)"));
        // 500 chars of payload plus prefix and marker, nowhere near the raw 900
        assert!(parts[0].chars().count() < 600);
    }

    #[test]
    fn short_thinking_is_untouched() {
        let parts = build_response_parts("brief", ContentType::Thinking, Role::Assistant);
        assert_eq!(parts, vec!["∴ Thinking…\nbrief"]);
    }

    #[test]
    fn long_text_pages_with_suffix() {
        let long = (0..200)
            .map(|i| format!("line {i} with some padding text"))
            .collect::<Vec<_>>()
            .join("\n");
        let parts = build_response_parts(&long, ContentType::Text, Role::Assistant);
        assert!(parts.len() > 1);
        let total = parts.len();
        assert!(parts[0].ends_with(&format!("[1/{total}]")));
        assert!(parts[total - 1].ends_with(&format!("[{total}/{total}]")));
        for part in &parts {
            assert!(part.chars().count() <= MAX_PART_LEN + 16);
        }
    }
}
