//! Core types shared across the bridge

use serde::{Deserialize, Serialize};

/// Who produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Classified transcript content.
///
/// Every line the monitor emits carries exactly one of these; matching is
/// exhaustive so a new variant forces every consumer to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    ToolError,
    LocalCommand,
    User,
    InteractivePrompt,
}

impl ContentType {
    /// Adjacent content tasks of these types may be concatenated into one
    /// outbound send. Tool calls and results never merge: the call must keep
    /// its own message id for the later in-place edit.
    pub fn is_mergeable(self) -> bool {
        matches!(
            self,
            ContentType::Text | ContentType::Thinking | ContentType::User | ContentType::LocalCommand
        )
    }

    /// Stable key used by the notification filter file.
    pub fn filter_key(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Thinking => "thinking",
            ContentType::ToolUse => "tool_use",
            ContentType::ToolResult => "tool_result",
            ContentType::ToolError => "tool_error",
            ContentType::LocalCommand => "local_command",
            ContentType::User => "user",
            ContentType::InteractivePrompt => "interactive_prompt",
        }
    }
}

/// One event emitted by the transcript monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub session_id: String,
    pub content_type: ContentType,
    pub role: Role,
    pub text: String,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// Kind of work item in a user's delivery queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Content,
    StatusUpdate,
    StatusClear,
}

/// A delivery work item.
///
/// `parts` holds pre-split, platform-sized chunks for content tasks; status
/// tasks carry their line in `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTask {
    pub kind: TaskKind,
    pub window_id: String,
    pub topic_id: i64,
    pub chat_id: i64,
    #[serde(default)]
    pub parts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub content_type: ContentType,
}

impl MessageTask {
    pub fn content(
        window_id: impl Into<String>,
        topic_id: i64,
        chat_id: i64,
        parts: Vec<String>,
        content_type: ContentType,
        tool_use_id: Option<String>,
        text: Option<String>,
    ) -> Self {
        Self {
            kind: TaskKind::Content,
            window_id: window_id.into(),
            topic_id,
            chat_id,
            parts,
            text,
            tool_use_id,
            content_type,
        }
    }

    pub fn status_update(
        window_id: impl Into<String>,
        topic_id: i64,
        chat_id: i64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: TaskKind::StatusUpdate,
            window_id: window_id.into(),
            topic_id,
            chat_id,
            parts: Vec::new(),
            text: Some(text.into()),
            tool_use_id: None,
            content_type: ContentType::Text,
        }
    }

    pub fn status_clear(window_id: impl Into<String>, topic_id: i64, chat_id: i64) -> Self {
        Self {
            kind: TaskKind::StatusClear,
            window_id: window_id.into(),
            topic_id,
            chat_id,
            parts: Vec::new(),
            text: None,
            tool_use_id: None,
            content_type: ContentType::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mergeable_set_excludes_tool_traffic() {
        assert!(ContentType::Text.is_mergeable());
        assert!(ContentType::Thinking.is_mergeable());
        assert!(ContentType::User.is_mergeable());
        assert!(ContentType::LocalCommand.is_mergeable());
        assert!(!ContentType::ToolUse.is_mergeable());
        assert!(!ContentType::ToolResult.is_mergeable());
        assert!(!ContentType::ToolError.is_mergeable());
        assert!(!ContentType::InteractivePrompt.is_mergeable());
    }

    #[test]
    fn content_type_round_trips_as_snake_case() {
        let json = serde_json::to_string(&ContentType::ToolResult).unwrap();
        assert_eq!(json, "\"tool_result\"");
        let back: ContentType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ContentType::ToolResult);
    }
}
