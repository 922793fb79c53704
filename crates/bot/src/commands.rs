//! Command router: every inbound topic message lands here.
//!
//! First message in an unbound topic starts the binding flow (the text is
//! held and forwarded to the agent once bound). In a bound topic, `/name`
//! commands are translated through the skill-alias map, handled natively, or
//! forwarded verbatim; `!cmd` runs in the window's working directory; plain
//! text becomes literal keystrokes with a trailing Enter.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ccbot_mux::{MuxClient, MuxWindow};
use ccbot_protocol::{ChatTransport, ContentType, MessageTask};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::delivery::DeliveryPipeline;
use crate::hub::RouterHub;
use crate::monitor::resolve_transcript_path;
use crate::paths;
use crate::render;
use crate::session_map::SessionMapStore;
use crate::shell;
use crate::skills::SkillMap;
use crate::telegram::ChatUpdate;
use crate::transcript;

/// How long to wait for the SessionStart hook after launching the agent.
const HOOK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const HOOK_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Wall-clock budget for `!` shell commands.
const SHELL_TIMEOUT_SECS: u64 = 30;

/// Transcript entries shown by `/history`.
const HISTORY_ENTRIES: usize = 10;

/// Sessions offered by `/resume`.
const RESUME_LIMIT: usize = 30;

/// A held first message waiting for the user to pick or create a window.
struct PendingBinding {
    held_text: String,
    offered: Vec<MuxWindow>,
}

/// A past agent session offered by `/resume`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub last_active: f64,
    pub message_count: usize,
}

pub struct CommandRouter {
    cfg: Arc<Config>,
    mux: MuxClient,
    hub: Arc<RouterHub>,
    session_map: Arc<SessionMapStore>,
    pipeline: Arc<DeliveryPipeline>,
    transport: Arc<dyn ChatTransport>,
    skills: SkillMap,
    pending: Mutex<HashMap<(i64, i64), PendingBinding>>,
    resume_offers: Mutex<HashMap<(i64, i64), Vec<SessionSummary>>>,
}

/// Split `/name args` into `(name, args)`, stripping a `@botname` mention.
fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let raw_name = parts.next()?;
    let name = raw_name.split('@').next().unwrap_or(raw_name);
    if name.is_empty() {
        return None;
    }
    Some((
        name.to_string(),
        parts.next().unwrap_or("").trim().to_string(),
    ))
}

/// Window names come from directory basenames; tmux treats some characters
/// specially, so normalize them away.
fn sanitize_window_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            ':' | '.' | ' ' | '\t' => '-',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

/// Scan the agent's prompt history for past sessions of one project.
pub fn scan_sessions(history_path: &Path, project: &str, limit: usize) -> Vec<SessionSummary> {
    let Ok(data) = std::fs::read_to_string(history_path) else {
        return Vec::new();
    };

    let mut grouped: HashMap<String, Vec<(f64, String)>> = HashMap::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("project").and_then(Value::as_str) != Some(project) {
            continue;
        }
        let Some(sid) = entry.get("sessionId").and_then(Value::as_str) else {
            continue;
        };
        let display = entry
            .get("display")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let ts = entry
            .get("timestamp")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            / 1000.0;
        grouped.entry(sid.to_string()).or_default().push((ts, display));
    }

    let mut summaries: Vec<SessionSummary> = grouped
        .into_iter()
        .map(|(session_id, entries)| {
            let title = entries
                .iter()
                .map(|(_, d)| d)
                .find(|d| !d.is_empty() && !d.starts_with('/'))
                .or_else(|| entries.iter().map(|(_, d)| d).find(|d| !d.is_empty()))
                .cloned()
                .unwrap_or_else(|| "Untitled".to_string());
            let title = if title.chars().count() > 60 {
                title.chars().take(57).collect::<String>() + "..."
            } else {
                title
            };
            let last_active = entries.iter().map(|(ts, _)| *ts).fold(0.0, f64::max);
            SessionSummary {
                session_id,
                title,
                last_active,
                message_count: entries.len(),
            }
        })
        .collect();

    summaries.sort_by(|a, b| b.last_active.total_cmp(&a.last_active));
    summaries.truncate(limit);
    summaries
}

fn relative_time(ts: f64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let delta = (now - ts).max(0.0);
    if delta < 60.0 {
        "just now".to_string()
    } else if delta < 3600.0 {
        format!("{}m ago", (delta / 60.0) as u64)
    } else if delta < 86_400.0 {
        format!("{}h ago", (delta / 3600.0) as u64)
    } else {
        let days = (delta / 86_400.0) as u64;
        match days {
            1 => "yesterday".to_string(),
            2..=29 => format!("{days}d ago"),
            _ => format!("{}mo ago", days / 30),
        }
    }
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        mux: MuxClient,
        hub: Arc<RouterHub>,
        session_map: Arc<SessionMapStore>,
        pipeline: Arc<DeliveryPipeline>,
        transport: Arc<dyn ChatTransport>,
        skills: SkillMap,
    ) -> Self {
        Self {
            cfg,
            mux,
            hub,
            session_map,
            pipeline,
            transport,
            skills,
            pending: Mutex::new(HashMap::new()),
            resume_offers: Mutex::new(HashMap::new()),
        }
    }

    async fn reply(&self, chat_id: i64, topic_id: i64, text: &str) {
        if let Err(e) = self
            .transport
            .send_message(chat_id, Some(topic_id), text)
            .await
        {
            warn!(
                component = "commands",
                event = "commands.reply_failed",
                chat_id = chat_id,
                topic_id = topic_id,
                error = %e,
                "Failed to send reply"
            );
        }
    }

    pub async fn handle_update(&self, update: ChatUpdate) {
        match update {
            ChatUpdate::Message {
                user_id,
                chat_id,
                topic_id,
                text,
            } => {
                if !self.cfg.is_user_allowed(user_id) {
                    debug!(
                        component = "commands",
                        event = "commands.user_rejected",
                        user_id = user_id,
                        "Ignoring message from non-allowed user"
                    );
                    return;
                }
                let Some(topic_id) = topic_id else {
                    debug!(
                        component = "commands",
                        event = "commands.outside_topic",
                        user_id = user_id,
                        "Ignoring message outside a topic"
                    );
                    return;
                };
                self.handle_message(user_id, chat_id, topic_id, text).await;
            }
            ChatUpdate::TopicClosed {
                user_id,
                chat_id: _,
                topic_id,
            } => {
                self.handle_topic_closed(user_id, topic_id).await;
            }
        }
    }

    async fn handle_message(&self, user_id: i64, chat_id: i64, topic_id: i64, text: String) {
        let has_pending = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .contains_key(&(user_id, topic_id));
        if has_pending {
            self.handle_pending_reply(user_id, chat_id, topic_id, &text)
                .await;
            return;
        }

        match self.hub.resolve_topic(user_id, topic_id) {
            Some(window_id) => {
                self.handle_bound(user_id, chat_id, topic_id, &window_id, &text)
                    .await;
            }
            None => {
                self.begin_binding(user_id, chat_id, topic_id, text).await;
            }
        }
    }

    // ── binding flow ─────────────────────────────────────────────────

    /// First message in an unbound topic: hold the text and offer windows.
    async fn begin_binding(&self, user_id: i64, chat_id: i64, topic_id: i64, text: String) {
        if let Some((name, args)) = parse_command(&text) {
            if name == "new" {
                self.create_and_bind(user_id, chat_id, topic_id, &args, None)
                    .await;
                return;
            }
        }

        let live = match self.mux.list_windows().await {
            Ok(live) => live,
            Err(e) => {
                self.reply(chat_id, topic_id, &format!("❌ Multiplexer unavailable: {e}"))
                    .await;
                return;
            }
        };
        let unbound: Vec<MuxWindow> = live
            .into_iter()
            .filter(|w| !self.hub.is_window_bound(&w.window_id))
            .collect();

        let message = if unbound.is_empty() {
            "No free terminal windows.\nSend /new <absolute_path> to start a session there."
                .to_string()
        } else {
            let mut lines = vec!["Pick a window for this topic (reply with its number):".to_string()];
            for (i, w) in unbound.iter().enumerate() {
                lines.push(format!("{}. [{}] {}", i + 1, w.name, w.cwd));
            }
            lines.push("Or send /new <absolute_path> to create a fresh one.".to_string());
            lines.join("\n")
        };

        self.pending.lock().expect("pending lock poisoned").insert(
            (user_id, topic_id),
            PendingBinding {
                held_text: text,
                offered: unbound,
            },
        );
        self.reply(chat_id, topic_id, &message).await;
    }

    /// The user answered the window offer: a number picks, `/new` creates,
    /// anything else replaces the held text and re-prompts.
    async fn handle_pending_reply(&self, user_id: i64, chat_id: i64, topic_id: i64, text: &str) {
        if let Some((name, args)) = parse_command(text) {
            if name == "new" {
                let held = self
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&(user_id, topic_id))
                    .map(|p| p.held_text);
                self.create_and_bind(user_id, chat_id, topic_id, &args, held)
                    .await;
                return;
            }
        }

        if let Ok(choice) = text.trim().parse::<usize>() {
            let picked = {
                let pending = self.pending.lock().expect("pending lock poisoned");
                pending
                    .get(&(user_id, topic_id))
                    .and_then(|p| p.offered.get(choice.wrapping_sub(1)).cloned())
            };
            match picked {
                Some(window) => {
                    let held = self
                        .pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&(user_id, topic_id))
                        .map(|p| p.held_text)
                        .unwrap_or_default();
                    self.bind_and_forward(user_id, chat_id, topic_id, &window, held)
                        .await;
                }
                None => {
                    self.reply(chat_id, topic_id, "Invalid selection; reply with a listed number.")
                        .await;
                }
            }
            return;
        }

        // New text replaces the held message and the offer is repeated.
        let held = text.to_string();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&(user_id, topic_id));
        self.begin_binding(user_id, chat_id, topic_id, held).await;
    }

    async fn bind_and_forward(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        window: &MuxWindow,
        held_text: String,
    ) {
        if let Err(e) = self.hub.bind(
            user_id,
            topic_id,
            &window.window_id,
            &window.name,
            &window.cwd,
            chat_id,
        ) {
            self.reply(chat_id, topic_id, &format!("❌ {e}")).await;
            return;
        }

        self.reply(
            chat_id,
            topic_id,
            &format!("✅ Bound to [{}] {}", window.name, window.cwd),
        )
        .await;

        if !held_text.is_empty() {
            if let Err(e) = self
                .mux
                .send_keys(&window.window_id, &held_text, true, true)
                .await
            {
                self.reply(chat_id, topic_id, &format!("❌ Failed to forward message: {e}"))
                    .await;
            }
        }
    }

    /// `/new <path>`: create a window running the agent, wait for the hook
    /// to register the session, bind, forward the held text.
    async fn create_and_bind(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        path: &str,
        held_text: Option<String>,
    ) {
        let path = path.trim();
        if path.is_empty() || !path.starts_with('/') {
            self.reply(chat_id, topic_id, "Usage: /new <absolute_path>").await;
            return;
        }
        if !Path::new(path).is_dir() {
            self.reply(chat_id, topic_id, &format!("❌ Not a directory: {path}"))
                .await;
            return;
        }

        let desired = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string());
        let desired = sanitize_window_name(&desired);

        let (window_id, final_name) = match self
            .mux
            .create_window(path, &desired, &self.cfg.agent_command)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.reply(chat_id, topic_id, &format!("❌ Failed to create window: {e}"))
                    .await;
                return;
            }
        };

        let registered = self.wait_for_session_entry(&window_id).await;
        if !registered {
            info!(
                component = "commands",
                event = "commands.hook_wait_timeout",
                window_id = %window_id,
                "Hook did not register the session in time; binding anyway"
            );
        }

        let window = MuxWindow {
            window_id,
            name: final_name,
            cwd: path.to_string(),
            pane_command: String::new(),
        };
        self.bind_and_forward(user_id, chat_id, topic_id, &window, held_text.unwrap_or_default())
            .await;
    }

    async fn wait_for_session_entry(&self, window_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + HOOK_WAIT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.session_map.session_for_window(window_id).is_some() {
                return true;
            }
            tokio::time::sleep(HOOK_WAIT_INTERVAL).await;
        }
        false
    }

    // ── bound topics ─────────────────────────────────────────────────

    async fn handle_bound(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        window_id: &str,
        text: &str,
    ) {
        if let Some(command) = text.strip_prefix('!') {
            self.run_shell(user_id, chat_id, topic_id, window_id, command.trim())
                .await;
            return;
        }

        if text.starts_with('/') {
            if let Some((name, args)) = parse_command(text) {
                self.handle_command(user_id, chat_id, topic_id, window_id, &name, &args)
                    .await;
                return;
            }
        }

        self.forward_text(user_id, chat_id, topic_id, window_id, text)
            .await;
    }

    async fn forward_text(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        window_id: &str,
        text: &str,
    ) {
        let window = match self.mux.find_by_id(window_id).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                self.auto_unbind(user_id, chat_id, topic_id, window_id).await;
                return;
            }
            Err(e) => {
                self.reply(chat_id, topic_id, &format!("❌ {e}")).await;
                return;
            }
        };

        let _ = self.transport.send_typing(chat_id, Some(topic_id)).await;
        // Forget the live status message so the next status starts fresh
        // below the user's message instead of editing the one above it.
        self.pipeline
            .enqueue_status_clear(user_id, window_id, topic_id, chat_id);

        if let Err(e) = self.mux.send_keys(&window.window_id, text, true, true).await {
            self.reply(chat_id, topic_id, &format!("❌ Failed to send: {e}"))
                .await;
        }
    }

    async fn handle_command(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        window_id: &str,
        name: &str,
        args: &str,
    ) {
        // Skill aliases rewrite to the agent's native slash command.
        if let Some(skill) = self.skills.get(name) {
            let forwarded = if args.is_empty() {
                skill.command.clone()
            } else {
                format!("{} {}", skill.command, args)
            };
            match self.mux.send_keys(window_id, &forwarded, true, true).await {
                Ok(()) => {
                    self.reply(chat_id, topic_id, &format!("⚡ Sent: {forwarded}"))
                        .await
                }
                Err(e) => self.reply(chat_id, topic_id, &format!("❌ {e}")).await,
            }
            return;
        }

        match name {
            "start" => {
                self.reply(
                    chat_id,
                    topic_id,
                    "🤖 This topic is bridged to a Claude Code session.\n\
                     Send text to forward it to the agent.\n\
                     /history — recent transcript\n\
                     /resume — pick a past session\n\
                     /screenshot — capture the terminal\n\
                     /esc — interrupt the agent\n\
                     !cmd — run a shell command in the project directory",
                )
                .await;
            }
            "history" => {
                let text = self.recent_history(window_id).await;
                self.reply(chat_id, topic_id, &text).await;
            }
            "resume" => {
                self.handle_resume(user_id, chat_id, topic_id, window_id, args)
                    .await;
            }
            "screenshot" => {
                match self.mux.capture_pane(window_id, false).await {
                    Ok(pane) => {
                        let body = format!("```\n{}\n```", pane.trim_end());
                        self.reply(chat_id, topic_id, &body).await;
                    }
                    Err(e) => self.reply(chat_id, topic_id, &format!("❌ {e}")).await,
                }
            }
            "esc" => {
                match self.mux.send_keys(window_id, "Escape", false, false).await {
                    Ok(()) => self.reply(chat_id, topic_id, "⎋ Sent Escape").await,
                    Err(e) => self.reply(chat_id, topic_id, &format!("❌ {e}")).await,
                }
            }
            "new" => {
                self.reply(
                    chat_id,
                    topic_id,
                    "❌ This topic is already bound to a window. Close the topic to release it.",
                )
                .await;
            }
            _ => {
                // Everything else goes to the agent verbatim.
                let forwarded = if args.is_empty() {
                    format!("/{name}")
                } else {
                    format!("/{name} {args}")
                };
                match self.mux.send_keys(window_id, &forwarded, true, true).await {
                    Ok(()) => {
                        self.reply(chat_id, topic_id, &format!("⚡ Sent: {forwarded}"))
                            .await;
                        // After /clear a fresh session id will appear; drop the
                        // old association so the monitor tracks the rotation.
                        if name == "clear" {
                            self.hub.clear_window_session(window_id);
                        }
                    }
                    Err(e) => self.reply(chat_id, topic_id, &format!("❌ {e}")).await,
                }
            }
        }
    }

    async fn run_shell(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        window_id: &str,
        command: &str,
    ) {
        if command.is_empty() {
            self.reply(chat_id, topic_id, "Usage: !<shell command>").await;
            return;
        }
        let cwd = self
            .hub
            .window_state(window_id)
            .map(|s| s.cwd)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let pipeline = self.pipeline.clone();
        let command = command.to_string();
        let window_id = window_id.to_string();
        tokio::spawn(async move {
            let result = shell::execute(&command, &cwd, SHELL_TIMEOUT_SECS).await;
            let rendered = result.render(&command);
            let parts = render::split_message(&rendered, render::MAX_PART_LEN);
            pipeline.enqueue_content(
                user_id,
                MessageTask::content(
                    window_id,
                    topic_id,
                    chat_id,
                    parts,
                    ContentType::Text,
                    None,
                    None,
                ),
            );
        });
    }

    // ── /resume ──────────────────────────────────────────────────────

    async fn handle_resume(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
        window_id: &str,
        args: &str,
    ) {
        let cwd = self
            .hub
            .window_state(window_id)
            .map(|s| s.cwd)
            .filter(|c| !c.is_empty());
        let Some(cwd) = cwd else {
            self.reply(chat_id, topic_id, "❌ Could not determine the project path.")
                .await;
            return;
        };

        if args.is_empty() {
            let sessions = scan_sessions(&paths::claude_history_path(), &cwd, RESUME_LIMIT);
            if sessions.is_empty() {
                self.reply(chat_id, topic_id, "No previous sessions found for this project.")
                    .await;
                return;
            }
            let mut lines = vec!["Previous sessions (resume with /resume <number>):".to_string()];
            for (i, s) in sessions.iter().enumerate() {
                lines.push(format!(
                    "{}. {} — {} · {} msgs",
                    i + 1,
                    s.title,
                    relative_time(s.last_active),
                    s.message_count
                ));
            }
            let body = lines.join("\n");
            self.resume_offers
                .lock()
                .expect("resume lock poisoned")
                .insert((user_id, topic_id), sessions);
            self.reply(chat_id, topic_id, &body).await;
            return;
        }

        let Ok(choice) = args.trim().parse::<usize>() else {
            self.reply(chat_id, topic_id, "Usage: /resume, then /resume <number>")
                .await;
            return;
        };
        let session = {
            let offers = self.resume_offers.lock().expect("resume lock poisoned");
            offers
                .get(&(user_id, topic_id))
                .and_then(|s| s.get(choice.wrapping_sub(1)).cloned())
        };
        let Some(session) = session else {
            self.reply(chat_id, topic_id, "Invalid selection; run /resume first.")
                .await;
            return;
        };
        self.resume_offers
            .lock()
            .expect("resume lock poisoned")
            .remove(&(user_id, topic_id));

        self.reply(
            chat_id,
            topic_id,
            &format!("⏳ Resuming: {} — exiting the current session…", session.title),
        )
        .await;

        // Escape twice to leave any dialog, /exit, then relaunch resumed.
        let _ = self.mux.send_keys(window_id, "Escape", false, false).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = self.mux.send_keys(window_id, "Escape", false, false).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = self.mux.send_keys(window_id, "/exit", true, true).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let resume_cmd = format!("{} --resume {}", self.cfg.agent_command, session.session_id);
        if let Err(e) = self.mux.send_keys(window_id, &resume_cmd, true, true).await {
            self.reply(chat_id, topic_id, &format!("❌ Failed to resume: {e}"))
                .await;
            return;
        }

        self.hub.clear_window_session(window_id);
        let registered = self.wait_for_session_entry(window_id).await;
        let suffix = if registered { "" } else { " (hook pending)" };
        self.reply(
            chat_id,
            topic_id,
            &format!("✅ Resumed: {}{suffix}", session.title),
        )
        .await;
    }

    // ── /history ─────────────────────────────────────────────────────

    async fn recent_history(&self, window_id: &str) -> String {
        let state = self.hub.window_state(window_id);
        let Some(state) = state else {
            return "📋 No session for this window yet.".to_string();
        };
        let Some(session_id) = state.session_id else {
            return "📋 No session for this window yet.".to_string();
        };

        let path = resolve_transcript_path(&paths::claude_projects_dir(), &session_id, &state.cwd);
        let Ok(data) = std::fs::read_to_string(&path) else {
            return "📋 No messages yet.".to_string();
        };

        let mut rendered: Vec<String> = Vec::new();
        for line in data.lines() {
            let Some(entries) = transcript::parse_line(line) else {
                continue;
            };
            for entry in entries {
                let prefix = match entry.content_type {
                    ContentType::User => "👤 ",
                    ContentType::Thinking => "∴ ",
                    ContentType::ToolUse => "🔧 ",
                    _ => "",
                };
                let mut text = entry.text;
                if text.chars().count() > 400 {
                    text = text.chars().take(400).collect::<String>() + "…";
                }
                rendered.push(format!("{prefix}{text}"));
            }
        }

        if rendered.is_empty() {
            return "📋 No messages yet.".to_string();
        }
        let tail: Vec<String> = rendered
            .into_iter()
            .rev()
            .take(HISTORY_ENTRIES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let body = format!("📋 Recent messages:\n\n{}", tail.join("\n\n"));
        render::split_message(&body, render::MAX_PART_LEN)
            .pop()
            .unwrap_or(body)
    }

    // ── cleanup ──────────────────────────────────────────────────────

    async fn auto_unbind(&self, user_id: i64, chat_id: i64, topic_id: i64, window_id: &str) {
        warn!(
            component = "commands",
            event = "commands.window_missing",
            user_id = user_id,
            topic_id = topic_id,
            window_id = %window_id,
            "Window gone on send, unbinding"
        );
        self.hub.unbind(user_id, topic_id);
        self.hub.remove_window(window_id);
        self.pipeline.flush_window(user_id, window_id);
        self.reply(
            chat_id,
            topic_id,
            "❌ The terminal window for this topic no longer exists; the topic has been unbound.",
        )
        .await;
    }

    /// Topic closed or deleted: kill the window and drop every trace.
    pub async fn handle_topic_closed(&self, user_id: i64, topic_id: i64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&(user_id, topic_id));
        self.resume_offers
            .lock()
            .expect("resume lock poisoned")
            .remove(&(user_id, topic_id));

        let Some(window_id) = self.hub.unbind(user_id, topic_id) else {
            return;
        };
        info!(
            component = "commands",
            event = "commands.topic_closed",
            user_id = user_id,
            topic_id = topic_id,
            window_id = %window_id,
            "Topic closed, killing window"
        );
        if let Err(e) = self.mux.kill_window(&window_id).await {
            warn!(
                component = "commands",
                event = "commands.kill_failed",
                window_id = %window_id,
                error = %e,
                "Failed to kill window on topic close"
            );
        }
        self.hub.remove_window(&window_id);
        self.pipeline.flush_window(user_id, &window_id);
    }
}
