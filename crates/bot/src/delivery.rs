//! Per-user outbound delivery pipeline.
//!
//! Exactly one FIFO queue and one worker task per user, spawned lazily on
//! first enqueue. The worker is the single consumer, so per-user ordering is
//! enqueue order modulo merging. Between any two outbound operations for a
//! user the worker enforces a minimum wall-clock gap; users do not contend.
//!
//! Tool pairing: when a tool-use message is sent its platform message id is
//! remembered; the matching tool result is dispatched as an edit of that
//! message, never a new send, even when other traffic intervened.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ccbot_protocol::{ChatTransport, ContentType, MessageTask, TaskKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::NotifyConfig;

/// Minimum gap between outbound operations per user.
pub const MESSAGE_SEND_INTERVAL: Duration = Duration::from_millis(1100);

/// Merged payloads stay below the platform limit with headroom.
pub const MERGE_LIMIT: usize = 3800;

/// Content backlog beyond this triggers compaction.
const MAX_QUEUE_SIZE: usize = 5;

/// Compaction keeps the oldest task for context plus this many newest.
const KEEP_RECENT: usize = 3;

/// Pending tool-use entries older than this are evicted.
const PENDING_TOOL_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-user drain budget at shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

struct SharedQueue {
    tasks: Mutex<VecDeque<MessageTask>>,
    notify: Notify,
    shutdown: AtomicBool,
}

struct UserHandle {
    queue: Arc<SharedQueue>,
    worker: JoinHandle<()>,
}

pub struct DeliveryPipeline {
    transport: Arc<dyn ChatTransport>,
    notify_cfg: NotifyConfig,
    users: Mutex<HashMap<i64, UserHandle>>,
}

impl DeliveryPipeline {
    pub fn new(transport: Arc<dyn ChatTransport>, notify_cfg: NotifyConfig) -> Self {
        Self {
            transport,
            notify_cfg,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn queue_for(&self, user_id: i64) -> Arc<SharedQueue> {
        let mut users = self.users.lock().expect("pipeline users lock poisoned");
        let handle = users.entry(user_id).or_insert_with(|| {
            let queue = Arc::new(SharedQueue {
                tasks: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            });
            let worker = Worker {
                user_id,
                queue: queue.clone(),
                transport: self.transport.clone(),
                notify_cfg: self.notify_cfg.clone(),
                status_msg: None,
                pending_tools: HashMap::new(),
                last_send: None,
            };
            info!(
                component = "delivery",
                event = "delivery.worker_started",
                user_id = user_id,
                "Delivery worker started"
            );
            UserHandle {
                queue: queue.clone(),
                worker: tokio::spawn(worker.run()),
            }
        });
        handle.queue.clone()
    }

    /// Append a content task, compacting the backlog first if needed.
    pub fn enqueue_content(&self, user_id: i64, task: MessageTask) {
        let queue = self.queue_for(user_id);
        {
            let mut tasks = queue.tasks.lock().expect("queue lock poisoned");
            compact_if_needed(&mut tasks, user_id);
            tasks.push_back(task);
        }
        queue.notify.notify_one();
    }

    /// Append a status update, first removing any queued status for the same
    /// window: status lines are ephemeral, only the latest matters.
    pub fn enqueue_status_update(&self, user_id: i64, task: MessageTask) {
        let queue = self.queue_for(user_id);
        {
            let mut tasks = queue.tasks.lock().expect("queue lock poisoned");
            tasks.retain(|t| {
                !(t.kind == TaskKind::StatusUpdate && t.window_id == task.window_id)
            });
            compact_if_needed(&mut tasks, user_id);
            tasks.push_back(task);
        }
        queue.notify.notify_one();
    }

    /// Delete the currently displayed status message, if any.
    pub fn enqueue_status_clear(&self, user_id: i64, window_id: &str, topic_id: i64, chat_id: i64) {
        let queue = self.queue_for(user_id);
        {
            let mut tasks = queue.tasks.lock().expect("queue lock poisoned");
            tasks.push_back(MessageTask::status_clear(window_id, topic_id, chat_id));
        }
        queue.notify.notify_one();
    }

    /// Drop queued work for a window (topic closed).
    pub fn flush_window(&self, user_id: i64, window_id: &str) {
        let users = self.users.lock().expect("pipeline users lock poisoned");
        if let Some(handle) = users.get(&user_id) {
            let mut tasks = handle.queue.tasks.lock().expect("queue lock poisoned");
            let before = tasks.len();
            tasks.retain(|t| t.window_id != window_id);
            let removed = before - tasks.len();
            if removed > 0 {
                debug!(
                    component = "delivery",
                    event = "delivery.window_flushed",
                    user_id = user_id,
                    window_id = %window_id,
                    removed = removed,
                    "Flushed queued tasks for closed window"
                );
            }
        }
    }

    /// Signal every worker to drain and wait up to the per-user deadline.
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, Arc<SharedQueue>, JoinHandle<()>)> = {
            let mut users = self.users.lock().expect("pipeline users lock poisoned");
            users
                .drain()
                .map(|(uid, h)| (uid, h.queue, h.worker))
                .collect()
        };

        for (user_id, queue, worker) in handles {
            queue.shutdown.store(true, Ordering::SeqCst);
            queue.notify.notify_one();
            if tokio::time::timeout(DRAIN_DEADLINE, worker).await.is_err() {
                warn!(
                    component = "delivery",
                    event = "delivery.worker_drain_timeout",
                    user_id = user_id,
                    "Worker did not drain in time, dropping remaining tasks"
                );
            }
        }
    }
}

/// Drop middle content when a user's backlog outruns delivery: keep the
/// oldest task for context and the newest few, and tell the user what
/// happened with a synthetic notice.
fn compact_if_needed(tasks: &mut VecDeque<MessageTask>, user_id: i64) {
    let content_count = tasks.iter().filter(|t| t.kind == TaskKind::Content).count();
    if content_count <= MAX_QUEUE_SIZE {
        return;
    }

    let items: Vec<MessageTask> = tasks.drain(..).collect();
    let (mut kept, dropped) = compact_tasks(items);
    if dropped > 0 {
        warn!(
            component = "delivery",
            event = "delivery.queue_compacted",
            user_id = user_id,
            dropped = dropped,
            kept = kept.len(),
            "Queue overflow, dropped middle messages"
        );
        if let Some(anchor) = kept.iter().find(|t| t.kind == TaskKind::Content).cloned() {
            let notice = MessageTask::content(
                anchor.window_id.clone(),
                anchor.topic_id,
                anchor.chat_id,
                vec![format!(
                    "⚠️ {dropped} messages dropped (queue overflow), keeping the latest {}",
                    kept.len()
                )],
                ContentType::Text,
                None,
                None,
            );
            kept.insert(0, notice);
        }
    }
    tasks.extend(kept);
}

/// Keep first content (context) + newest tail; statuses deduped per window.
fn compact_tasks(items: Vec<MessageTask>) -> (Vec<MessageTask>, usize) {
    let total = items.len();
    if total <= MAX_QUEUE_SIZE {
        return (items, 0);
    }

    let mut indexed: Vec<(usize, MessageTask)> = items.into_iter().enumerate().collect();

    // Latest status per window wins; older ones are dropped outright.
    let mut last_status: HashMap<String, usize> = HashMap::new();
    for (idx, task) in &indexed {
        if task.kind == TaskKind::StatusUpdate {
            last_status.insert(task.window_id.clone(), *idx);
        }
    }
    indexed.retain(|(idx, task)| {
        task.kind != TaskKind::StatusUpdate || last_status.get(&task.window_id) == Some(idx)
    });

    let first_content = indexed
        .iter()
        .position(|(_, t)| t.kind == TaskKind::Content);

    let mut kept: Vec<(usize, MessageTask)> = Vec::new();
    let mut rest: Vec<(usize, MessageTask)> = Vec::new();
    for (i, item) in indexed.into_iter().enumerate() {
        if Some(i) == first_content {
            kept.push(item);
        } else {
            rest.push(item);
        }
    }

    let tail_len = rest.len().min(KEEP_RECENT);
    kept.extend(rest.split_off(rest.len() - tail_len));
    kept.sort_by_key(|(idx, _)| *idx);

    let kept: Vec<MessageTask> = kept.into_iter().map(|(_, t)| t).collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Pull mergeable successors into the head task. Two adjacent content tasks
/// merge iff same window and topic, both single-part, both in the mergeable
/// set, and the combined payload stays under the limit.
fn merge_chain(head: &mut MessageTask, tasks: &mut VecDeque<MessageTask>) {
    if head.kind != TaskKind::Content
        || !head.content_type.is_mergeable()
        || head.tool_use_id.is_some()
        || head.parts.len() != 1
    {
        return;
    }

    loop {
        let mergeable = match tasks.front() {
            Some(next) => {
                next.kind == TaskKind::Content
                    && next.content_type.is_mergeable()
                    && next.tool_use_id.is_none()
                    && next.parts.len() == 1
                    && next.window_id == head.window_id
                    && next.topic_id == head.topic_id
                    && head.parts[0].chars().count() + 2 + next.parts[0].chars().count()
                        <= MERGE_LIMIT
            }
            None => false,
        };
        if !mergeable {
            return;
        }
        let next = tasks.pop_front().expect("front checked above");
        head.parts[0] = format!("{}\n\n{}", head.parts[0], next.parts[0]);
    }
}

#[derive(Debug, Clone)]
struct StatusMsg {
    message_id: i64,
    chat_id: i64,
    window_id: String,
    last_text: String,
}

struct PendingTool {
    message_id: i64,
    chat_id: i64,
    recorded_at: Instant,
}

struct Worker {
    user_id: i64,
    queue: Arc<SharedQueue>,
    transport: Arc<dyn ChatTransport>,
    notify_cfg: NotifyConfig,
    status_msg: Option<StatusMsg>,
    pending_tools: HashMap<String, PendingTool>,
    last_send: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let queue = self.queue.clone();
            let notified = queue.notify.notified();
            let task = {
                let mut tasks = self.queue.tasks.lock().expect("queue lock poisoned");
                match tasks.pop_front() {
                    Some(mut head) => {
                        merge_chain(&mut head, &mut tasks);
                        Some(head)
                    }
                    None => None,
                }
            };

            match task {
                Some(task) => self.process(task).await,
                None => {
                    if self.queue.shutdown.load(Ordering::SeqCst) {
                        debug!(
                            component = "delivery",
                            event = "delivery.worker_stopped",
                            user_id = self.user_id,
                            "Delivery worker drained and stopped"
                        );
                        return;
                    }
                    notified.await;
                }
            }
        }
    }

    async fn process(&mut self, task: MessageTask) {
        match task.kind {
            TaskKind::Content => self.process_content(task).await,
            TaskKind::StatusUpdate => self.process_status_update(task).await,
            TaskKind::StatusClear => self.clear_status().await,
        }
    }

    /// Sleep out the remaining send-interval deficit, then claim the slot.
    async fn rate_limit(&mut self) {
        if let Some(prev) = self.last_send {
            let elapsed = prev.elapsed();
            if elapsed < MESSAGE_SEND_INTERVAL {
                tokio::time::sleep(MESSAGE_SEND_INTERVAL - elapsed).await;
            }
        }
        self.last_send = Some(Instant::now());
    }

    async fn process_content(&mut self, task: MessageTask) {
        // Tool results edit the recorded tool-use message in place. The edit
        // bypasses the notification filter; an unmatched result obeys it.
        if matches!(task.content_type, ContentType::ToolResult | ContentType::ToolError) {
            self.evict_stale_pending();
            let pending = task
                .tool_use_id
                .as_deref()
                .and_then(|id| self.pending_tools.remove(id));

            if let Some(pending) = pending {
                if self.edit_tool_message(&task, &pending).await {
                    return;
                }
                // Edit failed (message gone): fall through to a normal send.
            }

            let allowed = match task.content_type {
                ContentType::ToolError => self.notify_cfg.tool_error,
                _ => self.notify_cfg.tool_result,
            };
            if !allowed {
                return;
            }
        }

        let mut last_sent_id: Option<i64> = None;
        let mut first_part = true;
        for part in &task.parts {
            if first_part {
                first_part = false;
                if let Some(edited_id) = self.collapse_status_into(&task, part).await {
                    last_sent_id = Some(edited_id);
                    continue;
                }
            }

            self.rate_limit().await;
            match self
                .transport
                .send_message(task.chat_id, Some(task.topic_id), part)
                .await
            {
                Ok(message_id) => last_sent_id = Some(message_id),
                Err(e) => {
                    error!(
                        component = "delivery",
                        event = "delivery.send_failed",
                        user_id = self.user_id,
                        error = %e,
                        "Failed to send message"
                    );
                }
            }
        }

        if task.content_type == ContentType::ToolUse {
            if let (Some(message_id), Some(tool_use_id)) = (last_sent_id, task.tool_use_id.clone())
            {
                self.evict_stale_pending();
                self.pending_tools.insert(
                    tool_use_id,
                    PendingTool {
                        message_id,
                        chat_id: task.chat_id,
                        recorded_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Edit the recorded tool-use message with the result text. Returns true
    /// when the edit landed (extra parts follow as plain sends).
    async fn edit_tool_message(&mut self, task: &MessageTask, pending: &PendingTool) -> bool {
        // A live status message would sit between the pair; remove it first.
        self.clear_status().await;

        let Some(first) = task.parts.first() else {
            return true;
        };
        self.rate_limit().await;
        match self
            .transport
            .edit_message(pending.chat_id, pending.message_id, first)
            .await
        {
            Ok(()) => {
                for part in &task.parts[1..] {
                    self.rate_limit().await;
                    if let Err(e) = self
                        .transport
                        .send_message(task.chat_id, Some(task.topic_id), part)
                        .await
                    {
                        error!(
                            component = "delivery",
                            event = "delivery.send_failed",
                            user_id = self.user_id,
                            error = %e,
                            "Failed to send tool-result overflow part"
                        );
                    }
                }
                true
            }
            Err(e) => {
                debug!(
                    component = "delivery",
                    event = "delivery.tool_edit_failed",
                    user_id = self.user_id,
                    message_id = pending.message_id,
                    error = %e,
                    "Tool message edit failed, sending fresh"
                );
                false
            }
        }
    }

    /// When a live status message exists for this window, the first content
    /// part replaces it in place instead of a new send.
    async fn collapse_status_into(&mut self, task: &MessageTask, part: &str) -> Option<i64> {
        let status = self.status_msg.take()?;
        if status.window_id != task.window_id {
            // Different window: the stale status just gets deleted.
            self.rate_limit().await;
            let _ = self
                .transport
                .delete_message(status.chat_id, status.message_id)
                .await;
            return None;
        }

        self.rate_limit().await;
        match self
            .transport
            .edit_message(status.chat_id, status.message_id, part)
            .await
        {
            Ok(()) => Some(status.message_id),
            Err(e) => {
                debug!(
                    component = "delivery",
                    event = "delivery.status_collapse_failed",
                    user_id = self.user_id,
                    error = %e,
                    "Status-to-content edit failed, sending fresh"
                );
                None
            }
        }
    }

    async fn process_status_update(&mut self, task: MessageTask) {
        let Some(text) = task.text.clone().filter(|t| !t.is_empty()) else {
            self.clear_status().await;
            return;
        };

        // The agent is interruptible while this phrase is showing; surface
        // the platform's typing indicator as a hint.
        if text.to_lowercase().contains("esc to interrupt") {
            let _ = self
                .transport
                .send_typing(task.chat_id, Some(task.topic_id))
                .await;
        }

        match self.status_msg.clone() {
            Some(status) if status.window_id == task.window_id => {
                if status.last_text == text {
                    return;
                }
                self.rate_limit().await;
                match self
                    .transport
                    .edit_message(status.chat_id, status.message_id, &text)
                    .await
                {
                    Ok(()) => {
                        self.status_msg = Some(StatusMsg {
                            last_text: text,
                            ..status
                        });
                    }
                    Err(_) => {
                        self.status_msg = None;
                        self.send_status(&task, &text).await;
                    }
                }
            }
            Some(status) => {
                // Window changed: replace the old status message entirely.
                self.rate_limit().await;
                let _ = self
                    .transport
                    .delete_message(status.chat_id, status.message_id)
                    .await;
                self.status_msg = None;
                self.send_status(&task, &text).await;
            }
            None => self.send_status(&task, &text).await,
        }
    }

    async fn send_status(&mut self, task: &MessageTask, text: &str) {
        self.rate_limit().await;
        match self
            .transport
            .send_message(task.chat_id, Some(task.topic_id), text)
            .await
        {
            Ok(message_id) => {
                self.status_msg = Some(StatusMsg {
                    message_id,
                    chat_id: task.chat_id,
                    window_id: task.window_id.clone(),
                    last_text: text.to_string(),
                });
            }
            Err(e) => {
                error!(
                    component = "delivery",
                    event = "delivery.status_send_failed",
                    user_id = self.user_id,
                    error = %e,
                    "Failed to send status message"
                );
            }
        }
    }

    async fn clear_status(&mut self) {
        if let Some(status) = self.status_msg.take() {
            self.rate_limit().await;
            let _ = self
                .transport
                .delete_message(status.chat_id, status.message_id)
                .await;
        }
    }

    fn evict_stale_pending(&mut self) {
        self.pending_tools
            .retain(|_, p| p.recorded_at.elapsed() < PENDING_TOOL_MAX_AGE);
    }
}
