//! Status polling.
//!
//! A single low-rate loop over every bound window: capture the pane,
//! classify it (interactive prompt / status line / idle), and feed the
//! delivery pipeline. Windows that vanished from the multiplexer are
//! treated as externally killed: the binding is dropped and the user told
//! once in the affected topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ccbot_mux::{MuxClient, MuxError};
use ccbot_protocol::{ContentType, MessageTask};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::delivery::DeliveryPipeline;
use crate::hub::{RouterHub, Subscriber};
use crate::terminal;

pub struct StatusPoller {
    interval: Duration,
    mux: MuxClient,
    hub: Arc<RouterHub>,
    pipeline: Arc<DeliveryPipeline>,
    /// Last delivered interactive-prompt content per window, so a dialog is
    /// relayed once and not on every tick it stays on screen.
    interactive_seen: HashMap<String, String>,
    /// Windows that had a status line on the previous tick.
    had_status: HashMap<String, bool>,
}

impl StatusPoller {
    pub fn new(
        interval: Duration,
        mux: MuxClient,
        hub: Arc<RouterHub>,
        pipeline: Arc<DeliveryPipeline>,
    ) -> Self {
        Self {
            interval,
            mux,
            hub,
            pipeline,
            interactive_seen: HashMap::new(),
            had_status: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            component = "status",
            event = "status.poller_started",
            interval_ms = self.interval.as_millis() as u64,
            "Status poller started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(
            component = "status",
            event = "status.poller_stopped",
            "Status poller stopped"
        );
    }

    async fn tick(&mut self) {
        for row in self.hub.bound_windows() {
            self.poll_window(&row).await;
        }
    }

    async fn poll_window(&mut self, row: &Subscriber) {
        let pane = match self.mux.capture_pane(&row.window_id, false).await {
            Ok(pane) => pane,
            Err(MuxError::WindowNotFound(_)) => {
                self.handle_window_gone(row).await;
                return;
            }
            Err(e) => {
                // Transient capture failure: keep whatever status is showing.
                debug!(
                    component = "status",
                    event = "status.capture_failed",
                    window_id = %row.window_id,
                    error = %e,
                    "Pane capture failed, skipping window this tick"
                );
                return;
            }
        };

        if let Some(prompt) = terminal::extract_interactive_content(&pane) {
            // Interactive dialog on screen: suppress status updates and
            // relay the dialog content once.
            if self.interactive_seen.get(&row.window_id) != Some(&prompt.content) {
                self.interactive_seen
                    .insert(row.window_id.clone(), prompt.content.clone());
                self.pipeline.enqueue_status_clear(
                    row.user_id,
                    &row.window_id,
                    row.topic_id,
                    row.chat_id,
                );
                self.pipeline.enqueue_content(
                    row.user_id,
                    MessageTask::content(
                        row.window_id.clone(),
                        row.topic_id,
                        row.chat_id,
                        vec![format!("⚠ {}\n\n{}", prompt.name, prompt.content)],
                        ContentType::InteractivePrompt,
                        None,
                        None,
                    ),
                );
            }
            self.had_status.remove(&row.window_id);
            return;
        }
        self.interactive_seen.remove(&row.window_id);

        match terminal::parse_status_line(&pane) {
            Some(status) => {
                self.pipeline.enqueue_status_update(
                    row.user_id,
                    MessageTask::status_update(
                        row.window_id.clone(),
                        row.topic_id,
                        row.chat_id,
                        status,
                    ),
                );
                self.had_status.insert(row.window_id.clone(), true);
            }
            None => {
                if self.had_status.remove(&row.window_id).is_some() {
                    self.pipeline.enqueue_status_clear(
                        row.user_id,
                        &row.window_id,
                        row.topic_id,
                        row.chat_id,
                    );
                }
            }
        }
    }

    /// The window died outside the bridge: unbind and tell the user once.
    async fn handle_window_gone(&mut self, row: &Subscriber) {
        warn!(
            component = "status",
            event = "status.window_vanished",
            user_id = row.user_id,
            topic_id = row.topic_id,
            window_id = %row.window_id,
            "Bound window no longer exists, unbinding"
        );

        self.hub.unbind(row.user_id, row.topic_id);
        self.hub.remove_window(&row.window_id);
        self.pipeline.flush_window(row.user_id, &row.window_id);
        self.interactive_seen.remove(&row.window_id);
        self.had_status.remove(&row.window_id);

        self.pipeline.enqueue_content(
            row.user_id,
            MessageTask::content(
                row.window_id.clone(),
                row.topic_id,
                row.chat_id,
                vec![
                    "❌ The terminal window for this topic no longer exists; the topic has been unbound.".to_string(),
                ],
                ContentType::Text,
                None,
                None,
            ),
        );
    }
}
