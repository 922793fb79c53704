//! ccbot
//!
//! Bridges Telegram forum topics to Claude Code sessions running inside a
//! tmux session. One topic ↔ one window ↔ one agent session; the terminal
//! stays the source of truth while the bridge mirrors the transcript out
//! and forwards topic messages back as keystrokes.

mod commands;
mod config;
mod delivery;
mod hook;
mod hub;
mod logging;
mod monitor;
mod offsets;
mod paths;
mod render;
mod session_map;
mod shell;
mod skills;
mod status;
mod store;
mod telegram;
mod terminal;
mod transcript;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use ccbot_mux::MuxClient;
use ccbot_protocol::{ChatTransport, ContentType, MessageTask, NewMessage};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::commands::CommandRouter;
use crate::config::Config;
use crate::delivery::DeliveryPipeline;
use crate::hub::RouterHub;
use crate::logging::init_logging;
use crate::monitor::SessionMonitor;
use crate::offsets::OffsetStore;
use crate::session_map::SessionMapStore;
use crate::status::StatusPoller;
use crate::telegram::TelegramTransport;

#[derive(Parser)]
#[command(
    name = "ccbot",
    about = "Bridge Telegram forum topics to Claude Code sessions in tmux"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the bridge (default)
    Run,
    /// Consume one SessionStart hook payload from stdin
    Hook {
        /// Install the hook declaration into ~/.claude/settings.json
        #[arg(long)]
        install: bool,
    },
    /// Scan a project's .claude/commands/ and write skills.json
    Sync { project_dir: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Hook { install: true } => {
            paths::init_data_dir(None);
            std::process::exit(hook::install_hook(None)?);
        }
        Command::Hook { install: false } => {
            paths::init_data_dir(None);
            let code = runtime.block_on(hook::run_hook());
            std::process::exit(code);
        }
        Command::Sync { project_dir } => run_sync(&project_dir),
        Command::Run => runtime.block_on(run_bridge()),
    }
}

fn run_sync(project_dir: &std::path::Path) -> anyhow::Result<()> {
    let project_dir = project_dir
        .canonicalize()
        .with_context(|| format!("{} is not a directory", project_dir.display()))?;
    let commands_dir = project_dir.join(".claude").join("commands");
    if !commands_dir.is_dir() {
        anyhow::bail!(
            "{} not found — is this a project with Claude Code commands?",
            commands_dir.display()
        );
    }

    paths::init_data_dir(None);
    paths::ensure_dirs().context("create config directory")?;

    let skills = skills::scan_commands(&project_dir);
    let out_file = paths::skills_path();
    skills::write_skills(&out_file, &skills)?;

    println!("Wrote {} skill commands to {}", skills.len(), out_file.display());
    for (name, skill) in skills.iter().take(5) {
        println!("  /{name} → {}", skill.command);
    }
    if skills.len() > 5 {
        println!("  … and {} more", skills.len() - 5);
    }
    Ok(())
}

async fn run_bridge() -> anyhow::Result<()> {
    paths::init_data_dir(None);
    paths::ensure_dirs().context("config directory is not writable")?;

    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span = tracing::info_span!("ccbot", service = "ccbot", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "bridge",
        event = "bridge.starting",
        run_id = %run_id,
        pid = std::process::id(),
        "Starting ccbot bridge"
    );

    // Fatal startup failures: missing config, unreachable tmux.
    let cfg = Arc::new(Config::load()?);
    let mux = MuxClient::new(&cfg.mux_session);
    mux.ensure_session()
        .await
        .context("cannot bind the tmux session at startup")?;

    let hub = Arc::new(RouterHub::load(&paths::state_path()));
    let live = mux.list_windows().await.unwrap_or_default();
    let (remapped, dropped) = hub.resolve_stale_ids(&live);
    info!(
        component = "bridge",
        event = "bridge.stale_ids_resolved",
        live_windows = live.len(),
        remapped = remapped,
        dropped = dropped,
        "Startup binding reconciliation complete"
    );

    let session_map = Arc::new(SessionMapStore::new(
        paths::session_map_path(),
        cfg.mux_session.clone(),
    ));
    let offsets = Arc::new(Mutex::new(OffsetStore::load(&paths::monitor_state_path())));
    let skills = skills::load_skills(&paths::skills_path());
    if !skills.is_empty() {
        info!(
            component = "bridge",
            event = "bridge.skills_loaded",
            count = skills.len(),
            "Loaded skill aliases"
        );
    }

    let transport: Arc<TelegramTransport> = Arc::new(TelegramTransport::new(&cfg.bot_token)?);
    let chat: Arc<dyn ChatTransport> = transport.clone();
    let pipeline = Arc::new(DeliveryPipeline::new(chat.clone(), cfg.notify.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Transcript monitor → event dispatcher → per-user pipeline.
    let (events_tx, mut events_rx) = mpsc::channel::<NewMessage>(256);
    let monitor = SessionMonitor::new(
        cfg.poll_interval,
        paths::claude_projects_dir(),
        session_map.clone(),
        hub.clone(),
        offsets.clone(),
        events_tx,
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let dispatcher_task = {
        let hub = hub.clone();
        let pipeline = pipeline.clone();
        let offsets = offsets.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            while let Some(msg) = events_rx.recv().await {
                dispatch_event(&msg, &hub, &pipeline, &offsets, &cfg);
            }
        })
    };

    // Pane status polling.
    let poller = StatusPoller::new(
        cfg.status_poll_interval,
        mux.clone(),
        hub.clone(),
        pipeline.clone(),
    );
    let status_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    // Inbound: platform update loop → command router.
    let router = Arc::new(CommandRouter::new(
        cfg.clone(),
        mux.clone(),
        hub.clone(),
        session_map.clone(),
        pipeline.clone(),
        chat.clone(),
        skills,
    ));
    let (updates_tx, mut updates_rx) = mpsc::channel(64);
    let update_loop_task = tokio::spawn(telegram::run_update_loop(
        transport.clone(),
        updates_tx,
        shutdown_rx.clone(),
    ));
    let router_task = {
        let router = router.clone();
        tokio::spawn(async move {
            // Inbound messages are processed in arrival order, one at a time.
            while let Some(update) = updates_rx.recv().await {
                router.handle_update(update).await;
            }
        })
    };

    info!(
        component = "bridge",
        event = "bridge.running",
        "Bridge is running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(
        component = "bridge",
        event = "bridge.shutdown_requested",
        "Shutting down"
    );

    // Producers stop first, then the user workers drain.
    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
    let _ = status_task.await;
    let _ = update_loop_task.await;
    drop(router);
    let _ = router_task.await;
    let _ = dispatcher_task.await;
    pipeline.shutdown().await;

    info!(
        component = "bridge",
        event = "bridge.stopped",
        "Bridge stopped"
    );
    Ok(())
}

/// Route one transcript event to every subscribed (user, topic) pair.
///
/// The notification filter applies here for plain content; tool results and
/// interactive prompts pass through — the delivery worker owns the
/// edit-bypass decision for results.
fn dispatch_event(
    msg: &NewMessage,
    hub: &Arc<RouterHub>,
    pipeline: &Arc<DeliveryPipeline>,
    offsets: &Arc<Mutex<OffsetStore>>,
    cfg: &Arc<Config>,
) {
    let subscribers = hub.find_subscribers(&msg.session_id);
    if subscribers.is_empty() {
        return;
    }

    let deliver = match msg.content_type {
        ContentType::ToolResult | ContentType::ToolError | ContentType::InteractivePrompt => true,
        other => cfg.notify.should_notify(other),
    };
    if !deliver {
        return;
    }

    let current_offset = offsets
        .lock()
        .expect("offset store poisoned")
        .get(&msg.session_id)
        .map(|row| row.last_byte_offset)
        .unwrap_or(0);

    for sub in subscribers {
        let parts = render::build_response_parts(&msg.text, msg.content_type, msg.role);
        pipeline.enqueue_content(
            sub.user_id,
            MessageTask::content(
                sub.window_id.clone(),
                sub.topic_id,
                sub.chat_id,
                parts,
                msg.content_type,
                msg.tool_use_id.clone(),
                Some(msg.text.clone()),
            ),
        );
        // Delivered content marks the transcript read up to the monitor's
        // current position for this user.
        hub.advance_cursor(sub.user_id, &sub.window_id, current_offset);
    }
}
