//! Transcript monitor.
//!
//! One cooperative loop at the configured poll interval. Each tick
//! reconciles the hook-written session map against the tracked set, tails
//! every tracked transcript from its persisted byte offset, emits typed
//! events for complete lines, and flushes dirty offsets.
//!
//! Offsets only move forward, with one exception: a transcript shorter than
//! its recorded offset was truncated and is re-read from 0. A trailing line
//! with no `\n` is never consumed; the next tick picks it up whole.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ccbot_protocol::NewMessage;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::hub::RouterHub;
use crate::offsets::OffsetStore;
use crate::session_map::{SessionMapEntry, SessionMapStore};
use crate::transcript;

pub struct SessionMonitor {
    poll_interval: std::time::Duration,
    projects_dir: PathBuf,
    session_map: Arc<SessionMapStore>,
    hub: Arc<RouterHub>,
    offsets: Arc<Mutex<OffsetStore>>,
    events_tx: mpsc::Sender<NewMessage>,
    /// window_id → session_id from the previous reconcile, for rotation detection
    window_sessions: HashMap<String, String>,
    /// mtime observed at the last poll, per session
    mtimes: HashMap<String, SystemTime>,
    /// Sessions found on the very first reconcile pre-existed this bridge
    /// process and start at end-of-file (startup catch-up policy).
    first_pass: bool,
}

impl SessionMonitor {
    pub fn new(
        poll_interval: std::time::Duration,
        projects_dir: PathBuf,
        session_map: Arc<SessionMapStore>,
        hub: Arc<RouterHub>,
        offsets: Arc<Mutex<OffsetStore>>,
        events_tx: mpsc::Sender<NewMessage>,
    ) -> Self {
        Self {
            poll_interval,
            projects_dir,
            session_map,
            hub,
            offsets,
            events_tx,
            window_sessions: HashMap::new(),
            mtimes: HashMap::new(),
            first_pass: true,
        }
    }

    /// Run until shutdown is signalled, then flush offsets one last time.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            component = "monitor",
            event = "monitor.started",
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Transcript monitor started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        self.offsets.lock().expect("offset store poisoned").flush_if_dirty();
        info!(
            component = "monitor",
            event = "monitor.stopped",
            "Transcript monitor stopped"
        );
    }

    /// One poll cycle. Public for tests.
    pub async fn tick(&mut self) {
        self.reconcile();

        let session_ids = self
            .offsets
            .lock()
            .expect("offset store poisoned")
            .session_ids();
        for session_id in session_ids {
            if let Err(e) = self.poll_session(&session_id).await {
                warn!(
                    component = "monitor",
                    event = "monitor.poll_failed",
                    session_id = %session_id,
                    error = %e,
                    "Transcript poll failed, will retry next tick"
                );
            }
        }

        self.offsets.lock().expect("offset store poisoned").flush_if_dirty();
    }

    /// Diff the session map against the tracked set.
    fn reconcile(&mut self) {
        let view = self.session_map.load();
        self.hub.apply_session_map(&view);

        for (window_id, entry) in &view {
            let session_id = entry.session_id.clone();
            let previous = self.window_sessions.get(window_id).cloned();
            match previous {
                Some(previous) if previous != session_id => {
                    // Rotation (e.g. /clear): drop the old row before the new
                    // session is tracked, and never retro-deliver its backlog.
                    info!(
                        component = "monitor",
                        event = "monitor.session_rotated",
                        window_id = %window_id,
                        old_session_id = %previous,
                        new_session_id = %session_id,
                        "Session rotated for window"
                    );
                    self.drop_session(&previous);
                    self.track(&session_id, entry, TrackFrom::EndOfFile);
                }
                Some(_) => {
                    // Unchanged; re-track only if the offset row vanished.
                    if !self
                        .offsets
                        .lock()
                        .expect("offset store poisoned")
                        .contains(&session_id)
                    {
                        self.track(&session_id, entry, TrackFrom::EndOfFile);
                    }
                }
                None => {
                    let already_tracked = self
                        .offsets
                        .lock()
                        .expect("offset store poisoned")
                        .contains(&session_id);
                    if already_tracked {
                        // Persisted row from a previous run: resume in place.
                        debug!(
                            component = "monitor",
                            event = "monitor.session_resumed",
                            window_id = %window_id,
                            session_id = %session_id,
                            "Resuming tracked session from persisted offset"
                        );
                    } else if self.first_pass {
                        self.track(&session_id, entry, TrackFrom::EndOfFile);
                    } else {
                        self.track(&session_id, entry, TrackFrom::Start);
                    }
                }
            }
            self.window_sessions
                .insert(window_id.clone(), session_id);
        }

        let gone: Vec<(String, String)> = self
            .window_sessions
            .iter()
            .filter(|(w, _)| !view.contains_key(*w))
            .map(|(w, s)| (w.clone(), s.clone()))
            .collect();
        for (window_id, session_id) in gone {
            info!(
                component = "monitor",
                event = "monitor.session_dropped",
                window_id = %window_id,
                session_id = %session_id,
                "Session map entry disappeared, dropping session"
            );
            self.drop_session(&session_id);
            self.window_sessions.remove(&window_id);
        }

        self.first_pass = false;
    }

    fn drop_session(&mut self, session_id: &str) {
        self.offsets
            .lock()
            .expect("offset store poisoned")
            .remove(session_id);
        self.mtimes.remove(session_id);
    }

    fn track(&mut self, session_id: &str, entry: &SessionMapEntry, from: TrackFrom) {
        let path = resolve_transcript_path(&self.projects_dir, session_id, &entry.cwd);
        let offset = match from {
            TrackFrom::Start => 0,
            TrackFrom::EndOfFile => std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
        };
        info!(
            component = "monitor",
            event = "monitor.session_tracked",
            session_id = %session_id,
            path = %path.display(),
            offset = offset,
            "Tracking session transcript"
        );
        self.offsets
            .lock()
            .expect("offset store poisoned")
            .track(session_id, path, offset);
    }

    /// Tail one transcript. Transient I/O failures abort this session only;
    /// the offset is untouched so the next tick retries the same bytes.
    async fn poll_session(&mut self, session_id: &str) -> anyhow::Result<()> {
        let (path, mut offset) = {
            let offsets = self.offsets.lock().expect("offset store poisoned");
            let Some(row) = offsets.get(session_id) else {
                return Ok(());
            };
            (row.file_path.clone(), row.last_byte_offset)
        };

        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    component = "monitor",
                    event = "monitor.transcript_missing",
                    session_id = %session_id,
                    path = %path.display(),
                    "Transcript not on disk yet"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mtime = metadata.modified().ok();
        if let (Some(m), Some(prev)) = (mtime, self.mtimes.get(session_id)) {
            if m == *prev {
                return Ok(());
            }
        }

        let size = metadata.len();
        if offset > size {
            warn!(
                component = "monitor",
                event = "monitor.transcript_truncated",
                session_id = %session_id,
                offset = offset,
                size = size,
                "Transcript shrank below offset, resetting to 0"
            );
            offset = 0;
            self.offsets
                .lock()
                .expect("offset store poisoned")
                .set_offset(session_id, 0);
        }

        if size == offset {
            if let Some(m) = mtime {
                self.mtimes.insert(session_id.to_string(), m);
            }
            return Ok(());
        }

        let chunk = read_chunk(&path, offset)?;
        let Some(last_newline) = chunk.iter().rposition(|&b| b == b'\n') else {
            // Partial trailing line only; leave the offset alone.
            return Ok(());
        };
        let consumed = last_newline + 1;

        for raw_line in chunk[..consumed].split(|&b| b == b'\n') {
            if raw_line.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(raw_line);
            match transcript::parse_line(&line) {
                Some(entries) => {
                    for entry in entries {
                        let msg = NewMessage {
                            session_id: session_id.to_string(),
                            content_type: entry.content_type,
                            role: entry.role,
                            text: entry.text,
                            is_complete: true,
                            tool_use_id: entry.tool_use_id,
                            tool_name: entry.tool_name,
                        };
                        if self.events_tx.send(msg).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                None => {
                    // Corrupt line: never retried, offset advances past it.
                    warn!(
                        component = "monitor",
                        event = "monitor.line_parse_failed",
                        session_id = %session_id,
                        line_len = raw_line.len(),
                        "Skipping malformed transcript line"
                    );
                }
            }
        }

        self.offsets
            .lock()
            .expect("offset store poisoned")
            .set_offset(session_id, offset + consumed as u64);
        if let Some(m) = mtime {
            self.mtimes.insert(session_id.to_string(), m);
        }
        Ok(())
    }
}

enum TrackFrom {
    Start,
    EndOfFile,
}

/// `/data/code/proj` → `<projects>/-data-code-proj/<sid>.jsonl`, with a scan
/// fallback when the encoded directory is not where the transcript lives.
pub(crate) fn resolve_transcript_path(projects_dir: &Path, session_id: &str, cwd: &str) -> PathBuf {
    let encoded = cwd.replace('/', "-");
    let direct = projects_dir.join(encoded).join(format!("{session_id}.jsonl"));
    if direct.exists() {
        return direct;
    }

    let file_name = format!("{session_id}.jsonl");
    if let Ok(entries) = std::fs::read_dir(projects_dir) {
        for entry in entries.flatten() {
            let candidate = entry.path().join(&file_name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    direct
}

fn read_chunk(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file: File = OpenOptions::new().read(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_map;
    use ccbot_protocol::ContentType;
    use serde_json::json;
    use std::io::Write;

    struct Fixture {
        dir: PathBuf,
        monitor: SessionMonitor,
        events_rx: mpsc::Receiver<NewMessage>,
        offsets: Arc<Mutex<OffsetStore>>,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "ccbot-monitor-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("projects")).unwrap();

        let session_map = Arc::new(SessionMapStore::new(dir.join("session_map.json"), "ccbot"));
        let hub = Arc::new(RouterHub::load(&dir.join("state.json")));
        let offsets = Arc::new(Mutex::new(OffsetStore::load(&dir.join("monitor_state.json"))));
        let (events_tx, events_rx) = mpsc::channel(256);

        let monitor = SessionMonitor::new(
            std::time::Duration::from_secs(2),
            dir.join("projects"),
            session_map,
            hub,
            offsets.clone(),
            events_tx,
        );

        Fixture {
            dir,
            monitor,
            events_rx,
            offsets,
        }
    }

    impl Fixture {
        fn transcript_path(&self, cwd: &str, sid: &str) -> PathBuf {
            let encoded = cwd.replace('/', "-");
            let dir = self.dir.join("projects").join(encoded);
            std::fs::create_dir_all(&dir).unwrap();
            dir.join(format!("{sid}.jsonl"))
        }

        fn map_entry(&self, window_id: &str, sid: &str, cwd: &str) {
            session_map::write_entry(
                &self.dir.join("session_map.json"),
                "ccbot",
                window_id,
                session_map::SessionMapEntry {
                    session_id: sid.to_string(),
                    cwd: cwd.to_string(),
                    window_name: "proj".to_string(),
                },
            )
            .unwrap();
        }

        fn drain(&mut self) -> Vec<NewMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.events_rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn assistant_line(text: &str) -> String {
        json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    #[tokio::test]
    async fn first_pass_starts_at_end_of_file() {
        let mut fx = fixture("catchup");
        let path = fx.transcript_path("/tmp/proj", "sid-a");
        std::fs::write(&path, format!("{}\n", assistant_line("old backlog"))).unwrap();
        fx.map_entry("@3", "sid-a", "/tmp/proj");

        fx.monitor.tick().await;
        assert!(fx.drain().is_empty(), "startup must not retro-deliver");

        // new content after startup flows through
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", assistant_line("fresh")).unwrap();
        drop(f);

        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "fresh");
        assert_eq!(events[0].content_type, ContentType::Text);
        assert_eq!(events[0].session_id, "sid-a");
        fx.cleanup();
    }

    #[tokio::test]
    async fn session_appearing_mid_run_delivers_from_start() {
        let mut fx = fixture("fresh");
        fx.monitor.tick().await; // consume the first pass with an empty map

        let path = fx.transcript_path("/tmp/proj", "sid-b");
        std::fs::write(&path, format!("{}\n", assistant_line("hello"))).unwrap();
        fx.map_entry("@4", "sid-b", "/tmp/proj");

        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "hello");
        fx.cleanup();
    }

    #[tokio::test]
    async fn restart_does_not_redeliver() {
        let mut fx = fixture("restart");
        fx.monitor.tick().await;

        let path = fx.transcript_path("/tmp/proj", "sid-c");
        std::fs::write(&path, format!("{}\n", assistant_line("once"))).unwrap();
        fx.map_entry("@5", "sid-c", "/tmp/proj");

        fx.monitor.tick().await;
        assert_eq!(fx.drain().len(), 1);
        fx.offsets.lock().unwrap().flush_if_dirty();

        // a second monitor over the same persisted offsets sees nothing new
        let session_map = Arc::new(SessionMapStore::new(
            fx.dir.join("session_map.json"),
            "ccbot",
        ));
        let hub = Arc::new(RouterHub::load(&fx.dir.join("state2.json")));
        let offsets = Arc::new(Mutex::new(OffsetStore::load(
            &fx.dir.join("monitor_state.json"),
        )));
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let mut second = SessionMonitor::new(
            std::time::Duration::from_secs(2),
            fx.dir.join("projects"),
            session_map,
            hub,
            offsets,
            events_tx,
        );
        second.tick().await;
        assert!(events_rx.try_recv().is_err(), "restart must not replay");
        fx.cleanup();
    }

    #[tokio::test]
    async fn rotation_drops_old_row_and_starts_at_eof() {
        let mut fx = fixture("rotation");
        fx.monitor.tick().await;

        let path_a = fx.transcript_path("/tmp/proj", "sid-old");
        std::fs::write(&path_a, format!("{}\n", assistant_line("from A"))).unwrap();
        fx.map_entry("@5", "sid-old", "/tmp/proj");
        fx.monitor.tick().await;
        assert_eq!(fx.drain().len(), 1);

        // /clear: same window, new session id with pre-existing content
        let path_b = fx.transcript_path("/tmp/proj", "sid-new");
        std::fs::write(&path_b, format!("{}\n", assistant_line("preamble"))).unwrap();
        fx.map_entry("@5", "sid-new", "/tmp/proj");

        fx.monitor.tick().await;
        assert!(fx.drain().is_empty(), "rotation must not retro-deliver");
        {
            let offsets = fx.offsets.lock().unwrap();
            assert!(!offsets.contains("sid-old"), "old offset row deleted");
            assert!(offsets.contains("sid-new"));
        }

        let mut f = OpenOptions::new().append(true).open(&path_b).unwrap();
        writeln!(f, "{}", assistant_line("after clear")).unwrap();
        drop(f);
        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "after clear");
        fx.cleanup();
    }

    #[tokio::test]
    async fn truncation_resets_offset_to_zero() {
        let mut fx = fixture("truncate");
        fx.monitor.tick().await;

        let path = fx.transcript_path("/tmp/proj", "sid-t");
        std::fs::write(&path, format!("{}\n", assistant_line("long original content"))).unwrap();
        fx.map_entry("@6", "sid-t", "/tmp/proj");
        fx.monitor.tick().await;
        assert_eq!(fx.drain().len(), 1);

        // file replaced by something shorter
        std::fs::write(&path, format!("{}\n", assistant_line("tiny"))).unwrap();
        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "tiny");

        let offsets = fx.offsets.lock().unwrap();
        let row = offsets.get("sid-t").unwrap();
        assert_eq!(row.last_byte_offset, std::fs::metadata(&path).unwrap().len());
        fx.cleanup();
    }

    #[tokio::test]
    async fn partial_trailing_line_is_not_consumed() {
        let mut fx = fixture("partial");
        fx.monitor.tick().await;

        let path = fx.transcript_path("/tmp/proj", "sid-p");
        let full = assistant_line("complete");
        let partial = assistant_line("not yet");
        std::fs::write(&path, format!("{full}\n{}", &partial[..20])).unwrap();
        fx.map_entry("@7", "sid-p", "/tmp/proj");

        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "complete");

        let recorded = fx
            .offsets
            .lock()
            .unwrap()
            .get("sid-p")
            .unwrap()
            .last_byte_offset;
        assert_eq!(recorded as usize, full.len() + 1);

        // finishing the line delivers it
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{}\n", &partial[20..]).unwrap();
        drop(f);
        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "not yet");
        fx.cleanup();
    }

    #[tokio::test]
    async fn malformed_line_skipped_but_offset_advances() {
        let mut fx = fixture("malformed");
        fx.monitor.tick().await;

        let path = fx.transcript_path("/tmp/proj", "sid-m");
        std::fs::write(
            &path,
            format!("{{broken json\n{}\n", assistant_line("good")),
        )
        .unwrap();
        fx.map_entry("@8", "sid-m", "/tmp/proj");

        fx.monitor.tick().await;
        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "good");

        let recorded = fx
            .offsets
            .lock()
            .unwrap()
            .get("sid-m")
            .unwrap()
            .last_byte_offset;
        assert_eq!(recorded, std::fs::metadata(&path).unwrap().len());

        // the corrupt line is never retried
        fx.monitor.tick().await;
        assert!(fx.drain().is_empty());
        fx.cleanup();
    }

    #[tokio::test]
    async fn disappeared_entry_drops_tracked_session() {
        let mut fx = fixture("gone");
        fx.monitor.tick().await;

        let path = fx.transcript_path("/tmp/proj", "sid-g");
        std::fs::write(&path, format!("{}\n", assistant_line("hi"))).unwrap();
        fx.map_entry("@9", "sid-g", "/tmp/proj");
        fx.monitor.tick().await;
        fx.drain();
        assert!(fx.offsets.lock().unwrap().contains("sid-g"));

        // wipe the map: entry disappeared
        std::fs::write(fx.dir.join("session_map.json"), "{}\n").unwrap();
        fx.monitor.tick().await;
        assert!(!fx.offsets.lock().unwrap().contains("sid-g"));
        fx.cleanup();
    }
}
