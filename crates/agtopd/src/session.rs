//! Session persistence and restart-time rehydration.
//!
//! One JSON file per run under `<projectRoot>/.agtop/sessions/`, written
//! on every (debounced) store change and once more on graceful shutdown.
//! At startup, sessions with a still-live agent PID are reconnected;
//! stale sessions replay their log tail and, if they claimed a live
//! child, fail with "host terminated".

use crate::process::{pid_alive, ProcessManager};
use crate::store::RunStore;
use agtop_core::config::Config;
use agtop_core::types::{Run, RunState, SkillCost, SubWorktree};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Most recent log lines captured in each session file.
const LOG_TAIL_LIMIT: usize = 1000;
/// Debounce window for change-driven saves.
const AUTOSAVE_DEBOUNCE: Duration = Duration::from_millis(500);
/// How often the PID watcher probes previously-live children.
const PID_WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad session file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// On-disk shape of one run's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub branch: String,
    pub worktree: PathBuf,
    pub workflow: String,
    pub state: RunState,
    pub merge_status: String,
    pub prompt: String,
    pub original_prompt: String,
    pub skill_index: usize,
    pub skill_total: usize,
    pub tokens: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub skill_costs: Vec<SkillCost>,
    pub pr_url: String,
    pub pr_urls: BTreeMap<String, String>,
    pub sub_worktrees: Vec<SubWorktree>,
    pub pid: Option<u32>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub log_tail: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: String,
    pub task_id: Option<String>,
    pub dev_server_port: u16,
    pub dev_server_url: String,
    pub follow_up_prompts: Vec<String>,
}

impl Session {
    fn from_run(
        run: &Run,
        pid: Option<u32>,
        stdout_log: PathBuf,
        stderr_log: PathBuf,
        log_tail: Vec<String>,
    ) -> Self {
        Self {
            id: run.id.clone(),
            branch: run.branch.clone(),
            worktree: run.worktree.clone(),
            workflow: run.workflow.clone(),
            state: run.state,
            merge_status: run.merge_status.clone(),
            prompt: run.prompt.clone(),
            original_prompt: run.original_prompt.clone(),
            skill_index: run.skill_index,
            skill_total: run.skill_total,
            tokens: run.tokens,
            tokens_in: run.tokens_in,
            tokens_out: run.tokens_out,
            cost: run.cost,
            skill_costs: run.skill_costs.clone(),
            pr_url: run.pr_url.clone(),
            pr_urls: run.pr_urls.clone(),
            sub_worktrees: run.sub_worktrees.clone(),
            pid,
            stdout_log,
            stderr_log,
            log_tail,
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
            error: run.error.clone(),
            task_id: run.task_id.clone(),
            dev_server_port: run.dev_server_port,
            dev_server_url: run.dev_server_url.clone(),
            follow_up_prompts: run.follow_up_prompts.clone(),
        }
    }

    fn into_run(self) -> Run {
        Run {
            id: self.id,
            prompt: self.prompt,
            original_prompt: self.original_prompt,
            workflow: self.workflow,
            task_id: self.task_id,
            follow_up_prompts: self.follow_up_prompts,
            branch: self.branch,
            worktree: self.worktree,
            sub_worktrees: self.sub_worktrees,
            state: self.state,
            skill_index: self.skill_index,
            skill_total: self.skill_total,
            merge_status: self.merge_status,
            error: self.error,
            pr_url: self.pr_url,
            pr_urls: self.pr_urls,
            tokens: self.tokens,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            cost: self.cost,
            skill_costs: self.skill_costs,
            dev_server_port: self.dev_server_port,
            dev_server_url: self.dev_server_url,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            ..Run::default()
        }
    }
}

/// Whether the process owning `pid` looks like an agent runtime child.
fn process_matches_agent(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/comm")) {
        Ok(comm) => {
            let comm = comm.trim();
            // The claude CLI runs under node; opencode ships a binary.
            comm.contains("claude") || comm.contains("opencode") || comm.contains("node")
        }
        Err(_) => false,
    }
}

/// Owns the on-disk session plane.
pub struct SessionStore {
    dir: PathBuf,
    store: Arc<RunStore>,
    manager: Arc<dyn ProcessManager>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(config: &Config, store: Arc<RunStore>, manager: Arc<dyn ProcessManager>) -> Self {
        Self {
            dir: config.project_root().join(".agtop/sessions"),
            store,
            manager,
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Persist every run. Temporary composite sub-task records (ids with
    /// `:`) never hit disk.
    pub fn save_all(&self) -> Result<()> {
        for run in self.store.list() {
            if run.id.contains(':') {
                continue;
            }
            self.save_run(&run)?;
        }
        Ok(())
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let (stdout_log, stderr_log) = self.manager.log_file_paths(&run.id);
        let session = Session::from_run(
            run,
            self.manager.pid(&run.id),
            stdout_log,
            stderr_log,
            self.manager.buffer(&run.id).tail(LOG_TAIL_LIMIT),
        );
        let json = serde_json::to_vec_pretty(&session).map_err(|e| SessionError::Corrupt {
            path: self.path_for(&run.id),
            message: e.to_string(),
        })?;

        // Write-then-rename so a crash never leaves a torn file.
        let path = self.path_for(&run.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Final write on graceful shutdown, while the manager still knows
    /// every live PID.
    pub fn final_save(&self) -> Result<()> {
        self.save_all()
    }

    /// Delete a run's session file and log files.
    pub fn remove(&self, run_id: &str) {
        let _ = std::fs::remove_file(self.path_for(run_id));
        let (stdout_log, stderr_log) = self.manager.log_file_paths(run_id);
        let _ = std::fs::remove_file(stdout_log);
        let _ = std::fs::remove_file(stderr_log);
    }

    /// Save on every store change, debounced. Cancelling the token
    /// triggers one last save.
    pub fn spawn_autosaver(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut changes = this.store.changes();
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        tokio::time::sleep(AUTOSAVE_DEBOUNCE).await;
                        // Coalesce everything that arrived in the window.
                        changes.borrow_and_update();
                        if let Err(e) = this.save_all() {
                            warn!(error = %e, "session autosave failed");
                        }
                    }
                    () = token.cancelled() => {
                        if let Err(e) = this.save_all() {
                            warn!(error = %e, "final session save failed");
                        }
                        return;
                    }
                }
            }
        })
    }

    /// Rebuild the store from session files. Returns the ids whose live
    /// children were successfully reconnected, so the front-end can
    /// resume their workflows.
    pub async fn rehydrate(&self, watcher_token: &CancellationToken) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reconnected = Vec::new();
        let mut watched = Vec::new();
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let session: Session = match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
            {
                Ok(session) => session,
                Err(message) => {
                    warn!(path = %path.display(), %message, "skipping corrupt session file");
                    continue;
                }
            };

            let pid = session.pid;
            let log_tail = session.log_tail.clone();
            let mut run = session.into_run();
            let was_live = pid.is_some() && run.state.is_active();

            let mut attached = false;
            if let Some(pid) = pid {
                if run.state.is_active() && pid_alive(pid) && process_matches_agent(pid) {
                    match self.manager.reconnect(&run.id, pid).await {
                        Ok(()) => {
                            attached = true;
                            watched.push((run.id.clone(), pid));
                            info!(run_id = %run.id, pid, "reattached to live agent");
                        }
                        Err(e) => {
                            warn!(run_id = %run.id, pid, error = %e, "reconnect failed");
                        }
                    }
                }
            }

            if !attached {
                // Replay the stored tail so the UI has history.
                self.manager.buffer(&run.id).extend(log_tail);
                if was_live {
                    run.state = RunState::Failed;
                    run.error = "host terminated".to_string();
                    run.completed_at = Some(Utc::now());
                }
            } else {
                reconnected.push(run.id.clone());
            }

            self.store.add(run);
        }

        if !watched.is_empty() {
            self.spawn_pid_watcher(watched, watcher_token.clone());
        }
        Ok(reconnected)
    }

    /// Fail runs whose previously-live child disappears. A watch is
    /// dropped once the executor starts a fresh child for the run.
    fn spawn_pid_watcher(&self, watched: Vec<(String, u32)>, token: CancellationToken) {
        let store = Arc::clone(&self.store);
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            let mut watched = watched;
            let mut interval = tokio::time::interval(PID_WATCH_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                watched.retain(|(run_id, pid)| {
                    match manager.pid(run_id) {
                        // A different child took over; the executor owns
                        // this run again.
                        Some(current) if current != *pid => false,
                        Some(_) => true,
                        None => {
                            if pid_alive(*pid) {
                                true
                            } else {
                                store.update(run_id, |run| {
                                    if run.state.is_active() {
                                        run.state = RunState::Failed;
                                        run.error = "agent process exited".to_string();
                                        run.completed_at = Some(Utc::now());
                                    }
                                });
                                false
                            }
                        }
                    }
                });
                if watched.is_empty() {
                    return;
                }
            }
        });
    }
}
