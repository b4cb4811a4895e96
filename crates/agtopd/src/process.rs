//! Agent process supervision.
//!
//! Children run the configured agent CLI with stdout/stderr redirected to
//! per-run log files, so they outlive a detaching parent. A supervisor
//! task tails the log file into bounded ring buffers, extracts telemetry
//! from the stream-JSON output, credits it to the run record, and
//! delivers exactly one [`SkillResult`] per invocation.

use crate::registry::RunOptions;
use crate::store::RunStore;
use agtop_core::config::{Config, PermissionMode, RuntimeKind};
use agtop_core::types::SkillCost;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines kept per run in the raw log ring buffer.
const MAX_LOG_LINES: usize = 4000;
/// Structured entries kept per run.
const MAX_ENTRIES: usize = 1000;
/// Poll interval for tailing child log files.
const TAIL_INTERVAL: Duration = Duration::from_millis(150);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// Parent detaching; the child stays alive. Never a failure.
    #[error("disconnected from agent process")]
    Disconnected,
    #[error("run {0} already has an active process")]
    AlreadyRunning(String),
    #[error("no active process for run {0}")]
    NotFound(String),
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Terminal outcome of one skill invocation.
#[derive(Debug, Clone)]
pub struct SkillResult {
    /// Assistant result text (falls back to the stdout tail).
    pub text: String,
    pub error: Option<ProcessError>,
}

impl SkillResult {
    pub fn ok(text: String) -> Self {
        Self { text, error: None }
    }
}

/// Bounded ring buffer of raw output lines.
#[derive(Debug)]
pub struct LogBuffer {
    cap: usize,
    lines: Mutex<VecDeque<String>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(MAX_LOG_LINES)
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_capacity(cap: usize) -> Self {
        Self {
            cap,
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.cap {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn extend<I: IntoIterator<Item = String>>(&self, new_lines: I) {
        for line in new_lines {
            self.push(line);
        }
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// Bounded ring buffer of structured stream entries.
#[derive(Debug)]
pub struct EntryBuffer {
    cap: usize,
    entries: Mutex<VecDeque<Value>>,
}

impl Default for EntryBuffer {
    fn default() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }
}

impl EntryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_capacity(cap: usize) -> Self {
        Self {
            cap,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: Value) {
        let mut entries = self.entries.lock();
        if entries.len() == self.cap {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn tail(&self, n: usize) -> Vec<Value> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Supervision interface the executor and pipeline depend on.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start a child for this run. The returned channel emits exactly one
    /// result, then closes. Fails when the run already has a child.
    async fn start_skill(
        &self,
        run_id: &str,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<oneshot::Receiver<SkillResult>>;

    /// Signal the child to stop (SIGTERM, then SIGKILL after a grace
    /// period).
    async fn stop(&self, run_id: &str) -> Result<()>;

    fn pause(&self, run_id: &str);
    fn resume(&self, run_id: &str);

    fn buffer(&self, run_id: &str) -> Arc<LogBuffer>;
    fn entry_buffer(&self, run_id: &str) -> Arc<EntryBuffer>;

    /// PID of the live child, if any.
    fn pid(&self, run_id: &str) -> Option<u32>;

    /// Attach to a known-live child by PID during rehydration. The
    /// pending result becomes available via [`Self::take_reconnected`].
    async fn reconnect(&self, run_id: &str, pid: u32) -> Result<()>;

    /// Claim the pending result channel of a reconnected child.
    fn take_reconnected(&self, run_id: &str) -> Option<oneshot::Receiver<SkillResult>>;

    /// Stdout/stderr log paths for archival.
    fn log_file_paths(&self, run_id: &str) -> (PathBuf, PathBuf);

    /// Mark the manager as disconnecting: results from here on carry the
    /// disconnect sentinel instead of failures.
    fn set_disconnecting(&self);

    /// Stop watching all children without killing them.
    async fn disconnect_all(&self);
}

#[derive(Debug)]
struct ProcHandle {
    pid: u32,
    detach: CancellationToken,
}

#[derive(Debug, Default)]
struct ManagerState {
    procs: Mutex<HashMap<String, ProcHandle>>,
    buffers: Mutex<HashMap<String, Arc<LogBuffer>>>,
    entries: Mutex<HashMap<String, Arc<EntryBuffer>>>,
    reconnected: Mutex<HashMap<String, oneshot::Receiver<SkillResult>>>,
    disconnecting: AtomicBool,
}

impl ManagerState {
    fn buffer(&self, run_id: &str) -> Arc<LogBuffer> {
        Arc::clone(
            self.buffers
                .lock()
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(LogBuffer::with_capacity(MAX_LOG_LINES))),
        )
    }

    fn entry_buffer(&self, run_id: &str) -> Arc<EntryBuffer> {
        Arc::clone(
            self.entries
                .lock()
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(EntryBuffer::with_capacity(MAX_ENTRIES))),
        )
    }
}

/// Spawns and supervises agent CLI children.
#[derive(Debug)]
pub struct AgentProcessManager {
    store: Arc<RunStore>,
    config: Arc<Config>,
    log_dir: PathBuf,
    state: Arc<ManagerState>,
}

impl AgentProcessManager {
    pub fn new(store: Arc<RunStore>, config: Arc<Config>) -> Self {
        let log_dir = config.project_root().join(".agtop/logs");
        Self {
            store,
            config,
            log_dir,
            state: Arc::new(ManagerState::default()),
        }
    }

    fn paths_for(&self, run_id: &str) -> (PathBuf, PathBuf) {
        let safe = run_id.replace([':', '/'], "_");
        (
            self.log_dir.join(format!("{safe}.stdout.log")),
            self.log_dir.join(format!("{safe}.stderr.log")),
        )
    }
}

/// Build the CLI invocation for one skill run.
pub(crate) fn build_agent_command(opts: &RunOptions, prompt: &str) -> (String, Vec<String>) {
    match opts.runtime {
        RuntimeKind::Claude => {
            let mut args = vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--model".to_string(),
                opts.model.clone(),
            ];
            match opts.permission_mode {
                Some(PermissionMode::AcceptAll) => {
                    args.push("--dangerously-skip-permissions".to_string());
                }
                Some(PermissionMode::AcceptEdits) => {
                    args.push("--permission-mode".to_string());
                    args.push("acceptEdits".to_string());
                }
                Some(PermissionMode::Manual) | None => {}
            }
            if !opts.allowed_tools.is_empty() {
                args.push("--allowedTools".to_string());
                args.push(opts.allowed_tools.join(","));
            }
            if let Some(max_turns) = opts.max_turns {
                args.push("--max-turns".to_string());
                args.push(max_turns.to_string());
            }
            args.push(prompt.to_string());
            ("claude".to_string(), args)
        }
        RuntimeKind::Opencode => {
            let mut args = vec!["run".to_string(), "--model".to_string(), opts.model.clone()];
            if let Some(agent) = &opts.agent {
                args.push("--agent".to_string());
                args.push(agent.clone());
            }
            args.push(prompt.to_string());
            ("opencode".to_string(), args)
        }
    }
}

/// Telemetry and result text accumulated from the stream-JSON output.
#[derive(Debug, Default, Clone)]
struct StreamStats {
    result_text: Option<String>,
    cost: f64,
    tokens_in: u64,
    tokens_out: u64,
}

impl StreamStats {
    fn absorb(&mut self, entry: &Value) {
        if entry.get("type").and_then(Value::as_str) != Some("result") {
            return;
        }
        if let Some(text) = entry.get("result").and_then(Value::as_str) {
            self.result_text = Some(text.to_string());
        }
        if let Some(cost) = entry.get("total_cost_usd").and_then(Value::as_f64) {
            self.cost = cost;
        }
        if let Some(usage) = entry.get("usage") {
            if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                self.tokens_in = input;
            }
            if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                self.tokens_out = output;
            }
        }
    }
}

/// Incremental reader over a growing log file.
struct FileTail {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl FileTail {
    fn new(path: PathBuf, offset: u64) -> Self {
        Self {
            path,
            offset,
            partial: String::new(),
        }
    }

    /// Complete new lines since the last drain.
    fn drain(&mut self) -> Vec<String> {
        let Ok(content) = std::fs::read(&self.path) else {
            return Vec::new();
        };
        if (content.len() as u64) <= self.offset {
            return Vec::new();
        }
        let new = String::from_utf8_lossy(&content[self.offset as usize..]).into_owned();
        self.offset = content.len() as u64;
        self.partial.push_str(&new);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end().to_string());
        }
        lines
    }

    /// Drain remaining lines, including a trailing unterminated one
    /// (used once the child exits).
    fn finish(&mut self) -> Vec<String> {
        let mut lines = self.drain();
        if !self.partial.is_empty() {
            lines.push(std::mem::take(&mut self.partial));
        }
        lines
    }
}

fn signal_pid(pid: u32, signal: Signal) -> bool {
    kill(Pid::from_raw(pid as i32), signal).is_ok()
}

/// Whether a PID is still alive.
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

struct Supervisor {
    state: Arc<ManagerState>,
    store: Arc<RunStore>,
    run_id: String,
    buffer: Arc<LogBuffer>,
    entries: Arc<EntryBuffer>,
    tail: FileTail,
    stats: StreamStats,
    stderr_path: PathBuf,
}

impl Supervisor {
    fn drain_output(&mut self) {
        for line in self.tail.drain() {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<Value>(&line) {
                self.stats.absorb(&entry);
                self.entries.push(entry);
            }
            self.buffer.push(line);
        }
    }

    fn finish_output(&mut self) {
        for line in self.tail.finish() {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<Value>(&line) {
                self.stats.absorb(&entry);
                self.entries.push(entry);
            }
            self.buffer.push(line);
        }
    }

    /// Credit telemetry to the run and build the final result.
    fn conclude(&mut self, exit_code: Option<i32>) -> SkillResult {
        self.finish_output();

        let skill = self
            .store
            .get(&self.run_id)
            .map(|run| run.current_skill)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "skill".to_string());
        let entry = SkillCost {
            skill,
            cost: self.stats.cost,
            tokens: self.stats.tokens_in + self.stats.tokens_out,
            tokens_in: self.stats.tokens_in,
            tokens_out: self.stats.tokens_out,
        };
        if entry.cost > 0.0 || entry.tokens > 0 {
            self.store
                .update(&self.run_id, |run| run.add_skill_cost(entry.clone()));
        }

        let text = self
            .stats
            .result_text
            .clone()
            .unwrap_or_else(|| self.buffer.tail(50).join("\n"));

        let error = match exit_code {
            Some(0) => None,
            Some(code) => {
                let stderr_tail = std::fs::read_to_string(&self.stderr_path)
                    .map(|s| {
                        s.lines()
                            .rev()
                            .take(5)
                            .collect::<Vec<_>>()
                            .into_iter()
                            .rev()
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                Some(ProcessError::Failed(format!(
                    "exit status {code}: {stderr_tail}"
                )))
            }
            None => Some(ProcessError::Failed("killed by signal".to_string())),
        };

        SkillResult { text, error }
    }

    fn remove_handle(&self) {
        self.state.procs.lock().remove(&self.run_id);
    }
}

#[async_trait]
impl ProcessManager for AgentProcessManager {
    async fn start_skill(
        &self,
        run_id: &str,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<oneshot::Receiver<SkillResult>> {
        if self.state.procs.lock().contains_key(run_id) {
            return Err(ProcessError::AlreadyRunning(run_id.to_string()));
        }

        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| ProcessError::NotFound(run_id.to_string()))?;
        let work_dir = if run.worktree.as_os_str().is_empty() {
            self.config.project_root()
        } else {
            run.worktree.clone()
        };

        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;
        let (stdout_path, stderr_path) = self.paths_for(run_id);
        let stdout_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stdout_path)
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;
        let stderr_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;
        let start_offset = stdout_file
            .metadata()
            .map(|m| m.len())
            .unwrap_or_default();

        let (program, args) = build_agent_command(opts, prompt);
        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .current_dir(&work_dir)
            .stdin(std::process::Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file)
            .kill_on_drop(false);
        if run.dev_server_port > 0 {
            cmd.env("PORT", run.dev_server_port.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::Spawn(format!("{program} not found on PATH"))
            } else {
                ProcessError::Spawn(e.to_string())
            }
        })?;
        let pid = child.id().unwrap_or_default();
        info!(run_id, pid, program, model = %opts.model, "agent process started");

        let detach = CancellationToken::new();
        self.state.procs.lock().insert(
            run_id.to_string(),
            ProcHandle {
                pid,
                detach: detach.clone(),
            },
        );

        let (tx, rx) = oneshot::channel();
        let mut supervisor = Supervisor {
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            run_id: run_id.to_string(),
            buffer: self.state.buffer(run_id),
            entries: self.state.entry_buffer(run_id),
            tail: FileTail::new(stdout_path, start_offset),
            stats: StreamStats::default(),
            stderr_path,
        };
        let state = Arc::clone(&self.state);
        let run_id_owned = run_id.to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TAIL_INTERVAL);
            let exit_code = loop {
                tokio::select! {
                    status = child.wait() => {
                        break status.ok().and_then(|s| s.code());
                    }
                    () = detach.cancelled() => {
                        // Parent detaching; the child keeps running.
                        supervisor.drain_output();
                        supervisor.remove_handle();
                        debug!(run_id = %run_id_owned, "supervisor detached");
                        let _ = tx.send(SkillResult {
                            text: String::new(),
                            error: Some(ProcessError::Disconnected),
                        });
                        return;
                    }
                    _ = interval.tick() => {
                        supervisor.drain_output();
                    }
                }
            };

            let mut result = supervisor.conclude(exit_code);
            if state.disconnecting.load(Ordering::SeqCst) {
                result.error = Some(ProcessError::Disconnected);
            }
            supervisor.remove_handle();
            debug!(run_id = %run_id_owned, ?exit_code, "agent process finished");
            let _ = tx.send(result);
        });

        Ok(rx)
    }

    async fn stop(&self, run_id: &str) -> Result<()> {
        let pid = self
            .pid(run_id)
            .ok_or_else(|| ProcessError::NotFound(run_id.to_string()))?;
        if !signal_pid(pid, Signal::SIGTERM) {
            return Ok(());
        }
        // Escalate if the child ignores SIGTERM.
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            if pid_alive(pid) {
                warn!(pid, "child ignored SIGTERM; sending SIGKILL");
                signal_pid(pid, Signal::SIGKILL);
            }
        });
        Ok(())
    }

    fn pause(&self, run_id: &str) {
        if let Some(pid) = self.pid(run_id) {
            signal_pid(pid, Signal::SIGSTOP);
        }
    }

    fn resume(&self, run_id: &str) {
        if let Some(pid) = self.pid(run_id) {
            signal_pid(pid, Signal::SIGCONT);
        }
    }

    fn buffer(&self, run_id: &str) -> Arc<LogBuffer> {
        self.state.buffer(run_id)
    }

    fn entry_buffer(&self, run_id: &str) -> Arc<EntryBuffer> {
        self.state.entry_buffer(run_id)
    }

    fn pid(&self, run_id: &str) -> Option<u32> {
        self.state.procs.lock().get(run_id).map(|h| h.pid)
    }

    async fn reconnect(&self, run_id: &str, pid: u32) -> Result<()> {
        if self.state.procs.lock().contains_key(run_id) {
            return Err(ProcessError::AlreadyRunning(run_id.to_string()));
        }
        if !pid_alive(pid) {
            return Err(ProcessError::NotFound(run_id.to_string()));
        }

        let (stdout_path, stderr_path) = self.paths_for(run_id);
        let buffer = self.state.buffer(run_id);

        // Replay the tail of the existing log before live-tailing.
        let replay_offset = if let Ok(content) = std::fs::read_to_string(&stdout_path) {
            let lines: Vec<&str> = content.lines().collect();
            let skip = lines.len().saturating_sub(MAX_LOG_LINES);
            buffer.extend(lines.into_iter().skip(skip).map(String::from));
            content.len() as u64
        } else {
            0
        };

        let detach = CancellationToken::new();
        self.state.procs.lock().insert(
            run_id.to_string(),
            ProcHandle {
                pid,
                detach: detach.clone(),
            },
        );

        let (tx, rx) = oneshot::channel();
        self.state
            .reconnected
            .lock()
            .insert(run_id.to_string(), rx);

        let mut supervisor = Supervisor {
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            run_id: run_id.to_string(),
            buffer,
            entries: self.state.entry_buffer(run_id),
            tail: FileTail::new(stdout_path, replay_offset),
            stats: StreamStats::default(),
            stderr_path,
        };
        let state = Arc::clone(&self.state);
        let run_id_owned = run_id.to_string();
        info!(run_id, pid, "reconnected to live agent process");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    () = detach.cancelled() => {
                        supervisor.drain_output();
                        supervisor.remove_handle();
                        let _ = tx.send(SkillResult {
                            text: String::new(),
                            error: Some(ProcessError::Disconnected),
                        });
                        return;
                    }
                    _ = interval.tick() => {
                        supervisor.drain_output();
                        if !pid_alive(pid) {
                            // Exit code is unknowable for a re-parented
                            // child; judge success by the stream result.
                            let exit = i32::from(supervisor.stats.result_text.is_none());
                            let mut result = supervisor.conclude(Some(exit));
                            if state.disconnecting.load(Ordering::SeqCst) {
                                result.error = Some(ProcessError::Disconnected);
                            }
                            supervisor.remove_handle();
                            debug!(run_id = %run_id_owned, "reconnected child exited");
                            let _ = tx.send(result);
                            return;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    fn take_reconnected(&self, run_id: &str) -> Option<oneshot::Receiver<SkillResult>> {
        self.state.reconnected.lock().remove(run_id)
    }

    fn log_file_paths(&self, run_id: &str) -> (PathBuf, PathBuf) {
        self.paths_for(run_id)
    }

    fn set_disconnecting(&self) {
        self.state.disconnecting.store(true, Ordering::SeqCst);
    }

    async fn disconnect_all(&self) {
        self.set_disconnecting();
        let tokens: Vec<CancellationToken> = self
            .state
            .procs
            .lock()
            .values()
            .map(|h| h.detach.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
        // Give supervisors a moment to deliver their disconnect results.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while !self.state.procs.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
