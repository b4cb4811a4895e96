//! Workflow execution.
//!
//! One worker task per run drives the resolved skill sequence: pause
//! waits, route and decompose side-effects, best-effort auto-commits,
//! rate-limit retries, and graceful cancellation. While the process-wide
//! shutdown flag is set, workers that observe cancellation leave the run
//! untouched so a later start can rehydrate it.

use crate::process::{ProcessError, ProcessManager, SkillResult};
use crate::registry::{RunOptions, SkillRegistry};
use crate::store::RunStore;
use agtop_core::config::Config;
use agtop_core::prompt::{build_minimal_prompt, build_prompt, PromptContext};
use agtop_core::skills::Skill;
use agtop_core::types::{Run, RunState};
use agtop_core::workflow::{
    parse_decompose_result, parse_review_result, parse_route_result, resolve_workflow,
    DecomposeResult, DecomposeTask, WorkflowError, BUILD_SKILL, COMMIT_SKILL, DECOMPOSE_SKILL,
    QUICK_FIX_WORKFLOW, REVIEW_SKILL, ROUTE_SKILL,
};
use agtop_core::LimitChecker;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded wait for workers to drain on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("run {id} is {state}; expected {expected}")]
    WrongState {
        id: String,
        state: RunState,
        expected: &'static str,
    },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Outcome of one skill invocation inside a worker.
#[derive(Debug)]
enum SkillRunError {
    /// Parent detaching; child alive. Leave the run untouched.
    Disconnected,
    /// Worker context cancelled.
    Cancelled,
    Failed(String),
}

/// Expanded prompt after ticket lookup.
#[derive(Debug, Clone)]
pub struct ExpandedPrompt {
    pub prompt: String,
    pub task_id: Option<String>,
}

/// Ticket-tracker seam: expands a prompt that references a ticket key.
/// Returns `None` when the prompt has no ticket reference.
#[async_trait]
pub trait TaskExpander: Send + Sync {
    async fn expand(&self, prompt: &str) -> Option<ExpandedPrompt>;
}

#[derive(Debug)]
struct WorkerHandle {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

/// Drives workflows against runs; one spawned worker per active run.
pub struct Executor {
    store: Arc<RunStore>,
    registry: Arc<SkillRegistry>,
    manager: Arc<dyn ProcessManager>,
    config: Arc<Config>,
    limits: LimitChecker,
    expander: Option<Arc<dyn TaskExpander>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workers", &self.workers.lock().len())
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        store: Arc<RunStore>,
        registry: Arc<SkillRegistry>,
        manager: Arc<dyn ProcessManager>,
        config: Arc<Config>,
        expander: Option<Arc<dyn TaskExpander>>,
    ) -> Arc<Self> {
        let limits = LimitChecker::new(&config.limits);
        Arc::new(Self {
            store,
            registry,
            manager,
            config,
            limits,
            expander,
            workers: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn workflow_names(&self) -> Vec<String> {
        self.config.workflows.keys().cloned().collect()
    }

    /// Start executing a workflow against a run.
    pub async fn execute(self: &Arc<Self>, run_id: &str, workflow: &str, prompt: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        drop(run);

        let mut prompt = prompt.to_string();
        let mut task_id = None;
        if let Some(expander) = &self.expander {
            if let Some(expanded) = expander.expand(&prompt).await {
                task_id = expanded.task_id;
                prompt = expanded.prompt;
            }
        }

        if workflow == QUICK_FIX_WORKFLOW {
            self.store.update(run_id, |run| {
                run.prompt = prompt.clone();
                if run.original_prompt.is_empty() {
                    run.original_prompt = prompt.clone();
                }
                run.task_id = task_id.clone();
                run.workflow = QUICK_FIX_WORKFLOW.to_string();
                run.skill_total = 1;
                run.state = RunState::Running;
                run.started_at = Some(Utc::now());
                run.error.clear();
            });
            let task = prompt;
            self.spawn_worker(run_id, move |this, id, token| async move {
                this.single_build_worker(id, task, token).await;
            });
            return Ok(());
        }

        let skills = match resolve_workflow(&self.config, workflow) {
            Ok(skills) => skills,
            Err(e) => {
                self.fail_run(run_id, e.to_string());
                return Err(e.into());
            }
        };

        self.store.update(run_id, |run| {
            run.prompt = prompt.clone();
            if run.original_prompt.is_empty() {
                run.original_prompt = prompt.clone();
            }
            run.task_id = task_id.clone();
            run.workflow = workflow.to_string();
            run.skill_total = skills.len();
            run.skill_index = 0;
            run.state = RunState::Running;
            run.started_at = Some(Utc::now());
            run.error.clear();
            run.completed_at = None;
        });
        info!(run_id, workflow, skills = skills.len(), "executing workflow");

        self.spawn_worker(run_id, move |this, id, token| async move {
            this.workflow_loop(id, skills, 0, String::new(), token).await;
        });
        Ok(())
    }

    /// Resume a failed or paused run from its last incomplete skill.
    pub fn resume(self: &Arc<Self>, run_id: &str, prompt: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        if !matches!(run.state, RunState::Failed | RunState::Paused) {
            return Err(ExecutorError::WrongState {
                id: run_id.to_string(),
                state: run.state,
                expected: "failed or paused",
            });
        }

        // A paused run whose worker is still parked only needs the state
        // flipped back; the worker picks up from where it blocked.
        if run.state == RunState::Paused {
            let live_worker = self
                .workers
                .lock()
                .get(run_id)
                .is_some_and(|handle| !handle.join.is_finished());
            if live_worker {
                self.manager.resume(run_id);
                self.store.update(run_id, |run| run.state = RunState::Running);
                return Ok(());
            }
        }

        let skills = resolve_workflow(&self.config, &run.workflow)?;
        let mut start = run.skill_index.saturating_sub(1);
        if start >= skills.len() {
            start = 0;
        }

        let new_prompt = prompt.to_string();
        self.store.update(run_id, |run| {
            if !new_prompt.is_empty() {
                run.prompt = new_prompt.clone();
            }
            run.state = RunState::Running;
            run.error.clear();
            run.completed_at = None;
        });
        info!(run_id, start, "resuming workflow");

        self.spawn_worker(run_id, move |this, id, token| async move {
            this.workflow_loop(id, skills, start, String::new(), token)
                .await;
        });
        Ok(())
    }

    /// Re-enter the workflow loop for a rehydrated run without mutating
    /// its state. If the manager reconnected a live child, its pending
    /// result is treated as the current skill's outcome.
    pub fn resume_reconnected(self: &Arc<Self>, run_id: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        let skills = resolve_workflow(&self.config, &run.workflow)?;
        let skill_index = run.skill_index;

        self.spawn_worker(run_id, move |this, id, token| async move {
            let (start, previous_output) = match this.manager.take_reconnected(&id) {
                None => (skill_index.saturating_sub(1), String::new()),
                Some(rx) => {
                    let result = tokio::select! {
                        res = rx => res,
                        () = token.cancelled() => {
                            if !this.is_shutting_down() {
                                this.fail_run(&id, "cancelled");
                            }
                            return;
                        }
                    };
                    match result {
                        Err(_) => (skill_index.saturating_sub(1), String::new()),
                        Ok(SkillResult { error: Some(ProcessError::Disconnected), .. }) => return,
                        Ok(SkillResult { error: Some(err), .. }) => {
                            if !this.is_shutting_down() {
                                let skill = this
                                    .store
                                    .get(&id)
                                    .map(|r| r.current_skill)
                                    .unwrap_or_default();
                                this.fail_run(&id, format!("skill {skill} failed: {err}"));
                            }
                            return;
                        }
                        // The in-flight skill finished; continue after it.
                        Ok(SkillResult { text, .. }) => (skill_index, text),
                    }
                }
            };
            this.workflow_loop(id, skills, start, previous_output, token)
                .await;
        });
        Ok(())
    }

    /// Append a follow-up prompt to a quiescent run and drive a single
    /// build+commit pass against its existing worktree.
    pub fn follow_up(self: &Arc<Self>, run_id: &str, prompt: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        if !matches!(run.state, RunState::Completed | RunState::Reviewing) {
            return Err(ExecutorError::WrongState {
                id: run_id.to_string(),
                state: run.state,
                expected: "completed or reviewing",
            });
        }

        let task = prompt.to_string();
        self.store.update(run_id, |run| {
            run.follow_up_prompts.push(task.clone());
            run.completed_at = None;
            run.state = RunState::Running;
            run.error.clear();
        });
        info!(run_id, "follow-up started");

        self.spawn_worker(run_id, move |this, id, token| async move {
            this.single_build_worker(id, task, token).await;
        });
        Ok(())
    }

    /// Cancel one run's worker. Safe when the run is not active.
    pub fn cancel(&self, run_id: &str) {
        if let Some(handle) = self.workers.lock().get(run_id) {
            handle.token.cancel();
        }
    }

    /// Pause a running run: flag the record and SIGSTOP the child.
    pub fn pause(&self, run_id: &str) {
        self.store.update(run_id, |run| {
            if run.state == RunState::Running {
                run.state = RunState::Paused;
            }
        });
        self.manager.pause(run_id);
    }

    /// Set the shutdown flag, cancel every worker, and wait (bounded)
    /// for drain. Children stay alive; the caller detaches the process
    /// manager after the final session save so live PIDs land on disk.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.manager.set_disconnecting();

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.token.cancel();
        }
        let joins = handles.into_iter().map(|handle| handle.join);
        if tokio::time::timeout(SHUTDOWN_DRAIN, join_all(joins))
            .await
            .is_err()
        {
            warn!("workers did not drain before the shutdown deadline");
        }
    }

    fn spawn_worker<F, Fut>(self: &Arc<Self>, run_id: &str, f: F)
    where
        F: FnOnce(Arc<Executor>, String, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let fut = f(Arc::clone(self), run_id.to_string(), token.clone());
        let join = tokio::spawn(fut);
        self.workers
            .lock()
            .insert(run_id.to_string(), WorkerHandle { token, join });
    }

    fn fail_run(&self, run_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id, error = %message, "run failed");
        self.store.update(run_id, |run| {
            run.state = RunState::Failed;
            run.error = message.clone();
            run.completed_at = Some(Utc::now());
        });
    }

    /// The per-run workflow driver.
    async fn workflow_loop(
        self: Arc<Self>,
        run_id: String,
        mut skills: Vec<String>,
        start: usize,
        mut previous_output: String,
        token: CancellationToken,
    ) {
        let mut i = start;
        loop {
            if token.is_cancelled() {
                if !self.is_shutting_down() {
                    self.fail_run(&run_id, "cancelled");
                }
                return;
            }
            if self.wait_while_paused(&run_id, &token).await.is_err() {
                if !self.is_shutting_down() {
                    self.fail_run(&run_id, "cancelled");
                }
                return;
            }
            if i >= skills.len() {
                break;
            }

            let name = skills[i].clone();
            self.store.update(&run_id, |run| {
                run.skill_index = i + 1;
                run.current_skill = name.clone();
                run.state = RunState::Running;
            });

            let Some((skill, opts)) = self.registry.skill_for_run(&self.config, &name) else {
                self.fail_run(&run_id, format!("skill {name} not found"));
                return;
            };
            let prompt = self.prompt_for(&run_id, &skill, &previous_output);

            let output = match self.run_skill(&run_id, &prompt, &opts, &token).await {
                Ok(output) => output,
                Err(SkillRunError::Disconnected) => return,
                Err(SkillRunError::Cancelled) => {
                    if !self.is_shutting_down() {
                        self.fail_run(&run_id, "cancelled");
                    }
                    return;
                }
                Err(SkillRunError::Failed(e)) => {
                    self.fail_run(&run_id, format!("skill {name} failed: {e}"));
                    return;
                }
            };

            if let Some(run) = self.store.get(&run_id) {
                if self.limits.tokens_exceeded(run.tokens) {
                    self.fail_run(&run_id, "token limit exceeded");
                    return;
                }
                if self.limits.cost_exceeded(run.cost) {
                    self.fail_run(&run_id, "cost limit exceeded");
                    return;
                }
            }

            // Auto-commit after modifying skills; never fatal.
            if !matches!(name.as_str(), ROUTE_SKILL | DECOMPOSE_SKILL | COMMIT_SKILL) {
                if self.auto_commit(&run_id, &token).await.is_err() {
                    if !self.is_shutting_down() {
                        self.fail_run(&run_id, "cancelled");
                    }
                    return;
                }
            }

            if name == ROUTE_SKILL {
                let available = self.workflow_names();
                let mut target = parse_route_result(&output, &available);
                if target.is_empty() {
                    warn!(run_id = %run_id, "route output unparseable; falling back to build workflow");
                    self.manager
                        .buffer(&run_id)
                        .push("route output unparseable; using build workflow".to_string());
                    target = BUILD_SKILL.to_string();
                }
                let routed = match resolve_workflow(&self.config, &target) {
                    Ok(routed) => routed,
                    Err(_) if target != BUILD_SKILL => {
                        warn!(run_id = %run_id, %target, "routed workflow unknown; falling back to build");
                        match resolve_workflow(&self.config, BUILD_SKILL) {
                            Ok(routed) => {
                                target = BUILD_SKILL.to_string();
                                routed
                            }
                            Err(e) => {
                                self.fail_run(&run_id, e.to_string());
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        self.fail_run(&run_id, e.to_string());
                        return;
                    }
                };
                info!(run_id = %run_id, workflow = %target, "routed");
                skills = routed;
                self.store.update(&run_id, |run| {
                    run.workflow = target.clone();
                    run.skill_total = skills.len();
                    run.skill_index = 0;
                });
                previous_output = String::new();
                i = 0;
                continue;
            }

            if name == DECOMPOSE_SKILL {
                let plan = parse_decompose_result(&output).filter(|p| !p.tasks.is_empty());
                match plan {
                    Some(plan) => {
                        match self.execute_parallel_groups(&run_id, &plan, &token).await {
                            Ok(merged) => previous_output = merged,
                            Err(SkillRunError::Disconnected) => return,
                            Err(SkillRunError::Cancelled) => {
                                if !self.is_shutting_down() {
                                    self.fail_run(&run_id, "cancelled");
                                }
                                return;
                            }
                            Err(SkillRunError::Failed(e)) => {
                                self.fail_run(&run_id, format!("parallel task failed: {e}"));
                                return;
                            }
                        }
                    }
                    None => previous_output = output,
                }
            } else {
                previous_output = output;
            }

            i += 1;
        }

        let last = skills.last().map(String::as_str).unwrap_or_default();
        let final_state = if last == REVIEW_SKILL {
            match parse_review_result(&previous_output) {
                Some(true) => RunState::Completed,
                _ => RunState::Reviewing,
            }
        } else {
            RunState::Completed
        };
        self.store.update(&run_id, |run| {
            run.state = final_state;
            run.completed_at = Some(Utc::now());
        });
        info!(run_id = %run_id, state = %final_state, "workflow finished");
    }

    /// Block while the run is paused. Wakes on store changes; readers
    /// re-check state on every wake.
    async fn wait_while_paused(
        &self,
        run_id: &str,
        token: &CancellationToken,
    ) -> std::result::Result<(), SkillRunError> {
        let mut changes = self.store.changes();
        loop {
            let Some(run) = self.store.get(run_id) else {
                return Err(SkillRunError::Cancelled);
            };
            if run.state != RunState::Paused {
                return Ok(());
            }
            tokio::select! {
                _ = changes.changed() => {}
                () = token.cancelled() => return Err(SkillRunError::Cancelled),
            }
        }
    }

    fn prompt_context(&self, run: &Run, user_prompt: String, previous_output: String) -> PromptContext {
        PromptContext {
            work_dir: if run.worktree.as_os_str().is_empty() {
                self.config.project_root()
            } else {
                run.worktree.clone()
            },
            branch: run.branch.clone(),
            previous_output,
            user_prompt,
            safety_patterns: self.config.safety.blocked_patterns.clone(),
            workflow_names: Vec::new(),
            spec_file: None,
            modified_files: Vec::new(),
        }
    }

    fn prompt_for(&self, run_id: &str, skill: &Skill, previous_output: &str) -> String {
        let run = self.store.get(run_id).unwrap_or_default();
        let mut ctx = self.prompt_context(&run, run.prompt.clone(), previous_output.to_string());
        if skill.name == ROUTE_SKILL {
            ctx.workflow_names = self.workflow_names();
        }
        build_prompt(skill, &ctx)
    }

    /// Run one skill with rate-limit retries. On cancellation the child
    /// is stopped and the result channel drained so the manager's
    /// consumer finishes before the next skill starts.
    async fn run_skill(
        &self,
        run_id: &str,
        prompt: &str,
        opts: &RunOptions,
        token: &CancellationToken,
    ) -> std::result::Result<String, SkillRunError> {
        let max_attempts = self.config.limits.rate_limit_max_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut rx = self
                .manager
                .start_skill(run_id, prompt, opts)
                .await
                .map_err(|e| SkillRunError::Failed(e.to_string()))?;

            let timeout = async {
                match opts.timeout {
                    Some(secs) if secs > 0 => {
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    }
                    _ => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(timeout);

            let received = tokio::select! {
                res = &mut rx => res,
                () = token.cancelled() => {
                    if self.is_shutting_down() {
                        // Graceful disconnect: the child stays alive for
                        // the next start to reconnect.
                        return Err(SkillRunError::Disconnected);
                    }
                    let _ = self.manager.stop(run_id).await;
                    let _ = rx.await;
                    return Err(SkillRunError::Cancelled);
                }
                () = &mut timeout => {
                    let _ = self.manager.stop(run_id).await;
                    let _ = rx.await;
                    return Err(SkillRunError::Failed(format!(
                        "timed out after {}s",
                        opts.timeout.unwrap_or_default()
                    )));
                }
            };

            let result = received
                .map_err(|_| SkillRunError::Failed("agent result channel closed".to_string()))?;
            match result.error {
                None => return Ok(result.text),
                Some(ProcessError::Disconnected) => return Err(SkillRunError::Disconnected),
                Some(err) => {
                    let message = err.to_string();
                    if self.limits.is_rate_limit(&message) && attempt < max_attempts {
                        let backoff = self.config.limits.rate_limit_backoff;
                        self.manager.buffer(run_id).push(format!(
                            "rate limited; retrying in {backoff}s (attempt {attempt}/{max_attempts})"
                        ));
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                            () = token.cancelled() => return Err(SkillRunError::Cancelled),
                        }
                        continue;
                    }
                    return Err(SkillRunError::Failed(message));
                }
            }
        }
    }

    /// Invoke the commit skill. Failures are logged to the run's buffer,
    /// never fatal; disconnect/cancel still propagate.
    async fn auto_commit(
        &self,
        run_id: &str,
        token: &CancellationToken,
    ) -> std::result::Result<(), SkillRunError> {
        let Some((skill, opts)) = self.registry.skill_for_run(&self.config, COMMIT_SKILL) else {
            return Ok(());
        };
        self.store
            .update(run_id, |run| run.current_skill = COMMIT_SKILL.to_string());
        let prompt = self.prompt_for(run_id, &skill, "");
        match self.run_skill(run_id, &prompt, &opts, token).await {
            Ok(_) => Ok(()),
            Err(SkillRunError::Failed(message)) => {
                warn!(run_id, error = %message, "auto-commit failed");
                self.manager
                    .buffer(run_id)
                    .push(format!("auto-commit failed: {message}"));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Execute decompose groups in topological order; tasks inside a
    /// group run concurrently under composite run ids.
    async fn execute_parallel_groups(
        self: &Arc<Self>,
        run_id: &str,
        plan: &DecomposeResult,
        token: &CancellationToken,
    ) -> std::result::Result<String, SkillRunError> {
        let groups = plan.group_by_parallel();
        let mut merged = String::new();

        for group in groups {
            if group.len() == 1 {
                let task = &group[0];
                let output = self.run_sub_task(run_id, task, token).await?;
                let _ = write!(merged, "### {}\n{}\n\n", task.name, output);
            } else {
                let futures: Vec<_> = group
                    .iter()
                    .map(|task| {
                        let this = Arc::clone(self);
                        let parent = run_id.to_string();
                        let task = task.clone();
                        let token = token.clone();
                        async move {
                            let output =
                                this.run_parallel_sub_task(&parent, &task, &token).await;
                            (task.name.clone(), output)
                        }
                    })
                    .collect();
                let results = join_all(futures).await;

                // Merge outputs in source order; the first error wins and
                // sibling errors are discarded.
                let mut first_err = None;
                for (name, result) in results {
                    match result {
                        Ok(output) => {
                            let _ = write!(merged, "### {name}\n{output}\n\n");
                        }
                        Err(e) => {
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                }
                if let Some(e) = first_err {
                    return Err(e);
                }
            }

            self.auto_commit(run_id, token).await?;
        }

        Ok(merged)
    }

    /// Run one sub-task inline under the parent's run id.
    async fn run_sub_task(
        &self,
        run_id: &str,
        task: &DecomposeTask,
        token: &CancellationToken,
    ) -> std::result::Result<String, SkillRunError> {
        let Some((skill, opts)) = self.registry.skill_for_run(&self.config, BUILD_SKILL) else {
            return Err(SkillRunError::Failed("build skill not found".to_string()));
        };
        self.store
            .update(run_id, |run| run.current_skill = BUILD_SKILL.to_string());
        let run = self.store.get(run_id).unwrap_or_default();
        let ctx = self.prompt_context(&run, task.name.clone(), String::new());
        let prompt = build_prompt(&skill, &ctx);
        self.run_skill(run_id, &prompt, &opts, token).await
    }

    /// Run one sub-task under a composite run id so the manager's
    /// single-child-per-id invariant holds. A temporary run record
    /// mirrors the parent; its telemetry folds back on completion.
    async fn run_parallel_sub_task(
        self: &Arc<Self>,
        parent_id: &str,
        task: &DecomposeTask,
        token: &CancellationToken,
    ) -> std::result::Result<String, SkillRunError> {
        let Some(parent) = self.store.get(parent_id) else {
            return Err(SkillRunError::Failed("parent run missing".to_string()));
        };
        let composite_id = format!("{}:{}", parent_id, task.name);

        let temp = Run {
            id: composite_id.clone(),
            prompt: task.name.clone(),
            original_prompt: task.name.clone(),
            workflow: parent.workflow.clone(),
            model: parent.model.clone(),
            branch: parent.branch.clone(),
            worktree: parent.worktree.clone(),
            sub_worktrees: parent.sub_worktrees.clone(),
            state: RunState::Running,
            current_skill: BUILD_SKILL.to_string(),
            skill_index: 1,
            skill_total: 1,
            started_at: Some(Utc::now()),
            ..Run::default()
        };
        self.store.add(temp);

        let result = self.run_sub_task(&composite_id, task, token).await;

        if let Some(temp_run) = self.store.get(&composite_id) {
            self.store
                .update(parent_id, |parent| parent.absorb_telemetry(&temp_run));
        }
        self.store.remove(&composite_id);
        result
    }

    /// Run the build skill once with a custom task prompt against the
    /// run's worktree. Used by the merge pipeline's fix loop and
    /// conflict resolution; errors come back as plain strings.
    pub async fn run_fix_build(
        &self,
        run_id: &str,
        task: &str,
    ) -> std::result::Result<String, String> {
        let Some((skill, opts)) = self.registry.skill_for_run(&self.config, BUILD_SKILL) else {
            return Err("build skill not found".to_string());
        };
        self.store
            .update(run_id, |run| run.current_skill = BUILD_SKILL.to_string());
        let run = self.store.get(run_id).unwrap_or_default();
        let ctx = self.prompt_context(&run, task.to_string(), String::new());
        let prompt = build_prompt(&skill, &ctx);
        let token = CancellationToken::new();
        match self.run_skill(run_id, &prompt, &opts, &token).await {
            Ok(text) => Ok(text),
            Err(SkillRunError::Disconnected) => Err("disconnected".to_string()),
            Err(SkillRunError::Cancelled) => Err("cancelled".to_string()),
            Err(SkillRunError::Failed(e)) => Err(e),
        }
    }

    /// Best-effort commit for pipeline callers.
    pub async fn commit_best_effort(&self, run_id: &str) {
        let token = CancellationToken::new();
        let _ = self.auto_commit(run_id, &token).await;
    }

    /// Quick-fix and follow-up path: one build with a minimal prompt,
    /// then commit, then completed.
    async fn single_build_worker(
        self: Arc<Self>,
        run_id: String,
        task: String,
        token: CancellationToken,
    ) {
        let Some((_, opts)) = self.registry.skill_for_run(&self.config, BUILD_SKILL) else {
            self.fail_run(&run_id, "build skill not found");
            return;
        };
        self.store.update(&run_id, |run| {
            run.current_skill = BUILD_SKILL.to_string();
            run.skill_index = 1;
        });
        let run = self.store.get(&run_id).unwrap_or_default();
        let prompt = build_minimal_prompt(&self.prompt_context(&run, task, String::new()));

        match self.run_skill(&run_id, &prompt, &opts, &token).await {
            Ok(_) => {}
            Err(SkillRunError::Disconnected) => return,
            Err(SkillRunError::Cancelled) => {
                if !self.is_shutting_down() {
                    self.fail_run(&run_id, "cancelled");
                }
                return;
            }
            Err(SkillRunError::Failed(e)) => {
                self.fail_run(&run_id, format!("skill build failed: {e}"));
                return;
            }
        }

        if self.auto_commit(&run_id, &token).await.is_err() {
            if !self.is_shutting_down() {
                self.fail_run(&run_id, "cancelled");
            }
            return;
        }

        self.store.update(&run_id, |run| {
            run.state = RunState::Completed;
            run.completed_at = Some(Utc::now());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{EntryBuffer, LogBuffer};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use tokio::sync::oneshot;

    /// Scripted process manager. Each queued entry is either a result or
    /// a hang (delivered only when `stop` is called).
    #[derive(Default)]
    struct MockManager {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<(String, String)>>,
        pending: Mutex<HashMap<String, oneshot::Sender<SkillResult>>>,
        buffers: Mutex<HashMap<String, Arc<LogBuffer>>>,
        entries: Mutex<HashMap<String, Arc<EntryBuffer>>>,
        store: Mutex<Option<Arc<RunStore>>>,
        cost_per_call: f64,
    }

    enum Scripted {
        Result(SkillResult),
        Hang,
    }

    impl MockManager {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn with_cost(cost: f64) -> Arc<Self> {
            Arc::new(Self {
                cost_per_call: cost,
                ..Self::default()
            })
        }

        /// Deliver a success for a hanging invocation.
        fn complete_hang(&self, run_id: &str, text: &str) {
            if let Some(tx) = self.pending.lock().remove(run_id) {
                let _ = tx.send(SkillResult::ok(text.to_string()));
            }
        }

        fn push_ok(&self, text: &str) {
            self.script
                .lock()
                .push_back(Scripted::Result(SkillResult::ok(text.to_string())));
        }

        fn push_err(&self, message: &str) {
            self.script.lock().push_back(Scripted::Result(SkillResult {
                text: String::new(),
                error: Some(ProcessError::Failed(message.to_string())),
            }));
        }

        fn push_hang(&self) {
            self.script.lock().push_back(Scripted::Hang);
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }

        fn skill_calls(&self) -> Vec<String> {
            // The prompt records which skill ran via its body line.
            self.calls()
                .iter()
                .map(|(_, prompt)| {
                    prompt
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .to_string()
                })
                .collect()
        }
    }

    #[async_trait]
    impl ProcessManager for MockManager {
        async fn start_skill(
            &self,
            run_id: &str,
            prompt: &str,
            _opts: &RunOptions,
        ) -> crate::process::Result<oneshot::Receiver<SkillResult>> {
            self.calls
                .lock()
                .push((run_id.to_string(), prompt.to_string()));
            if let Some(store) = self.store.lock().clone() {
                if self.cost_per_call > 0.0 {
                    let cost = self.cost_per_call;
                    store.update(run_id, |run| {
                        let skill = run.current_skill.clone();
                        run.add_skill_cost(agtop_core::SkillCost {
                            skill,
                            cost,
                            tokens: 10,
                            tokens_in: 6,
                            tokens_out: 4,
                        });
                    });
                }
            }
            let (tx, rx) = oneshot::channel();
            let next = self.script.lock().pop_front();
            match next {
                Some(Scripted::Result(result)) => {
                    let _ = tx.send(result);
                }
                Some(Scripted::Hang) => {
                    self.pending.lock().insert(run_id.to_string(), tx);
                }
                None => {
                    let _ = tx.send(SkillResult::ok("done".to_string()));
                }
            }
            Ok(rx)
        }

        async fn stop(&self, run_id: &str) -> crate::process::Result<()> {
            if let Some(tx) = self.pending.lock().remove(run_id) {
                let _ = tx.send(SkillResult {
                    text: String::new(),
                    error: Some(ProcessError::Failed("stopped".to_string())),
                });
            }
            Ok(())
        }

        fn pause(&self, _run_id: &str) {}
        fn resume(&self, _run_id: &str) {}

        fn buffer(&self, run_id: &str) -> Arc<LogBuffer> {
            Arc::clone(
                self.buffers
                    .lock()
                    .entry(run_id.to_string())
                    .or_insert_with(|| Arc::new(LogBuffer::new())),
            )
        }

        fn entry_buffer(&self, run_id: &str) -> Arc<EntryBuffer> {
            Arc::clone(
                self.entries
                    .lock()
                    .entry(run_id.to_string())
                    .or_insert_with(|| Arc::new(EntryBuffer::new())),
            )
        }

        fn pid(&self, _run_id: &str) -> Option<u32> {
            None
        }

        async fn reconnect(&self, _run_id: &str, _pid: u32) -> crate::process::Result<()> {
            Ok(())
        }

        fn take_reconnected(&self, _run_id: &str) -> Option<oneshot::Receiver<SkillResult>> {
            None
        }

        fn log_file_paths(&self, run_id: &str) -> (PathBuf, PathBuf) {
            (
                PathBuf::from(format!("/tmp/{run_id}.stdout.log")),
                PathBuf::from(format!("/tmp/{run_id}.stderr.log")),
            )
        }

        fn set_disconnecting(&self) {}
        async fn disconnect_all(&self) {}
    }

    struct Harness {
        store: Arc<RunStore>,
        manager: Arc<MockManager>,
        executor: Arc<Executor>,
    }

    fn harness_with(config: Config, manager: Arc<MockManager>) -> Harness {
        let store = Arc::new(RunStore::new());
        *manager.store.lock() = Some(Arc::clone(&store));
        let config = Arc::new(config);
        let registry = Arc::new(SkillRegistry::load_from(
            &config,
            vec![crate::registry::SkillSource {
                label: "builtin",
                priority: crate::registry::BUILTIN_PRIORITY,
                dir: None,
            }],
        ));
        let executor = Executor::new(
            Arc::clone(&store),
            registry,
            Arc::clone(&manager) as Arc<dyn ProcessManager>,
            config,
            None,
        );
        Harness {
            store,
            manager,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default(), MockManager::new())
    }

    fn seed_run(store: &RunStore) -> String {
        let mut run = Run::new("add a dark mode toggle", "build");
        run.branch = "agtop/001".to_string();
        run.worktree = PathBuf::from("/tmp/wt/001");
        store.add(run)
    }

    async fn wait_for<F: Fn(&Run) -> bool>(store: &RunStore, id: &str, pred: F) -> Run {
        let mut changes = store.changes();
        for _ in 0..200 {
            if let Some(run) = store.get(id) {
                if pred(&run) {
                    return run;
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), changes.changed()).await;
        }
        panic!("condition not reached; run: {:?}", store.get(id));
    }

    #[tokio::test]
    async fn execute_drives_workflow_to_completion() {
        let h = harness();
        let id = seed_run(&h.store);

        h.executor
            .execute(&id, "build", "add a dark mode toggle")
            .await
            .unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;

        assert_eq!(run.workflow, "build");
        assert_eq!(run.skill_total, 2);
        assert_eq!(run.skill_index, 2);
        assert!(run.completed_at.is_some());
        // build, auto-commit, test, auto-commit
        let skills = h.manager.skill_calls();
        assert_eq!(skills.len(), 4, "calls: {skills:?}");
        assert!(skills[0].contains("Implement the task"));
        assert!(skills[1].contains("Stage and commit"));
        assert!(skills[3].contains("Stage and commit"));
    }

    #[tokio::test]
    async fn auto_routes_then_falls_back_to_build_on_unparseable_output() {
        let h = harness();
        let id = seed_run(&h.store);
        h.manager
            .push_ok("I could not settle on a single workflow for this one.");

        h.executor
            .execute(&id, "auto", "add a dark mode toggle")
            .await
            .unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;

        assert_eq!(run.workflow, "build");
        assert_eq!(run.skill_total, 2);
        assert!(h
            .manager
            .buffer(&id)
            .tail(10)
            .iter()
            .any(|l| l.contains("route output unparseable")));
        // route (no commit), build, commit, test, commit
        assert_eq!(h.manager.calls().len(), 5);
    }

    #[tokio::test]
    async fn route_json_switches_workflow() {
        let mut config = Config::default();
        config.workflows.insert(
            "plan-build".to_string(),
            agtop_core::config::WorkflowConfig {
                skills: vec!["plan".to_string(), "build".to_string(), "test".to_string()],
            },
        );
        let h = harness_with(config, MockManager::new());
        let id = seed_run(&h.store);
        h.manager.push_ok("{\"workflow\": \"plan-build\"}");

        h.executor.execute(&id, "auto", "prompt").await.unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        assert_eq!(run.workflow, "plan-build");
        assert_eq!(run.skill_total, 3);
        assert_eq!(run.skill_index, 3);
    }

    #[tokio::test]
    async fn review_verdict_controls_terminal_state() {
        let mut config = Config::default();
        config.workflows.insert(
            "check".to_string(),
            agtop_core::config::WorkflowConfig {
                skills: vec!["review".to_string()],
            },
        );

        // Failing verdict parks the run in reviewing.
        let h = harness_with(config.clone(), MockManager::new());
        let id = seed_run(&h.store);
        h.manager.push_ok("{\"success\": false}");
        h.executor.execute(&id, "check", "prompt").await.unwrap();
        let run = wait_for(&h.store, &id, |r| !r.state.is_active()).await;
        assert_eq!(run.state, RunState::Reviewing);

        // Passing verdict completes.
        let h = harness_with(config, MockManager::new());
        let id = seed_run(&h.store);
        h.manager.push_ok("all good\n{\"success\": true}");
        h.executor.execute(&id, "check", "prompt").await.unwrap();
        let run = wait_for(&h.store, &id, |r| !r.state.is_active()).await;
        assert_eq!(run.state, RunState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_skill_retries_after_backoff() {
        let h = harness();
        let id = seed_run(&h.store);
        h.manager.push_err("429 too many requests");

        h.executor.execute(&id, "build", "prompt").await.unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        assert_eq!(run.state, RunState::Completed);

        // First build call was rate-limited, second succeeded.
        let calls = h.manager.calls();
        assert_eq!(calls.len(), 5, "calls: {calls:?}");
        assert!(h
            .manager
            .buffer(&id)
            .tail(10)
            .iter()
            .any(|l| l.contains("rate limited; retrying")));
    }

    #[tokio::test(start_paused = true)]
    async fn non_rate_limit_error_fails_the_run() {
        let h = harness();
        let id = seed_run(&h.store);
        h.manager.push_err("compile error in src/lib.rs");

        h.executor.execute(&id, "build", "prompt").await.unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Failed).await;
        assert!(run.error.contains("skill build failed"));
        assert!(run.error.contains("compile error"));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_fails_the_run_when_not_shutting_down() {
        let h = harness();
        let id = seed_run(&h.store);
        h.manager.push_hang();

        h.executor.execute(&id, "build", "prompt").await.unwrap();
        // Wait for the skill to be in flight.
        wait_for(&h.store, &id, |r| r.skill_index == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.executor.cancel(&id);
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Failed).await;
        assert_eq!(run.error, "cancelled");
    }

    #[tokio::test]
    async fn shutdown_preserves_run_state() {
        let h = harness();
        let id = seed_run(&h.store);
        h.manager.push_hang();

        h.executor.execute(&id, "build", "prompt").await.unwrap();
        wait_for(&h.store, &id, |r| r.skill_index == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.executor.shutdown().await;
        let run = h.store.get(&id).unwrap();
        assert_eq!(run.state, RunState::Running, "state preserved for rehydration");
        assert!(run.error.is_empty());
    }

    #[tokio::test]
    async fn resume_requires_failed_or_paused() {
        let h = harness();
        let id = seed_run(&h.store);
        let err = h.executor.resume(&id, "").unwrap_err();
        assert!(matches!(err, ExecutorError::WrongState { .. }));
    }

    #[tokio::test]
    async fn resume_clamps_out_of_range_skill_index() {
        let h = harness();
        let id = seed_run(&h.store);
        h.store.update(&id, |run| {
            run.state = RunState::Failed;
            run.workflow = "build".to_string();
            run.skill_index = 99;
        });

        h.executor.resume(&id, "").unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        // Restarted from index 0: both skills ran.
        assert_eq!(run.skill_index, 2);
        assert_eq!(h.manager.calls().len(), 4);
    }

    #[tokio::test]
    async fn resume_restarts_last_incomplete_skill() {
        let h = harness();
        let id = seed_run(&h.store);
        h.store.update(&id, |run| {
            run.state = RunState::Failed;
            run.workflow = "build".to_string();
            run.skill_index = 2;
        });

        h.executor.resume(&id, "try again with smaller steps").unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        assert_eq!(run.prompt, "try again with smaller steps");
        // Only the second skill (test) re-ran, plus its commit.
        assert_eq!(h.manager.calls().len(), 2);
    }

    #[tokio::test]
    async fn follow_up_appends_prompt_and_completes() {
        let h = harness();
        let id = seed_run(&h.store);
        h.store.update(&id, |run| {
            run.state = RunState::Completed;
            run.completed_at = Some(Utc::now());
        });

        h.executor.follow_up(&id, "also fix the hover state").unwrap();
        let run = wait_for(&h.store, &id, |r| {
            r.state == RunState::Completed && !r.follow_up_prompts.is_empty()
        })
        .await;

        assert_eq!(run.follow_up_prompts, vec!["also fix the hover state"]);
        // One build plus one commit.
        let calls = h.manager.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.contains("also fix the hover state"));
    }

    #[tokio::test]
    async fn follow_up_rejected_for_active_run() {
        let h = harness();
        let id = seed_run(&h.store);
        h.store.update(&id, |run| run.state = RunState::Running);
        assert!(h.executor.follow_up(&id, "nope").is_err());
    }

    #[tokio::test]
    async fn quick_fix_runs_single_build_then_commit() {
        let h = harness();
        let id = seed_run(&h.store);

        h.executor
            .execute(&id, "quick-fix", "fix the typo on the landing page")
            .await
            .unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        assert_eq!(run.workflow, "quick-fix");
        assert_eq!(run.skill_total, 1);

        let calls = h.manager.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.contains("fix the typo on the landing page"));
        assert!(calls[0].1.contains("## Task"));
    }

    #[tokio::test]
    async fn unknown_workflow_fails_run_and_errors() {
        let h = harness();
        let id = seed_run(&h.store);
        let err = h.executor.execute(&id, "no-such", "prompt").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Workflow(_)));
        let run = h.store.get(&id).unwrap();
        assert_eq!(run.state, RunState::Failed);
    }

    #[tokio::test]
    async fn decompose_runs_groups_and_folds_telemetry() {
        let mut config = Config::default();
        config.workflows.insert(
            "split".to_string(),
            agtop_core::config::WorkflowConfig {
                skills: vec!["decompose".to_string()],
            },
        );
        let h = harness_with(config, MockManager::with_cost(0.1));
        let id = seed_run(&h.store);

        h.manager.push_ok(
            r#"{"tasks":[
                {"name":"api endpoint","parallel_group":"g1","dependencies":[]},
                {"name":"web page","parallel_group":"g1","dependencies":[]},
                {"name":"wire together","parallel_group":"g2","dependencies":["api endpoint"]}
            ]}"#,
        );

        h.executor.execute(&id, "split", "build the feature").await.unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;

        // Temporary composite records are gone.
        assert_eq!(h.store.count(), 1);
        // decompose + 2 parallel builds + group commit + 1 solo build +
        // group commit = 6 invocations, each credited 0.1.
        assert_eq!(h.manager.calls().len(), 6);
        assert!((run.cost - 0.6).abs() < 1e-9, "cost: {}", run.cost);
        assert_eq!(run.skill_costs.len(), 6);

        // Composite ids were used for the concurrent group.
        let calls = h.manager.calls();
        assert!(calls.iter().any(|(id, _)| id.ends_with(":api endpoint")));
        assert!(calls.iter().any(|(id, _)| id.ends_with(":web page")));
    }

    #[tokio::test]
    async fn pause_parks_worker_between_skills_until_resumed() {
        let h = harness();
        let id = seed_run(&h.store);
        // First skill hangs so we can pause while it is in flight.
        h.manager.push_hang();

        h.executor.execute(&id, "build", "prompt").await.unwrap();
        wait_for(&h.store, &id, |r| r.skill_index == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.executor.pause(&id);
        assert_eq!(h.store.get(&id).unwrap().state, RunState::Paused);

        // Let the in-flight skill finish; its auto-commit still runs, but
        // the worker must then park before starting the next skill.
        h.manager.complete_hang(&id, "built it");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.get(&id).unwrap().state, RunState::Paused);
        assert_eq!(h.manager.calls().len(), 2, "build + auto-commit only");

        // Resuming the parked worker continues the workflow in place.
        h.executor.resume(&id, "").unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        assert_eq!(run.skill_index, 2);
        assert_eq!(h.manager.calls().len(), 4);
    }

    #[tokio::test]
    async fn resume_reconnected_reenters_loop_without_state_change() {
        let h = harness();
        let id = seed_run(&h.store);
        h.store.update(&id, |run| {
            run.state = RunState::Running;
            run.workflow = "build".to_string();
            run.skill_index = 2;
            run.skill_total = 2;
        });

        h.executor.resume_reconnected(&id).unwrap();
        let run = wait_for(&h.store, &id, |r| r.state == RunState::Completed).await;
        // Re-ran the in-flight skill (test) and its commit.
        assert_eq!(run.skill_index, 2);
        assert_eq!(h.manager.calls().len(), 2);
    }
}
