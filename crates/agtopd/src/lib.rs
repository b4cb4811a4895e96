//! agtopd — the agtop orchestrator engine.
//!
//! Wires the run store, skill registry, process manager, worktree
//! manager, executor, merge pipeline, and session persistence into one
//! engine the front-end drives.

pub mod checks;
pub mod executor;
pub mod git;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod session;
pub mod store;
pub mod worktree;

use agtop_core::config::Config;
use agtop_core::types::{Run, RunState};
use chrono::Utc;
use executor::{Executor, ExecutorError, TaskExpander};
use pipeline::MergePipeline;
use process::{AgentProcessManager, ProcessManager};
use registry::SkillRegistry;
use session::SessionStore;
use std::sync::Arc;
use store::RunStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use worktree::WorktreeManager;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Worktree(#[from] worktree::WorktreeError),
    #[error(transparent)]
    Session(#[from] session::SessionError),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("run {id} is {state}; expected {expected}")]
    WrongState {
        id: String,
        state: RunState,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The assembled engine: one instance per process.
pub struct Engine {
    pub config: Arc<Config>,
    pub store: Arc<RunStore>,
    pub registry: Arc<SkillRegistry>,
    pub manager: Arc<AgentProcessManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub executor: Arc<Executor>,
    pub pipeline: Arc<MergePipeline>,
    pub sessions: Arc<SessionStore>,
    background: CancellationToken,
    autosaver: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_expander(config, None)
    }

    pub fn with_expander(config: Config, expander: Option<Arc<dyn TaskExpander>>) -> Arc<Self> {
        let config = Arc::new(config);
        let store = Arc::new(RunStore::new());
        let registry = Arc::new(SkillRegistry::load(&config));
        let manager = Arc::new(AgentProcessManager::new(
            Arc::clone(&store),
            Arc::clone(&config),
        ));
        let worktrees = Arc::new(WorktreeManager::new(Arc::clone(&config)));
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&manager) as Arc<dyn ProcessManager>,
            Arc::clone(&config),
            expander,
        );
        let pipeline = Arc::new(MergePipeline::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&executor),
            Arc::clone(&worktrees),
        ));
        let sessions = Arc::new(SessionStore::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&manager) as Arc<dyn ProcessManager>,
        ));

        Arc::new(Self {
            config,
            store,
            registry,
            manager,
            worktrees,
            executor,
            pipeline,
            sessions,
            background: CancellationToken::new(),
            autosaver: parking_lot::Mutex::new(None),
        })
    }

    /// Start background services and rehydrate prior sessions. Returns
    /// the ids of runs whose live children were reconnected; their
    /// workflows are resumed in place.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<String>> {
        let handle = self.sessions.spawn_autosaver(self.background.child_token());
        *self.autosaver.lock() = Some(handle);
        let reconnected = self.sessions.rehydrate(&self.background).await?;
        for run_id in &reconnected {
            if let Err(e) = self.executor.resume_reconnected(run_id) {
                error!(run_id, error = %e, "failed to resume reconnected run");
            }
        }
        info!(
            runs = self.store.count(),
            reconnected = reconnected.len(),
            "engine started"
        );
        Ok(reconnected)
    }

    /// Create a run: insert the record, provision its worktree, and
    /// start the workflow.
    pub async fn start_run(self: &Arc<Self>, prompt: &str, workflow: &str) -> Result<String> {
        let mut run = Run::new(prompt, workflow);
        run.model = match self.config.runtime.default {
            agtop_core::RuntimeKind::Claude => self.config.runtime.claude.model.clone(),
            agtop_core::RuntimeKind::Opencode => self.config.runtime.opencode.model.clone(),
        };
        let run_id = self.store.add(run);

        let created = match self.worktrees.create(&run_id) {
            Ok(created) => created,
            Err(e) => {
                self.store.update(&run_id, |run| {
                    run.state = RunState::Failed;
                    run.error = format!("worktree create failed: {e}");
                    run.completed_at = Some(Utc::now());
                });
                return Err(e.into());
            }
        };
        self.store.update(&run_id, |run| {
            run.branch = created.branch.clone();
            run.worktree = created.path.clone();
            run.sub_worktrees = created.sub_worktrees.clone();
        });

        self.executor.execute(&run_id, workflow, prompt).await?;
        Ok(run_id)
    }

    /// Accept a quiescent run: merge via the PR pipeline, or merge
    /// locally when `merge.auto_merge` is off.
    pub fn accept(self: &Arc<Self>, run_id: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !matches!(run.state, RunState::Completed | RunState::Reviewing) {
            return Err(EngineError::WrongState {
                id: run_id.to_string(),
                state: run.state,
                expected: "completed or reviewing",
            });
        }

        let this = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if this.config.merge.auto_merge {
                let _ = this.pipeline.run(&run_id).await;
            } else {
                this.merge_local(&run_id);
            }
        });
        Ok(())
    }

    /// Local merge path: rebase + merge the branch straight into each
    /// repo's default branch, no remote involved.
    fn merge_local(&self, run_id: &str) {
        let Some(run) = self.store.get(run_id) else {
            return;
        };
        self.store.update(run_id, |run| {
            run.state = RunState::Merging;
            run.merge_status = "merging".to_string();
        });
        match self.worktrees.merge(&run) {
            Ok(_) => {
                self.store.update(run_id, |run| {
                    run.state = RunState::Accepted;
                    run.merge_status = "merged".to_string();
                    run.completed_at = Some(Utc::now());
                });
            }
            Err(e) => {
                self.store.update(run_id, |run| {
                    run.state = RunState::Failed;
                    run.merge_status = "failed".to_string();
                    run.error = e.to_string();
                    run.completed_at = Some(Utc::now());
                });
            }
        }
    }

    /// Reject a quiescent run.
    pub fn reject(&self, run_id: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !matches!(run.state, RunState::Completed | RunState::Reviewing) {
            return Err(EngineError::WrongState {
                id: run_id.to_string(),
                state: run.state,
                expected: "completed or reviewing",
            });
        }
        self.store.update(run_id, |run| {
            run.state = RunState::Rejected;
            run.completed_at = Some(Utc::now());
        });
        Ok(())
    }

    /// Tear a run down: cancel its worker, drop its worktree and
    /// branch, and delete its session and logs.
    pub async fn remove_run(&self, run_id: &str) -> Result<()> {
        self.executor.cancel(run_id);
        let _ = self.manager.stop(run_id).await;
        if let Some(run) = self.store.get(run_id) {
            self.worktrees.remove(&run)?;
        }
        self.sessions.remove(run_id);
        self.store.remove(run_id);
        Ok(())
    }

    /// Graceful shutdown: drain workers, save sessions with live PIDs
    /// intact, then detach from children without killing them.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.executor.shutdown().await;
        if let Err(e) = self.sessions.final_save() {
            error!(error = %e, "final session save failed");
        }
        // Stop the autosaver (its cancel branch saves once more, still
        // with live PIDs) before detaching from children.
        self.background.cancel();
        let handle = self.autosaver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.manager.disconnect_all().await;
    }
}
