//! In-memory run store.
//!
//! Owns every run record. All mutation goes through [`RunStore::update`]
//! under the store's lock; readers get snapshots. Change notifications
//! are coalesced: subscribers re-read the store on wake, and missed edges
//! do not matter.

use agtop_core::Run;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

/// Zero-pad width for assigned run ids.
const ID_WIDTH: usize = 3;

#[derive(Debug)]
struct Inner {
    runs: HashMap<String, Run>,
    next_id: u64,
}

/// Thread-safe store of run records with a monotonic id allocator and a
/// coalesced change channel.
#[derive(Debug)]
pub struct RunStore {
    inner: Mutex<Inner>,
    notify: watch::Sender<u64>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                runs: HashMap::new(),
                next_id: 1,
            }),
            notify,
        }
    }

    /// Insert a run. Assigns the next monotonic id when the record has
    /// none and stamps `created_at` when unset. Returns the id.
    pub fn add(&self, mut run: Run) -> String {
        let id = {
            let mut inner = self.inner.lock();
            if run.id.is_empty() {
                run.id = format!("{:0width$}", inner.next_id, width = ID_WIDTH);
                inner.next_id += 1;
            } else if let Ok(numeric) = run.id.parse::<u64>() {
                // Rehydrated ids keep the allocator ahead of them.
                if numeric >= inner.next_id {
                    inner.next_id = numeric + 1;
                }
            }
            if run.created_at_is_unset() {
                run.created_at = Utc::now();
            }
            let id = run.id.clone();
            inner.runs.insert(id.clone(), run);
            id
        };
        self.broadcast();
        id
    }

    /// Snapshot of one run.
    pub fn get(&self, id: &str) -> Option<Run> {
        self.inner.lock().runs.get(id).cloned()
    }

    /// Mutate a run in place under the store lock, then broadcast.
    /// No-op when the id is absent.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Run)) {
        let found = {
            let mut inner = self.inner.lock();
            match inner.runs.get_mut(id) {
                Some(run) => {
                    f(run);
                    true
                }
                None => false,
            }
        };
        if found {
            self.broadcast();
        }
    }

    /// Remove a run, returning it.
    pub fn remove(&self, id: &str) -> Option<Run> {
        let removed = self.inner.lock().runs.remove(id);
        if removed.is_some() {
            self.broadcast();
        }
        removed
    }

    /// Snapshot of all runs, newest first: `created_at` descending, ties
    /// broken by id descending.
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.inner.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        runs
    }

    pub fn count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    /// Number of runs whose state is active.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .runs
            .values()
            .filter(|r| r.state.is_active())
            .count()
    }

    /// Subscribe to coalesced change notifications.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn broadcast(&self) {
        self.notify.send_modify(|version| *version = version.wrapping_add(1));
    }
}
