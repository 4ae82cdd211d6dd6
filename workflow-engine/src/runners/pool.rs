// Runner Pool
// Label-matched runner slots with per-runner capacity and a global cap

use crate::config::{RunnerConfig, WILDCARD_LABEL};

use tokio::sync::watch;
use tracing::debug;

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct RunnerSlot {
    config: RunnerConfig,
    busy: usize,
}

#[derive(Debug)]
struct PoolState {
    runners: Vec<RunnerSlot>,
    running: usize,
    /// 0 = unlimited
    max_total: usize,
}

#[derive(Debug)]
struct PoolInner {
    state: Mutex<PoolState>,
    /// Bumped on every release so waiting dispatchers retry
    released: watch::Sender<u64>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runners shared by every run of an engine.
///
/// Cloning is cheap and clones share slots.
#[derive(Debug, Clone)]
pub struct RunnerPool {
    inner: Arc<PoolInner>,
}

/// A claimed slot on one runner; the slot frees itself when dropped
#[derive(Debug)]
pub struct RunnerLease {
    pool: Arc<PoolInner>,
    runner_index: usize,
    runner: String,
}

impl RunnerLease {
    /// Name of the runner hosting the job
    pub fn runner(&self) -> &str {
        &self.runner
    }
}

impl Drop for RunnerLease {
    fn drop(&mut self) {
        {
            let mut state = self.pool.lock();
            if let Some(slot) = state.runners.get_mut(self.runner_index) {
                slot.busy = slot.busy.saturating_sub(1);
            }
            state.running = state.running.saturating_sub(1);
        }
        self.pool.released.send_modify(|generation| *generation += 1);
        debug!(runner = self.runner.as_str(), "released runner slot");
    }
}

fn satisfies(config: &RunnerConfig, required: &[String]) -> bool {
    if config.labels.iter().any(|l| l == WILDCARD_LABEL) {
        return true;
    }
    required
        .iter()
        .all(|req| config.labels.iter().any(|l| l.eq_ignore_ascii_case(req)))
}

impl RunnerPool {
    pub fn new(runners: &[RunnerConfig], max_parallel_jobs: usize) -> Self {
        let (released, _) = watch::channel(0);
        let state = PoolState {
            runners: runners
                .iter()
                .map(|config| RunnerSlot {
                    config: config.clone(),
                    busy: 0,
                })
                .collect(),
            running: 0,
            max_total: max_parallel_jobs,
        };
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(state),
                released,
            }),
        }
    }

    /// Whether any runner could ever host a job with these labels
    pub fn can_satisfy(&self, required: &[String]) -> bool {
        self.inner
            .lock()
            .runners
            .iter()
            .any(|slot| satisfies(&slot.config, required))
    }

    /// Claim a free slot on the least busy matching runner
    pub fn acquire(&self, required: &[String]) -> Option<RunnerLease> {
        let mut state = self.inner.lock();
        if state.max_total > 0 && state.running >= state.max_total {
            return None;
        }

        let (index, slot) = state
            .runners
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.busy < slot.config.capacity && satisfies(&slot.config, required))
            .min_by_key(|(_, slot)| slot.busy)?;
        slot.busy += 1;
        let runner = slot.config.name.clone();
        state.running += 1;

        debug!(runner = runner.as_str(), labels = ?required, "acquired runner slot");
        Some(RunnerLease {
            pool: Arc::clone(&self.inner),
            runner_index: index,
            runner,
        })
    }

    /// Give a slot back (same as dropping the lease)
    pub fn release(&self, lease: RunnerLease) {
        drop(lease);
    }

    /// Receiver that changes whenever a slot is released
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.released.subscribe()
    }

    /// Jobs currently holding a slot
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Slots in use on one runner
    pub fn busy(&self, runner: &str) -> usize {
        self.inner
            .lock()
            .runners
            .iter()
            .find(|slot| slot.config.name == runner)
            .map(|slot| slot.busy)
            .unwrap_or(0)
    }
}
