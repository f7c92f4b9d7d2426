//! Work stealing for load balancing across worker threads.
//!
//! Every worker owns a local queue. An idle worker first drains the tasks
//! tied to it, then its local queue, then steals from a random victim.
//! Tied tasks live in a separate per-worker queue that is never stolen from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use super::policy::SchedulePolicy;
use super::queue::TaskQueue;
use super::task::{WorkDescriptor, WorkerId};

/// Statistics about work stealing operations.
#[derive(Debug, Default)]
pub struct StealStats {
    /// Number of successful steals.
    pub steal_successes: AtomicUsize,
    /// Number of failed steal attempts.
    pub steal_failures: AtomicUsize,
    /// Total number of steal attempts.
    pub total_attempts: AtomicUsize,
}

impl StealStats {
    #[inline]
    pub fn record_success(&self) {
        self.steal_successes.fetch_add(1, Ordering::SeqCst);
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.steal_failures.fetch_add(1, Ordering::SeqCst);
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Fraction of attempts that found a task.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_attempts.load(Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        let successes = self.steal_successes.load(Ordering::SeqCst);
        successes as f64 / total as f64
    }
}

/// Strategy for stealing tasks from other workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StealStrategy {
    /// Steal from the back of victim's queue (reduces contention).
    #[default]
    Back,
    /// Steal from the front of victim's queue (FIFO).
    Front,
    /// Randomly choose between front and back.
    Random,
}

/// Work-stealing scheduling policy.
#[derive(Debug)]
pub struct WorkStealingPolicy {
    local: Vec<TaskQueue>,
    tied: Vec<TaskQueue>,
    strategy: StealStrategy,
    stats: Arc<StealStats>,
    /// Next local queue for tasks queued from outside the workers
    round_robin: AtomicUsize,
    rng_state: AtomicUsize,
}

impl WorkStealingPolicy {
    pub fn new(num_workers: usize) -> Self {
        let n = num_workers.max(1);
        Self {
            local: (0..n).map(|_| TaskQueue::new()).collect(),
            tied: (0..n).map(|_| TaskQueue::new()).collect(),
            strategy: StealStrategy::Back,
            stats: Arc::new(StealStats::default()),
            round_robin: AtomicUsize::new(0),
            rng_state: AtomicUsize::new(1),
        }
    }

    pub fn with_strategy(
        mut self,
        strategy: StealStrategy,
    ) -> Self {
        self.strategy = strategy;
        self
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.local.len()
    }

    #[inline]
    pub fn stats(&self) -> &Arc<StealStats> {
        &self.stats
    }

    /// Tasks sitting in `worker`'s local queue.
    pub fn local_len(
        &self,
        worker: WorkerId,
    ) -> usize {
        self.local.get(worker.0).map_or(0, TaskQueue::len)
    }

    /// Steal one task from a random victim other than `thief`.
    pub fn steal_random(
        &self,
        thief: WorkerId,
    ) -> Option<Arc<WorkDescriptor>> {
        let num_workers = self.num_workers();
        if num_workers < 2 {
            return None;
        }

        // Bounded so an empty system does not spin here
        let max_attempts = num_workers.min(8);
        for _ in 0..max_attempts {
            let victim = self.random_worker(thief);
            if let Some(wd) = self.steal_from(victim) {
                tracing::trace!("{} stole {} from Worker({})", thief, wd.id(), victim);
                self.stats.record_success();
                return Some(wd);
            }
        }

        // Random victims may all miss while one queue still holds work
        for victim in (0..num_workers).filter(|&v| v != thief.0) {
            if let Some(wd) = self.steal_from(victim) {
                self.stats.record_success();
                return Some(wd);
            }
        }

        self.stats.record_failure();
        None
    }

    fn steal_from(
        &self,
        victim: usize,
    ) -> Option<Arc<WorkDescriptor>> {
        let queue = self.local.get(victim)?;
        match self.strategy {
            StealStrategy::Back => queue.pop_back(),
            StealStrategy::Front => queue.pop_front(),
            StealStrategy::Random => {
                if self.next_rand() % 2 == 0 {
                    queue.pop_back()
                } else {
                    queue.pop_front()
                }
            },
        }
    }

    /// Random worker different from `thief`.
    #[inline]
    fn random_worker(
        &self,
        thief: WorkerId,
    ) -> usize {
        let num_workers = self.num_workers();
        let mut rng = self.next_rand();
        let mut victim = rng % num_workers;
        while victim == thief.0 && num_workers > 1 {
            rng = rng.wrapping_add(12345);
            victim = rng % num_workers;
        }
        victim
    }

    /// Simple LCG random number generator.
    #[inline]
    fn next_rand(&self) -> usize {
        let state = self.rng_state.fetch_add(1, Ordering::SeqCst);
        state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407)
            >> 16
    }
}

impl Default for WorkStealingPolicy {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(num_cpus)
    }
}

impl SchedulePolicy for WorkStealingPolicy {
    fn queue(
        &self,
        worker: Option<WorkerId>,
        wd: Arc<WorkDescriptor>,
    ) {
        let n = self.num_workers();
        if let Some(owner) = wd.tied_to() {
            self.tied[owner.0 % n].push(wd);
            return;
        }
        let target = match worker {
            Some(w) if w.0 < n => w.0,
            _ => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        };
        self.local[target].push(wd);
    }

    fn at_idle(
        &self,
        worker: WorkerId,
    ) -> Option<Arc<WorkDescriptor>> {
        let own = worker.0 % self.num_workers();
        self.tied[own]
            .pop_front()
            .or_else(|| self.local[own].pop_front())
            .or_else(|| self.steal_random(WorkerId(own)))
    }

    fn num_ready(&self) -> usize {
        self.local.iter().chain(self.tied.iter()).map(TaskQueue::len).sum()
    }
}
