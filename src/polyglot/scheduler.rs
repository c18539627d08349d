//! Parallel Polyglot Scheduler
//!
//! Runs one dependency group at a time. Every block in the group already has
//! a variable snapshot (deep copies of its read set), so workers share
//! nothing with the host; writes become visible only in the sequential
//! source-order merge the interpreter performs afterwards.
//!
//! The pool is a fixed set of persistent slot threads, each owning its own
//! [`ExecutorSet`] — executor instances never migrate between threads. Work
//! reaches a slot over its channel; the slot hands its channel back when the
//! item finishes. On the first failure in a group the shared cancellation
//! token advances every sibling's effective deadline to now.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sandbox::SandboxHandle;
use crate::value::Value;

use super::block::Language;
use super::cache::CodeCache;
use super::executors::ExecutorSet;
use super::types::{CancelToken, ExecError, ExecJob};

/// Grace window past the deadline for straggler replies.
const COLLECT_GRACE: Duration = Duration::from_secs(1);

/// Idle receive timeout; lets slot threads notice pool shutdown.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// One block of a group, snapshot included.
pub struct GroupItem {
    /// Source-order index used for merge ordering and error selection
    pub index: usize,
    pub language: Language,
    pub source: String,
    pub bound: Vec<String>,
    /// Deep-copied read-set values, in bound order
    pub inputs: Vec<(String, Value)>,
}

struct WorkItem {
    item: GroupItem,
    job: ExecJob,
    reply: mpsc::Sender<(usize, Result<Value, ExecError>)>,
}

struct PoolShared {
    available: Mutex<VecDeque<mpsc::Sender<WorkItem>>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size pool of slot threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            available: Mutex::new(VecDeque::with_capacity(size)),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        for worker in 0..size {
            let (tx, rx) = mpsc::channel::<WorkItem>();
            shared
                .available
                .lock()
                .expect("pool lock poisoned")
                .push_back(tx.clone());
            let shared_for_worker = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("medley-worker-{}", worker))
                .spawn(move || worker_main(rx, tx, shared_for_worker))
                .expect("failed to spawn scheduler worker");
        }
        Self { shared, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Hand one work item to a free slot, waiting until `deadline`.
    fn dispatch(&self, work: WorkItem, deadline: Instant) -> Result<(), WorkItem> {
        let mut available = self.shared.available.lock().expect("pool lock poisoned");
        loop {
            if let Some(slot) = available.pop_front() {
                drop(available);
                return slot.send(work).map_err(|e| e.0);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(work);
            }
            let (guard, _timeout) = self
                .shared
                .cond
                .wait_timeout(available, remaining.min(IDLE_POLL))
                .expect("pool lock poisoned");
            available = guard;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
    }
}

fn worker_main(
    rx: mpsc::Receiver<WorkItem>,
    own_tx: mpsc::Sender<WorkItem>,
    shared: Arc<PoolShared>,
) {
    let mut executors = ExecutorSet::new();
    loop {
        let work = match rx.recv_timeout(IDLE_POLL) {
            Ok(work) => work,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let index = work.item.index;
        let result = run_item(&mut executors, &work.item, &work.job);
        // A dropped receiver means the group already failed; nothing to do.
        let _ = work.reply.send((index, result));

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        shared
            .available
            .lock()
            .expect("pool lock poisoned")
            .push_back(own_tx.clone());
        shared.cond.notify_one();
    }
    executors.shutdown_all();
}

fn run_item(
    executors: &mut ExecutorSet,
    item: &GroupItem,
    job: &ExecJob,
) -> Result<Value, ExecError> {
    if job.expired() {
        return Err(ExecError::Timeout {
            language: item.language,
            elapsed: Duration::ZERO,
        });
    }
    let executor = executors.get_or_create(item.language)?;
    let prepared = executor.prepare(&item.source, &item.bound, job)?;
    executor.execute(&prepared, &item.inputs, job)
}

/// The scheduler: lazily-built pool plus group orchestration.
pub struct Scheduler {
    pool: std::sync::OnceLock<WorkerPool>,
    max_workers: usize,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Self {
        Self { pool: std::sync::OnceLock::new(), max_workers }
    }

    fn pool(&self) -> &WorkerPool {
        self.pool.get_or_init(|| {
            let size = num_cpus::get().min(self.max_workers.max(1));
            tracing::debug!(workers = size, "starting polyglot worker pool");
            WorkerPool::new(size)
        })
    }

    /// Execute a group concurrently and collect every member's result,
    /// ordered by source index. On the first failure the remaining members
    /// are cancelled; their results (and any stragglers) are discarded by
    /// the caller, which fails the group with the lowest-index error.
    pub fn execute_group(
        &self,
        items: Vec<GroupItem>,
        sandbox: SandboxHandle,
        cache: Arc<CodeCache>,
    ) -> Vec<(usize, Result<Value, ExecError>)> {
        let expected = items.len();
        let cancel = CancelToken::new();
        let deadline = sandbox.config().deadline_from_now();
        let (reply_tx, reply_rx) = mpsc::channel();

        tracing::debug!(blocks = expected, "dispatching polyglot group");
        let mut results: Vec<(usize, Result<Value, ExecError>)> = Vec::with_capacity(expected);

        for item in items {
            let job = ExecJob {
                deadline,
                cancel: cancel.clone(),
                sandbox: sandbox.clone(),
                cache: Arc::clone(&cache),
            };
            let index = item.index;
            let language = item.language;
            let work = WorkItem { item, job, reply: reply_tx.clone() };
            if self.pool().dispatch(work, deadline).is_err() {
                cancel.cancel();
                results.push((
                    index,
                    Err(ExecError::Timeout { language, elapsed: Duration::ZERO }),
                ));
            }
        }
        drop(reply_tx);

        let hard_stop = deadline + COLLECT_GRACE;
        while results.len() < expected {
            let remaining = hard_stop.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match reply_rx.recv_timeout(remaining) {
                Ok((index, result)) => {
                    if result.is_err() {
                        // First failure cancels the rest of the group.
                        cancel.cancel();
                    }
                    results.push((index, result));
                }
                Err(_) => break,
            }
        }

        results.sort_by_key(|(index, _)| *index);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::sandbox::{SandboxConfig, SandboxStack};

    fn test_sandbox() -> SandboxHandle {
        let audit = Arc::new(AuditLog::ephemeral().unwrap());
        let config = SandboxConfig::elevated().with_allowed_command("/bin/sh");
        Arc::new(SandboxStack::new(config, audit)).handle()
    }

    fn shell_item(index: usize, source: &str) -> GroupItem {
        GroupItem {
            index,
            language: Language::Shell,
            source: source.to_string(),
            bound: Vec::new(),
            inputs: Vec::new(),
        }
    }

    #[test]
    fn test_group_results_in_source_order() {
        let scheduler = Scheduler::new(4);
        let cache = Arc::new(CodeCache::new(8).unwrap());
        // The slower block comes first in source order; ordering must hold
        // regardless of completion order.
        let items = vec![
            shell_item(0, "sleep 0.3; echo first"),
            shell_item(1, "echo second"),
            shell_item(2, "echo third"),
        ];
        let results = scheduler.execute_group(items, test_sandbox(), cache);
        assert_eq!(results.len(), 3);
        let indices: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(
            results[0].1.as_ref().unwrap(),
            &Value::string("first")
        );
    }

    #[test]
    fn test_group_runs_concurrently() {
        let scheduler = Scheduler::new(4);
        let cache = Arc::new(CodeCache::new(8).unwrap());
        let items = vec![
            shell_item(0, "sleep 0.4; echo a"),
            shell_item(1, "sleep 0.4; echo b"),
            shell_item(2, "sleep 0.4; echo c"),
        ];
        let started = Instant::now();
        let results = scheduler.execute_group(items, test_sandbox(), cache);
        let elapsed = started.elapsed();
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        // Three 0.4s blocks in parallel: nowhere near the 1.2s serial cost.
        assert!(
            elapsed < Duration::from_millis(1000),
            "group took {:?}, expected parallel execution",
            elapsed
        );
    }

    #[test]
    fn test_failure_cancels_siblings() {
        let scheduler = Scheduler::new(4);
        let cache = Arc::new(CodeCache::new(8).unwrap());
        let items = vec![
            shell_item(0, "exit 7"),
            shell_item(1, "sleep 20; echo survived"),
        ];
        let started = Instant::now();
        let results = scheduler.execute_group(items, test_sandbox(), cache);
        // The failing block reports; the sibling is cancelled well before
        // its sleep finishes.
        assert!(results.iter().any(|(_, r)| r.is_err()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_pool_size_is_bounded() {
        let scheduler = Scheduler::new(2);
        let cache = Arc::new(CodeCache::new(8).unwrap());
        // More items than workers still completes.
        let items: Vec<GroupItem> =
            (0..6).map(|i| shell_item(i, "echo ok")).collect();
        let results = scheduler.execute_group(items, test_sandbox(), cache);
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(scheduler.pool().size(), 2.min(num_cpus::get()));
    }
}
