//! Recovery coordination for unclean shutdowns.
//!
//! When a tree opens a store whose last session did not close cleanly, it hands a
//! [`CleanupJob`] to a [`RecoveryCoordinator`]. The coordinator runs the job either
//! on a background worker or inline, and exposes its lifecycle through a
//! [`CleanupHandle`]:
//!
//! ```text
//! Idle -> Scheduled -> Running -> Complete
//!                              \-> Failed
//! ```
//!
//! Completion and failure are reported to the owning tree's monitor before the
//! handle leaves `Running`, so anything waiting on the handle observes the
//! monitor event first.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::storage::btree::TreeMonitor;
use crate::types::{Result, TreeError};

mod cleanup;

pub use cleanup::CrashCleanup;

const PROGRESS_INTERVAL: u64 = 1024;

/// Work scheduled on a [`RecoveryCoordinator`].
pub trait CleanupJob: Send + 'static {
    /// Short description used in logs.
    fn describe(&self) -> String;
    /// Runs the pass to completion, reporting through `progress`.
    fn run(&mut self, progress: &CleanupProgress) -> Result<()>;
}

/// Lifecycle of one cleanup pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum CleanupState {
    /// Created but not yet handed to a coordinator.
    Idle,
    /// Queued on a coordinator.
    Scheduled,
    /// Executing.
    Running,
    /// Finished without error.
    Complete,
    /// Aborted with an error.
    Failed,
}

/// Totals reported when a pass completes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Pages read by the pass.
    pub pages_visited: u64,
    /// Pointer slots zeroed.
    pub pointers_cleaned: u64,
    /// Wall-clock duration of the pass.
    pub duration_ms: u64,
}

/// Live counters of a running pass.
pub struct CleanupProgress {
    pages_visited: AtomicU64,
    pointers_cleaned: AtomicU64,
    monitor: Arc<dyn TreeMonitor>,
}

impl CleanupProgress {
    fn new(monitor: Arc<dyn TreeMonitor>) -> Self {
        Self {
            pages_visited: AtomicU64::new(0),
            pointers_cleaned: AtomicU64::new(0),
            monitor,
        }
    }

    /// Records one visited page.
    pub fn page_visited(&self) {
        let visited = self.pages_visited.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        if visited % PROGRESS_INTERVAL == 0 {
            self.monitor
                .cleanup_progress(visited, self.pointers_cleaned());
        }
    }

    /// Records `count` zeroed pointer slots.
    pub fn pointers_cleaned_by(&self, count: u64) {
        self.pointers_cleaned
            .fetch_add(count, AtomicOrdering::Relaxed);
    }

    /// Pages visited so far.
    pub fn pages_visited(&self) -> u64 {
        self.pages_visited.load(AtomicOrdering::Relaxed)
    }

    /// Pointer slots zeroed so far.
    pub fn pointers_cleaned(&self) -> u64 {
        self.pointers_cleaned.load(AtomicOrdering::Relaxed)
    }
}

enum Status {
    Idle,
    Scheduled,
    Running,
    Complete(CleanupReport),
    Failed(String),
}

impl Status {
    fn state(&self) -> CleanupState {
        match self {
            Status::Idle => CleanupState::Idle,
            Status::Scheduled => CleanupState::Scheduled,
            Status::Running => CleanupState::Running,
            Status::Complete(_) => CleanupState::Complete,
            Status::Failed(_) => CleanupState::Failed,
        }
    }
}

struct HandleInner {
    status: Status,
    history: Vec<CleanupState>,
}

struct HandleShared {
    inner: Mutex<HandleInner>,
    done: Condvar,
    progress: CleanupProgress,
}

/// Observer of one scheduled cleanup pass. Cloning shares the same pass.
///
/// Completion does not mark the store clean; the clean flag is written when
/// the tree closes.
#[derive(Clone)]
pub struct CleanupHandle {
    shared: Arc<HandleShared>,
}

impl CleanupHandle {
    fn new(monitor: Arc<dyn TreeMonitor>) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                inner: Mutex::new(HandleInner {
                    status: Status::Idle,
                    history: vec![CleanupState::Idle],
                }),
                done: Condvar::new(),
                progress: CleanupProgress::new(monitor),
            }),
        }
    }

    fn transition(&self, status: Status) {
        let mut inner = self.shared.inner.lock();
        let state = status.state();
        inner.status = status;
        inner.history.push(state);
        if matches!(state, CleanupState::Complete | CleanupState::Failed) {
            self.shared.done.notify_all();
        }
    }

    /// Current state.
    pub fn state(&self) -> CleanupState {
        self.shared.inner.lock().status.state()
    }

    /// Every state the pass has been in, oldest first.
    pub fn history(&self) -> Vec<CleanupState> {
        self.shared.inner.lock().history.clone()
    }

    /// Pages visited and pointers cleaned so far.
    pub fn progress(&self) -> (u64, u64) {
        let progress = &self.shared.progress;
        (progress.pages_visited(), progress.pointers_cleaned())
    }

    /// Blocks until the pass completes or fails.
    pub fn wait(&self) -> Result<CleanupReport> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(result) = Self::outcome(&inner.status) {
                return result;
            }
            self.shared.done.wait(&mut inner);
        }
    }

    /// Like [`CleanupHandle::wait`] but gives up after `timeout`, returning `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<CleanupReport>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(result) = Self::outcome(&inner.status) {
                return Some(result);
            }
            if self
                .shared
                .done
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return Self::outcome(&inner.status);
            }
        }
    }

    fn outcome(status: &Status) -> Option<Result<CleanupReport>> {
        match status {
            Status::Complete(report) => Some(Ok(*report)),
            Status::Failed(reason) => Some(Err(TreeError::RecoveryFailed(reason.clone()))),
            _ => None,
        }
    }
}

impl fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pages_visited, pointers_cleaned) = self.progress();
        f.debug_struct("CleanupHandle")
            .field("state", &self.state())
            .field("pages_visited", &pages_visited)
            .field("pointers_cleaned", &pointers_cleaned)
            .finish()
    }
}

/// Where cleanup jobs execute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// On a worker thread owned by the coordinator.
    #[default]
    Background,
    /// On the thread that schedules the job, before `schedule` returns.
    Immediate,
}

struct Task {
    job: Box<dyn CleanupJob>,
    handle: CleanupHandle,
    monitor: Arc<dyn TreeMonitor>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    worker_running: bool,
}

/// Runs cleanup passes for the trees that schedule them.
///
/// Cloning shares the same queue. In background mode a worker thread is spawned
/// when work arrives and exits once the queue drains.
#[derive(Clone)]
pub struct RecoveryCoordinator {
    mode: ExecutionMode,
    queue: Arc<Mutex<QueueState>>,
}

impl RecoveryCoordinator {
    /// Coordinator with the given execution mode.
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            queue: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Runs jobs on a background worker.
    pub fn background() -> Self {
        Self::new(ExecutionMode::Background)
    }

    /// Runs jobs inline on the scheduling thread.
    pub fn immediate() -> Self {
        Self::new(ExecutionMode::Immediate)
    }

    /// Configured execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Jobs queued but not yet started.
    pub fn pending(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Schedules `job`, reporting its lifecycle to `monitor`.
    pub fn schedule(
        &self,
        job: Box<dyn CleanupJob>,
        monitor: Arc<dyn TreeMonitor>,
    ) -> CleanupHandle {
        let handle = CleanupHandle::new(Arc::clone(&monitor));
        handle.transition(Status::Scheduled);
        monitor.cleanup_registered();
        info!(job = %job.describe(), mode = ?self.mode, "gentree.recovery.cleanup_scheduled");
        let task = Task {
            job,
            handle: handle.clone(),
            monitor,
        };
        match self.mode {
            ExecutionMode::Immediate => Self::run_task(task),
            ExecutionMode::Background => self.enqueue(task),
        }
        handle
    }

    fn enqueue(&self, task: Task) {
        let mut state = self.queue.lock();
        state.pending.push_back(task);
        if state.worker_running {
            return;
        }
        state.worker_running = true;
        drop(state);
        let queue = Arc::clone(&self.queue);
        let spawned = thread::Builder::new()
            .name("gentree-recovery-cleanup".into())
            .spawn(move || Self::worker_loop(queue));
        if let Err(err) = spawned {
            warn!(error = %err, "gentree.recovery.worker_spawn_failed; running inline");
            Self::worker_loop(Arc::clone(&self.queue));
        }
    }

    fn worker_loop(queue: Arc<Mutex<QueueState>>) {
        loop {
            let task = {
                let mut state = queue.lock();
                let Some(task) = state.pending.pop_front() else {
                    state.worker_running = false;
                    debug!("gentree.recovery.worker_exit");
                    break;
                };
                task
            };
            Self::run_task(task);
        }
    }

    fn run_task(task: Task) {
        let Task {
            mut job,
            handle,
            monitor,
        } = task;
        let description = job.describe();
        handle.transition(Status::Running);
        monitor.cleanup_started();
        info!(job = %description, "gentree.recovery.cleanup_started");
        let started = Instant::now();
        let progress = &handle.shared.progress;
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(progress)))
            .unwrap_or_else(|_| Err(TreeError::RecoveryFailed("cleanup job panicked".into())));
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                let report = CleanupReport {
                    pages_visited: progress.pages_visited(),
                    pointers_cleaned: progress.pointers_cleaned(),
                    duration_ms,
                };
                info!(
                    job = %description,
                    pages_visited = report.pages_visited,
                    pointers_cleaned = report.pointers_cleaned,
                    duration_ms,
                    "gentree.recovery.cleanup_finished"
                );
                monitor.cleanup_finished(
                    report.pages_visited,
                    report.pointers_cleaned,
                    report.duration_ms,
                );
                handle.transition(Status::Complete(report));
            }
            Err(err) => {
                error!(job = %description, error = %err, "gentree.recovery.cleanup_failed");
                monitor.cleanup_failed(&err);
                handle.transition(Status::Failed(err.to_string()));
            }
        }
    }
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("mode", &self.mode)
            .field("pending", &self.pending())
            .finish()
    }
}
