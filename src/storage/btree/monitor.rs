use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::TreeError;

/// Observer of tree lifecycle and recovery events.
///
/// Every method has an empty default so implementations only override what they
/// report. Callbacks run on the thread that produced the event, which for cleanup
/// events is usually the recovery worker; keep them short.
pub trait TreeMonitor: Send + Sync {
    /// A store file was created because none existed.
    fn no_store_file(&self) {}

    /// An existing store was opened; `clean` is false after a crash.
    fn startup_state(&self, clean: bool) {
        let _ = clean;
    }

    /// A checkpoint published generation `stable`.
    fn checkpoint_completed(&self, stable: u64) {
        let _ = stable;
    }

    /// A cleanup pass was scheduled.
    fn cleanup_registered(&self) {}

    /// The scheduled cleanup pass began running.
    fn cleanup_started(&self) {}

    /// Periodic progress from a running cleanup pass.
    fn cleanup_progress(&self, pages_visited: u64, pointers_cleaned: u64) {
        let _ = (pages_visited, pointers_cleaned);
    }

    /// A cleanup pass completed. Called exactly once per completed pass.
    fn cleanup_finished(&self, pages_visited: u64, pointers_cleaned: u64, duration_ms: u64) {
        let _ = (pages_visited, pointers_cleaned, duration_ms);
    }

    /// A cleanup pass aborted.
    fn cleanup_failed(&self, error: &TreeError) {
        let _ = error;
    }
}

/// Monitor that ignores every event.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopMonitor;

impl TreeMonitor for NoopMonitor {}

/// Monitor that counts events.
#[derive(Default, Debug)]
pub struct CounterMonitor {
    /// Completed checkpoints.
    pub checkpoints: AtomicU64,
    /// Opens that found an unclean shutdown.
    pub unclean_starts: AtomicU64,
    /// Cleanup passes that completed.
    pub cleanups_finished: AtomicU64,
    /// Cleanup passes that failed.
    pub cleanups_failed: AtomicU64,
    /// Crash pointers cleaned across all passes.
    pub pointers_cleaned: AtomicU64,
}

impl TreeMonitor for CounterMonitor {
    fn startup_state(&self, clean: bool) {
        if !clean {
            self.unclean_starts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn checkpoint_completed(&self, _stable: u64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    fn cleanup_finished(&self, _pages_visited: u64, pointers_cleaned: u64, _duration_ms: u64) {
        self.cleanups_finished.fetch_add(1, Ordering::Relaxed);
        self.pointers_cleaned
            .fetch_add(pointers_cleaned, Ordering::Relaxed);
    }

    fn cleanup_failed(&self, _error: &TreeError) {
        self.cleanups_failed.fetch_add(1, Ordering::Relaxed);
    }
}
