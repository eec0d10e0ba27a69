//! Background WAL checkpointing.
//!
//! Every commit on the primary handle runs the WAL hook. Once the log holds
//! at least `wal_threshold_pages` pages the hook marks a checkpoint as
//! pending and wakes the worker. The worker runs a passive checkpoint on its
//! own secondary handle so the committing thread never waits for the copy
//! back into the database file.
//!
//! Signals coalesce: however many commits happen while a pass is pending or
//! running, at most one more pass follows.

use crate::{diagnostics, ffi};
use projectdb_core::{
    CheckpointError, CheckpointErrorKind, CheckpointPolicy, Project, SharedErrorState,
    is_busy_code,
};
use serde::Serialize;
use std::ffi::{c_char, c_int, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Invoked on the project's owning thread after a checkpoint failure.
pub type CheckpointFailureCallback = Arc<dyn Fn() + Send + Sync>;

/// Where the worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPhase {
    /// Waiting for a commit to cross the threshold
    Idle,
    /// A pass was requested and has not started
    Pending,
    /// A pass is running
    Active,
    /// The worker has been told to exit
    Stopping,
}

/// Result of one checkpoint call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointAttempt {
    Done,
    /// A reader or writer held a conflicting lock
    Busy,
    Failed { code: i32, message: String },
}

/// Something the worker can checkpoint.
///
/// The worker owns its target for its whole life and drops it on exit.
pub trait CheckpointTarget: Send + 'static {
    fn checkpoint(&mut self) -> CheckpointAttempt;
}

/// Counters kept by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    /// Passes that completed
    pub passes: u64,
    /// Busy results seen, across all passes
    pub busy_retries: u64,
    /// Passes given up after exhausting retries or on shutdown
    pub abandoned: u64,
    /// Passes that ended in an engine failure
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    busy_retries: AtomicU64,
    abandoned: AtomicU64,
    failures: AtomicU64,
}

struct State {
    phase: CheckpointPhase,
    /// A commit crossed the threshold while a pass was running
    rearmed: bool,
}

/// State shared between the hook, the worker and the owning connection.
pub(crate) struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    /// Held around each checkpoint call and by mode switches on the primary
    gate: Mutex<()>,
    threshold: u32,
    counters: Counters,
    target_released: AtomicBool,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a pass. Never blocks beyond the brief state lock.
    fn signal(&self) {
        let mut state = self.lock_state();
        match state.phase {
            CheckpointPhase::Idle => state.phase = CheckpointPhase::Pending,
            CheckpointPhase::Active => state.rearmed = true,
            CheckpointPhase::Pending | CheckpointPhase::Stopping => return,
        }
        drop(state);
        self.wake.notify_all();
    }

    fn is_stopping(&self) -> bool {
        self.lock_state().phase == CheckpointPhase::Stopping
    }
}

/// WAL hook installed on the primary handle.
///
/// # Safety
/// `data` must point to the `Shared` of a live `CheckpointCoordinator`.
pub(crate) unsafe extern "C" fn wal_commit_hook(
    data: *mut c_void,
    _db: *mut ffi::sqlite3,
    _schema: *const c_char,
    pages: c_int,
) -> c_int {
    // SAFETY: the connection uninstalls the hook before the coordinator
    // (and with it the last strong reference to Shared) is dropped.
    let shared = unsafe { &*data.cast::<Shared>() };
    if u32::try_from(pages).is_ok_and(|p| p >= shared.threshold) {
        shared.signal();
    }
    ffi::SQLITE_OK
}

/// Records a failed pass and schedules the owner's callback.
pub struct FailureNotifier {
    project: Weak<Project>,
    callback: Option<CheckpointFailureCallback>,
    errors: SharedErrorState,
    diagnostic_lines: usize,
    label: String,
}

impl FailureNotifier {
    pub fn new(
        project: Weak<Project>,
        callback: Option<CheckpointFailureCallback>,
        errors: SharedErrorState,
        diagnostic_lines: usize,
        label: impl Into<String>,
    ) -> Self {
        Self {
            project,
            callback,
            errors,
            diagnostic_lines,
            label: label.into(),
        }
    }

    fn notify(&self, code: i32, engine_message: &str) {
        let error = checkpoint_error(&self.label, code);
        let log = diagnostics::recent(self.diagnostic_lines);
        self.errors
            .set(error.message.clone(), engine_message, Some(code), log);
        diagnostics::record(format!("{error}: {engine_message}"));
        tracing::warn!(
            label = %self.label,
            code,
            engine_message,
            disk_full = error.kind == CheckpointErrorKind::DiskFull,
            "checkpoint failed"
        );

        let Some(callback) = &self.callback else {
            return;
        };
        match self.project.upgrade() {
            Some(project) => {
                let callback = Arc::clone(callback);
                project.call_after(move || callback());
            }
            None => tracing::debug!(label = %self.label, "project gone; failure callback dropped"),
        }
    }
}

fn checkpoint_error(label: &str, code: i32) -> CheckpointError {
    if code & 0xff == ffi::SQLITE_FULL {
        CheckpointError {
            kind: CheckpointErrorKind::DiskFull,
            message: format!("Disk is full; could not checkpoint {label}"),
            engine_code: Some(code),
        }
    } else {
        CheckpointError {
            kind: CheckpointErrorKind::Engine,
            message: format!("Failed to checkpoint {label}"),
            engine_code: Some(code),
        }
    }
}

enum PassOutcome {
    Completed,
    Abandoned,
    Failed { code: i32, message: String },
}

/// Owns the worker thread and the state it shares with the WAL hook.
pub struct CheckpointCoordinator {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    policy: CheckpointPolicy,
}

impl CheckpointCoordinator {
    /// Spawn the worker. It idles until the first signal.
    pub fn start(
        target: Box<dyn CheckpointTarget>,
        threshold: u32,
        policy: CheckpointPolicy,
        notifier: FailureNotifier,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: CheckpointPhase::Idle,
                rearmed: false,
            }),
            wake: Condvar::new(),
            gate: Mutex::new(()),
            threshold: threshold.max(1),
            counters: Counters::default(),
            target_released: AtomicBool::new(false),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let policy = policy.clone();
            thread::Builder::new()
                .name("projectdb-checkpoint".to_string())
                .spawn(move || run(&shared, target, &policy, &notifier))?
        };
        tracing::debug!(threshold, "checkpoint worker started");
        Ok(Self {
            shared,
            worker: Some(worker),
            policy,
        })
    }

    /// Request a pass, exactly as a commit over the threshold would.
    pub fn signal(&self) {
        self.shared.signal();
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.shared.lock_state().phase
    }

    pub fn stats(&self) -> CheckpointStats {
        let c = &self.shared.counters;
        CheckpointStats {
            passes: c.passes.load(Ordering::Relaxed),
            busy_retries: c.busy_retries.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Whether the worker still owns its target.
    pub fn holds_target(&self) -> bool {
        !self.shared.target_released.load(Ordering::Acquire)
    }

    /// Run `f` while no checkpoint call is in flight.
    pub fn quiesce<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.shared.gate.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Wait until no pass is pending or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        loop {
            match state.phase {
                CheckpointPhase::Idle | CheckpointPhase::Stopping => return true,
                CheckpointPhase::Pending | CheckpointPhase::Active => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop the worker and join it. Idempotent.
    ///
    /// With `drain_on_close` a pending or running pass may finish first,
    /// bounded by `drain_timeout_ms`. Returns false if the worker panicked.
    pub fn shutdown(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        if self.policy.drain_on_close && !self.wait_idle(self.policy.drain_timeout()) {
            tracing::warn!(
                timeout_ms = self.policy.drain_timeout_ms,
                "checkpoint drain timed out; stopping worker"
            );
        }
        self.shared.lock_state().phase = CheckpointPhase::Stopping;
        self.shared.wake.notify_all();
        match worker.join() {
            Ok(()) => {
                tracing::debug!(stats = ?self.stats(), "checkpoint worker stopped");
                true
            }
            Err(_) => {
                tracing::error!("checkpoint worker panicked");
                false
            }
        }
    }

    /// Pointer handed to `sqlite3_wal_hook`.
    pub(crate) fn hook_data(&self) -> *mut c_void {
        Arc::as_ptr(&self.shared).cast_mut().cast()
    }
}

impl Drop for CheckpointCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("phase", &self.phase())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn run(
    shared: &Shared,
    mut target: Box<dyn CheckpointTarget>,
    policy: &CheckpointPolicy,
    notifier: &FailureNotifier,
) {
    loop {
        {
            let mut state = shared.lock_state();
            while state.phase == CheckpointPhase::Idle {
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.phase == CheckpointPhase::Stopping {
                break;
            }
            state.phase = CheckpointPhase::Active;
            state.rearmed = false;
        }
        shared.wake.notify_all();

        let outcome = run_pass(shared, target.as_mut(), policy);

        {
            let mut state = shared.lock_state();
            if state.phase == CheckpointPhase::Active {
                state.phase = if state.rearmed {
                    CheckpointPhase::Pending
                } else {
                    CheckpointPhase::Idle
                };
                state.rearmed = false;
            }
        }
        shared.wake.notify_all();

        if let PassOutcome::Failed { code, message } = outcome {
            notifier.notify(code, &message);
        }
    }
    drop(target);
    shared.target_released.store(true, Ordering::Release);
}

fn run_pass(shared: &Shared, target: &mut dyn CheckpointTarget, policy: &CheckpointPolicy) -> PassOutcome {
    let counters = &shared.counters;
    let mut busy = 0_u32;
    loop {
        let attempt = {
            let _gate = shared.gate.lock().unwrap_or_else(PoisonError::into_inner);
            target.checkpoint()
        };
        match attempt {
            CheckpointAttempt::Done => {
                counters.passes.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(busy, "checkpoint pass complete");
                return PassOutcome::Completed;
            }
            CheckpointAttempt::Busy => {
                counters.busy_retries.fetch_add(1, Ordering::Relaxed);
                if busy >= policy.max_busy_retries || shared.is_stopping() {
                    counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(busy, "checkpoint pass abandoned while busy");
                    return PassOutcome::Abandoned;
                }
                busy += 1;
                thread::sleep(policy.backoff(busy));
            }
            CheckpointAttempt::Failed { code, message } => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                return PassOutcome::Failed { code, message };
            }
        }
    }
}

/// Passive checkpoints over the secondary handle.
pub struct WalCheckpointer {
    db: NonNull<ffi::sqlite3>,
}

// SAFETY: the handle is opened in serialized mode and only the worker
// thread uses it after construction.
unsafe impl Send for WalCheckpointer {}

impl WalCheckpointer {
    /// Take ownership of an open handle; it is closed on drop.
    ///
    /// # Safety
    /// `db` must be an open handle that nothing else will close.
    pub(crate) unsafe fn from_raw(db: NonNull<ffi::sqlite3>) -> Self {
        Self { db }
    }
}

impl CheckpointTarget for WalCheckpointer {
    fn checkpoint(&mut self) -> CheckpointAttempt {
        // SAFETY: db is open; a null schema checkpoints every attached database
        let rc = unsafe {
            ffi::sqlite3_wal_checkpoint_v2(
                self.db.as_ptr(),
                std::ptr::null(),
                ffi::SQLITE_CHECKPOINT_PASSIVE,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc == ffi::SQLITE_OK {
            CheckpointAttempt::Done
        } else if is_busy_code(rc) {
            CheckpointAttempt::Busy
        } else {
            // SAFETY: db is open
            let (message, _) = unsafe { ffi::last_error(self.db.as_ptr()) };
            CheckpointAttempt::Failed { code: rc, message }
        }
    }
}

impl Drop for WalCheckpointer {
    fn drop(&mut self) {
        // SAFETY: the worker never prepares statements on this handle, so a
        // plain close cannot be refused for unfinalized statements.
        let rc = unsafe { ffi::sqlite3_close(self.db.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            tracing::warn!(rc, "checkpoint handle close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projectdb_core::ErrorState;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Plays back a fixed script of attempts, then reports `Done`.
    struct Scripted {
        script: VecDeque<CheckpointAttempt>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<CheckpointAttempt>, calls: &Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                script: script.into(),
                calls: Arc::clone(calls),
                delay: Duration::ZERO,
            })
        }
    }

    impl CheckpointTarget for Scripted {
        fn checkpoint(&mut self) -> CheckpointAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.script.pop_front().unwrap_or(CheckpointAttempt::Done)
        }
    }

    fn quick_policy() -> CheckpointPolicy {
        CheckpointPolicy {
            max_busy_retries: 3,
            busy_backoff_ms: 1,
            max_backoff_ms: 2,
            drain_on_close: true,
            drain_timeout_ms: 5_000,
        }
    }

    fn notifier(project: &Arc<Project>, fired: &Arc<AtomicUsize>) -> (FailureNotifier, SharedErrorState) {
        let errors = ErrorState::shared();
        let fired = Arc::clone(fired);
        let callback: CheckpointFailureCallback = Arc::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        let notifier = FailureNotifier::new(
            Arc::downgrade(project),
            Some(callback),
            Arc::clone(&errors),
            5,
            "test.db",
        );
        (notifier, errors)
    }

    #[test]
    fn signal_runs_one_pass() {
        let project = Project::new("signal");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, _) = notifier(&project, &fired);
        let mut coordinator =
            CheckpointCoordinator::start(Scripted::new(vec![], &calls), 1, quick_policy(), n).unwrap();

        assert_eq!(coordinator.phase(), CheckpointPhase::Idle);
        coordinator.signal();
        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        assert!(coordinator.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().passes, 1);
        assert!(!coordinator.holds_target());
    }

    #[test]
    fn signals_during_a_pass_coalesce_into_one_more() {
        let project = Project::new("coalesce");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, _) = notifier(&project, &fired);
        let mut target = Scripted::new(vec![], &calls);
        target.delay = Duration::from_millis(50);
        let mut coordinator = CheckpointCoordinator::start(target, 1, quick_policy(), n).unwrap();

        coordinator.signal();
        while coordinator.phase() != CheckpointPhase::Active {
            thread::yield_now();
        }
        for _ in 0..20 {
            coordinator.signal();
        }
        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        coordinator.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn busy_retries_then_succeeds() {
        let project = Project::new("busy");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, errors) = notifier(&project, &fired);
        let script = vec![CheckpointAttempt::Busy, CheckpointAttempt::Busy];
        let mut coordinator =
            CheckpointCoordinator::start(Scripted::new(script, &calls), 1, quick_policy(), n).unwrap();

        coordinator.signal();
        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        coordinator.shutdown();
        let stats = coordinator.stats();
        assert_eq!(stats.busy_retries, 2);
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.abandoned, 0);
        assert!(errors.snapshot().is_empty());
    }

    #[test]
    fn exhausted_busy_pass_is_abandoned_silently() {
        let project = Project::new("abandon");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, errors) = notifier(&project, &fired);
        let script = vec![CheckpointAttempt::Busy; 10];
        let mut coordinator =
            CheckpointCoordinator::start(Scripted::new(script, &calls), 1, quick_policy(), n).unwrap();

        coordinator.signal();
        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        let stats = coordinator.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.busy_retries, 4);
        assert_eq!(stats.failures, 0);
        assert!(errors.snapshot().is_empty());
        assert_eq!(project.pending_calls(), 0);

        // The next request starts a fresh pass.
        coordinator.signal();
        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        coordinator.shutdown();
        assert_eq!(coordinator.stats().abandoned, 2);
    }

    #[test]
    fn failure_records_error_and_defers_callback() {
        let project = Project::new("failure");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, errors) = notifier(&project, &fired);
        let script = vec![CheckpointAttempt::Failed {
            code: ffi::SQLITE_FULL,
            message: "database or disk is full".to_string(),
        }];
        let mut coordinator =
            CheckpointCoordinator::start(Scripted::new(script, &calls), 1, quick_policy(), n).unwrap();

        coordinator.signal();
        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        coordinator.shutdown();

        let snapshot = errors.snapshot();
        assert!(snapshot.message.starts_with("Disk is full"));
        assert_eq!(snapshot.engine_code, Some(ffi::SQLITE_FULL));
        assert_eq!(coordinator.stats().failures, 1);

        // Not run on the worker; only when the owner dispatches.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(project.dispatch_pending(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_keeps_serving_after_failures() {
        let project = Project::new("resilient");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, errors) = notifier(&project, &fired);
        let failed = || CheckpointAttempt::Failed {
            code: ffi::SQLITE_ERROR,
            message: "disk I/O error".to_string(),
        };
        let script = vec![failed(), failed(), CheckpointAttempt::Done];
        let mut coordinator =
            CheckpointCoordinator::start(Scripted::new(script, &calls), 1, quick_policy(), n).unwrap();

        for _ in 0..3 {
            coordinator.signal();
            assert!(coordinator.wait_idle(Duration::from_secs(5)));
            assert_eq!(coordinator.phase(), CheckpointPhase::Idle);
        }
        coordinator.shutdown();

        let stats = coordinator.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.passes, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.message(), "Failed to checkpoint test.db");

        // One callback per failure, none of them run by the worker.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(project.dispatch_pending(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn other_failures_use_generic_message() {
        let err = checkpoint_error("p.db", ffi::SQLITE_ERROR);
        assert_eq!(err.kind, CheckpointErrorKind::Engine);
        assert_eq!(err.message, "Failed to checkpoint p.db");
        let full = checkpoint_error("p.db", ffi::SQLITE_FULL);
        assert_eq!(full.kind, CheckpointErrorKind::DiskFull);
    }

    #[test]
    fn shutdown_without_signal_joins_promptly() {
        let project = Project::new("idle");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, _) = notifier(&project, &fired);
        let mut coordinator =
            CheckpointCoordinator::start(Scripted::new(vec![], &calls), 1, quick_policy(), n).unwrap();
        assert!(coordinator.shutdown());
        assert!(coordinator.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.phase(), CheckpointPhase::Stopping);
    }

    #[test]
    fn shutdown_drains_pending_pass() {
        let project = Project::new("drain");
        let calls = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let (n, _) = notifier(&project, &fired);
        let mut target = Scripted::new(vec![], &calls);
        target.delay = Duration::from_millis(20);
        let mut coordinator = CheckpointCoordinator::start(target, 1, quick_policy(), n).unwrap();
        coordinator.signal();
        assert!(coordinator.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
