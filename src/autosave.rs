//! # Autosave Controller
//!
//! Event- and time-driven loop that decides when to cut snapshots without
//! user involvement. Three mutually exclusive policies: a plain timer, a
//! diff-threshold check fed by a filesystem observer, and a hybrid of both.
//! Every successful trigger is followed by retention, which only ever
//! removes autosave snapshots.

use crate::config::{AutosaveConfig, AutosaveModeKind, RetentionConfig, STORAGE_DIR};
use crate::db::AutosaveState;
use crate::error::{EngineError, Result};
use crate::version::{CreateOptions, VersionManager, CURRENT_REF};
use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The hybrid loop wakes on a fixed cadence and decides from elapsed time.
const HYBRID_TICK: Duration = Duration::from_secs(60);

/// Observer signals are collapsed to at most one per second.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Granularity of the stop-flag poll inside worker sleeps.
const POLL: Duration = Duration::from_millis(250);

/// Resolved autosave policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutosaveMode {
    Timer {
        interval: Duration,
    },
    DiffThreshold {
        threshold: f64,
        check_interval: Duration,
    },
    Hybrid {
        min_interval: Duration,
        max_interval: Duration,
        threshold: f64,
    },
}

impl AutosaveMode {
    pub fn from_config(config: &AutosaveConfig) -> Self {
        match config.mode {
            AutosaveModeKind::Timer => AutosaveMode::Timer {
                interval: Duration::from_secs(config.timer.interval),
            },
            AutosaveModeKind::Diff => AutosaveMode::DiffThreshold {
                threshold: config.diff_threshold.threshold,
                check_interval: Duration::from_secs(config.diff_threshold.check_interval),
            },
            AutosaveModeKind::Hybrid => AutosaveMode::Hybrid {
                min_interval: Duration::from_secs(config.hybrid.min_interval),
                max_interval: Duration::from_secs(config.hybrid.max_interval),
                threshold: config.hybrid.threshold,
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AutosaveMode::Timer { .. } => "timer",
            AutosaveMode::DiffThreshold { .. } => "diff",
            AutosaveMode::Hybrid { .. } => "hybrid",
        }
    }

    fn needs_observer(&self) -> bool {
        !matches!(self, AutosaveMode::Timer { .. })
    }
}

/// Owns the background worker and the filesystem observer for one project.
pub struct AutosaveController {
    project_root: PathBuf,
    manager: Arc<VersionManager>,
    mode: AutosaveMode,
    retention: RetentionConfig,
    running: Arc<AtomicBool>,
    dirty: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

impl AutosaveController {
    pub fn new(manager: Arc<VersionManager>, mode: AutosaveMode, retention: RetentionConfig) -> Self {
        Self {
            project_root: manager.root().to_path_buf(),
            manager,
            mode,
            retention,
            running: Arc::new(AtomicBool::new(false)),
            dirty: Arc::new(AtomicBool::new(false)),
            worker: None,
            watcher: None,
        }
    }

    pub fn mode(&self) -> AutosaveMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the worker (and the observer for diff/hybrid modes).
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        if self.mode.needs_observer() {
            self.watcher = Some(self.spawn_observer()?);
        }

        let manager = Arc::clone(&self.manager);
        let running = Arc::clone(&self.running);
        let dirty = Arc::clone(&self.dirty);
        let mode = self.mode;
        let retention = self.retention.clone();
        let worker = std::thread::Builder::new()
            .name("autosave".into())
            .spawn(move || run_loop(manager, mode, retention, running, dirty))
            .map_err(|e| EngineError::Internal(e.into()))?;
        self.worker = Some(worker);

        info!(mode = self.mode.label(), root = %self.project_root.display(), "autosave started");
        Ok(())
    }

    /// Stops the worker and the observer. Blocks until the worker joins; an
    /// in-flight snapshot finishes its transaction first.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.watcher = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        info!(root = %self.project_root.display(), "autosave stopped");
    }

    fn spawn_observer(&self) -> Result<RecommendedWatcher> {
        let dirty = Arc::clone(&self.dirty);
        let storage_dir = self.project_root.join(STORAGE_DIR);
        // Debounce state lives entirely in the observer callback thread.
        let last_signal: Mutex<Option<Instant>> = Mutex::new(None);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let Ok(event) = res else { return };
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                // Directory events and anything under our own storage are
                // ignored; the latter would feed back on every snapshot.
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| !p.starts_with(&storage_dir) && !p.is_dir());
                if !relevant {
                    return;
                }
                let mut last = last_signal.lock().expect("debounce lock poisoned");
                let debounced = last.map(|t| t.elapsed() < DEBOUNCE).unwrap_or(false);
                if !debounced {
                    dirty.store(true, Ordering::SeqCst);
                    *last = Some(Instant::now());
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| EngineError::Internal(e.into()))?;

        watcher
            .watch(&self.project_root, RecursiveMode::Recursive)
            .map_err(|e| EngineError::Internal(e.into()))?;
        Ok(watcher)
    }
}

impl Drop for AutosaveController {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn run_loop(
    manager: Arc<VersionManager>,
    mode: AutosaveMode,
    retention: RetentionConfig,
    running: Arc<AtomicBool>,
    dirty: Arc<AtomicBool>,
) {
    match mode {
        AutosaveMode::Timer { interval } => {
            while sleep_while_running(&running, interval) {
                run_trigger(&manager, &retention, "timer");
            }
        }
        AutosaveMode::DiffThreshold {
            threshold,
            check_interval,
        } => {
            while sleep_while_running(&running, check_interval) {
                record_check(&manager);
                if !dirty.load(Ordering::SeqCst) {
                    continue;
                }
                match current_significance(&manager) {
                    Ok(significance) if significance >= threshold => {
                        if run_trigger(&manager, &retention, "diff_threshold") {
                            dirty.store(false, Ordering::SeqCst);
                        }
                    }
                    Ok(significance) => {
                        debug!(significance, threshold, "below autosave threshold")
                    }
                    Err(e) => warn!(error = %e, "autosave diff check failed"),
                }
            }
        }
        AutosaveMode::Hybrid {
            min_interval,
            max_interval,
            threshold,
        } => {
            let mut last_save = Instant::now();
            while sleep_while_running(&running, HYBRID_TICK) {
                record_check(&manager);
                let elapsed = last_save.elapsed();
                let significance = if dirty.load(Ordering::SeqCst) {
                    current_significance(&manager).unwrap_or(0.0)
                } else {
                    0.0
                };
                match hybrid_decision(
                    elapsed,
                    min_interval,
                    max_interval,
                    dirty.load(Ordering::SeqCst),
                    significance,
                    threshold,
                ) {
                    Some(trigger) => {
                        if run_trigger(&manager, &retention, trigger) {
                            dirty.store(false, Ordering::SeqCst);
                        }
                        // A NoChanges outcome still resets the clock; there
                        // is nothing to save until the tree moves again.
                        last_save = Instant::now();
                    }
                    None => {}
                }
            }
        }
    }
}

/// Pure hybrid policy: max-interval wins unconditionally, then the
/// threshold path requires min-interval, a dirty tree, and significance.
fn hybrid_decision(
    elapsed: Duration,
    min_interval: Duration,
    max_interval: Duration,
    dirty: bool,
    significance: f64,
    threshold: f64,
) -> Option<&'static str> {
    if elapsed >= max_interval {
        Some("hybrid_max_interval")
    } else if elapsed >= min_interval && dirty && significance >= threshold {
        Some("hybrid_threshold")
    } else {
        None
    }
}

/// Significance of the working tree against the latest snapshot. With no
/// snapshot yet, everything is significant.
fn current_significance(manager: &VersionManager) -> Result<f64> {
    let latest = manager.list_snapshots(Some(1), true)?;
    match latest.first() {
        Some(meta) => Ok(manager
            .diff(&meta.id.to_string(), CURRENT_REF, None)?
            .significance),
        None => Ok(1.0),
    }
}

fn record_check(manager: &VersionManager) {
    let mut state = manager.db().autosave_state().unwrap_or_default();
    state.last_check = Some(Utc::now());
    if let Err(e) = manager.db().update_autosave_state(&state) {
        warn!(error = %e, "failed to record autosave check");
    }
}

/// Cuts one autosave snapshot and applies retention. Failures are logged and
/// never stop the loop. Returns whether a snapshot was created.
fn run_trigger(manager: &VersionManager, retention: &RetentionConfig, trigger: &str) -> bool {
    let created = manager.create_snapshot(CreateOptions {
        message: Some(format!("Autosave ({trigger})")),
        is_autosave: true,
        trigger_type: Some(trigger.to_string()),
        ..Default::default()
    });

    let snapshot = match created {
        Ok(snapshot) => snapshot,
        Err(EngineError::NoChanges) => {
            debug!(trigger, "autosave skipped: no changes");
            return false;
        }
        Err(e) => {
            warn!(trigger, error = %e, "autosave trigger failed");
            return false;
        }
    };
    info!(id = snapshot.meta.id, trigger, "autosave snapshot created");

    match manager.cleanup_old_autosaves(retention.max_autosaves) {
        Ok(0) => {}
        Ok(n) => debug!(deleted = n, "autosave retention pruned snapshots"),
        Err(e) => warn!(error = %e, "autosave retention failed"),
    }
    if retention.delete_after_days > 0 {
        if let Err(e) = manager.cleanup_expired_autosaves(retention.delete_after_days) {
            warn!(error = %e, "expired-autosave cleanup failed");
        }
    }

    let state = AutosaveState {
        last_check: Some(Utc::now()),
        last_save: Some(Utc::now()),
        last_snapshot_id: Some(snapshot.meta.id),
        files_tracked: snapshot.meta.files_count,
    };
    if let Err(e) = manager.db().update_autosave_state(&state) {
        warn!(error = %e, "failed to record autosave state");
    }
    true
}

/// Sleeps up to `duration`, polling the stop flag. Returns false when the
/// controller was stopped during the wait.
fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return running.load(Ordering::SeqCst);
        }
        std::thread::sleep(POLL.min(remaining));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use std::fs;

    fn manager(root: &std::path::Path) -> Arc<VersionManager> {
        Arc::new(VersionManager::open(root, ProjectConfig::default()).unwrap())
    }

    #[test]
    fn hybrid_decision_table() {
        let min = Duration::from_secs(120);
        let max = Duration::from_secs(1800);

        // past max: unconditional
        assert_eq!(
            hybrid_decision(Duration::from_secs(1800), min, max, false, 0.0, 0.5),
            Some("hybrid_max_interval")
        );
        // between min and max, dirty + significant
        assert_eq!(
            hybrid_decision(Duration::from_secs(300), min, max, true, 0.6, 0.5),
            Some("hybrid_threshold")
        );
        // clean tree never triggers the threshold path
        assert_eq!(
            hybrid_decision(Duration::from_secs(300), min, max, false, 0.9, 0.5),
            None
        );
        // below min interval
        assert_eq!(
            hybrid_decision(Duration::from_secs(60), min, max, true, 0.9, 0.5),
            None
        );
        // below threshold
        assert_eq!(
            hybrid_decision(Duration::from_secs(300), min, max, true, 0.3, 0.5),
            None
        );
    }

    #[test]
    fn trigger_applies_retention_and_spares_manual() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("w.txt"), "v0").unwrap();
        let vm = manager(dir.path());

        // one manual snapshot first
        vm.create_snapshot(CreateOptions {
            message: Some("manual".into()),
            ..Default::default()
        })
        .unwrap();

        let retention = RetentionConfig {
            max_autosaves: 2,
            ..Default::default()
        };
        for i in 0..4 {
            fs::write(dir.path().join("w.txt"), format!("v{i}")).unwrap();
            assert!(run_trigger(&vm, &retention, "timer"));
        }

        let (manual, auto) = vm.db().snapshot_counts().unwrap();
        assert_eq!(manual, 1);
        assert!(auto <= 2);

        let state = vm.db().autosave_state().unwrap();
        assert!(state.last_save.is_some());
        assert!(state.last_snapshot_id.is_some());
    }

    #[test]
    fn trigger_on_unchanged_tree_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("w.txt"), "stable").unwrap();
        let vm = manager(dir.path());

        let retention = RetentionConfig::default();
        assert!(run_trigger(&vm, &retention, "timer"));
        assert!(!run_trigger(&vm, &retention, "timer"));
        assert_eq!(vm.list_snapshots(None, true).unwrap().len(), 1);
    }

    #[test]
    fn significance_is_full_without_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("w.txt"), "x").unwrap();
        let vm = manager(dir.path());
        assert_eq!(current_significance(&vm).unwrap(), 1.0);
    }

    #[test]
    fn controller_start_stop_joins_promptly() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("w.txt"), "x").unwrap();
        let vm = manager(dir.path());

        let mut controller = AutosaveController::new(
            vm,
            AutosaveMode::Timer {
                interval: Duration::from_secs(3600),
            },
            RetentionConfig::default(),
        );
        controller.start().unwrap();
        assert!(controller.is_running());

        let started = Instant::now();
        controller.stop();
        assert!(!controller.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn mode_from_config() {
        let mut config = crate::config::AutosaveConfig::default();
        config.mode = AutosaveModeKind::Timer;
        config.timer.interval = 42;
        assert_eq!(
            AutosaveMode::from_config(&config),
            AutosaveMode::Timer {
                interval: Duration::from_secs(42)
            }
        );
        config.mode = AutosaveModeKind::Diff;
        assert_eq!(AutosaveMode::from_config(&config).label(), "diff");
        config.mode = AutosaveModeKind::Hybrid;
        assert!(AutosaveMode::from_config(&config).needs_observer());
    }
}
