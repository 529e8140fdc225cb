//! Incremental revalidation on file changes
//!
//! The coordinator runs as a background task driven by a small state
//! machine:
//!
//! ```text
//! Idle -> Debouncing -> Computing -> Invalidating -> Dispatching -> Idle
//! ```
//!
//! Change notifications arriving while debouncing restart the quiet period,
//! so a burst of file events becomes one cycle. Notifications arriving during
//! a cycle stay queued and start the next one. Within a cycle every affected
//! entry is invalidated before any package is re-dispatched.

use crate::batch::{BatchOrchestrator, TaskOutcome};
use crate::cache::{normalize_path, CacheValue};
use crate::config::{BatchConfig, WatchConfig};
use crate::error::{ModcheckError, ModcheckResult};
use crate::monitor::{OpKind, OpMetadata, OpResult};
use crate::package::{DependencyGraph, PackageId};
use crate::pipeline::ValidationPipeline;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REPORT_CHANNEL_CAPACITY: usize = 16;

/// Where the coordinator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Debouncing,
    Computing,
    Invalidating,
    Dispatching,
    /// The background task has exited
    Stopped,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Debouncing => "debouncing",
            Self::Computing => "computing",
            Self::Invalidating => "invalidating",
            Self::Dispatching => "dispatching",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of revalidating one package in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PackageOutcome<R> {
    Valid { result: R, cached: bool },
    Failed(String),
    /// Not started because the coordinator was shutting down
    Cancelled,
}

/// Completion event of one invalidation and revalidation cycle
#[derive(Debug, Clone)]
pub struct CycleReport<R> {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Changed paths coalesced into this cycle
    pub changed_files: Vec<PathBuf>,
    /// Packages owning a changed file, plus explicit revalidation requests
    pub directly_affected: BTreeSet<PackageId>,
    /// Directly affected packages and everything depending on them
    pub affected: BTreeSet<PackageId>,
    /// Cache entries removed before dispatch
    pub invalidated: usize,
    pub outcomes: HashMap<PackageId, PackageOutcome<R>>,
    pub duration: Duration,
}

impl<R> CycleReport<R> {
    /// Packages whose revalidation failed
    pub fn failures(&self) -> impl Iterator<Item = (&PackageId, &str)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            PackageOutcome::Failed(reason) => Some((id, reason.as_str())),
            _ => None,
        })
    }
}

enum Event {
    FilesChanged(Vec<PathBuf>),
    Revalidate(Vec<PackageId>),
    Shutdown,
}

/// Reacts to change notifications by invalidating and revalidating only the
/// affected packages
pub struct IncrementalCoordinator<R> {
    pipeline: ValidationPipeline<R>,
    graph: Arc<dyn DependencyGraph>,
    orchestrator: BatchOrchestrator,
    concurrency: usize,
    debounce: Duration,
}

impl<R: CacheValue> IncrementalCoordinator<R> {
    pub fn new(
        pipeline: ValidationPipeline<R>,
        graph: Arc<dyn DependencyGraph>,
        batch: &BatchConfig,
        watch: &WatchConfig,
    ) -> ModcheckResult<Self> {
        if batch.concurrency == 0 {
            return Err(ModcheckError::InvalidConcurrency(batch.concurrency));
        }
        Ok(Self {
            pipeline,
            graph,
            orchestrator: BatchOrchestrator::from_config(batch)?,
            concurrency: batch.concurrency,
            debounce: watch.debounce(),
        })
    }

    /// Packages owning `paths` (longest matching root wins) and their
    /// transitive dependents
    pub fn affected_packages(
        &self,
        paths: &[PathBuf],
    ) -> (BTreeSet<PackageId>, BTreeSet<PackageId>) {
        let direct = self.owners_of(paths);
        let closure = self.dependents_closure(&direct);
        (direct, closure)
    }

    fn owners_of(&self, paths: &[PathBuf]) -> BTreeSet<PackageId> {
        let workspace = self.pipeline.workspace();
        let roots: Vec<(PackageId, PathBuf)> = workspace
            .packages()
            .into_iter()
            .filter_map(|id| {
                let root = workspace.root_of(&id)?;
                Some((id, normalize_path(&root)))
            })
            .collect();

        let mut owners = BTreeSet::new();
        for path in paths {
            let path = normalize_path(path);
            let owner = roots
                .iter()
                .filter(|(_, root)| path.starts_with(root))
                .max_by_key(|(_, root)| root.components().count());
            match owner {
                Some((id, _)) => {
                    owners.insert(id.clone());
                }
                None => debug!("No package owns {}", path.display()),
            }
        }
        owners
    }

    fn dependents_closure(&self, direct: &BTreeSet<PackageId>) -> BTreeSet<PackageId> {
        let mut closure = direct.clone();
        let mut queue: VecDeque<PackageId> = direct.iter().cloned().collect();

        while let Some(package) = queue.pop_front() {
            for dependent in self.graph.dependents_of(&package) {
                if closure.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        closure
    }

    /// Start the background task
    pub fn spawn(self) -> CoordinatorHandle<R> {
        let (events, rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(CoordinatorState::Idle);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(self.run(rx, reports.clone(), state_tx, cancel.clone()));

        CoordinatorHandle {
            events,
            reports,
            state,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Event>,
        reports: broadcast::Sender<Arc<CycleReport<R>>>,
        state: watch::Sender<CoordinatorState>,
        cancel: CancellationToken,
    ) {
        let mut files: BTreeSet<PathBuf> = BTreeSet::new();
        let mut packages: BTreeSet<PackageId> = BTreeSet::new();

        'cycles: loop {
            state.send_replace(CoordinatorState::Idle);

            match rx.recv().await {
                None | Some(Event::Shutdown) => break,
                Some(event) => absorb(event, &mut files, &mut packages),
            }

            state.send_replace(CoordinatorState::Debouncing);
            let quiet = tokio::time::sleep(self.debounce);
            tokio::pin!(quiet);
            loop {
                tokio::select! {
                    _ = &mut quiet => break,
                    event = rx.recv() => match event {
                        None | Some(Event::Shutdown) => break 'cycles,
                        Some(event) => {
                            absorb(event, &mut files, &mut packages);
                            quiet.as_mut().reset(tokio::time::Instant::now() + self.debounce);
                        }
                    },
                }
            }

            let changed: Vec<PathBuf> = std::mem::take(&mut files).into_iter().collect();
            let requested = std::mem::take(&mut packages);
            let report = self.run_cycle(changed, requested, &state, &cancel).await;

            // Nobody listening is fine
            let _ = reports.send(Arc::new(report));

            if cancel.is_cancelled() {
                break;
            }
        }

        state.send_replace(CoordinatorState::Stopped);
        debug!("Incremental coordinator stopped");
    }

    async fn run_cycle(
        &self,
        changed_files: Vec<PathBuf>,
        requested: BTreeSet<PackageId>,
        state: &watch::Sender<CoordinatorState>,
        cancel: &CancellationToken,
    ) -> CycleReport<R> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let monitor = self.pipeline.monitor();
        let op_id = format!("cycle:{id}");
        monitor.start_op(op_id.clone(), OpMetadata::new(OpKind::Cycle));

        state.send_replace(CoordinatorState::Computing);
        let mut directly_affected = self.owners_of(&changed_files);
        directly_affected.extend(requested);
        let affected = self.dependents_closure(&directly_affected);
        let affected_list: Vec<PackageId> = affected.iter().cloned().collect();

        state.send_replace(CoordinatorState::Invalidating);
        let store = self.pipeline.store();
        let mut invalidated = store.invalidate(&changed_files, &affected_list);
        for package in &affected_list {
            if store.remove(&self.pipeline.key_for(package)) {
                invalidated += 1;
            }
        }

        state.send_replace(CoordinatorState::Dispatching);
        let tasks = self.pipeline.tasks(&affected_list);
        let mut outcomes = HashMap::with_capacity(affected_list.len());
        match self.orchestrator.run(tasks, self.concurrency, cancel).await {
            Ok(report) => {
                for (task_id, result) in report.results {
                    let outcome = match result.outcome {
                        TaskOutcome::Succeeded(checked) => PackageOutcome::Valid {
                            result: checked.result,
                            cached: checked.cached,
                        },
                        TaskOutcome::Failed(e) => PackageOutcome::Failed(e.to_string()),
                        TaskOutcome::Cancelled => PackageOutcome::Cancelled,
                    };
                    outcomes.insert(PackageId::from(task_id), outcome);
                }
            }
            Err(e) => {
                warn!("Revalidation batch rejected: {}", e);
                for package in &affected_list {
                    outcomes.insert(package.clone(), PackageOutcome::Failed(e.to_string()));
                }
            }
        }

        let maintenance = store.maintain().await;
        if maintenance.removed() > 0 {
            debug!("Post-cycle maintenance removed {} files", maintenance.removed());
        }

        let failed = outcomes
            .values()
            .filter(|o| matches!(o, PackageOutcome::Failed(_)))
            .count();
        monitor.end_op(
            &op_id,
            if failed == 0 {
                OpResult::ok()
            } else {
                OpResult::failed()
            },
        );

        let duration = started.elapsed();
        info!(
            cycle = %id,
            changed = changed_files.len(),
            affected = affected.len(),
            invalidated,
            failed,
            duration_ms = duration.as_millis() as u64,
            "Revalidation cycle complete"
        );

        CycleReport {
            id,
            started_at,
            changed_files,
            directly_affected,
            affected,
            invalidated,
            outcomes,
            duration,
        }
    }
}

fn absorb(event: Event, files: &mut BTreeSet<PathBuf>, packages: &mut BTreeSet<PackageId>) {
    match event {
        Event::FilesChanged(paths) => files.extend(paths),
        Event::Revalidate(ids) => packages.extend(ids),
        Event::Shutdown => {}
    }
}

/// Control handle of a running coordinator
pub struct CoordinatorHandle<R> {
    events: mpsc::UnboundedSender<Event>,
    reports: broadcast::Sender<Arc<CycleReport<R>>>,
    state: watch::Receiver<CoordinatorState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<R> CoordinatorHandle<R> {
    /// Report changed paths. Returns immediately; the cycle runs in the
    /// background and its report goes to [`subscribe`](Self::subscribe).
    pub fn on_files_changed(&self, paths: Vec<PathBuf>) -> ModcheckResult<()> {
        self.events
            .send(Event::FilesChanged(paths))
            .map_err(|_| ModcheckError::CoordinatorStopped)
    }

    /// Request revalidation of packages (and their dependents) without a
    /// file change
    pub fn revalidate(&self, packages: Vec<PackageId>) -> ModcheckResult<()> {
        self.events
            .send(Event::Revalidate(packages))
            .map_err(|_| ModcheckError::CoordinatorStopped)
    }

    /// Receive a report for every cycle completed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CycleReport<R>>> {
        self.reports.subscribe()
    }

    /// Current state
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Stop the coordinator. A running batch finishes its in-flight tasks
    /// and skips the rest; queued notifications are dropped.
    pub async fn shutdown(self) -> ModcheckResult<()> {
        self.cancel.cancel();
        let _ = self.events.send(Event::Shutdown);
        self.task
            .await
            .map_err(|e| ModcheckError::Internal(format!("coordinator task failed: {e}")))
    }
}
