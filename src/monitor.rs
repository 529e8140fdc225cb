//! Operation timing and cache effectiveness tracking
//!
//! Operations are bracketed with [`PerformanceMonitor::start_op`] and
//! [`PerformanceMonitor::end_op`]. Completed operations go into a bounded
//! history (oldest dropped first) from which averages and [`Insight`]s are
//! computed, so memory stays flat in long-running processes.

use crate::config::MonitorConfig;
use crate::package::PackageId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Samples needed before a heuristic fires
const MIN_SAMPLES: usize = 10;

/// Failure share of recent operations above which an insight is raised
const HIGH_FAILURE_RATE: f64 = 0.2;

/// Kind of a monitored operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Validation,
    CacheLookup,
    Batch,
    Cycle,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::CacheLookup => "cache_lookup",
            Self::Batch => "batch",
            Self::Cycle => "cycle",
        };
        f.write_str(name)
    }
}

/// What an operation is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpMetadata {
    pub kind: OpKind,
    pub package: Option<PackageId>,
}

impl OpMetadata {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            package: None,
        }
    }

    pub fn for_package(kind: OpKind, package: &PackageId) -> Self {
        Self {
            kind,
            package: Some(package.clone()),
        }
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpResult {
    pub success: bool,
    /// Whether the operation was answered from the cache, if it consulted it
    pub cache_hit: Option<bool>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            cache_hit: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            cache_hit: None,
        }
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = Some(hit);
        self
    }
}

/// Severity of an insight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

/// A heuristic observation about recent behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub severity: Severity,
    pub message: String,
}

/// Per-kind aggregate over recent history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub count: usize,
    pub failures: usize,
    pub avg_duration_ms: f64,
}

/// Aggregated monitor statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Operations completed since the last reset
    pub completed: u64,
    /// Failed operations since the last reset
    pub failures: u64,
    /// Operations started but not ended
    pub in_flight: usize,
    /// Unended operations dropped to keep the in-flight set bounded
    pub abandoned: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// `cache_hits / (cache_hits + cache_misses)`, 0 without lookups
    pub hit_rate: f64,
    /// Mean duration over recent history
    pub avg_duration_ms: f64,
    /// Operations currently kept in history
    pub history_len: usize,
    pub by_kind: BTreeMap<OpKind, KindStats>,
    pub insights: Vec<Insight>,
}

#[derive(Debug)]
struct ActiveOp {
    metadata: OpMetadata,
    started: Instant,
    seq: u64,
}

#[derive(Debug, Clone)]
struct CompletedOp {
    kind: OpKind,
    duration: Duration,
    success: bool,
}

#[derive(Debug, Default)]
struct State {
    active: HashMap<String, ActiveOp>,
    history: VecDeque<CompletedOp>,
    /// Recent cache outcomes, bounded like `history`
    recent_cache: VecDeque<bool>,
    completed: u64,
    failures: u64,
    abandoned: u64,
    next_seq: u64,
    cache_hits: u64,
    cache_misses: u64,
}

/// Thread-safe operation monitor
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<State>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin timing an operation. Restarting a running id restarts its clock.
    ///
    /// At most `history_limit` operations are tracked as in flight; starting
    /// one more drops the oldest, which was most likely never ended.
    pub fn start_op(&self, id: impl Into<String>, metadata: OpMetadata) {
        let id = id.into();
        let mut state = self.lock();
        if !state.active.contains_key(&id) && state.active.len() >= self.config.history_limit {
            let oldest = state
                .active
                .iter()
                .min_by_key(|(_, op)| op.seq)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                state.active.remove(&oldest);
                state.abandoned += 1;
                debug!(op_id = %oldest, "Dropped operation that was never ended");
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let previous = state.active.insert(
            id.clone(),
            ActiveOp {
                metadata,
                started: Instant::now(),
                seq,
            },
        );
        if previous.is_some() {
            debug!(op_id = %id, "Operation restarted before it ended");
        }
    }

    /// Finish an operation, returning its duration. Unknown ids are ignored.
    pub fn end_op(&self, id: &str, result: OpResult) -> Option<Duration> {
        let mut state = self.lock();
        let Some(op) = state.active.remove(id) else {
            warn!(op_id = %id, "end_op for an operation that was never started");
            return None;
        };

        let duration = op.started.elapsed();
        state.completed += 1;
        if !result.success {
            state.failures += 1;
        }
        if let Some(hit) = result.cache_hit {
            self.push_cache(&mut state, hit);
        }

        state.history.push_back(CompletedOp {
            kind: op.metadata.kind,
            duration,
            success: result.success,
        });
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }

        if duration.as_millis() as u64 > self.config.slow_op_ms {
            debug!(
                op_id = %id,
                kind = %op.metadata.kind,
                package = ?op.metadata.package,
                duration_ms = duration.as_millis() as u64,
                "Slow operation"
            );
        }
        Some(duration)
    }

    /// Count a cache lookup that was not bracketed as an operation
    pub fn record_cache(&self, hit: bool) {
        let mut state = self.lock();
        self.push_cache(&mut state, hit);
    }

    fn push_cache(&self, state: &mut State, hit: bool) {
        if hit {
            state.cache_hits += 1;
        } else {
            state.cache_misses += 1;
        }
        state.recent_cache.push_back(hit);
        while state.recent_cache.len() > self.config.history_limit {
            state.recent_cache.pop_front();
        }
    }

    /// Aggregate counters, averages, and insights
    pub fn stats(&self) -> MonitorStats {
        let state = self.lock();

        let mut by_kind: BTreeMap<OpKind, (usize, usize, Duration)> = BTreeMap::new();
        let mut total = Duration::ZERO;
        for op in &state.history {
            let entry = by_kind.entry(op.kind).or_default();
            entry.0 += 1;
            if !op.success {
                entry.1 += 1;
            }
            entry.2 += op.duration;
            total += op.duration;
        }

        let avg_ms = |sum: Duration, n: usize| {
            if n == 0 {
                0.0
            } else {
                sum.as_secs_f64() * 1000.0 / n as f64
            }
        };

        let by_kind: BTreeMap<OpKind, KindStats> = by_kind
            .into_iter()
            .map(|(kind, (count, failures, sum))| {
                (
                    kind,
                    KindStats {
                        count,
                        failures,
                        avg_duration_ms: avg_ms(sum, count),
                    },
                )
            })
            .collect();

        let lookups = state.cache_hits + state.cache_misses;
        MonitorStats {
            completed: state.completed,
            failures: state.failures,
            in_flight: state.active.len(),
            abandoned: state.abandoned,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.cache_hits as f64 / lookups as f64
            },
            avg_duration_ms: avg_ms(total, state.history.len()),
            history_len: state.history.len(),
            insights: self.insights(&state, &by_kind),
            by_kind,
        }
    }

    fn insights(&self, state: &State, by_kind: &BTreeMap<OpKind, KindStats>) -> Vec<Insight> {
        let mut insights = Vec::new();

        let lookups = state.recent_cache.len();
        if lookups >= MIN_SAMPLES {
            let hits = state.recent_cache.iter().filter(|hit| **hit).count();
            let rate = hits as f64 / lookups as f64;
            if rate < self.config.low_hit_rate {
                insights.push(Insight {
                    severity: Severity::Warning,
                    message: format!(
                        "Cache hit rate is {:.0}% (below {:.0}%): consider raising cache.max_age_secs",
                        rate * 100.0,
                        self.config.low_hit_rate * 100.0
                    ),
                });
            }
        }

        if let Some(validation) = by_kind.get(&OpKind::Validation) {
            if validation.count >= MIN_SAMPLES
                && validation.avg_duration_ms > self.config.slow_op_ms as f64
            {
                insights.push(Insight {
                    severity: Severity::Info,
                    message: format!(
                        "Validations average {:.0}ms: consider raising batch.concurrency",
                        validation.avg_duration_ms
                    ),
                });
            }
        }

        let recent = state.history.len();
        if recent >= MIN_SAMPLES {
            let failed = state.history.iter().filter(|op| !op.success).count();
            let rate = failed as f64 / recent as f64;
            if rate > HIGH_FAILURE_RATE {
                insights.push(Insight {
                    severity: Severity::Warning,
                    message: format!(
                        "{:.0}% of recent operations failed ({} of {})",
                        rate * 100.0,
                        failed,
                        recent
                    ),
                });
            }
        }

        insights
    }

    /// Forget all history and counters
    pub fn reset(&self) {
        *self.lock() = State::default();
    }
}
