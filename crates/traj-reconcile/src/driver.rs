//! Batch driver: one worker thread per in-flight instance, completions on a
//! channel, and a committer that hands finished trajectories to the sink in
//! instance order.
//!
//! Workers never touch the output. Only the coordinating thread writes, so an
//! instance abandoned at the deadline can never write late.

use crate::config::{parse_optional_positive_usize_env, resolve_max_in_flight, InstanceConfig};
use crate::error::{ReconcileError, ReconcileWarning};
use crate::store::RecordStore;
use crate::writer::TrajectorySink;
use crate::{reconcile_instance, InstanceStats, Reconciled};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use traj_core::{RUN_SUMMARY_SCHEMA_VERSION, TRAJ_ENV_MAX_IN_FLIGHT};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub concurrency: usize,
    pub deadline: Option<Duration>,
    pub exclude_models: Vec<String>,
    /// Set by the interrupt handler; treated like an expired deadline.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Trajectories with fewer assistant messages are not written. 0 keeps
    /// everything, including empty trajectories.
    pub min_assistant_turns: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Reconciled, but below `min_assistant_turns`; nothing written.
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub instance_id: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ReconcileWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<InstanceStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: String,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    #[serde(default)]
    pub filtered: usize,
    pub warnings_total: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub store_warnings: Vec<ReconcileWarning>,
    pub instances: Vec<InstanceReport>,
}

impl RunSummary {
    fn new(store_warnings: Vec<ReconcileWarning>) -> Self {
        Self {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            filtered: 0,
            warnings_total: store_warnings.len(),
            store_warnings,
            instances: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }

    fn record(&mut self, report: InstanceReport) {
        self.processed += 1;
        match report.status {
            InstanceStatus::Succeeded => self.succeeded += 1,
            InstanceStatus::Failed => self.failed += 1,
            InstanceStatus::TimedOut => self.timed_out += 1,
            InstanceStatus::Filtered => self.filtered += 1,
        }
        self.warnings_total += report.warnings.len();
        self.instances.push(report);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InstanceDispatch {
    schedule_idx: usize,
    instance_id: String,
}

#[derive(Debug)]
struct InstanceCompletion {
    schedule_idx: usize,
    worker_id: String,
    outcome: Result<Reconciled, ReconcileError>,
}

type InstanceExecutor = dyn Fn(&str) -> Result<Reconciled, ReconcileError> + Send + Sync + 'static;

trait WorkerBackend {
    fn submit(&mut self, dispatch: InstanceDispatch) -> Result<()>;
    fn poll_completions(&mut self, timeout: Duration) -> Result<Vec<InstanceCompletion>>;
    fn in_flight(&self) -> Vec<InstanceDispatch>;
    fn has_capacity(&self) -> bool;
}

struct LocalThreadWorkerBackend {
    max_in_flight: usize,
    capacity_warning: Option<String>,
    executor: Arc<InstanceExecutor>,
    next_worker_seq: AtomicU64,
    completions_tx: mpsc::Sender<InstanceCompletion>,
    completions_rx: mpsc::Receiver<InstanceCompletion>,
    in_flight_by_idx: HashMap<usize, InstanceDispatch>,
}

impl LocalThreadWorkerBackend {
    fn new(max_in_flight: usize, executor: Arc<InstanceExecutor>) -> Result<Self> {
        let ceiling = parse_optional_positive_usize_env(TRAJ_ENV_MAX_IN_FLIGHT)?;
        Self::new_with_ceiling(max_in_flight, executor, ceiling)
    }

    fn new_with_ceiling(
        max_in_flight: usize,
        executor: Arc<InstanceExecutor>,
        ceiling: Option<usize>,
    ) -> Result<Self> {
        if max_in_flight == 0 {
            return Err(anyhow!("worker backend requires max_in_flight > 0"));
        }
        let (max_in_flight, capacity_warning) = resolve_max_in_flight(max_in_flight, ceiling);
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            max_in_flight,
            capacity_warning,
            executor,
            next_worker_seq: AtomicU64::new(1),
            completions_tx: tx,
            completions_rx: rx,
            in_flight_by_idx: HashMap::new(),
        })
    }
}

impl WorkerBackend for LocalThreadWorkerBackend {
    fn submit(&mut self, dispatch: InstanceDispatch) -> Result<()> {
        if self.in_flight_by_idx.len() >= self.max_in_flight {
            return Err(anyhow!(
                "worker backend at capacity: in_flight={} max_in_flight={}",
                self.in_flight_by_idx.len(),
                self.max_in_flight
            ));
        }
        if self.in_flight_by_idx.contains_key(&dispatch.schedule_idx) {
            return Err(anyhow!(
                "instance {} (schedule_idx {}) is already in flight",
                dispatch.instance_id,
                dispatch.schedule_idx
            ));
        }
        let worker_id = format!(
            "traj-worker-{}",
            self.next_worker_seq.fetch_add(1, Ordering::Relaxed)
        );
        let tracked = dispatch.clone();
        let executor = self.executor.clone();
        let completions_tx = self.completions_tx.clone();
        let thread_name = worker_id.clone();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| executor(&dispatch.instance_id)))
                    .unwrap_or_else(|_| {
                        Err(ReconcileError::Store {
                            instance_id: dispatch.instance_id.clone(),
                            source: anyhow!("worker panicked"),
                        })
                    });
                // The coordinator may already have given up on this instance.
                let _ = completions_tx.send(InstanceCompletion {
                    schedule_idx: dispatch.schedule_idx,
                    worker_id,
                    outcome,
                });
            })?;
        self.in_flight_by_idx.insert(tracked.schedule_idx, tracked);
        Ok(())
    }

    fn poll_completions(&mut self, timeout: Duration) -> Result<Vec<InstanceCompletion>> {
        let mut out = Vec::new();
        match self.completions_rx.recv_timeout(timeout) {
            Ok(first) => out.push(first),
            Err(mpsc::RecvTimeoutError::Timeout) => return Ok(out),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("worker completion channel disconnected"))
            }
        }
        while let Ok(next) = self.completions_rx.try_recv() {
            out.push(next);
        }
        for completion in &out {
            if self.in_flight_by_idx.remove(&completion.schedule_idx).is_none() {
                return Err(anyhow!(
                    "worker protocol fault: completion for unknown schedule_idx {}",
                    completion.schedule_idx
                ));
            }
        }
        Ok(out)
    }

    fn in_flight(&self) -> Vec<InstanceDispatch> {
        let mut dispatches: Vec<InstanceDispatch> = self.in_flight_by_idx.values().cloned().collect();
        dispatches.sort_by_key(|d| d.schedule_idx);
        dispatches
    }

    fn has_capacity(&self) -> bool {
        self.in_flight_by_idx.len() < self.max_in_flight
    }
}

/// Buffers out-of-order completions and commits them strictly by schedule
/// index, so the sink sees instances in the same order on every run.
struct DeterministicCommitter {
    next_commit_idx: usize,
    min_assistant_turns: usize,
    pending_by_schedule: BTreeMap<usize, (String, Result<Reconciled, ReconcileError>)>,
}

impl DeterministicCommitter {
    fn new(min_assistant_turns: usize) -> Self {
        Self {
            next_commit_idx: 0,
            min_assistant_turns,
            pending_by_schedule: BTreeMap::new(),
        }
    }

    fn enqueue(
        &mut self,
        schedule_idx: usize,
        instance_id: String,
        outcome: Result<Reconciled, ReconcileError>,
    ) -> Result<()> {
        if schedule_idx < self.next_commit_idx {
            return Err(anyhow!(
                "deterministic committer protocol fault: schedule_idx {} already committed through {}",
                schedule_idx,
                self.next_commit_idx.saturating_sub(1)
            ));
        }
        if self.pending_by_schedule.contains_key(&schedule_idx) {
            return Err(anyhow!(
                "deterministic committer protocol fault: duplicate completion for schedule_idx {}",
                schedule_idx
            ));
        }
        self.pending_by_schedule
            .insert(schedule_idx, (instance_id, outcome));
        Ok(())
    }

    fn drain_ready(&mut self, sink: &mut dyn TrajectorySink, summary: &mut RunSummary) -> usize {
        let mut committed = 0_usize;
        while let Some((instance_id, outcome)) = self.pending_by_schedule.remove(&self.next_commit_idx) {
            summary.record(commit_instance(
                sink,
                instance_id,
                outcome,
                self.min_assistant_turns,
            ));
            self.next_commit_idx += 1;
            committed += 1;
        }
        committed
    }
}

/// A failed write only fails its own instance.
fn commit_instance(
    sink: &mut dyn TrajectorySink,
    instance_id: String,
    outcome: Result<Reconciled, ReconcileError>,
    min_assistant_turns: usize,
) -> InstanceReport {
    if let Ok(reconciled) = &outcome {
        if reconciled.stats.assistant_messages < min_assistant_turns {
            let reason = format!(
                "{} assistant message(s), below the minimum of {}",
                reconciled.stats.assistant_messages, min_assistant_turns
            );
            debug!(instance_id = %instance_id, "filtered: {}", reason);
            return InstanceReport {
                instance_id,
                status: InstanceStatus::Filtered,
                error: None,
                reason: Some(reason),
                warnings: reconciled.warnings.clone(),
                stats: Some(reconciled.stats),
            };
        }
    }
    let written = outcome.and_then(|reconciled| {
        sink.write_trajectory(&instance_id, &reconciled.trajectory)
            .map(|()| reconciled)
            .map_err(|source| ReconcileError::Store {
                instance_id: instance_id.clone(),
                source,
            })
    });
    match written {
        Ok(reconciled) => InstanceReport {
            instance_id,
            status: InstanceStatus::Succeeded,
            error: None,
            reason: None,
            warnings: reconciled.warnings,
            stats: Some(reconciled.stats),
        },
        Err(err) => {
            let status = if err.is_timeout() {
                InstanceStatus::TimedOut
            } else {
                InstanceStatus::Failed
            };
            warn!(instance_id = %instance_id, kind = err.kind(), "instance not reconciled: {}", err);
            InstanceReport {
                instance_id,
                status,
                error: Some(ErrorReport {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                }),
                reason: None,
                warnings: Vec::new(),
                stats: None,
            }
        }
    }
}

/// Reconciles every instance in `instance_ids` (deduplicated and sorted)
/// and commits the results to `sink`. Per-instance failures end up in the
/// summary, including failed writes; only a failed flush or a backend
/// fault returns an error.
pub fn run_batch(
    store: Arc<dyn RecordStore>,
    instance_ids: Vec<String>,
    instance_configs: Vec<InstanceConfig>,
    options: &RunOptions,
    sink: &mut dyn TrajectorySink,
) -> Result<RunSummary> {
    let executor = instance_executor(store.clone(), instance_configs, options.exclude_models.clone());
    let mut backend = LocalThreadWorkerBackend::new(options.concurrency.max(1), executor)?;
    if let Some(warning) = backend.capacity_warning.as_deref() {
        warn!("{}", warning);
    }
    run_schedule(&mut backend, store.store_warnings(), instance_ids, options, sink)
}

fn instance_executor(
    store: Arc<dyn RecordStore>,
    instance_configs: Vec<InstanceConfig>,
    exclude_models: Vec<String>,
) -> Arc<InstanceExecutor> {
    let configs: HashMap<String, InstanceConfig> = instance_configs
        .into_iter()
        .map(|c| (c.instance_id.clone(), c))
        .collect();
    Arc::new(move |instance_id: &str| {
        reconcile_instance(
            store.as_ref(),
            instance_id,
            configs.get(instance_id),
            &exclude_models,
        )
    })
}

fn run_schedule(
    backend: &mut dyn WorkerBackend,
    store_warnings: Vec<ReconcileWarning>,
    instance_ids: Vec<String>,
    options: &RunOptions,
    sink: &mut dyn TrajectorySink,
) -> Result<RunSummary> {
    let schedule: Vec<String> = instance_ids
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let started = Instant::now();
    let deadline = options.deadline.map(|d| started + d);
    let cancelled = || {
        options
            .cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    };
    info!(instances = schedule.len(), "reconciling batch");

    let mut summary = RunSummary::new(store_warnings);
    let mut committer = DeterministicCommitter::new(options.min_assistant_turns);
    let mut next_idx = 0_usize;
    let mut interrupted = false;

    loop {
        if cancelled() {
            interrupted = true;
            break;
        }
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            break;
        }
        while next_idx < schedule.len() && backend.has_capacity() {
            backend.submit(InstanceDispatch {
                schedule_idx: next_idx,
                instance_id: schedule[next_idx].clone(),
            })?;
            next_idx += 1;
        }
        if next_idx >= schedule.len() && backend.in_flight().is_empty() {
            break;
        }
        let wait = deadline
            .map(|d| d.saturating_duration_since(Instant::now()).min(POLL_INTERVAL))
            .unwrap_or(POLL_INTERVAL);
        for completion in backend.poll_completions(wait)? {
            debug!(
                worker = %completion.worker_id,
                schedule_idx = completion.schedule_idx,
                "instance completed"
            );
            let instance_id = schedule[completion.schedule_idx].clone();
            committer.enqueue(completion.schedule_idx, instance_id, completion.outcome)?;
        }
        committer.drain_ready(sink, &mut summary);
    }

    let abandoned: Vec<usize> = backend
        .in_flight()
        .into_iter()
        .map(|d| d.schedule_idx)
        .chain(next_idx..schedule.len())
        .collect();
    if !abandoned.is_empty() {
        warn!(
            abandoned = abandoned.len(),
            interrupted,
            "batch stopped before every instance finished"
        );
    }
    for idx in abandoned {
        let instance_id = schedule[idx].clone();
        let err = if interrupted {
            ReconcileError::Interrupted {
                instance_id: instance_id.clone(),
            }
        } else {
            ReconcileError::Timeout {
                instance_id: instance_id.clone(),
            }
        };
        committer.enqueue(idx, instance_id, Err(err))?;
    }
    committer.drain_ready(sink, &mut summary);
    sink.flush()?;

    info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        filtered = summary.filtered,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );
    Ok(summary)
}
