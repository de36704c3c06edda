//! Reconciles intercepted LLM API call logs into one canonical trajectory
//! per task instance.
//!
//! Per instance the pipeline is: [`store`] loads the raw records,
//! [`normalize`] maps each call onto a wire-format independent view,
//! [`dedup`] collapses retries into logical turns, [`merge`] folds the turns
//! into one message sequence and [`writer`] assembles the document.
//! [`driver`] runs that pipeline across a batch of instances.

pub mod config;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod merge;
pub mod normalize;
pub mod record;
pub mod store;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use config::{InstanceConfig, OutputLayout, RunConfig};
pub use dedup::{deduplicate, LogicalTurn};
pub use driver::{run_batch, InstanceReport, InstanceStatus, RunOptions, RunSummary};
pub use error::{ReconcileError, ReconcileWarning, WarningKind};
pub use merge::{merge_turns, CanonicalMessage};
pub use store::{open_store, RecordStore};
pub use writer::{build_trajectory, open_sink, Trajectory, TrajectorySink};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub records_read: usize,
    pub records_skipped: usize,
    pub records_excluded: usize,
    pub turns: usize,
    pub failed_turns: usize,
    pub messages: usize,
    #[serde(default)]
    pub assistant_messages: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub trajectory: Trajectory,
    pub turns: Vec<LogicalTurn>,
    pub warnings: Vec<ReconcileWarning>,
    pub stats: InstanceStats,
}

/// Runs the whole pipeline for one instance. Only a missing source or an
/// unreadable log is an error; everything else becomes a warning.
pub fn reconcile_instance(
    store: &dyn RecordStore,
    instance_id: &str,
    config: Option<&InstanceConfig>,
    exclude_models: &[String],
) -> Result<Reconciled, ReconcileError> {
    let loaded = store.load(instance_id, exclude_models)?;
    let mut warnings = loaded.warnings;
    let mut stats = InstanceStats {
        records_read: loaded.lines_read,
        records_skipped: loaded.skipped,
        records_excluded: loaded.excluded,
        ..InstanceStats::default()
    };

    let deduped = deduplicate(loaded.records);
    warnings.extend(deduped.warnings);
    let merged = merge_turns(&deduped.turns);
    warnings.extend(merged.warnings);

    stats.turns = deduped.turns.len();
    stats.failed_turns = deduped.turns.iter().filter(|t| t.failed).count();
    stats.messages = merged.messages.len();
    stats.assistant_messages = merged
        .messages
        .iter()
        .filter(|m| m.role == normalize::Role::Assistant)
        .count();
    debug!(
        instance_id,
        turns = stats.turns,
        messages = stats.messages,
        warnings = warnings.len(),
        "reconciled instance"
    );

    let trajectory = build_trajectory(instance_id, &deduped.turns, merged.messages, config);
    Ok(Reconciled {
        trajectory,
        turns: deduped.turns,
        warnings,
        stats,
    })
}
