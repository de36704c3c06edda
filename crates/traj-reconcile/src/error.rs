use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that end reconciliation of a single instance. None of these abort
/// the batch; the driver records them against the instance.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no raw record source for instance {instance_id} (looked in {path})")]
    SourceMissing { instance_id: String, path: PathBuf },
    #[error("record at line {line} could not be decoded: {message}")]
    RecordParse { line: usize, message: String },
    #[error("turn {turn_index} does not extend the emitted conversation: {detail}")]
    Inconsistency { turn_index: usize, detail: String },
    #[error("instance {instance_id} exceeded the batch deadline")]
    Timeout { instance_id: String },
    #[error("instance {instance_id} abandoned after interrupt")]
    Interrupted { instance_id: String },
    #[error("record store error for instance {instance_id}: {source}")]
    Store {
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceMissing { .. } => "source_missing",
            Self::RecordParse { .. } => "record_parse",
            Self::Inconsistency { .. } => "reconciliation_inconsistency",
            Self::Timeout { .. } => "timeout",
            Self::Interrupted { .. } => "interrupted",
            Self::Store { .. } => "store",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Interrupted { .. })
    }

    /// Downgrades a recoverable error into the warning attached to the
    /// instance.
    pub fn into_warning(self) -> ReconcileWarning {
        let (kind, line, turn_index) = match &self {
            Self::RecordParse { line, .. } => (WarningKind::RecordParse, Some(*line), None),
            Self::Inconsistency { turn_index, .. } => (
                WarningKind::ReconciliationInconsistency,
                None,
                Some(*turn_index),
            ),
            _ => (WarningKind::Store, None, None),
        };
        ReconcileWarning {
            kind,
            message: self.to_string(),
            line,
            turn_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    RecordParse,
    ReconciliationInconsistency,
    FailedTurn,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileWarning {
    pub kind: WarningKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<usize>,
}

impl ReconcileWarning {
    pub fn failed_turn(turn_index: usize, attempts: usize) -> Self {
        Self {
            kind: WarningKind::FailedTurn,
            message: format!(
                "turn {} has no successful attempt ({} attempt(s)); kept the last one",
                turn_index, attempts
            ),
            line: None,
            turn_index: Some(turn_index),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Store,
            message: message.into(),
            line: None,
            turn_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_downgrades_to_line_warning() {
        let warning = ReconcileError::RecordParse {
            line: 3,
            message: "expected value".to_string(),
        }
        .into_warning();
        assert_eq!(warning.kind, WarningKind::RecordParse);
        assert_eq!(warning.line, Some(3));
        assert!(warning.message.contains("line 3"));
    }

    #[test]
    fn timeout_and_interrupt_are_distinct_from_failure() {
        let timeout = ReconcileError::Timeout {
            instance_id: "a".to_string(),
        };
        let missing = ReconcileError::SourceMissing {
            instance_id: "a".to_string(),
            path: PathBuf::from("/tmp/a.jsonl"),
        };
        assert!(timeout.is_timeout());
        assert!(!missing.is_timeout());
        assert_eq!(missing.kind(), "source_missing");
    }

    #[test]
    fn warning_kinds_serialize_snake_case() {
        let raw = serde_json::to_value(ReconcileWarning::failed_turn(2, 3)).expect("serialize");
        assert_eq!(raw["kind"], "failed_turn");
        assert_eq!(raw["turn_index"], 2);
        assert!(raw.get("line").is_none());
    }
}
