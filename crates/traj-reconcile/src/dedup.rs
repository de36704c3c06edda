//! Collapses retried and re-sent calls into logical turns.
//!
//! Records are grouped by the exact conversation prefix they sent. The
//! group's representative is its most recent successful attempt; a group
//! with no success keeps its last attempt and is marked failed.

use crate::error::ReconcileWarning;
use crate::normalize::{normalize_record, NormalizedCall, RequestView};
use crate::record::{effective_timestamps, RawCallRecord};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;
use traj_core::{canonical_json, sequence_digest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub digest: String,
    /// Canonical key per element: the system prompt (when present) followed
    /// by every history message.
    pub elements: Vec<String>,
    pub history_len: usize,
}

impl Fingerprint {
    pub fn of_request(request: &RequestView) -> Self {
        let mut elements = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            elements.push(system_key(system));
        }
        elements.extend(request.messages.iter().map(|m| m.fingerprint_key()));
        Self {
            digest: sequence_digest(&elements),
            history_len: request.messages.len(),
            elements,
        }
    }

    /// No prior history: the call opens a new conversation chain.
    pub fn is_empty(&self) -> bool {
        self.history_len == 0
    }

    pub fn is_strict_prefix_of(&self, other: &Fingerprint) -> bool {
        self.elements.len() < other.elements.len()
            && other.elements[..self.elements.len()] == self.elements[..]
    }
}

pub(crate) fn system_key(system: &str) -> String {
    canonical_json(&json!({"role": "system", "parts": [{"text": system}]}))
}

#[derive(Debug, Clone)]
pub struct LogicalTurn {
    pub index: usize,
    pub record: RawCallRecord,
    pub call: NormalizedCall,
    /// The representative carries a live model response.
    pub generation: bool,
    /// No attempt in the group succeeded.
    pub failed: bool,
    pub attempts: usize,
    pub attempt_seqs: Vec<usize>,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Default)]
pub struct Deduplicated {
    pub turns: Vec<LogicalTurn>,
    pub warnings: Vec<ReconcileWarning>,
}

struct Candidate {
    ts: i64,
    record: RawCallRecord,
    call: NormalizedCall,
    fingerprint: Fingerprint,
}

pub fn deduplicate(records: Vec<RawCallRecord>) -> Deduplicated {
    let timestamps = effective_timestamps(&records);
    let mut candidates: Vec<Candidate> = records
        .into_iter()
        .zip(timestamps)
        .map(|(record, ts)| {
            let call = normalize_record(&record);
            let fingerprint = Fingerprint::of_request(&call.request);
            Candidate {
                ts,
                record,
                call,
                fingerprint,
            }
        })
        .collect();
    // Write order breaks timestamp ties.
    candidates.sort_by(|a, b| (a.ts, a.record.seq).cmp(&(b.ts, b.record.seq)));

    let mut groups: Vec<Vec<Candidate>> = Vec::new();
    let mut by_digest: HashMap<String, Vec<usize>> = HashMap::new();
    for candidate in candidates {
        let slots = by_digest
            .entry(candidate.fingerprint.digest.clone())
            .or_default();
        let existing = slots
            .iter()
            .copied()
            .find(|&g| groups[g][0].fingerprint.elements == candidate.fingerprint.elements);
        match existing {
            Some(g) => groups[g].push(candidate),
            None => {
                slots.push(groups.len());
                groups.push(vec![candidate]);
            }
        }
    }

    let mut out = Deduplicated::default();
    for (index, mut members) in groups.into_iter().enumerate() {
        let attempts = members.len();
        let attempt_seqs: Vec<usize> = members.iter().map(|c| c.record.seq).collect();
        let chosen = members
            .iter()
            .rposition(|c| c.record.success)
            .unwrap_or(attempts - 1);
        let failed = !members[chosen].record.success;
        let rep = members.swap_remove(chosen);
        if failed {
            out.warnings
                .push(ReconcileWarning::failed_turn(index, attempts));
        }
        let generation = !failed && !rep.call.response.is_empty();
        debug!(
            turn = index,
            attempts,
            seq = rep.record.seq,
            generation,
            failed,
            "logical turn"
        );
        out.turns.push(LogicalTurn {
            index,
            record: rep.record,
            call: rep.call,
            generation,
            failed,
            attempts,
            attempt_seqs,
            fingerprint: rep.fingerprint,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_record_line;
    use crate::test_support::flat_record;
    use serde_json::Value;

    fn records(values: &[Value]) -> Vec<RawCallRecord> {
        values
            .iter()
            .enumerate()
            .map(|(seq, v)| parse_record_line(&v.to_string(), seq, seq + 1).expect("record"))
            .collect()
    }

    #[test]
    fn retry_collapses_to_latest_success() {
        let recs = records(&[
            flat_record("a", 100, true, &["hi"], "hello"),
            flat_record("a", 200, true, &["hi"], "hello again"),
            flat_record("a", 300, true, &["hi", "hello again", "bye"], "goodbye"),
        ]);
        let out = deduplicate(recs);
        assert_eq!(out.turns.len(), 2);
        assert_eq!(out.turns[0].attempts, 2);
        assert_eq!(out.turns[0].record.seq, 1);
        assert_eq!(out.turns[0].call.response.text, "hello again");
        assert!(out.turns[0].generation);
        assert_eq!(out.turns[1].index, 1);
        assert!(out.turns[0].fingerprint.is_strict_prefix_of(&out.turns[1].fingerprint));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn success_beats_later_failure() {
        let recs = records(&[
            flat_record("a", 100, true, &["hi"], "hello"),
            flat_record("a", 200, false, &["hi"], ""),
        ]);
        let out = deduplicate(recs);
        assert_eq!(out.turns.len(), 1);
        assert_eq!(out.turns[0].record.seq, 0);
        assert!(!out.turns[0].failed);
    }

    #[test]
    fn all_failed_group_keeps_last_attempt_and_warns() {
        let recs = records(&[
            flat_record("a", 100, false, &["hi"], ""),
            flat_record("a", 200, false, &["hi"], "partial"),
        ]);
        let out = deduplicate(recs);
        assert_eq!(out.turns.len(), 1);
        let turn = &out.turns[0];
        assert!(turn.failed);
        assert!(!turn.generation);
        assert_eq!(turn.record.seq, 1);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].turn_index, Some(0));
    }

    #[test]
    fn timestamp_ties_resolve_by_write_order() {
        let recs = records(&[
            flat_record("a", 100, true, &["hi"], "first"),
            flat_record("a", 100, true, &["hi"], "second"),
        ]);
        let out = deduplicate(recs);
        assert_eq!(out.turns[0].call.response.text, "second");
        assert_eq!(out.turns[0].attempt_seqs, vec![0, 1]);
    }

    #[test]
    fn out_of_order_writes_are_sorted_by_timestamp() {
        let recs = records(&[
            flat_record("a", 300, true, &["hi", "hello", "bye"], "goodbye"),
            flat_record("a", 100, true, &["hi"], "hello"),
        ]);
        let out = deduplicate(recs);
        assert_eq!(out.turns.len(), 2);
        assert_eq!(out.turns[0].call.response.text, "hello");
        assert_eq!(out.turns[1].call.response.text, "goodbye");
    }

    #[test]
    fn reasoning_and_system_prompt_shape_the_fingerprint_correctly() {
        let with_thinking = serde_json::json!({
            "instance_id": "a", "timestamp": 1,
            "request": {"system": [{"type": "text", "text": "sys", "cache_control": {"type": "ephemeral"}}],
                        "messages": [{"role": "user", "content": "hi"},
                                     {"role": "assistant", "content": [{"type": "thinking", "thinking": "x", "signature": "s"}, {"type": "text", "text": "hello"}]},
                                     {"role": "user", "content": "bye"}]},
            "response": {"content": "ok"}
        });
        let stripped = serde_json::json!({
            "instance_id": "a", "timestamp": 2,
            "request": {"system": "sys",
                        "messages": [{"role": "user", "content": "hi"},
                                     {"role": "assistant", "content": "hello"},
                                     {"role": "user", "content": "bye"}]},
            "response": {"content": "ok"}
        });
        let other_system = serde_json::json!({
            "instance_id": "a", "timestamp": 3,
            "request": {"system": "different",
                        "messages": [{"role": "user", "content": "hi"},
                                     {"role": "assistant", "content": "hello"},
                                     {"role": "user", "content": "bye"}]},
            "response": {"content": "ok"}
        });
        let out = deduplicate(records(&[with_thinking, stripped, other_system]));
        assert_eq!(out.turns.len(), 2);
        assert_eq!(out.turns[0].attempts, 2);
    }

    #[test]
    fn empty_history_is_its_own_turn() {
        let recs = records(&[
            flat_record("a", 100, true, &[], "warmup"),
            flat_record("a", 200, true, &["hi"], "hello"),
        ]);
        let out = deduplicate(recs);
        assert_eq!(out.turns.len(), 2);
        assert!(out.turns[0].fingerprint.is_empty());
        assert!(!out.turns[1].fingerprint.is_empty());
    }
}
