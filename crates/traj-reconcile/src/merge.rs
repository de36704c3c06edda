//! Folds logical turns into one message sequence.
//!
//! The fold keeps the running conversation as a list of fingerprint keys
//! (the last turn's request history plus its response, system prompt
//! excluded). A turn whose
//! history extends that list contributes only the suffix; anything else is
//! an inconsistency and falls back to appending whatever has not been
//! emitted yet.

use crate::dedup::LogicalTurn;
use crate::error::{ReconcileError, ReconcileWarning};
use crate::normalize::{NormalizedMessage, Role, ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<CanonicalToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<bool>,
}

impl CanonicalMessage {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            reasoning_content: None,
            tool_calls: None,
            tool_name: None,
            generation: None,
        }
    }

    fn assistant(
        content: String,
        reasoning: Option<String>,
        calls: &[ToolCall],
        generation: bool,
    ) -> Self {
        let tool_calls: Vec<CanonicalToolCall> = calls
            .iter()
            .map(|c| CanonicalToolCall {
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect();
        Self {
            role: Role::Assistant,
            content,
            reasoning_content: reasoning.filter(|r| !r.is_empty()),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_name: None,
            generation: Some(generation),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Merged {
    pub messages: Vec<CanonicalMessage>,
    pub warnings: Vec<ReconcileWarning>,
}

#[derive(Default)]
struct Merger {
    messages: Vec<CanonicalMessage>,
    warnings: Vec<ReconcileWarning>,
    conversation: Vec<String>,
    emitted: HashSet<String>,
    system_emitted: bool,
    last_calls: Vec<ToolCall>,
}

pub fn merge_turns(turns: &[LogicalTurn]) -> Merged {
    let mut merger = Merger::default();
    for turn in turns {
        merger.fold(turn);
    }
    Merged {
        messages: merger.messages,
        warnings: merger.warnings,
    }
}

impl Merger {
    fn fold(&mut self, turn: &LogicalTurn) {
        let request = &turn.call.request;
        if !self.system_emitted {
            self.system_emitted = true;
            if let Some(system) = request.system.as_ref().filter(|s| !s.is_empty()) {
                self.messages
                    .push(CanonicalMessage::plain(Role::System, system.clone()));
            }
        }

        if turn.fingerprint.is_empty() {
            // Opens its own chain; the running conversation is left alone.
            self.emit_response(turn);
            return;
        }

        // History keys only: consecutive turns may add or drop the system prompt.
        let elements = &turn.fingerprint.elements;
        let history = &elements[elements.len() - turn.fingerprint.history_len..];
        if self.extends_conversation(history) {
            for message in &request.messages[self.conversation.len()..] {
                self.emit_history(message);
            }
        } else {
            let diverge_at = self
                .conversation
                .iter()
                .zip(history.iter())
                .take_while(|(a, b)| a == b)
                .count();
            let err = ReconcileError::Inconsistency {
                turn_index: turn.index,
                detail: format!(
                    "history diverges at message {} (running {}, request {})",
                    diverge_at,
                    self.conversation.len(),
                    history.len()
                ),
            };
            warn!("{}", err);
            self.warnings.push(err.into_warning());
            for message in &request.messages {
                if !self.emitted.contains(&message.fingerprint_key()) {
                    self.emit_history(message);
                }
            }
        }

        self.conversation = history.to_vec();
        if let Some(key) = self.emit_response(turn) {
            self.conversation.push(key);
        }
    }

    /// Emits the turn's assistant output, returning its conversation key.
    fn emit_response(&mut self, turn: &LogicalTurn) -> Option<String> {
        let response = &turn.call.response;
        if response.is_empty() {
            debug!(turn = turn.index, failed = turn.failed, "turn has no assistant output");
            return None;
        }
        let reply = response.to_message();
        let key = reply.fingerprint_key();
        self.messages.push(CanonicalMessage::assistant(
            response.text.clone(),
            reply.reasoning(),
            &response.tool_calls,
            turn.generation,
        ));
        self.last_calls = response.tool_calls.clone();
        self.emitted.insert(key.clone());
        Some(key)
    }

    fn extends_conversation(&self, history: &[String]) -> bool {
        self.conversation.len() <= history.len()
            && history[..self.conversation.len()] == self.conversation[..]
    }

    fn emit_history(&mut self, message: &NormalizedMessage) {
        self.emitted.insert(message.fingerprint_key());
        match message.role {
            Role::Assistant => {
                let calls: Vec<ToolCall> = message.tool_calls().into_iter().cloned().collect();
                self.messages.push(CanonicalMessage::assistant(
                    message.text(),
                    message.reasoning(),
                    &calls,
                    false,
                ));
                self.last_calls = calls;
            }
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    self.messages.push(CanonicalMessage::plain(Role::System, text));
                }
            }
            Role::User | Role::Tool => {
                let results = message.tool_results();
                let positions: Vec<Option<usize>> = results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| self.call_position(r, i))
                    .collect();
                let mut order: Vec<usize> = (0..results.len()).collect();
                order.sort_by_key(|&i| positions[i].unwrap_or(usize::MAX));
                let sorted: Vec<(&ToolResult, Option<usize>)> =
                    order.iter().map(|&i| (results[i], positions[i])).collect();
                for (result, position) in sorted {
                    let tool_name = result
                        .name
                        .clone()
                        .or_else(|| position.map(|p| self.last_calls[p].name.clone()))
                        .or_else(|| result.call_id.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let mut msg = CanonicalMessage::plain(Role::Tool, result.content.clone());
                    msg.tool_name = Some(tool_name);
                    self.messages.push(msg);
                }

                let text = message.text();
                if !text.is_empty() {
                    self.messages.push(CanonicalMessage::plain(Role::User, text));
                }
            }
        }
    }

    /// Index of the originating call in the latest assistant message: by id
    /// when the result carries one, else by the result's own position.
    fn call_position(&self, result: &ToolResult, nth: usize) -> Option<usize> {
        match &result.call_id {
            Some(id) => self
                .last_calls
                .iter()
                .position(|c| c.id.as_deref() == Some(id.as_str())),
            None => (nth < self.last_calls.len()).then_some(nth),
        }
    }
}
