use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use traj_core::ensure_dir;

pub(crate) struct TempDirGuard {
    pub(crate) path: PathBuf,
}

impl TempDirGuard {
    pub(crate) fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&path).expect("temp dir");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Chat history alternating user/assistant, starting with the user.
pub(crate) fn history(turns: &[&str]) -> Vec<Value> {
    turns
        .iter()
        .enumerate()
        .map(|(idx, text)| {
            let role = if idx % 2 == 0 { "user" } else { "assistant" };
            json!({"role": role, "content": text})
        })
        .collect()
}

/// One flat-shape record line.
pub(crate) fn flat_line(instance_id: &str, ts: i64, turns: &[&str], reply: &str) -> String {
    flat_record(instance_id, ts, true, turns, reply).to_string()
}

pub(crate) fn flat_record(
    instance_id: &str,
    ts: i64,
    success: bool,
    turns: &[&str],
    reply: &str,
) -> Value {
    json!({
        "instance_id": instance_id,
        "timestamp": ts,
        "success": success,
        "model": "test-model",
        "request": {"messages": history(turns)},
        "response": {"content": reply, "finish_reason": "stop"},
        "usage": {"prompt_tokens": 10, "completion_tokens": 2}
    })
}
