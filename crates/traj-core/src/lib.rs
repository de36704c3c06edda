use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const RAW_LOG_EXTENSION: &str = "jsonl";
pub const RAW_LOG_GZ_EXTENSION: &str = "jsonl.gz";
pub const TRAJECTORY_DOC_EXTENSION: &str = "json";
pub const DEFAULT_SUMMARY_SUFFIX: &str = ".summary.json";

pub const TRAJECTORY_SCHEMA_NAME: &str = "trajectory_v1.jsonschema";
pub const RUN_SUMMARY_SCHEMA_NAME: &str = "run_summary_v1.jsonschema";
pub const RUN_SUMMARY_SCHEMA_VERSION: &str = "run_summary_v1";

pub const TRAJ_ENV_MAX_IN_FLIGHT: &str = "TRAJ_MAX_IN_FLIGHT";
pub const TRAJ_ENV_LOG: &str = "RUST_LOG";

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Serializes with object keys sorted at every depth, so structurally equal
/// values always produce the same string.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&quote_json_string(s)),
        Value::Array(arr) => {
            out.push('[');
            for (idx, item) in arr.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (k, v)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&quote_json_string(k));
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

fn quote_json_string(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| format!("\"{}\"", raw.escape_default()))
}

/// Digest over an ordered list of already-canonical parts. Parts are
/// length-prefixed so `["ab","c"]` and `["a","bc"]` never collide.
pub fn sequence_digest<S: AsRef<str>>(parts: &[S]) -> String {
    let mut buf = Vec::new();
    for part in parts {
        let part = part.as_ref();
        buf.extend_from_slice(&(part.len() as u64).to_le_bytes());
        buf.extend_from_slice(part.as_bytes());
    }
    sha256_bytes(&buf)
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Instance ids end up in file names; anything outside `[A-Za-z0-9._-]`
/// is replaced.
pub fn sanitize_for_fs(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": null}], "c": "x"}});
        let b = json!({"a": {"c": "x", "d": [1, {"y": null, "z": 0}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":"x","d":[1,{"y":null,"z":0}]},"b":1}"#
        );
        assert_eq!(
            sha256_bytes(canonical_json(&a).as_bytes()),
            sha256_bytes(canonical_json(&b).as_bytes())
        );
    }

    #[test]
    fn sequence_digest_is_boundary_sensitive() {
        assert_ne!(sequence_digest(&["ab", "c"]), sequence_digest(&["a", "bc"]));
        assert_eq!(sequence_digest(&["a", "b"]), sequence_digest(&["a", "b"]));
        assert!(sequence_digest::<&str>(&[]).starts_with("sha256:"));
    }

    #[test]
    fn sanitize_for_fs_replaces_separators() {
        assert_eq!(sanitize_for_fs("task/01 a"), "task_01_a");
        assert_eq!(sanitize_for_fs("bench-md.emoji_001"), "bench-md.emoji_001");
        assert_eq!(sanitize_for_fs(".."), "_");
        assert_eq!(sanitize_for_fs(""), "_");
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = std::env::temp_dir().join(format!(
            "traj_core_atomic_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = dir.join("nested").join("out.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_json_pretty(&path, &json!({"k": 1})).expect("second write");
        let raw = fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("\"k\": 1"));
        assert!(raw.ends_with('\n'));
        let _ = fs::remove_dir_all(&dir);
    }
}
