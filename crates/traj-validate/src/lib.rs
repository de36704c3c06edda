use anyhow::{anyhow, Result};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use traj_core::TRAJECTORY_DOC_EXTENSION;

#[derive(Debug)]
pub struct TrajectoryValidationError {
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub session_id: Option<String>,
    pub message_index: Option<usize>,
}

impl std::fmt::Display for TrajectoryValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TrajectoryValidationError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub documents: usize,
    pub messages: usize,
}

/// Validates either an aggregated JSONL file or a directory of per-instance
/// `.json` documents. Stops at the first offending document.
pub fn validate_path(path: &Path, schema: &JSONSchema) -> Result<ValidationReport> {
    if path.is_dir() {
        validate_document_dir(path, schema)
    } else {
        validate_trajectory_lines(path, schema)
    }
}

pub fn validate_trajectory_lines(path: &Path, schema: &JSONSchema) -> Result<ValidationReport> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut report = ValidationReport::default();
    let mut seen_sessions: HashSet<String> = HashSet::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(|e| TrajectoryValidationError {
            message: format!("invalid JSON at line {}: {}", line_no, e),
            file: Some(path.to_path_buf()),
            line: Some(line_no),
            session_id: None,
            message_index: None,
        })?;
        let messages = check_document(&value, schema).map_err(|mut err| {
            err.message = format!("line {}: {}", line_no, err.message);
            err.file = Some(path.to_path_buf());
            err.line = Some(line_no);
            err
        })?;
        let session_id = session_id_of(&value).unwrap_or_default();
        if !seen_sessions.insert(session_id.clone()) {
            return Err(TrajectoryValidationError {
                message: format!("duplicate trajectory for session {} at line {}", session_id, line_no),
                file: Some(path.to_path_buf()),
                line: Some(line_no),
                session_id: Some(session_id),
                message_index: None,
            }
            .into());
        }
        report.documents += 1;
        report.messages += messages;
    }
    Ok(report)
}

pub fn validate_document_dir(dir: &Path, schema: &JSONSchema) -> Result<ValidationReport> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|e| e.to_str()) == Some(TRAJECTORY_DOC_EXTENSION)
        })
        .collect();
    paths.sort();
    if paths.is_empty() {
        return Err(anyhow!("no trajectory documents in {}", dir.display()));
    }

    let mut report = ValidationReport::default();
    for path in paths {
        let data = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&data).map_err(|e| TrajectoryValidationError {
            message: format!("invalid JSON in {}: {}", path.display(), e),
            file: Some(path.clone()),
            line: None,
            session_id: None,
            message_index: None,
        })?;
        let messages = check_document(&value, schema).map_err(|mut err| {
            err.message = format!("{}: {}", path.display(), err.message);
            err.file = Some(path.clone());
            err
        })?;
        report.documents += 1;
        report.messages += messages;
    }
    Ok(report)
}

/// Schema plus the invariants the schema cannot express. Returns the number
/// of messages checked.
pub fn check_document(value: &Value, schema: &JSONSchema) -> Result<usize, TrajectoryValidationError> {
    let session_id = session_id_of(value);
    let fail = |message: String, message_index: Option<usize>| TrajectoryValidationError {
        message,
        file: None,
        line: None,
        session_id: session_id.clone(),
        message_index,
    };

    if let Err(errors) = schema.validate(value) {
        let msgs: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(fail(format!("schema validation failed: {}", msgs.join("; ")), None));
    }

    let mut tool_names = HashSet::new();
    for tool in value["tools"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let name = tool
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !tool_names.insert(name) {
            return Err(fail(format!("tool {} declared twice", name), None));
        }
    }

    let messages = value["messages"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    let mut previous: Option<&Value> = None;
    for (idx, message) in messages.iter().enumerate() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        let has_generation = message.get("generation").is_some();
        match role {
            "assistant" if !has_generation => {
                return Err(fail(
                    format!("assistant message {} has no generation flag", idx),
                    Some(idx),
                ));
            }
            "assistant" => {}
            _ if has_generation => {
                return Err(fail(
                    format!("{} message {} carries a generation flag", role, idx),
                    Some(idx),
                ));
            }
            _ => {}
        }
        if role == "tool" && message.get("tool_name").is_none() {
            return Err(fail(format!("tool message {} has no tool_name", idx), Some(idx)));
        }
        if role != "tool" && message.get("tool_name").is_some() {
            return Err(fail(
                format!("{} message {} carries a tool_name", role, idx),
                Some(idx),
            ));
        }
        if let Some(prev) = previous {
            if role != "tool" && same_message(prev, message) {
                return Err(fail(
                    format!("message {} repeats message {}", idx, idx - 1),
                    Some(idx),
                ));
            }
        }
        previous = Some(message);
    }
    Ok(messages.len())
}

fn same_message(a: &Value, b: &Value) -> bool {
    a.get("role") == b.get("role")
        && a.get("content") == b.get("content")
        && a.get("tool_calls") == b.get("tool_calls")
}

fn session_id_of(value: &Value) -> Option<String> {
    value
        .pointer("/meta/session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use traj_core::TRAJECTORY_SCHEMA_NAME;
    use traj_schemas::compile_schema;

    fn temp_root(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "traj_validate_{}_{}_{}",
            label,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn doc(session: &str, messages: Value) -> Value {
        json!({
            "meta": {"session_id": session, "biz_id": "", "model": "m", "max_tokens": 0},
            "tools": [{"type": "function", "function": {"name": "Bash", "description": "", "parameters": {"type": "object", "properties": {}}}}],
            "messages": messages
        })
    }

    fn good_messages() -> Value {
        json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "", "generation": true,
             "tool_calls": [{"name": "Bash", "arguments": {"cmd": "ls"}}]},
            {"role": "tool", "content": "a.txt", "tool_name": "Bash"},
            {"role": "assistant", "content": "done", "generation": true}
        ])
    }

    fn write_lines(path: &Path, docs: &[Value]) {
        let body: Vec<String> = docs.iter().map(|d| d.to_string()).collect();
        fs::write(path, body.join("\n")).expect("write jsonl");
    }

    #[test]
    fn accepts_well_formed_jsonl() {
        let schema = compile_schema(TRAJECTORY_SCHEMA_NAME).expect("schema");
        let root = temp_root("ok");
        let path = root.join("out.jsonl");
        write_lines(&path, &[doc("a", good_messages()), doc("b", json!([]))]);
        let report = validate_path(&path, &schema).expect("valid");
        assert_eq!(report, ValidationReport { documents: 2, messages: 4 });
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reports_first_offending_line() {
        let schema = compile_schema(TRAJECTORY_SCHEMA_NAME).expect("schema");
        let root = temp_root("bad_line");
        let path = root.join("out.jsonl");
        let missing_flag = doc("b", json!([{"role": "user", "content": "hi"}, {"role": "assistant", "content": "x"}]));
        write_lines(&path, &[doc("a", good_messages()), missing_flag]);
        let err = validate_path(&path, &schema).expect_err("must fail");
        let err = err
            .downcast_ref::<TrajectoryValidationError>()
            .expect("typed error");
        assert_eq!(err.line, Some(2));
        assert_eq!(err.session_id.as_deref(), Some("b"));
        assert_eq!(err.message_index, Some(1));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rejects_duplicates_and_misplaced_fields() {
        let schema = compile_schema(TRAJECTORY_SCHEMA_NAME).expect("schema");
        let repeated = doc("a", json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello", "generation": true},
            {"role": "assistant", "content": "hello", "generation": false}
        ]));
        let err = check_document(&repeated, &schema).expect_err("repeat");
        assert!(err.message.contains("repeats"));

        let misplaced = doc("a", json!([{"role": "user", "content": "hi", "generation": true}]));
        assert!(check_document(&misplaced, &schema).is_err());

        let nameless_tool = doc("a", json!([{"role": "tool", "content": "out"}]));
        assert_eq!(
            check_document(&nameless_tool, &schema).expect_err("no name").message_index,
            Some(0)
        );

        let root = temp_root("dup_session");
        let path = root.join("out.jsonl");
        write_lines(&path, &[doc("a", json!([])), doc("a", json!([]))]);
        let err = validate_path(&path, &schema).expect_err("duplicate session");
        assert!(err.to_string().contains("duplicate trajectory"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn validates_document_directories() {
        let schema = compile_schema(TRAJECTORY_SCHEMA_NAME).expect("schema");
        let root = temp_root("dir");
        fs::write(root.join("a.json"), serde_json::to_vec_pretty(&doc("a", good_messages())).expect("json"))
            .expect("write a");
        fs::write(root.join("notes.txt"), "skip").expect("write txt");
        let report = validate_path(&root, &schema).expect("valid dir");
        assert_eq!(report.documents, 1);

        fs::write(root.join("b.json"), "{").expect("write b");
        let err = validate_path(&root, &schema).expect_err("broken doc");
        assert!(err.to_string().contains("b.json"));

        let empty = root.join("empty");
        fs::create_dir_all(&empty).expect("empty dir");
        assert!(validate_path(&empty, &schema).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
