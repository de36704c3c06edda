use crate::config::{InstanceConfig, OutputLayout};
use crate::dedup::LogicalTurn;
use crate::merge::CanonicalMessage;
use crate::normalize::ToolSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use traj_core::{
    atomic_write_json_pretty, ensure_dir, sanitize_for_fs, sha256_bytes, TRAJECTORY_DOC_EXTENSION,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryMeta {
    pub session_id: String,
    pub biz_id: String,
    pub model: String,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaffold: Option<String>,
    /// Request `metadata` passed through; the typed fields above win.
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

const RESERVED_META_KEYS: [&str; 5] = ["session_id", "biz_id", "model", "max_tokens", "scaffold"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

impl ToolDefinition {
    /// OpenAI function form. Only `properties` and `required` survive from
    /// the source schema.
    pub fn from_spec(spec: &ToolSpec) -> Self {
        let mut parameters = Map::new();
        parameters.insert("type".to_string(), json!("object"));
        parameters.insert(
            "properties".to_string(),
            spec.parameters
                .get("properties")
                .cloned()
                .unwrap_or_else(|| json!({})),
        );
        if let Some(required) = spec.parameters.get("required") {
            parameters.insert("required".to_string(), required.clone());
        }
        Self {
            kind: "function".to_string(),
            function: ToolFunction {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: Value::Object(parameters),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub meta: TrajectoryMeta,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<CanonicalMessage>,
}

pub fn build_trajectory(
    instance_id: &str,
    turns: &[LogicalTurn],
    messages: Vec<CanonicalMessage>,
    config: Option<&InstanceConfig>,
) -> Trajectory {
    let records = || turns.iter().map(|t| &t.record);
    let biz_id = config
        .and_then(|c| c.biz_id.clone())
        .or_else(|| records().find_map(|r| r.biz_id.clone()))
        .unwrap_or_default();
    let model = config
        .and_then(|c| c.model.clone())
        .or_else(|| {
            records()
                .map(|r| r.model.clone())
                .find(|m| !m.is_empty())
        })
        .unwrap_or_default();
    let max_tokens = config
        .and_then(|c| c.max_tokens)
        .or_else(|| records().find_map(|r| r.max_tokens))
        .unwrap_or(0);

    let metadata: BTreeMap<String, Value> = records()
        .rev()
        .filter_map(|r| r.request.get("metadata").and_then(Value::as_object))
        .find(|m| !m.is_empty())
        .map(|m| {
            m.iter()
                .filter(|(k, _)| !RESERVED_META_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    let tools = turns
        .iter()
        .rev()
        .map(|t| &t.call.request.tools)
        .find(|tools| !tools.is_empty())
        .map(|tools| tools.iter().map(ToolDefinition::from_spec).collect())
        .unwrap_or_default();

    Trajectory {
        meta: TrajectoryMeta {
            session_id: instance_id.to_string(),
            biz_id,
            model,
            max_tokens,
            scaffold: config.and_then(|c| c.scaffold.clone()),
            metadata,
        },
        tools,
        messages,
    }
}

pub trait TrajectorySink {
    fn write_trajectory(&mut self, instance_id: &str, trajectory: &Trajectory) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// All trajectories in one file, one per line. The file is truncated on
/// open so a rerun reproduces it exactly.
pub struct JsonlTrajectorySink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTrajectorySink {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open trajectory output {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl TrajectorySink for JsonlTrajectorySink {
    fn write_trajectory(&mut self, _instance_id: &str, trajectory: &Trajectory) -> Result<()> {
        serde_json::to_writer(&mut self.writer, trajectory)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

/// One `<instance_id>.json` per instance.
pub struct DirTrajectorySink {
    dir: PathBuf,
}

impl DirTrajectorySink {
    pub fn new(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Ids that sanitizing changed get a digest suffix, so `task/1` and
    /// `task_1` never share a file.
    pub fn path_for(&self, instance_id: &str) -> PathBuf {
        let sanitized = sanitize_for_fs(instance_id);
        let stem = if sanitized == instance_id {
            sanitized
        } else {
            let digest = sha256_bytes(instance_id.as_bytes());
            let hex = digest.trim_start_matches("sha256:");
            format!("{}-{}", sanitized, &hex[..12])
        };
        self.dir
            .join(format!("{}.{}", stem, TRAJECTORY_DOC_EXTENSION))
    }
}

impl TrajectorySink for DirTrajectorySink {
    fn write_trajectory(&mut self, instance_id: &str, trajectory: &Trajectory) -> Result<()> {
        atomic_write_json_pretty(&self.path_for(instance_id), &serde_json::to_value(trajectory)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn open_sink(layout: OutputLayout, output: &Path) -> Result<Box<dyn TrajectorySink>> {
    Ok(match layout {
        OutputLayout::Jsonl => Box::new(JsonlTrajectorySink::new(output)?),
        OutputLayout::Dir => Box::new(DirTrajectorySink::new(output)?),
    })
}

pub fn write_summary<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    atomic_write_json_pretty(path, &serde_json::to_value(summary)?)
        .with_context(|| format!("write run summary {}", path.display()))
}

/// Reads an aggregated JSONL output back, skipping blank lines.
pub fn read_trajectories(path: &Path) -> Result<Vec<Trajectory>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{} line {}", path.display(), idx + 1))
        })
        .collect()
}
