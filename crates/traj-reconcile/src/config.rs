use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use traj_core::TRAJ_ENV_MAX_IN_FLIGHT;

pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// One aggregated JSONL file, one trajectory per line.
    #[default]
    Jsonl,
    /// One pretty JSON document per instance.
    Dir,
}

impl FromStr for OutputLayout {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Ok(Self::Jsonl),
            "dir" => Ok(Self::Dir),
            other => Err(anyhow!("unknown output layout: {} (expected jsonl|dir)", other)),
        }
    }
}

impl fmt::Display for OutputLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jsonl => "jsonl",
            Self::Dir => "dir",
        })
    }
}

/// Per-instance metadata. Only used to fill the trajectory `meta` block;
/// values here win over whatever the records carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub scaffold: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub biz_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub layout: OutputLayout,
    pub concurrency: Option<usize>,
    pub deadline_seconds: Option<u64>,
    pub exclude_models: Vec<String>,
    /// Drop trajectories with fewer assistant messages than this.
    pub min_assistant_turns: Option<usize>,
    pub instances: Vec<InstanceConfig>,
}

impl RunConfig {
    /// Reads YAML or JSON, chosen by extension. Unknown extensions are read
    /// as YAML, which also accepts JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read run config {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config: RunConfig = if is_json {
            serde_json::from_str(&raw)
                .with_context(|| format!("parse run config {}", path.display()))?
        } else {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("parse run config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (idx, instance) in self.instances.iter().enumerate() {
            if instance.instance_id.trim().is_empty() {
                return Err(anyhow!("instances[{}].instance_id must be non-empty", idx));
            }
            if !seen.insert(instance.instance_id.as_str()) {
                return Err(anyhow!(
                    "instances[{}].instance_id duplicates {}",
                    idx,
                    instance.instance_id
                ));
            }
        }
        if self.concurrency == Some(0) {
            return Err(anyhow!("concurrency must be > 0"));
        }
        Ok(())
    }

    pub fn instance(&self, instance_id: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    /// Configured ids in file order, or `None` when the store decides.
    pub fn instance_ids(&self) -> Option<Vec<String>> {
        if self.instances.is_empty() {
            None
        } else {
            Some(self.instances.iter().map(|i| i.instance_id.clone()).collect())
        }
    }
}

pub fn parse_optional_positive_usize_env(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => parse_positive(name, &raw),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<Option<usize>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed
        .parse::<usize>()
        .map_err(|_| anyhow!("{} must be a positive integer when set (got: {})", name, raw))?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0 when set", name));
    }
    Ok(Some(parsed))
}

/// Applies the environment ceiling to the requested worker count. The
/// second value is a warning to surface when the ceiling lowered it.
pub fn resolve_max_in_flight(requested: usize, ceiling: Option<usize>) -> (usize, Option<String>) {
    let effective = ceiling
        .map(|c| requested.min(c))
        .unwrap_or(requested)
        .max(1);
    if effective < requested {
        let warning = format!(
            "worker capacity ceiling applied: requested={} effective={} env_var={}",
            requested, effective, TRAJ_ENV_MAX_IN_FLIGHT
        );
        return (effective, Some(warning));
    }
    (effective, None)
}
