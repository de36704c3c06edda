use crate::error::{ReconcileError, ReconcileWarning};
use crate::record::{parse_record_line, RawCallRecord};
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use traj_core::{sanitize_for_fs, RAW_LOG_EXTENSION, RAW_LOG_GZ_EXTENSION};
use walkdir::WalkDir;

/// Records loaded for one instance, in write order.
#[derive(Debug, Clone, Default)]
pub struct InstanceRecords {
    pub records: Vec<RawCallRecord>,
    pub warnings: Vec<ReconcileWarning>,
    pub lines_read: usize,
    pub skipped: usize,
    pub excluded: usize,
}

pub trait RecordStore: Send + Sync {
    /// Every instance the store holds records for, sorted.
    fn instance_ids(&self) -> Vec<String>;

    fn load(
        &self,
        instance_id: &str,
        exclude_models: &[String],
    ) -> Result<InstanceRecords, ReconcileError>;

    /// Problems found while indexing that belong to no single instance.
    fn store_warnings(&self) -> Vec<ReconcileWarning> {
        Vec::new()
    }
}

/// Opens the store matching `input`: a directory of per-instance logs or a
/// single combined log file. A missing input is the only fatal case.
pub fn open_store(input: &Path) -> Result<Box<dyn RecordStore>> {
    if input.is_dir() {
        return Ok(Box::new(DirRecordStore::open(input)?));
    }
    if input.is_file() {
        return Ok(Box::new(CombinedLogStore::open(input)?));
    }
    Err(anyhow!("input location not found: {}", input.display()))
}

/// Directory layout: `<instance_id>.jsonl` or `<instance_id>.jsonl.gz`,
/// found at any depth below the root.
pub struct DirRecordStore {
    root: PathBuf,
    index: BTreeMap<String, PathBuf>,
    warnings: Vec<ReconcileWarning>,
}

impl DirRecordStore {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!("record directory not found: {}", root.display()));
        }
        let mut index: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut warnings = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(instance_id) = instance_id_for_file(entry.path()) else {
                continue;
            };
            if let Some(existing) = index.get(&instance_id) {
                let message = format!(
                    "instance {} has more than one log; using {} and ignoring {}",
                    instance_id,
                    existing.display(),
                    entry.path().display()
                );
                warn!("{}", message);
                warnings.push(ReconcileWarning::store(message));
                continue;
            }
            index.insert(instance_id, entry.path().to_path_buf());
        }
        debug!(root = %root.display(), instances = index.len(), "indexed record directory");
        Ok(Self {
            root: root.to_path_buf(),
            index,
            warnings,
        })
    }
}

impl RecordStore for DirRecordStore {
    fn instance_ids(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn load(
        &self,
        instance_id: &str,
        exclude_models: &[String],
    ) -> Result<InstanceRecords, ReconcileError> {
        let Some(path) = self.index.get(instance_id) else {
            return Err(ReconcileError::SourceMissing {
                instance_id: instance_id.to_string(),
                path: self.root.join(format!(
                    "{}.{}",
                    sanitize_for_fs(instance_id),
                    RAW_LOG_EXTENSION
                )),
            });
        };
        let reader = open_log(path).map_err(|source| ReconcileError::Store {
            instance_id: instance_id.to_string(),
            source,
        })?;
        let mut loaded = InstanceRecords::default();
        for (line_no, line) in read_lines(reader, &mut loaded.warnings) {
            loaded.lines_read += 1;
            match line.and_then(|text| parse_record_line(&text, line_no - 1, line_no)) {
                Ok(record) => push_record(&mut loaded, record, exclude_models),
                Err(err) => {
                    warn!(instance_id, "skipping record: {}", err);
                    loaded.skipped += 1;
                    loaded.warnings.push(err.into_warning());
                }
            }
        }
        Ok(loaded)
    }

    fn store_warnings(&self) -> Vec<ReconcileWarning> {
        self.warnings.clone()
    }
}

/// Single JSONL file holding many instances, partitioned by each record's
/// `instance_id` (or `session_id`).
pub struct CombinedLogStore {
    path: PathBuf,
    buckets: BTreeMap<String, Vec<RawCallRecord>>,
    warnings: Vec<ReconcileWarning>,
}

impl CombinedLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = open_log(path)?;
        let mut warnings = Vec::new();
        let mut buckets: BTreeMap<String, Vec<RawCallRecord>> = BTreeMap::new();
        for (line_no, line) in read_lines(reader, &mut warnings) {
            match line.and_then(|text| parse_record_line(&text, line_no - 1, line_no)) {
                Ok(record) => match record.instance_id.clone() {
                    Some(id) if !id.is_empty() => buckets.entry(id).or_default().push(record),
                    _ => {
                        let message =
                            format!("record at line {} names no instance; skipped", line_no);
                        warn!("{}", message);
                        warnings.push(ReconcileWarning::store(message));
                    }
                },
                Err(err) => {
                    warn!("skipping record: {}", err);
                    warnings.push(err.into_warning());
                }
            }
        }
        debug!(path = %path.display(), instances = buckets.len(), "partitioned combined log");
        Ok(Self {
            path: path.to_path_buf(),
            buckets,
            warnings,
        })
    }
}

impl RecordStore for CombinedLogStore {
    fn instance_ids(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    fn load(
        &self,
        instance_id: &str,
        exclude_models: &[String],
    ) -> Result<InstanceRecords, ReconcileError> {
        let bucket = self
            .buckets
            .get(instance_id)
            .ok_or_else(|| ReconcileError::SourceMissing {
                instance_id: instance_id.to_string(),
                path: self.path.clone(),
            })?;
        let mut loaded = InstanceRecords::default();
        for record in bucket {
            loaded.lines_read += 1;
            push_record(&mut loaded, record.clone(), exclude_models);
        }
        Ok(loaded)
    }

    fn store_warnings(&self) -> Vec<ReconcileWarning> {
        self.warnings.clone()
    }
}

fn push_record(loaded: &mut InstanceRecords, record: RawCallRecord, exclude_models: &[String]) {
    if record.model_is_excluded(exclude_models) {
        debug!(model = %record.model, line = record.line, "excluded record by model");
        loaded.excluded += 1;
        return;
    }
    loaded.records.push(record);
}

fn instance_id_for_file(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(&format!(".{}", RAW_LOG_GZ_EXTENSION))
        .or_else(|| name.strip_suffix(&format!(".{}", RAW_LOG_EXTENSION)))?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

fn open_log(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let is_gz = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".gz"))
        .unwrap_or(false);
    let inner: Box<dyn Read> = if is_gz {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(inner)))
}

/// Non-blank lines with their one-based line numbers. A line that is not
/// valid UTF-8 comes back as a `RecordParse` error for that line only. An
/// I/O error (for example a truncated gzip stream) ends the read with a
/// store warning; the lines already read are kept.
fn read_lines(
    mut reader: Box<dyn BufRead>,
    warnings: &mut Vec<ReconcileWarning>,
) -> Vec<(usize, Result<String, ReconcileError>)> {
    let mut out = Vec::new();
    let mut buf = Vec::new();
    let mut line_no = 0_usize;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                line_no += 1;
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                match String::from_utf8(std::mem::take(&mut buf)) {
                    Ok(text) if text.trim().is_empty() => {}
                    Ok(text) => out.push((line_no, Ok(text))),
                    Err(err) => out.push((
                        line_no,
                        Err(ReconcileError::RecordParse {
                            line: line_no,
                            message: format!("invalid UTF-8: {}", err.utf8_error()),
                        }),
                    )),
                }
            }
            Err(err) => {
                let message = format!("read stopped after line {}: {}", line_no, err);
                warn!("{}", message);
                warnings.push(ReconcileWarning::store(message));
                break;
            }
        }
    }
    out
}
