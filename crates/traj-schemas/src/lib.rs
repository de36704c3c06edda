//! JSON schemas for reconciled trajectories and run summaries, embedded at
//! build time from the workspace `schemas/` directory.

use anyhow::{anyhow, Context, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::borrow::Cow;
use std::fs;
use std::path::Path;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

/// File names accepted by `traj schema-validate`, sorted.
pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS_DIR
        .files()
        .filter_map(|f| f.path().file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn schema_source(name: &str) -> Result<Cow<'static, str>> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let text = std::str::from_utf8(file.contents())
            .with_context(|| format!("schema {} is not UTF-8", name))?;
        return Ok(Cow::Borrowed(text));
    }
    // A schema edited or added after this crate was built is still read from
    // the workspace checkout.
    let on_disk = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if on_disk.is_file() {
        let text = fs::read_to_string(&on_disk)
            .with_context(|| format!("read schema {}", on_disk.display()))?;
        return Ok(Cow::Owned(text));
    }
    Err(anyhow!(
        "schema not found: {} (known: {})",
        name,
        schema_names().join(", ")
    ))
}

pub fn load_schema(name: &str) -> Result<Value> {
    let source = schema_source(name)?;
    serde_json::from_str(&source).with_context(|| format!("parse schema {}", name))
}

/// Compiles a trajectory or run-summary schema as Draft 7. The schema
/// document is leaked because the compiled validator borrows it; callers
/// compile once per command.
pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let document: &'static Value = Box::leak(Box::new(load_schema(name)?));
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(document)
        .map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))
}

/// Validates `value` against a named schema, joining every violation into
/// one error message.
pub fn validate_value(schema: &JSONSchema, value: &Value) -> Result<()> {
    if let Err(errors) = schema.validate(value) {
        let msgs: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(anyhow!(msgs.join("; ")));
    }
    Ok(())
}
