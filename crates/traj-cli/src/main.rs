use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use traj_core::{DEFAULT_SUMMARY_SUFFIX, TRAJECTORY_SCHEMA_NAME, TRAJ_ENV_LOG};
use traj_reconcile::config::DEFAULT_CONCURRENCY;
use traj_reconcile::{
    open_sink, open_store, reconcile_instance, run_batch, InstanceConfig, OutputLayout,
    RecordStore, RunConfig, RunOptions, RunSummary,
};

#[derive(Parser)]
#[command(name = "traj", version, about = "Reconcile intercepted LLM call logs into trajectories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    #[value(name = "jsonl")]
    Jsonl,
    #[value(name = "dir")]
    Dir,
}

impl From<LayoutArg> for OutputLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Jsonl => OutputLayout::Jsonl,
            LayoutArg::Dir => OutputLayout::Dir,
        }
    }
}

#[derive(Args, Debug, Default)]
struct ReconcileArgs {
    /// Directory of per-instance logs or a single combined log file.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    summary: Option<PathBuf>,
    /// Run config in YAML or JSON.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    deadline_seconds: Option<u64>,
    #[arg(long = "exclude-model")]
    exclude_models: Vec<String>,
    /// Skip writing trajectories with fewer assistant messages.
    #[arg(long)]
    min_assistant_turns: Option<usize>,
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    Reconcile(ReconcileArgs),
    Inspect {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        instance: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long = "exclude-model")]
        exclude_models: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Validate {
        /// Aggregated JSONL output or a directory of documents.
        #[arg(long)]
        trajectories: PathBuf,
        #[arg(long)]
        json: bool,
    },
    SchemaValidate {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(TRAJ_ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(CommandOutcome { payload, success }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

struct CommandOutcome {
    payload: Option<Value>,
    success: bool,
}

impl CommandOutcome {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            success: true,
        }
    }
}

fn run_command(command: Commands) -> Result<CommandOutcome> {
    match command {
        Commands::Reconcile(args) => {
            let json = args.json;
            let config = match &args.config {
                Some(path) => RunConfig::load(path)?,
                None => RunConfig::default(),
            };
            let settings = resolve_reconcile_settings(config, args)?;
            let cancel = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(cancel.clone());
            let summary = execute_reconcile(&settings, Some(cancel))?;
            let success = summary.is_clean();
            if json {
                return Ok(CommandOutcome {
                    payload: Some(json!({
                        "ok": success,
                        "command": "reconcile",
                        "output": settings.output.display().to_string(),
                        "summary_path": settings.summary.display().to_string(),
                        "summary": summary
                    })),
                    success,
                });
            }
            print_summary(&summary, &settings);
            Ok(CommandOutcome {
                payload: None,
                success,
            })
        }
        Commands::Inspect {
            input,
            instance,
            config,
            exclude_models,
            json,
        } => {
            let config = match &config {
                Some(path) => RunConfig::load(path)?,
                None => RunConfig::default(),
            };
            let mut excluded = config.exclude_models.clone();
            excluded.extend(exclude_models);
            let store = open_store(&input)?;
            let reconciled = reconcile_instance(
                store.as_ref(),
                &instance,
                config.instance(&instance),
                &excluded,
            )?;
            let turns: Vec<Value> = reconciled
                .turns
                .iter()
                .map(|t| {
                    json!({
                        "index": t.index,
                        "attempts": t.attempts,
                        "attempt_seqs": t.attempt_seqs,
                        "representative_seq": t.record.seq,
                        "representative_line": t.record.line,
                        "generation": t.generation,
                        "failed": t.failed,
                        "history_len": t.fingerprint.history_len,
                        "fingerprint": t.fingerprint.digest,
                        "finish_reason": t.call.response.finish_reason
                    })
                })
                .collect();
            if json {
                return Ok(CommandOutcome::done(Some(json!({
                    "ok": true,
                    "command": "inspect",
                    "instance_id": instance,
                    "turns": turns,
                    "warnings": reconciled.warnings,
                    "stats": reconciled.stats,
                    "trajectory": reconciled.trajectory
                }))));
            }
            println!("instance: {}", instance);
            println!(
                "records: read={} skipped={} excluded={}",
                reconciled.stats.records_read,
                reconciled.stats.records_skipped,
                reconciled.stats.records_excluded
            );
            for turn in &reconciled.turns {
                println!(
                    "turn {}: attempts={} seq={} generation={} failed={} history={}",
                    turn.index,
                    turn.attempts,
                    turn.record.seq,
                    turn.generation,
                    turn.failed,
                    turn.fingerprint.history_len
                );
            }
            for warning in &reconciled.warnings {
                println!("warning: {}", warning.message);
            }
            println!("messages: {}", reconciled.trajectory.messages.len());
            Ok(CommandOutcome::done(None))
        }
        Commands::Validate { trajectories, json } => {
            let schema = traj_schemas::compile_schema(TRAJECTORY_SCHEMA_NAME)?;
            let report = traj_validate::validate_path(&trajectories, &schema)?;
            if json {
                return Ok(CommandOutcome::done(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "valid": true,
                    "documents": report.documents,
                    "messages": report.messages
                }))));
            }
            println!(
                "ok: {} trajectories, {} messages",
                report.documents, report.messages
            );
            Ok(CommandOutcome::done(None))
        }
        Commands::SchemaValidate { schema, file, json } => {
            let known = traj_schemas::schema_names();
            if !known.contains(&schema) {
                return Err(anyhow!(
                    "unknown schema {} (available: {})",
                    schema,
                    known.join(", ")
                ));
            }
            let compiled = traj_schemas::compile_schema(&schema)?;
            let data = std::fs::read_to_string(&file)?;
            let value: Value = serde_json::from_str(&data)?;
            traj_schemas::validate_value(&compiled, &value)
                .map_err(|e| anyhow!("schema error in {}: {}", file.display(), e))?;
            if json {
                return Ok(CommandOutcome::done(Some(json!({
                    "ok": true,
                    "command": "schema-validate",
                    "valid": true,
                    "schema": schema
                }))));
            }
            println!("ok");
            Ok(CommandOutcome::done(None))
        }
    }
}

#[derive(Debug)]
struct ReconcileSettings {
    input: PathBuf,
    output: PathBuf,
    summary: PathBuf,
    layout: OutputLayout,
    instances: Vec<InstanceConfig>,
    instance_ids: Option<Vec<String>>,
    options: RunOptions,
}

/// Flags win over the config file; exclusion lists are combined.
fn resolve_reconcile_settings(config: RunConfig, args: ReconcileArgs) -> Result<ReconcileSettings> {
    let input = args
        .input
        .or_else(|| config.input.clone())
        .ok_or_else(|| anyhow!("--input is required (or set `input` in the run config)"))?;
    let output = args
        .output
        .or_else(|| config.output.clone())
        .ok_or_else(|| anyhow!("--output is required (or set `output` in the run config)"))?;
    let summary = args
        .summary
        .or_else(|| config.summary.clone())
        .unwrap_or_else(|| default_summary_path(&output));
    let concurrency = args
        .concurrency
        .or(config.concurrency)
        .unwrap_or(DEFAULT_CONCURRENCY);
    if concurrency == 0 {
        return Err(anyhow!("--concurrency must be > 0"));
    }
    let mut exclude_models = config.exclude_models.clone();
    for model in args.exclude_models {
        if !exclude_models.contains(&model) {
            exclude_models.push(model);
        }
    }
    Ok(ReconcileSettings {
        input,
        output,
        summary,
        layout: args.layout.map(Into::into).unwrap_or(config.layout),
        instance_ids: config.instance_ids(),
        instances: config.instances,
        options: RunOptions {
            concurrency,
            deadline: args
                .deadline_seconds
                .or(config.deadline_seconds)
                .map(Duration::from_secs),
            exclude_models,
            cancel: None,
            min_assistant_turns: args
                .min_assistant_turns
                .or(config.min_assistant_turns)
                .unwrap_or(0),
        },
    })
}

/// `out/trajectories.jsonl` -> `out/trajectories.summary.json`; a directory
/// output gets a sibling file so it never mixes with the documents.
fn default_summary_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("trajectories");
    output.with_file_name(format!("{}{}", stem, DEFAULT_SUMMARY_SUFFIX))
}

fn execute_reconcile(settings: &ReconcileSettings, cancel: Option<Arc<AtomicBool>>) -> Result<RunSummary> {
    let store: Arc<dyn RecordStore> = Arc::from(open_store(&settings.input)?);
    let instance_ids = settings
        .instance_ids
        .clone()
        .unwrap_or_else(|| store.instance_ids());
    info!(
        input = %settings.input.display(),
        output = %settings.output.display(),
        layout = %settings.layout,
        instances = instance_ids.len(),
        "starting reconciliation"
    );
    let mut sink = open_sink(settings.layout, &settings.output)?;
    let options = RunOptions {
        cancel,
        ..settings.options.clone()
    };
    let summary = run_batch(
        store,
        instance_ids,
        settings.instances.clone(),
        &options,
        sink.as_mut(),
    )?;
    traj_reconcile::writer::write_summary(&settings.summary, &summary)?;
    Ok(summary)
}

fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    });
    if let Err(err) = result {
        warn!("interrupt handler not installed: {}", err);
    }
}

fn print_summary(summary: &RunSummary, settings: &ReconcileSettings) {
    println!("output: {}", settings.output.display());
    println!("summary: {}", settings.summary.display());
    println!(
        "processed: {} succeeded: {} failed: {} timed_out: {} filtered: {} warnings: {}",
        summary.processed,
        summary.succeeded,
        summary.failed,
        summary.timed_out,
        summary.filtered,
        summary.warnings_total
    );
    for report in summary.instances.iter().filter(|r| r.error.is_some()) {
        if let Some(error) = &report.error {
            println!("  {} [{}]: {}", report.instance_id, error.kind, error.message);
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Reconcile(args) => args.json,
        Commands::Inspect { json, .. }
        | Commands::Validate { json, .. }
        | Commands::SchemaValidate { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!(
            "traj_cli_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn record(instance: &str, ts: i64, history: &[(&str, &str)], reply: &str) -> String {
        let messages: Vec<Value> = history
            .iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect();
        json!({
            "instance_id": instance,
            "timestamp": ts,
            "success": true,
            "model": "m",
            "request": {"messages": messages},
            "response": {"content": reply}
        })
        .to_string()
    }

    #[test]
    fn cli_parses_reconcile_flags() {
        let cli = Cli::try_parse_from([
            "traj",
            "reconcile",
            "--input",
            "raw",
            "--output",
            "out.jsonl",
            "--exclude-model",
            "haiku",
            "--exclude-model",
            "mini",
            "--layout",
            "dir",
            "--deadline-seconds",
            "60",
            "--min-assistant-turns",
            "2",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Reconcile(args) => {
                assert_eq!(args.exclude_models, vec!["haiku".to_string(), "mini".to_string()]);
                assert!(matches!(args.layout, Some(LayoutArg::Dir)));
                assert_eq!(args.deadline_seconds, Some(60));
                assert_eq!(args.min_assistant_turns, Some(2));
                assert!(args.json);
            }
            _ => panic!("expected reconcile"),
        }
        assert!(Cli::try_parse_from(["traj", "reconcile", "--layout", "tar"]).is_err());
    }

    #[test]
    fn flags_override_config_values() {
        let config = RunConfig {
            input: Some(PathBuf::from("from-config")),
            output: Some(PathBuf::from("cfg/out.jsonl")),
            concurrency: Some(3),
            deadline_seconds: Some(10),
            exclude_models: vec!["haiku".to_string()],
            min_assistant_turns: Some(1),
            instances: vec![InstanceConfig {
                instance_id: "a".to_string(),
                ..InstanceConfig::default()
            }],
            ..RunConfig::default()
        };
        let args = ReconcileArgs {
            input: Some(PathBuf::from("from-flag")),
            concurrency: Some(5),
            exclude_models: vec!["haiku".to_string(), "flash".to_string()],
            layout: Some(LayoutArg::Dir),
            min_assistant_turns: Some(3),
            ..ReconcileArgs::default()
        };
        let settings = resolve_reconcile_settings(config, args).expect("settings");
        assert_eq!(settings.options.min_assistant_turns, 3);
        assert_eq!(settings.input, PathBuf::from("from-flag"));
        assert_eq!(settings.output, PathBuf::from("cfg/out.jsonl"));
        assert_eq!(settings.summary, PathBuf::from("cfg/out.summary.json"));
        assert_eq!(settings.layout, OutputLayout::Dir);
        assert_eq!(settings.options.concurrency, 5);
        assert_eq!(settings.options.deadline, Some(Duration::from_secs(10)));
        assert_eq!(
            settings.options.exclude_models,
            vec!["haiku".to_string(), "flash".to_string()]
        );
        assert_eq!(settings.instance_ids, Some(vec!["a".to_string()]));

        let err = resolve_reconcile_settings(RunConfig::default(), ReconcileArgs::default())
            .expect_err("input required");
        assert!(err.to_string().contains("--input"));
    }

    #[test]
    fn default_summary_sits_next_to_output() {
        assert_eq!(
            default_summary_path(Path::new("runs/trajs")),
            PathBuf::from("runs/trajs.summary.json")
        );
        assert_eq!(
            default_summary_path(Path::new("out.jsonl")),
            PathBuf::from("out.summary.json")
        );
    }

    #[test]
    fn reconcile_then_validate_end_to_end() {
        let root = temp_dir("e2e");
        let raw = root.join("raw");
        std::fs::create_dir_all(&raw).expect("raw dir");
        let lines = [
            record("case-1", 100, &[("user", "hi")], "hello"),
            record("case-1", 200, &[("user", "hi")], "hello"),
            record("case-1", 300, &[("user", "hi"), ("assistant", "hello"), ("user", "bye")], "goodbye"),
        ];
        std::fs::write(raw.join("case-1.jsonl"), lines.join("\n")).expect("write log");
        std::fs::write(raw.join("case-2.jsonl"), "").expect("write empty log");

        let output = root.join("out").join("trajectories.jsonl");
        let settings = resolve_reconcile_settings(
            RunConfig::default(),
            ReconcileArgs {
                input: Some(raw),
                output: Some(output.clone()),
                concurrency: Some(2),
                ..ReconcileArgs::default()
            },
        )
        .expect("settings");
        let summary = execute_reconcile(&settings, None).expect("reconcile");
        assert_eq!(summary.succeeded, 2);
        assert!(summary.is_clean());
        assert!(settings.summary.exists());

        let outcome = run_command(Commands::Validate {
            trajectories: output.clone(),
            json: true,
        })
        .expect("validate");
        let payload = outcome.payload.expect("payload");
        assert_eq!(payload["documents"], 2);
        assert_eq!(payload["messages"], 4);

        let outcome = run_command(Commands::SchemaValidate {
            schema: traj_core::RUN_SUMMARY_SCHEMA_NAME.to_string(),
            file: settings.summary.clone(),
            json: true,
        })
        .expect("summary schema");
        assert_eq!(outcome.payload.expect("payload")["valid"], true);
        let err = run_command(Commands::SchemaValidate {
            schema: "nope.jsonschema".to_string(),
            file: settings.summary.clone(),
            json: false,
        })
        .err()
        .expect("unknown schema");
        assert!(err.to_string().contains("trajectory_v1.jsonschema"));

        let outcome = run_command(Commands::Inspect {
            input: root.join("raw"),
            instance: "case-1".to_string(),
            config: None,
            exclude_models: Vec::new(),
            json: true,
        })
        .expect("inspect");
        let payload = outcome.payload.expect("payload");
        assert_eq!(payload["turns"].as_array().map(Vec::len), Some(2));
        assert_eq!(payload["turns"][0]["attempts"], 2);
        assert_eq!(payload["turns"][0]["representative_seq"], 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn json_error_shape_matches_command_contract() {
        let value = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "command_failed");
        assert_eq!(value["error"]["message"], "boom");
    }
}
