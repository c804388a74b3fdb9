use anyhow::Result;
use clap::{Parser, Subcommand};
use pricepipe_core::{Artifact, ArtifactRef, ArtifactStore};
use pricepipe_runner::{PipelineSummary, RunOptions, RunResult};
use pricepipe_steps::{check, cleaning, download, split, train, StepContext};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pricepipe", version, about = "NYC rental price data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline described by a YAML config.
    Run {
        #[arg(default_value = "config.yaml")]
        config: PathBuf,
        /// Comma-separated subset of steps, or "all".
        #[arg(long)]
        steps: Option<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show what a run would do without executing anything.
    Describe {
        #[arg(default_value = "config.yaml")]
        config: PathBuf,
        #[arg(long)]
        steps: Option<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run a single pipeline step against an artifact store.
    Step {
        #[command(subcommand)]
        step: StepCommands,
    },
    /// Inspect and manage the artifact store.
    Artifacts {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// Write a starter config.yaml in the current directory.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Remove pipeline bookkeeping from the current directory.
    Clean {
        #[arg(long)]
        runs: bool,
        #[arg(long)]
        store: bool,
    },
}

#[derive(Subcommand)]
enum StepCommands {
    /// Stage a local sample file and publish it as the raw artifact.
    Download {
        sample: String,
        artifact_name: String,
        artifact_type: String,
        artifact_description: String,
        #[arg(long = "data_dir", default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        scratch: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Drop price outliers and normalize dates.
    BasicCleaning {
        #[arg(long = "input_artifact")]
        input_artifact: ArtifactRef,
        #[arg(long = "output_artifact")]
        output_artifact: String,
        #[arg(long = "output_type")]
        output_type: String,
        #[arg(long = "output_description")]
        output_description: String,
        #[arg(long = "min_price")]
        min_price: f64,
        #[arg(long = "max_price")]
        max_price: f64,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        scratch: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Validate a cleaned dataset against bounds and a reference artifact.
    DataCheck {
        #[arg(long)]
        csv: ArtifactRef,
        #[arg(long = "ref")]
        reference: ArtifactRef,
        #[arg(long = "kl_threshold")]
        kl_threshold: f64,
        #[arg(long = "min_price")]
        min_price: f64,
        #[arg(long = "max_price")]
        max_price: f64,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        scratch: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Partition a dataset into trainval and test artifacts.
    DataSplit {
        input: ArtifactRef,
        test_size: f64,
        #[arg(long = "random_seed", default_value_t = 42)]
        random_seed: u64,
        #[arg(long = "stratify_by", default_value = "none")]
        stratify_by: String,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        scratch: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Fit the baseline model and publish it with validation metrics.
    Train {
        #[arg(long = "trainval_artifact")]
        trainval_artifact: ArtifactRef,
        #[arg(long = "val_size")]
        val_size: f64,
        #[arg(long = "random_seed", default_value_t = 42)]
        random_seed: u64,
        #[arg(long = "stratify_by", default_value = "none")]
        stratify_by: String,
        #[arg(long = "output_artifact", default_value = "price_model")]
        output_artifact: String,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        scratch: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// List artifact names with their aliases.
    List {
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show published versions of one artifact.
    Versions {
        name: String,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Point an alias at an existing version.
    Alias {
        name: String,
        alias: String,
        version: u64,
        #[arg(long, default_value = ".pricepipe/artifacts")]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    // Logs go to stderr so --json output on stdout stays parseable.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            steps,
            set_values,
            store,
            json,
        } => {
            let options = RunOptions {
                steps,
                set_bindings: parse_set_bindings(&set_values)?,
                store_root: store,
                pipeline_command: None,
            };
            let result = pricepipe_runner::run_pipeline(&config, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": run_result_to_json(&result),
                })));
            }
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            println!("steps_run: {}", result.steps_run.join(","));
        }
        Commands::Describe {
            config,
            steps,
            set_values,
            store,
            json,
        } => {
            let set_bindings = parse_set_bindings(&set_values)?;
            let summary = pricepipe_runner::describe_pipeline(
                &config,
                steps.as_deref(),
                &set_bindings,
                store.as_deref(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Step { step } => return run_step(step),
        Commands::Artifacts { command } => return run_artifacts(command),
        Commands::Init { force } => {
            let path = PathBuf::from("config.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    path.display()
                )));
            }
            std::fs::write(&path, STARTER_CONFIG)?;
            println!("wrote: {}", path.display());
            println!("next: place your sample CSV under data/ and edit etl.sample");
            println!("next: pricepipe describe {}", path.display());
        }
        Commands::Clean { runs, store } => {
            let base = PathBuf::from(".pricepipe");
            if runs {
                let runs_dir = base.join("runs");
                if runs_dir.exists() {
                    std::fs::remove_dir_all(&runs_dir)?;
                    println!("removed: {}", runs_dir.display());
                }
            }
            if store {
                let store_dir = base.join("artifacts");
                if store_dir.exists() {
                    std::fs::remove_dir_all(&store_dir)?;
                    println!("removed: {}", store_dir.display());
                }
            }
        }
    }
    Ok(None)
}

/// A scratch dir handed in by the orchestrator is borrowed (it owns the
/// cleanup); standalone invocations get a private one removed on drop.
fn step_context(store: PathBuf, scratch: Option<PathBuf>) -> Result<StepContext> {
    match scratch {
        Some(dir) => {
            pricepipe_core::ensure_dir(&dir)?;
            Ok(StepContext::with_scratch(store, dir))
        }
        None => StepContext::new(store),
    }
}

fn run_step(step: StepCommands) -> Result<Option<Value>> {
    match step {
        StepCommands::Download {
            sample,
            artifact_name,
            artifact_type,
            artifact_description,
            data_dir,
            store,
            scratch,
            json,
        } => {
            let ctx = step_context(store, scratch)?;
            let artifact = download::run(
                &ctx,
                &download::DownloadArgs {
                    sample,
                    data_dir,
                    artifact_name,
                    artifact_type,
                    artifact_description,
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "step download",
                    "artifact": artifact_to_json(&artifact),
                })));
            }
            print_artifact(&artifact);
        }
        StepCommands::BasicCleaning {
            input_artifact,
            output_artifact,
            output_type,
            output_description,
            min_price,
            max_price,
            store,
            scratch,
            json,
        } => {
            let ctx = step_context(store, scratch)?;
            let artifact = cleaning::run(
                &ctx,
                &cleaning::CleaningArgs {
                    input_artifact,
                    output_artifact,
                    output_type,
                    output_description,
                    min_price,
                    max_price,
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "step basic-cleaning",
                    "artifact": artifact_to_json(&artifact),
                })));
            }
            print_artifact(&artifact);
        }
        StepCommands::DataCheck {
            csv,
            reference,
            kl_threshold,
            min_price,
            max_price,
            store,
            scratch,
            json,
        } => {
            let ctx = step_context(store, scratch)?;
            let report = check::run(
                &ctx,
                &check::CheckArgs {
                    csv,
                    reference,
                    kl_threshold,
                    min_price,
                    max_price,
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "step data-check",
                    "rows": report.rows,
                    "kl_divergence": report.kl_divergence,
                })));
            }
            println!("rows: {}", report.rows);
            match report.kl_divergence {
                Some(kl) => println!("kl_divergence: {:.6}", kl),
                None => println!("kl_divergence: not computed"),
            }
        }
        StepCommands::DataSplit {
            input,
            test_size,
            random_seed,
            stratify_by,
            store,
            scratch,
            json,
        } => {
            let ctx = step_context(store, scratch)?;
            let outputs = split::run(
                &ctx,
                &split::SplitArgs {
                    input,
                    test_size,
                    random_seed,
                    stratify_by,
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "step data-split",
                    "trainval": artifact_to_json(&outputs.trainval),
                    "test": artifact_to_json(&outputs.test),
                })));
            }
            print_artifact(&outputs.trainval);
            print_artifact(&outputs.test);
        }
        StepCommands::Train {
            trainval_artifact,
            val_size,
            random_seed,
            stratify_by,
            output_artifact,
            store,
            scratch,
            json,
        } => {
            let ctx = step_context(store, scratch)?;
            let (artifact, metrics) = train::run(
                &ctx,
                &train::TrainArgs {
                    trainval_artifact,
                    val_size,
                    random_seed,
                    stratify_by,
                    output_artifact,
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "step train",
                    "artifact": artifact_to_json(&artifact),
                    "metrics": {
                        "mae": metrics.mae,
                        "r2": metrics.r2,
                        "train_rows": metrics.train_rows,
                        "val_rows": metrics.val_rows,
                    },
                })));
            }
            print_artifact(&artifact);
            println!("mae: {:.4}", metrics.mae);
            println!("r2: {:.4}", metrics.r2);
            println!("train_rows: {}", metrics.train_rows);
            println!("val_rows: {}", metrics.val_rows);
        }
    }
    Ok(None)
}

fn run_artifacts(command: ArtifactCommands) -> Result<Option<Value>> {
    match command {
        ArtifactCommands::List { store, json } => {
            let store = ArtifactStore::new(store);
            let entries = store.list()?;
            if json {
                let listing: Vec<Value> = entries
                    .iter()
                    .map(|(name, aliases)| {
                        json!({
                            "name": name,
                            "aliases": aliases,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "artifacts list",
                    "artifacts": listing,
                })));
            }
            for (name, aliases) in entries {
                let rendered: Vec<String> = aliases
                    .iter()
                    .map(|(alias, version)| format!("{}=v{}", alias, version))
                    .collect();
                println!("{}: {}", name, rendered.join(" "));
            }
        }
        ArtifactCommands::Versions { name, store, json } => {
            let store = ArtifactStore::new(store);
            let versions = store.versions(&name)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "artifacts versions",
                    "name": name,
                    "versions": versions,
                })));
            }
            for v in versions {
                println!("v{}", v);
            }
        }
        ArtifactCommands::Alias {
            name,
            alias,
            version,
            store,
            json,
        } => {
            let store = ArtifactStore::new(store);
            store.set_alias(&name, &alias, version)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "artifacts alias",
                    "name": name,
                    "alias": alias,
                    "version": version,
                })));
            }
            println!("{}:{} -> v{}", name, alias, version);
        }
    }
    Ok(None)
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
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Step { step } => match step {
            StepCommands::Download { json, .. }
            | StepCommands::BasicCleaning { json, .. }
            | StepCommands::DataCheck { json, .. }
            | StepCommands::DataSplit { json, .. }
            | StepCommands::Train { json, .. } => *json,
        },
        Commands::Artifacts { command } => match command {
            ArtifactCommands::List { json, .. }
            | ArtifactCommands::Versions { json, .. }
            | ArtifactCommands::Alias { json, .. } => *json,
        },
        _ => false,
    }
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "steps_run": result.steps_run,
    })
}

fn summary_to_json(summary: &PipelineSummary) -> Value {
    json!({
        "project": summary.project,
        "experiment": summary.experiment,
        "active_steps": summary.active_steps,
        "store_root": summary.store_root.display().to_string(),
        "parameters": summary.parameters,
    })
}

fn print_summary(summary: &PipelineSummary) {
    println!("project: {}", summary.project);
    println!("experiment: {}", summary.experiment);
    println!("active_steps: {}", summary.active_steps.join(","));
    println!("store_root: {}", summary.store_root.display());
    for (step, params) in &summary.parameters {
        println!("{}:", step);
        for (key, value) in params {
            println!("  {}: {}", key, value);
        }
    }
}

fn artifact_to_json(artifact: &Artifact) -> Value {
    json!({
        "name": artifact.meta.name,
        "version": artifact.meta.version,
        "type": artifact.meta.artifact_type,
        "digest": artifact.meta.digest,
        "path": artifact.path.display().to_string(),
    })
}

fn print_artifact(artifact: &Artifact) {
    println!(
        "published: {}:v{} ({}) {}",
        artifact.meta.name,
        artifact.meta.version,
        artifact.meta.artifact_type,
        artifact.path.display()
    );
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!(format!("invalid --set '{}': expected k=v", raw)))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(format!(
                "invalid --set '{}': key cannot be empty",
                raw
            )));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

const STARTER_CONFIG: &str = "\
main:
  project_name: nyc_airbnb
  experiment_name: development
  steps: all
  data_dir: data
etl:
  sample: sample1.csv
  min_price: 10
  max_price: 350
data_check:
  kl_threshold: 0.2
modeling:
  test_size: 0.2
  val_size: 0.2
  random_seed: 42
  stratify_by: neighbourhood_group
  output_artifact: price_model
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bindings_parse_json_values_and_fall_back_to_strings() {
        let parsed = parse_set_bindings(&[
            "etl.min_price=25".to_string(),
            "main.steps=download,train".to_string(),
        ])
        .expect("bindings");
        assert_eq!(parsed["etl.min_price"], json!(25));
        assert_eq!(parsed["main.steps"], json!("download,train"));
        assert!(parse_set_bindings(&["no_equals".to_string()]).is_err());
        assert!(parse_set_bindings(&["=5".to_string()]).is_err());
    }

    #[test]
    fn starter_config_satisfies_validation() {
        let yaml: serde_json::Value =
            serde_json::to_value(serde_yaml::from_str::<serde_yaml::Value>(STARTER_CONFIG).expect("yaml"))
                .expect("to json");
        assert_eq!(yaml.pointer("/main/steps"), Some(&json!("all")));
        assert_eq!(yaml.pointer("/etl/min_price"), Some(&json!(10)));
        assert_eq!(
            yaml.pointer("/modeling/stratify_by"),
            Some(&json!("neighbourhood_group"))
        );
    }
}
