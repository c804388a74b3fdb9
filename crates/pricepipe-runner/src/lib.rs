use anyhow::{anyhow, Result};
use chrono::Utc;
use pricepipe_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Fixed execution order. A configured subset always runs in this order, no
/// matter how the subset was written.
pub const STEP_ORDER: &[&str] = &[
    "download",
    "basic_cleaning",
    "data_check",
    "data_split",
    "train",
];

pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub steps_run: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub project: String,
    pub experiment: String,
    pub active_steps: Vec<String>,
    pub store_root: PathBuf,
    pub parameters: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Comma-separated subset of steps, overriding `main.steps`.
    pub steps: Option<String>,
    /// `group.key` -> value overrides applied onto the loaded config.
    pub set_bindings: BTreeMap<String, Value>,
    /// Artifact store root, overriding the default next to the config.
    pub store_root: Option<PathBuf>,
    /// Command prefix used to spawn steps; defaults to the current executable.
    pub pipeline_command: Option<Vec<String>>,
}

pub fn run_pipeline(config_path: &Path, options: &RunOptions) -> Result<RunResult> {
    let config = load_config(config_path, &options.set_bindings)?;
    // Step subprocesses resolve paths against their own cwd, so everything
    // handed to them is anchored to the absolute project root.
    let project_root = fs::canonicalize(project_root_of(config_path))?;
    let active_steps = resolve_active_steps(&config, options.steps.as_deref())?;
    let store_root = resolve_store_root(&project_root, options.store_root.as_deref());

    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
    let run_dir = project_root.join(".pricepipe").join("runs").join(&run_id);
    ensure_dir(&run_dir)?;

    atomic_write_json_pretty(&run_dir.join("resolved_config.json"), &config)?;
    atomic_write_bytes(
        &run_dir.join("resolved_config.digest"),
        canonical_json_digest(&config)?.as_bytes(),
    )?;
    let manifest = json!({
        "schema_version": "run_manifest_v1",
        "run_id": run_id,
        "project": config.pointer("/main/project_name").and_then(|v| v.as_str()),
        "experiment": config.pointer("/main/experiment_name").and_then(|v| v.as_str()),
        "active_steps": active_steps,
        "store_root": store_root.display().to_string(),
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("manifest.json"), &manifest)?;

    // The single scoped resource of a run: a scratch dir released on exit,
    // success or failure. Artifacts live in the store and are never touched.
    let scratch = ScratchDir::create(run_dir.join("scratch"))?;
    let mut run_state = StateFile::begin(
        run_dir.join("run_state.json"),
        json!({ "schema_version": "run_state_v1", "run_id": run_id }),
    );
    let command = resolve_pipeline_command(&config, options.pipeline_command.as_deref())?;
    let mut steps_run = Vec::new();

    for step in &active_steps {
        let mut params = step_parameters(&config, step)?;
        absolutize_path_params(&mut params, &project_root);
        let argv = build_step_argv(step, &params, &store_root, scratch.path())?;

        let step_dir = run_dir.join("steps").join(step);
        ensure_dir(&step_dir)?;
        atomic_write_json_pretty(
            &step_dir.join("step_parameters.json"),
            &serde_json::to_value(&params)?,
        )?;
        let mut step_state = StateFile::begin(
            step_dir.join("step_state.json"),
            json!({ "schema_version": "step_state_v1", "step": step }),
        );

        tracing::info!(step = %step, "starting step");
        let status = Command::new(&command[0])
            .args(&command[1..])
            .args(&argv)
            .current_dir(&project_root)
            .status()?;

        // First failure aborts the rest of the pipeline; nothing already
        // published is rolled back.
        if !status.success() {
            step_state.settle("failed", Some("step_exit_nonzero"))?;
            return Err(anyhow!(
                "step '{}' exited with status {}",
                step,
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            ));
        }
        step_state.settle("completed", None)?;
        steps_run.push(step.clone());
    }

    run_state.settle("completed", None)?;
    Ok(RunResult {
        run_id,
        run_dir,
        steps_run,
    })
}

/// Dry inspection of what `run` would do: active steps and the parameter map
/// each step would receive. No side effects.
pub fn describe_pipeline(
    config_path: &Path,
    steps_override: Option<&str>,
    set_bindings: &BTreeMap<String, Value>,
    store_root: Option<&Path>,
) -> Result<PipelineSummary> {
    let project_root = project_root_of(config_path);
    let config = load_config(config_path, set_bindings)?;
    let active_steps = resolve_active_steps(&config, steps_override)?;

    let mut parameters = BTreeMap::new();
    for step in &active_steps {
        parameters.insert(step.clone(), step_parameters(&config, step)?);
    }
    Ok(PipelineSummary {
        project: config
            .pointer("/main/project_name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        experiment: config
            .pointer("/main/experiment_name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        active_steps,
        store_root: resolve_store_root(&project_root, store_root),
        parameters,
    })
}

fn project_root_of(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// A relative override is taken as project-relative, never cwd-relative.
pub fn resolve_store_root(project_root: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => project_root.join(path),
        None => project_root.join(".pricepipe").join("artifacts"),
    }
}

/// Path-valued step parameters from the config may be project-relative; the
/// subprocess must receive them anchored to the project root.
fn absolutize_path_params(params: &mut BTreeMap<String, Value>, project_root: &Path) {
    for key in ["data_dir"] {
        if let Some(raw) = params.get(key).and_then(|v| v.as_str()) {
            let path = Path::new(raw);
            if path.is_relative() {
                params.insert(
                    key.to_string(),
                    json!(project_root.join(path).to_string_lossy()),
                );
            }
        }
    }
}

/// Command prefix the step subprocesses are spawned with. An explicit option
/// wins, then `main.pipeline_command` from the config, then the current
/// executable.
fn resolve_pipeline_command(config: &Value, explicit: Option<&[String]>) -> Result<Vec<String>> {
    if let Some(parts) = explicit {
        if parts.is_empty() {
            return Err(anyhow!("pipeline command must not be empty"));
        }
        return Ok(parts.to_vec());
    }
    if let Some(configured) = config.pointer("/main/pipeline_command") {
        let parts: Vec<String> = serde_json::from_value(configured.clone())
            .map_err(|_| anyhow!("main.pipeline_command must be an array of strings"))?;
        if parts.is_empty() {
            return Err(anyhow!("main.pipeline_command must not be empty"));
        }
        return Ok(parts);
    }
    let exe = std::env::current_exe()?;
    Ok(vec![exe.to_string_lossy().to_string()])
}

pub fn load_config(config_path: &Path, set_bindings: &BTreeMap<String, Value>) -> Result<Value> {
    let raw = fs::read_to_string(config_path)
        .map_err(|e| anyhow!("cannot read config {}: {}", config_path.display(), e))?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let mut config: Value = serde_json::to_value(yaml)?;
    for (key, value) in set_bindings {
        let pointer = format!("/{}", key.split('.').collect::<Vec<_>>().join("/"));
        set_json_pointer_value(&mut config, &pointer, value.clone())?;
    }
    validate_required_fields(&config)?;
    Ok(config)
}

fn validate_required_fields(config: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/main/project_name",
        "/main/experiment_name",
        "/main/steps",
        "/etl/sample",
        "/etl/min_price",
        "/etl/max_price",
        "/data_check/kl_threshold",
        "/modeling/test_size",
        "/modeling/val_size",
        "/modeling/random_seed",
        "/modeling/stratify_by",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match config.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

pub fn resolve_active_steps(config: &Value, cli_override: Option<&str>) -> Result<Vec<String>> {
    let configured = config
        .pointer("/main/steps")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("main.steps must be a string"))?;
    let requested = cli_override.unwrap_or(configured);

    if requested.trim() == "all" {
        return Ok(STEP_ORDER.iter().map(|s| s.to_string()).collect());
    }
    let mut selected = Vec::new();
    for name in requested.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if !STEP_ORDER.contains(&name) {
            return Err(anyhow!(
                "unknown step '{}': expected one of {}",
                name,
                STEP_ORDER.join(", ")
            ));
        }
        selected.push(name);
    }
    if selected.is_empty() {
        return Err(anyhow!("no steps selected"));
    }
    // Execute in the fixed order regardless of selection order.
    Ok(STEP_ORDER
        .iter()
        .filter(|s| selected.contains(*s))
        .map(|s| s.to_string())
        .collect())
}

/// Flat parameter mapping a step receives, derived from the composed config.
/// Artifact names are the fixed wiring between steps: each step publishes
/// under a well-known name and the next step fetches `name:latest`.
pub fn step_parameters(config: &Value, step: &str) -> Result<BTreeMap<String, Value>> {
    let mut params = BTreeMap::new();
    match step {
        "download" => {
            params.insert("sample".into(), require(config, "/etl/sample")?);
            params.insert(
                "data_dir".into(),
                config
                    .pointer("/main/data_dir")
                    .cloned()
                    .unwrap_or_else(|| json!("data")),
            );
            params.insert("artifact_name".into(), json!("sample.csv"));
            params.insert("artifact_type".into(), json!("raw_data"));
            params.insert(
                "artifact_description".into(),
                json!("Raw file as downloaded"),
            );
        }
        "basic_cleaning" => {
            params.insert("input_artifact".into(), json!("sample.csv:latest"));
            params.insert("output_artifact".into(), json!("clean_sample.csv"));
            params.insert("output_type".into(), json!("clean_sample"));
            params.insert(
                "output_description".into(),
                json!("Data with outliers and null values removed"),
            );
            params.insert("min_price".into(), require(config, "/etl/min_price")?);
            params.insert("max_price".into(), require(config, "/etl/max_price")?);
        }
        "data_check" => {
            params.insert("csv".into(), json!("clean_sample.csv:latest"));
            params.insert("ref".into(), json!("clean_sample.csv:reference"));
            params.insert(
                "kl_threshold".into(),
                require(config, "/data_check/kl_threshold")?,
            );
            params.insert("min_price".into(), require(config, "/etl/min_price")?);
            params.insert("max_price".into(), require(config, "/etl/max_price")?);
        }
        "data_split" => {
            params.insert("input".into(), json!("clean_sample.csv:latest"));
            params.insert("test_size".into(), require(config, "/modeling/test_size")?);
            params.insert(
                "random_seed".into(),
                require(config, "/modeling/random_seed")?,
            );
            params.insert(
                "stratify_by".into(),
                require(config, "/modeling/stratify_by")?,
            );
        }
        "train" => {
            params.insert(
                "trainval_artifact".into(),
                json!("trainval_data.csv:latest"),
            );
            params.insert("val_size".into(), require(config, "/modeling/val_size")?);
            params.insert(
                "random_seed".into(),
                require(config, "/modeling/random_seed")?,
            );
            params.insert(
                "stratify_by".into(),
                require(config, "/modeling/stratify_by")?,
            );
            params.insert(
                "output_artifact".into(),
                config
                    .pointer("/modeling/output_artifact")
                    .cloned()
                    .unwrap_or_else(|| json!("price_model")),
            );
        }
        other => return Err(anyhow!("unknown step '{}'", other)),
    }
    Ok(params)
}

fn require(config: &Value, pointer: &str) -> Result<Value> {
    config
        .pointer(pointer)
        .cloned()
        .ok_or_else(|| anyhow!("config missing {}", pointer))
}

/// Argv (minus the binary) for one step subprocess. Must line up with the
/// `step` subcommand surfaces in the CLI crate.
pub fn build_step_argv(
    step: &str,
    params: &BTreeMap<String, Value>,
    store_root: &Path,
    scratch: &Path,
) -> Result<Vec<String>> {
    let get = |key: &str| -> Result<String> {
        params
            .get(key)
            .map(value_to_string)
            .ok_or_else(|| anyhow!("step '{}' is missing parameter '{}'", step, key))
    };
    let mut argv = vec!["step".to_string()];
    match step {
        "download" => {
            argv.push("download".into());
            argv.push(get("sample")?);
            argv.push(get("artifact_name")?);
            argv.push(get("artifact_type")?);
            argv.push(get("artifact_description")?);
            argv.push("--data_dir".into());
            argv.push(get("data_dir")?);
        }
        "basic_cleaning" => {
            argv.push("basic-cleaning".into());
            for key in [
                "input_artifact",
                "output_artifact",
                "output_type",
                "output_description",
                "min_price",
                "max_price",
            ] {
                argv.push(format!("--{}", key));
                argv.push(get(key)?);
            }
        }
        "data_check" => {
            argv.push("data-check".into());
            for key in ["csv", "ref", "kl_threshold", "min_price", "max_price"] {
                argv.push(format!("--{}", key));
                argv.push(get(key)?);
            }
        }
        "data_split" => {
            argv.push("data-split".into());
            argv.push(get("input")?);
            argv.push(get("test_size")?);
            argv.push("--random_seed".into());
            argv.push(get("random_seed")?);
            argv.push("--stratify_by".into());
            argv.push(get("stratify_by")?);
        }
        "train" => {
            argv.push("train".into());
            for key in [
                "trainval_artifact",
                "val_size",
                "random_seed",
                "stratify_by",
                "output_artifact",
            ] {
                argv.push(format!("--{}", key));
                argv.push(get(key)?);
            }
        }
        other => return Err(anyhow!("unknown step '{}'", other)),
    }
    argv.push("--store".into());
    argv.push(store_root.to_string_lossy().to_string());
    argv.push("--scratch".into());
    argv.push(scratch.to_string_lossy().to_string());
    Ok(argv)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn set_json_pointer_value(root: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    if !pointer.starts_with('/') {
        return Err(anyhow!("json pointer must start with '/': {}", pointer));
    }
    let tokens: Vec<&str> = pointer.split('/').skip(1).collect();
    let (last, parents) = match tokens.split_last() {
        Some(pair) => pair,
        None => {
            *root = new_value;
            return Ok(());
        }
    };
    let mut cur = root;
    for token in parents {
        match cur {
            Value::Object(map) => {
                cur = map.entry(token.to_string()).or_insert_with(|| json!({}));
            }
            _ => {
                return Err(anyhow!(
                    "json pointer hit non-object at '{}' in {}",
                    token,
                    pointer
                ))
            }
        }
    }
    match cur {
        Value::Object(map) => {
            map.insert(last.to_string(), new_value);
            Ok(())
        }
        _ => Err(anyhow!("json pointer target is not an object: {}", pointer)),
    }
}

/// Status file for a run or step scope. `begin` records `running`; if the
/// scope unwinds before `settle`, the drop records `failed` so a crashed
/// orchestrator never leaves a state file claiming progress.
struct StateFile {
    path: PathBuf,
    identity: Value,
    settled: bool,
}

impl StateFile {
    fn begin(path: PathBuf, identity: Value) -> Self {
        let this = Self {
            path,
            identity,
            settled: false,
        };
        let _ = this.record("running", None);
        this
    }

    fn record(&self, status: &str, exit_reason: Option<&str>) -> Result<()> {
        let mut payload = self.identity.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("status".to_string(), json!(status));
            map.insert("exit_reason".to_string(), json!(exit_reason));
            map.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        atomic_write_json_pretty(&self.path, &payload)
    }

    fn settle(&mut self, status: &str, exit_reason: Option<&str>) -> Result<()> {
        self.record(status, exit_reason)?;
        self.settled = true;
        Ok(())
    }
}

impl Drop for StateFile {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.record("failed", Some("aborted"));
        }
    }
}

struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(path: PathBuf) -> Result<Self> {
        ensure_dir(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
