use crate::context::StepContext;
use anyhow::{anyhow, Result};
use pricepipe_core::{Artifact, PublishSpec};
use std::path::PathBuf;

pub struct DownloadArgs {
    pub sample: String,
    pub data_dir: PathBuf,
    pub artifact_name: String,
    pub artifact_type: String,
    pub artifact_description: String,
}

/// Stage the named sample file from the data directory and publish it as the
/// pipeline's raw artifact.
pub fn run(ctx: &StepContext, args: &DownloadArgs) -> Result<Artifact> {
    let source = args.data_dir.join(&args.sample);
    if !source.is_file() {
        return Err(anyhow!(
            "sample '{}' not found under {}",
            args.sample,
            args.data_dir.display()
        ));
    }
    tracing::info!(sample = %args.sample, "staging raw sample");

    let staged = ctx.scratch_file(&args.artifact_name);
    std::fs::copy(&source, &staged)?;

    ctx.store().publish(
        &PublishSpec {
            name: &args.artifact_name,
            artifact_type: &args.artifact_type,
            description: &args.artifact_description,
        },
        &staged,
    )
}
