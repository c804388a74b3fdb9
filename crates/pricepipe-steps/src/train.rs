use crate::context::StepContext;
use crate::split::split_indices;
use anyhow::{anyhow, Result};
use pricepipe_core::{Artifact, ArtifactRef, PublishSpec, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub struct TrainArgs {
    pub trainval_artifact: ArtifactRef,
    pub val_size: f64,
    pub random_seed: u64,
    pub stratify_by: String,
    pub output_artifact: String,
}

/// Baseline price estimator: the global mean, refined by a per-group mean
/// where the grouping column is known. Stands in for the original heavyweight
/// regressor; the point of the pipeline is the artifact flow, not the model.
#[derive(Debug, Serialize, Deserialize)]
pub struct BaselineModel {
    pub group_column: Option<String>,
    pub global_mean: f64,
    pub group_means: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Metrics {
    pub mae: f64,
    pub r2: f64,
    pub train_rows: usize,
    pub val_rows: usize,
}

#[derive(Serialize, Deserialize)]
struct ModelExport {
    model: BaselineModel,
    metrics: Metrics,
}

impl BaselineModel {
    pub fn fit(table: &Table, rows: &[usize], group_column: Option<&str>) -> Result<Self> {
        if rows.is_empty() {
            return Err(anyhow!("cannot fit a model on zero rows"));
        }
        let price_col = table.require_column("price")?;
        let group_col = group_column
            .map(|c| table.require_column(c))
            .transpose()?;

        let mut sum = 0.0;
        let mut group_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for &idx in rows {
            let price = parse_price(table, price_col, idx)?;
            sum += price;
            if let Some(col) = group_col {
                let entry = group_sums
                    .entry(table.rows[idx][col].clone())
                    .or_insert((0.0, 0));
                entry.0 += price;
                entry.1 += 1;
            }
        }
        Ok(Self {
            group_column: group_column.map(|c| c.to_string()),
            global_mean: sum / rows.len() as f64,
            group_means: group_sums
                .into_iter()
                .map(|(k, (total, n))| (k, total / n as f64))
                .collect(),
        })
    }

    pub fn predict(&self, group: Option<&str>) -> f64 {
        group
            .and_then(|g| self.group_means.get(g).copied())
            .unwrap_or(self.global_mean)
    }

    pub fn evaluate(&self, table: &Table, rows: &[usize]) -> Result<Metrics> {
        if rows.is_empty() {
            return Err(anyhow!("cannot evaluate on zero rows"));
        }
        let price_col = table.require_column("price")?;
        let group_col = self
            .group_column
            .as_deref()
            .map(|c| table.require_column(c))
            .transpose()?;

        let actual: Vec<f64> = rows
            .iter()
            .map(|&idx| parse_price(table, price_col, idx))
            .collect::<Result<_>>()?;
        let predicted: Vec<f64> = rows
            .iter()
            .map(|&idx| self.predict(group_col.map(|c| table.rows[idx][c].as_str())))
            .collect();

        let n = actual.len() as f64;
        let mae = actual
            .iter()
            .zip(&predicted)
            .map(|(a, p)| (a - p).abs())
            .sum::<f64>()
            / n;
        let mean = actual.iter().sum::<f64>() / n;
        let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
        let ss_res: f64 = actual
            .iter()
            .zip(&predicted)
            .map(|(a, p)| (a - p).powi(2))
            .sum();
        let r2 = if ss_tot == 0.0 {
            0.0
        } else {
            1.0 - ss_res / ss_tot
        };
        Ok(Metrics {
            mae,
            r2,
            train_rows: 0,
            val_rows: rows.len(),
        })
    }
}

fn parse_price(table: &Table, price_col: usize, idx: usize) -> Result<f64> {
    table.rows[idx][price_col]
        .trim()
        .parse()
        .map_err(|_| anyhow!("row {}: unparseable price", idx + 1))
}

/// Split a validation set off trainval, fit the baseline, score it, and
/// publish model plus metrics as a single JSON artifact.
pub fn run(ctx: &StepContext, args: &TrainArgs) -> Result<(Artifact, Metrics)> {
    let input = ctx.store().fetch(&args.trainval_artifact)?;
    let table = Table::read_path(&input.path)?;

    let stratify = match args.stratify_by.as_str() {
        "none" => None,
        column => Some(column),
    };
    let stratify_col = stratify.map(|c| table.require_column(c)).transpose()?;
    let (train_idx, val_idx) =
        split_indices(&table, args.val_size, args.random_seed, stratify_col)?;
    if val_idx.is_empty() {
        return Err(anyhow!("val_size {} produced an empty validation set", args.val_size));
    }

    let model = BaselineModel::fit(&table, &train_idx, stratify)?;
    let mut metrics = model.evaluate(&table, &val_idx)?;
    metrics.train_rows = train_idx.len();
    tracing::info!(mae = metrics.mae, r2 = metrics.r2, "trained baseline model");

    let export = ModelExport { model, metrics };
    let out_path = ctx.scratch_file(&format!("{}.json", args.output_artifact));
    pricepipe_core::atomic_write_bytes(&out_path, &serde_json::to_vec_pretty(&export)?)?;
    let artifact = ctx.store().publish(
        &PublishSpec {
            name: &args.output_artifact,
            artifact_type: "model_export",
            description: "Baseline price model with validation metrics",
        },
        &out_path,
    )?;
    Ok((artifact, metrics))
}
