use crate::context::StepContext;
use anyhow::{anyhow, Result};
use pricepipe_core::{ArtifactRef, Table};
use std::collections::BTreeMap;

pub struct CheckArgs {
    pub csv: ArtifactRef,
    pub reference: ArtifactRef,
    pub kl_threshold: f64,
    pub min_price: f64,
    pub max_price: f64,
}

#[derive(Debug)]
pub struct CheckReport {
    pub rows: usize,
    pub kl_divergence: Option<f64>,
}

const REQUIRED_COLUMNS: &[&str] = &["price", "neighbourhood_group", "room_type"];
const STRATA_COLUMN: &str = "neighbourhood_group";

/// Validate the cleaned dataset against the configured bounds and against a
/// pinned reference artifact. Publishes nothing; the first violation aborts.
pub fn run(ctx: &StepContext, args: &CheckArgs) -> Result<CheckReport> {
    let candidate = ctx.store().fetch(&args.csv)?;
    let reference = ctx.store().fetch(&args.reference)?;
    let table = Table::read_path(&candidate.path)?;
    let ref_table = Table::read_path(&reference.path)?;

    check_table(&table, &ref_table, args)
}

pub fn check_table(table: &Table, reference: &Table, args: &CheckArgs) -> Result<CheckReport> {
    if table.is_empty() {
        return Err(anyhow!("dataset has no rows"));
    }
    for column in REQUIRED_COLUMNS {
        table.require_column(column)?;
    }

    let price_col = table.require_column("price")?;
    for (idx, row) in table.rows.iter().enumerate() {
        let price: f64 = row[price_col]
            .trim()
            .parse()
            .map_err(|_| anyhow!("row {}: unparseable price '{}'", idx + 1, row[price_col]))?;
        if price < args.min_price || price > args.max_price {
            return Err(anyhow!(
                "row {}: price {} outside [{}, {}]",
                idx + 1,
                price,
                args.min_price,
                args.max_price
            ));
        }
    }

    let kl_divergence = match (
        table.column_index(STRATA_COLUMN),
        reference.column_index(STRATA_COLUMN),
    ) {
        (Some(a), Some(b)) => {
            let kl = kl_divergence(
                &category_distribution(table, a),
                &category_distribution(reference, b),
            );
            if kl > args.kl_threshold {
                return Err(anyhow!(
                    "{} distribution drifted from reference: KL {:.4} > threshold {}",
                    STRATA_COLUMN,
                    kl,
                    args.kl_threshold
                ));
            }
            Some(kl)
        }
        _ => None,
    };

    tracing::info!(rows = table.len(), ?kl_divergence, "data check passed");
    Ok(CheckReport {
        rows: table.len(),
        kl_divergence,
    })
}

fn category_distribution(table: &Table, column: usize) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, f64> = BTreeMap::new();
    for row in &table.rows {
        *counts.entry(row[column].clone()).or_default() += 1.0;
    }
    let total: f64 = counts.values().sum();
    for value in counts.values_mut() {
        *value /= total;
    }
    counts
}

/// KL(p || q) over the union of categories, with a small floor so a category
/// absent on one side does not produce an infinity.
fn kl_divergence(p: &BTreeMap<String, f64>, q: &BTreeMap<String, f64>) -> f64 {
    const FLOOR: f64 = 1e-9;
    let mut keys: Vec<&String> = p.keys().chain(q.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.iter()
        .map(|k| {
            let pk = p.get(*k).copied().unwrap_or(0.0).max(FLOOR);
            let qk = q.get(*k).copied().unwrap_or(0.0).max(FLOOR);
            pk * (pk / qk).ln()
        })
        .sum()
}
