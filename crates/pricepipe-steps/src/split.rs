use crate::context::StepContext;
use anyhow::{anyhow, Result};
use pricepipe_core::{Artifact, ArtifactRef, PublishSpec, Table};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

pub struct SplitArgs {
    pub input: ArtifactRef,
    /// Fraction of the dataset when < 1.0, absolute row count otherwise.
    pub test_size: f64,
    pub random_seed: u64,
    /// Column to stratify by, or "none".
    pub stratify_by: String,
}

pub struct SplitOutputs {
    pub trainval: Artifact,
    pub test: Artifact,
}

/// Partition the input artifact into `trainval_data.csv` and `test_data.csv`
/// and publish both.
pub fn run(ctx: &StepContext, args: &SplitArgs) -> Result<SplitOutputs> {
    let input = ctx.store().fetch(&args.input)?;
    let table = Table::read_path(&input.path)?;

    let stratify_col = match args.stratify_by.as_str() {
        "none" => None,
        column => Some(table.require_column(column)?),
    };
    let (trainval_idx, test_idx) =
        split_indices(&table, args.test_size, args.random_seed, stratify_col)?;
    tracing::info!(
        total = table.len(),
        trainval = trainval_idx.len(),
        test = test_idx.len(),
        seed = args.random_seed,
        "split trainval and test"
    );

    let mut outputs = Vec::new();
    for (indices, kind) in [(&trainval_idx, "trainval"), (&test_idx, "test")] {
        let name = format!("{}_data.csv", kind);
        let path = ctx.scratch_file(&name);
        table.select_rows(indices).write_path(&path)?;
        outputs.push(ctx.store().publish(
            &PublishSpec {
                name: &name,
                artifact_type: &format!("{}_data", kind),
                description: &format!("{} split of dataset", kind),
            },
            &path,
        )?);
    }
    let test = outputs.pop().ok_or_else(|| anyhow!("missing test output"))?;
    let trainval = outputs
        .pop()
        .ok_or_else(|| anyhow!("missing trainval output"))?;
    Ok(SplitOutputs { trainval, test })
}

/// Deterministic (seeded) partition of row indices into (trainval, test).
/// With a stratify column, rows are grouped by class first and each class is
/// split at the same rate, so class proportions carry over up to rounding.
/// Both halves preserve the original row order.
pub fn split_indices(
    table: &Table,
    test_size: f64,
    seed: u64,
    stratify_col: Option<usize>,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let total = table.len();
    if total == 0 {
        return Err(anyhow!("cannot split an empty dataset"));
    }
    let fraction = if test_size < 1.0 {
        if test_size < 0.0 {
            return Err(anyhow!("test_size must be non-negative, got {}", test_size));
        }
        test_size
    } else {
        let count = test_size.trunc();
        if count != test_size || count as usize > total {
            return Err(anyhow!(
                "test_size {} is not a valid row count for {} rows",
                test_size,
                total
            ));
        }
        count / total as f64
    };

    // BTreeMap keeps group iteration order stable across runs, which the
    // determinism guarantee depends on.
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    match stratify_col {
        Some(col) => {
            for (idx, row) in table.rows.iter().enumerate() {
                groups.entry(row[col].clone()).or_default().push(idx);
            }
        }
        None => {
            groups.insert(String::new(), (0..total).collect());
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut test_idx = Vec::new();
    let mut trainval_idx = Vec::new();
    for indices in groups.values() {
        let mut shuffled = indices.clone();
        shuffled.shuffle(&mut rng);
        let take = ((shuffled.len() as f64) * fraction).round() as usize;
        let take = take.min(shuffled.len());
        test_idx.extend(shuffled.drain(..take));
        trainval_idx.extend(shuffled);
    }
    trainval_idx.sort_unstable();
    test_idx.sort_unstable();
    Ok((trainval_idx, test_idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn rows_with_groups(per_group: &[(&str, usize)]) -> Table {
        let mut t = Table::new(vec!["id".to_string(), "neighbourhood_group".to_string()]);
        let mut id = 0;
        for (group, n) in per_group {
            for _ in 0..*n {
                id += 1;
                t.rows.push(vec![id.to_string(), group.to_string()]);
            }
        }
        t
    }

    #[test]
    fn partition_is_disjoint_and_exhaustive() {
        let t = rows_with_groups(&[("a", 100)]);
        let (trainval, test) = split_indices(&t, 0.2, 42, None).expect("split");
        assert_eq!(trainval.len() + test.len(), 100);
        assert_eq!(trainval.len(), 80);
        assert_eq!(test.len(), 20);
        let union: BTreeSet<usize> = trainval.iter().chain(test.iter()).copied().collect();
        assert_eq!(union.len(), 100, "no index may appear twice");
    }

    #[test]
    fn same_seed_reproduces_the_partition() {
        let t = rows_with_groups(&[("a", 100)]);
        let first = split_indices(&t, 0.2, 42, None).expect("first");
        let second = split_indices(&t, 0.2, 42, None).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn different_seed_changes_the_partition() {
        let t = rows_with_groups(&[("a", 100)]);
        let a = split_indices(&t, 0.2, 42, None).expect("seed 42");
        let b = split_indices(&t, 0.2, 43, None).expect("seed 43");
        assert_ne!(a.1, b.1, "different seeds should pick different test rows");
    }

    #[test]
    fn stratified_split_preserves_class_proportions() {
        let t = rows_with_groups(&[("a", 600), ("b", 300), ("c", 100)]);
        let group_col = t.require_column("neighbourhood_group").expect("col");
        let (_, test) = split_indices(&t, 0.2, 7, Some(group_col)).expect("split");

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for &idx in &test {
            *counts.entry(t.rows[idx][group_col].as_str()).or_default() += 1;
        }
        assert_eq!(counts["a"], 120);
        assert_eq!(counts["b"], 60);
        assert_eq!(counts["c"], 20);
    }

    #[test]
    fn absolute_test_size_is_a_row_count() {
        let t = rows_with_groups(&[("a", 50)]);
        let (trainval, test) = split_indices(&t, 10.0, 1, None).expect("split");
        assert_eq!(test.len(), 10);
        assert_eq!(trainval.len(), 40);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        let t = rows_with_groups(&[("a", 10)]);
        assert!(split_indices(&t, -0.1, 1, None).is_err());
        assert!(split_indices(&t, 11.0, 1, None).is_err());
        assert!(split_indices(&t, 10.5, 1, None).is_err());
    }

    #[test]
    fn empty_input_is_rejected() {
        let t = rows_with_groups(&[]);
        assert!(split_indices(&t, 0.2, 1, None).is_err());
    }
}
