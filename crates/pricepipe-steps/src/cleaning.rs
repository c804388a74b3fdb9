use crate::context::StepContext;
use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveDateTime};
use pricepipe_core::{Artifact, ArtifactRef, PublishSpec, Table};

pub struct CleaningArgs {
    pub input_artifact: ArtifactRef,
    pub output_artifact: String,
    pub output_type: String,
    pub output_description: String,
    pub min_price: f64,
    pub max_price: f64,
}

pub fn run(ctx: &StepContext, args: &CleaningArgs) -> Result<Artifact> {
    let input = ctx.store().fetch(&args.input_artifact)?;
    let table = Table::read_path(&input.path)?;
    let before = table.len();

    let cleaned = clean_table(table, args.min_price, args.max_price)?;
    tracing::info!(
        rows_in = before,
        rows_out = cleaned.len(),
        min_price = args.min_price,
        max_price = args.max_price,
        "cleaned dataset"
    );

    let out_path = ctx.scratch_file(&args.output_artifact);
    cleaned.write_path(&out_path)?;
    ctx.store().publish(
        &PublishSpec {
            name: &args.output_artifact,
            artifact_type: &args.output_type,
            description: &args.output_description,
        },
        &out_path,
    )
}

/// Keep rows whose price lies in the inclusive [min, max] band, drop rows
/// without a parseable price, and normalize `last_review` (when present) to
/// ISO `YYYY-MM-DD`.
pub fn clean_table(table: Table, min_price: f64, max_price: f64) -> Result<Table> {
    let price_col = table.require_column("price")?;
    let review_col = table.column_index("last_review");

    let mut out = Table::new(table.headers.clone());
    for row in table.rows {
        let price = match row[price_col].trim().parse::<f64>() {
            Ok(p) => p,
            Err(_) => continue,
        };
        if price < min_price || price > max_price {
            continue;
        }
        let mut row = row;
        if let Some(idx) = review_col {
            row[idx] = normalize_date(&row[idx])?;
        }
        out.rows.push(row);
    }
    Ok(out)
}

/// Canonical date form. Empty cells stay empty (listings without a review);
/// anything non-empty must parse in one of the supported layouts.
pub fn normalize_date(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(String::new());
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Ok(date.format("%Y-%m-%d").to_string());
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt.date().format("%Y-%m-%d").to_string());
        }
    }
    Err(anyhow!("unparseable date value '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced(prices: &[&str]) -> Table {
        let mut t = Table::new(vec!["id".to_string(), "price".to_string()]);
        for (i, p) in prices.iter().enumerate() {
            t.rows.push(vec![i.to_string(), p.to_string()]);
        }
        t
    }

    #[test]
    fn retains_rows_inside_inclusive_band_only() {
        let t = priced(&["5", "50", "500", "5000"]);
        let cleaned = clean_table(t, 10.0, 1000.0).expect("clean");
        let kept: Vec<&str> = cleaned.rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(kept, vec!["50", "500"]);
    }

    #[test]
    fn bounds_are_inclusive_both_ends() {
        let t = priced(&["10", "9.99", "1000", "1000.01"]);
        let cleaned = clean_table(t, 10.0, 1000.0).expect("clean");
        let kept: Vec<&str> = cleaned.rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(kept, vec!["10", "1000"]);
    }

    #[test]
    fn unparseable_prices_are_dropped() {
        let t = priced(&["", "abc", "100"]);
        let cleaned = clean_table(t, 10.0, 1000.0).expect("clean");
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned.rows[0][1], "100");
    }

    #[test]
    fn missing_price_column_is_an_error() {
        let t = Table::parse("id,name\n1,a\n").expect("parse");
        assert!(clean_table(t, 10.0, 1000.0).is_err());
    }

    #[test]
    fn last_review_is_normalized_when_present() {
        let raw = "id,price,last_review\n1,50,2019-05-21\n2,60,06/23/2019\n3,70,\n";
        let t = Table::parse(raw).expect("parse");
        let cleaned = clean_table(t, 10.0, 1000.0).expect("clean");
        let dates: Vec<&str> = cleaned.rows.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(dates, vec!["2019-05-21", "2019-06-23", ""]);
    }

    #[test]
    fn date_normalization_accepts_supported_layouts() {
        assert_eq!(normalize_date("2019-05-21").expect("iso"), "2019-05-21");
        assert_eq!(normalize_date("2019/05/21").expect("slash"), "2019-05-21");
        assert_eq!(normalize_date("05/21/2019").expect("us"), "2019-05-21");
        assert_eq!(
            normalize_date("2019-05-21 14:03:00").expect("datetime"),
            "2019-05-21"
        );
        assert_eq!(normalize_date("  ").expect("blank"), "");
        assert!(normalize_date("next tuesday").is_err());
    }
}
