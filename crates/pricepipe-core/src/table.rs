use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;

/// In-memory CSV table: a header row plus string cells. The parser handles
/// quoted fields (embedded commas, doubled quotes, newlines inside quotes),
/// which the rental dataset's free-text `name` column needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn read_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("cannot read csv {}: {}", path.display(), e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut records = parse_records(raw)?;
        if records.is_empty() {
            return Err(anyhow!("csv has no header row"));
        }
        let headers = records.remove(0);
        for (idx, row) in records.iter().enumerate() {
            if row.len() != headers.len() {
                return Err(anyhow!(
                    "csv row {} has {} fields, expected {}",
                    idx + 2,
                    row.len(),
                    headers.len()
                ));
            }
        }
        Ok(Self {
            headers,
            rows: records,
        })
    }

    pub fn write_path(&self, path: &Path) -> Result<()> {
        crate::fsio::atomic_write_bytes(path, self.to_csv().as_bytes())
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        write_record(&mut out, &self.headers);
        for row in &self.rows {
            write_record(&mut out, row);
        }
        out
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| anyhow!("csv is missing required column '{}'", name))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// New table with the same headers and the given rows of this one.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            headers: self.headers.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }
}

fn parse_records(raw: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(anyhow!("csv ends inside a quoted field"));
    }
    // Trailing record without a final newline.
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    // Blank lines carry no record.
    records.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    Ok(records)
}

fn write_record(out: &mut String, fields: &[String]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains(',') || field.contains('"') || field.contains('\n') {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}
