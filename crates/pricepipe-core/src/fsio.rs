use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write-then-rename so a reader never observes a half-written file. This is
/// the durability contract the artifact store's publish relies on: once this
/// returns, the bytes are visible to any later open by path. A failed attempt
/// leaves no staging file behind.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    ensure_dir(&parent)?;
    let staging = parent.join(format!(
        ".stage-{}-{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let outcome = stage_and_swap(&staging, path, &parent, bytes);
    if outcome.is_err() {
        let _ = fs::remove_file(&staging);
    }
    outcome
}

fn stage_and_swap(staging: &Path, target: &Path, parent: &Path, bytes: &[u8]) -> Result<()> {
    let mut staged = fs::File::create(staging)?;
    staged.write_all(bytes)?;
    staged.sync_all()?;
    drop(staged);
    fs::rename(staging, target)?;
    // Rename durability needs the directory entry on disk too.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "pricepipe_fsio_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_temp_file() {
        let root = temp_root("atomic");
        let target = root.join("a").join("b").join("data.json");
        atomic_write_bytes(&target, b"{}").expect("write");
        assert_eq!(fs::read(&target).expect("read back"), b"{}");
        let siblings: Vec<_> = fs::read_dir(target.parent().unwrap())
            .expect("list dir")
            .collect();
        assert_eq!(siblings.len(), 1, "temp file should be renamed away");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let root = temp_root("replace");
        let target = root.join("data.json");
        atomic_write_bytes(&target, b"old").expect("first write");
        atomic_write_bytes(&target, b"new").expect("second write");
        assert_eq!(fs::read(&target).expect("read back"), b"new");
        let _ = fs::remove_dir_all(root);
    }
}
