use anyhow::Result;
use chrono::Utc;
use pricepipe_core::{ensure_dir, ArtifactStore};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything a step needs from its environment, passed explicitly instead of
/// living in ambient globals: the artifact store and a scratch directory for
/// files that exist only between transform and publish.
pub struct StepContext {
    store: ArtifactStore,
    scratch: PathBuf,
    owns_scratch: bool,
}

impl StepContext {
    /// Context with a private scratch directory, removed on drop.
    pub fn new(store_root: impl Into<PathBuf>) -> Result<Self> {
        let scratch = std::env::temp_dir().join(format!(
            "pricepipe_step_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&scratch)?;
        Ok(Self {
            store: ArtifactStore::new(store_root),
            scratch,
            owns_scratch: true,
        })
    }

    /// Context whose scratch directory is managed by the caller (the
    /// orchestrator owns one scratch dir per pipeline invocation).
    pub fn with_scratch(store_root: impl Into<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            store: ArtifactStore::new(store_root),
            scratch: scratch.into(),
            owns_scratch: false,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    pub fn scratch_file(&self, name: &str) -> PathBuf {
        self.scratch.join(name)
    }
}

impl Drop for StepContext {
    fn drop(&mut self) {
        if self.owns_scratch {
            let _ = fs::remove_dir_all(&self.scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_scratch_is_removed_on_drop() {
        let store_root = std::env::temp_dir().join(format!(
            "pricepipe_ctx_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let scratch = {
            let ctx = StepContext::new(&store_root).expect("context");
            let path = ctx.scratch_dir().to_path_buf();
            assert!(path.is_dir());
            path
        };
        assert!(!scratch.exists(), "scratch should be cleaned up");
        let _ = fs::remove_dir_all(store_root);
    }

    #[test]
    fn borrowed_scratch_is_left_alone() {
        let root = std::env::temp_dir().join(format!(
            "pricepipe_ctx_borrow_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("root");
        {
            let _ctx = StepContext::with_scratch(root.join("artifacts"), &root);
        }
        assert!(root.exists(), "caller-owned scratch must survive");
        let _ = fs::remove_dir_all(root);
    }
}
