use crate::fsio::{atomic_write_bytes, ensure_dir};
use crate::hash::sha256_file;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Local append-only artifact store. Every publish allocates a fresh version
/// directory under `root/<name>/v<N>/`; nothing is ever rewritten in place.
/// Aliases (including the automatic `latest`) are movable pointers kept in a
/// per-artifact `aliases.json`.
pub struct ArtifactStore {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {name}")]
    ArtifactNotFound { name: String },
    #[error("artifact {name} has no version v{version}")]
    VersionNotFound { name: String, version: u64 },
    #[error("artifact {name} has no alias '{alias}'")]
    AliasNotFound { name: String, alias: String },
    #[error("alias '{alias}' is reserved for version selectors")]
    ReservedAlias { alias: String },
    #[error("file to publish does not exist: {path}")]
    MissingFile { path: PathBuf },
    #[error("invalid artifact reference '{reference}': expected name or name:selector")]
    InvalidReference { reference: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub version: u64,
    pub artifact_type: String,
    pub description: String,
    pub file_name: String,
    pub digest: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub path: PathBuf,
}

pub struct PublishSpec<'a> {
    pub name: &'a str,
    pub artifact_type: &'a str,
    pub description: &'a str,
}

/// `name`, `name:v3`, `name:latest`, `name:reference` and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub name: String,
    pub selector: VersionSelector,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Version(u64),
    Alias(String),
}

impl FromStr for ArtifactRef {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, StoreError> {
        let (name, selector) = match raw.rsplit_once(':') {
            Some((name, sel)) => (name, sel),
            None => (raw, "latest"),
        };
        if name.is_empty() || selector.is_empty() {
            return Err(StoreError::InvalidReference {
                reference: raw.to_string(),
            });
        }
        let selector = match parse_version_token(selector) {
            Some(v) => VersionSelector::Version(v),
            None => VersionSelector::Alias(selector.to_string()),
        };
        Ok(ArtifactRef {
            name: name.to_string(),
            selector,
        })
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            VersionSelector::Version(v) => write!(f, "{}:v{}", self.name, v),
            VersionSelector::Alias(a) => write!(f, "{}:{}", self.name, a),
        }
    }
}

fn parse_version_token(token: &str) -> Option<u64> {
    let digits = token.strip_prefix('v')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Publish `file` as a new version of `spec.name`. Copies the bytes into
    /// the store, writes metadata, and moves `latest`. Returns only after the
    /// version is durable on disk, so a fetch by `name:latest` issued by the
    /// next pipeline step is guaranteed to see it.
    pub fn publish(&self, spec: &PublishSpec<'_>, file: &Path) -> Result<Artifact> {
        if !file.is_file() {
            return Err(StoreError::MissingFile {
                path: file.to_path_buf(),
            }
            .into());
        }
        let version = self.next_version(spec.name)?;
        let version_dir = self.artifact_dir(spec.name).join(format!("v{}", version));
        ensure_dir(&version_dir)?;

        let file_name = file
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("file to publish has no name: {}", file.display()))?
            .to_string();
        let stored = version_dir.join(&file_name);
        fs::copy(file, &stored)?;
        fs::File::open(&stored)?.sync_all()?;

        let meta = ArtifactMeta {
            name: spec.name.to_string(),
            version,
            artifact_type: spec.artifact_type.to_string(),
            description: spec.description.to_string(),
            file_name,
            digest: sha256_file(&stored)?,
            created_at: Utc::now().to_rfc3339(),
        };
        atomic_write_bytes(
            &version_dir.join("metadata.json"),
            &serde_json::to_vec_pretty(&meta)?,
        )?;
        self.write_alias(spec.name, "latest", version)?;

        tracing::info!(
            name = spec.name,
            version,
            digest = %meta.digest,
            "published artifact"
        );
        Ok(Artifact { meta, path: stored })
    }

    /// Resolve a reference to the on-disk file of a published version.
    pub fn fetch(&self, reference: &ArtifactRef) -> Result<Artifact> {
        let version = self.resolve_version(reference)?;
        let version_dir = self
            .artifact_dir(&reference.name)
            .join(format!("v{}", version));
        let meta_path = version_dir.join("metadata.json");
        if !meta_path.is_file() {
            return Err(StoreError::VersionNotFound {
                name: reference.name.clone(),
                version,
            }
            .into());
        }
        let meta: ArtifactMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
        let path = version_dir.join(&meta.file_name);
        if !path.is_file() {
            return Err(anyhow!(
                "artifact {} v{} is missing its backing file {}",
                reference.name,
                version,
                meta.file_name
            ));
        }
        tracing::info!(reference = %reference, version, "fetched artifact");
        Ok(Artifact { meta, path })
    }

    /// Point `alias` at an existing version. `latest` and `v<N>`-shaped names
    /// cannot be reassigned by hand.
    pub fn set_alias(&self, name: &str, alias: &str, version: u64) -> Result<()> {
        if alias == "latest" || parse_version_token(alias).is_some() {
            return Err(StoreError::ReservedAlias {
                alias: alias.to_string(),
            }
            .into());
        }
        if !self.versions(name)?.contains(&version) {
            return Err(StoreError::VersionNotFound {
                name: name.to_string(),
                version,
            }
            .into());
        }
        self.write_alias(name, alias, version)
    }

    pub fn latest_version(&self, name: &str) -> Result<u64> {
        self.resolve_version(&ArtifactRef {
            name: name.to_string(),
            selector: VersionSelector::Alias("latest".to_string()),
        })
    }

    /// Published versions of `name`, ascending.
    pub fn versions(&self, name: &str) -> Result<Vec<u64>> {
        let dir = self.artifact_dir(name);
        if !dir.is_dir() {
            return Err(StoreError::ArtifactNotFound {
                name: name.to_string(),
            }
            .into());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(v) = entry
                .file_name()
                .to_str()
                .and_then(parse_version_token)
            {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// All artifact names in the store, with their aliases.
    pub fn list(&self) -> Result<Vec<(String, BTreeMap<String, u64>)>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
        {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            out.push((name.clone(), self.read_aliases(&name)?));
        }
        out.sort();
        Ok(out)
    }

    pub fn aliases(&self, name: &str) -> Result<BTreeMap<String, u64>> {
        self.read_aliases(name)
    }

    fn artifact_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn next_version(&self, name: &str) -> Result<u64> {
        match self.versions(name) {
            Ok(versions) => Ok(versions.last().copied().unwrap_or(0) + 1),
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::ArtifactNotFound { .. }) => Ok(1),
                _ => Err(err),
            },
        }
    }

    fn resolve_version(&self, reference: &ArtifactRef) -> Result<u64> {
        if !self.artifact_dir(&reference.name).is_dir() {
            return Err(StoreError::ArtifactNotFound {
                name: reference.name.clone(),
            }
            .into());
        }
        match &reference.selector {
            VersionSelector::Version(v) => Ok(*v),
            VersionSelector::Alias(alias) => {
                let aliases = self.read_aliases(&reference.name)?;
                aliases.get(alias).copied().ok_or_else(|| {
                    StoreError::AliasNotFound {
                        name: reference.name.clone(),
                        alias: alias.clone(),
                    }
                    .into()
                })
            }
        }
    }

    fn read_aliases(&self, name: &str) -> Result<BTreeMap<String, u64>> {
        let path = self.artifact_dir(name).join("aliases.json");
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&fs::read(&path)?)?)
    }

    fn write_alias(&self, name: &str, alias: &str, version: u64) -> Result<()> {
        let mut aliases = self.read_aliases(name)?;
        aliases.insert(alias.to_string(), version);
        atomic_write_bytes(
            &self.artifact_dir(name).join("aliases.json"),
            &serde_json::to_vec_pretty(&aliases)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> (PathBuf, ArtifactStore) {
        let root = std::env::temp_dir().join(format!(
            "pricepipe_store_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        (root.clone(), ArtifactStore::new(root.join("artifacts")))
    }

    fn write_sample(root: &Path, name: &str, content: &str) -> PathBuf {
        let path = root.join(name);
        ensure_dir(root).expect("sample dir");
        fs::write(&path, content).expect("sample file");
        path
    }

    const RAW: PublishSpec<'static> = PublishSpec {
        name: "sample.csv",
        artifact_type: "raw_data",
        description: "raw rows",
    };

    #[test]
    fn publish_twice_creates_two_distinct_versions() {
        let (root, store) = temp_store("twice");
        let file = write_sample(&root, "sample.csv", "id,price\n1,10\n");
        let first = store.publish(&RAW, &file).expect("first publish");
        let second = store.publish(&RAW, &file).expect("second publish");
        assert_eq!(first.meta.version, 1);
        assert_eq!(second.meta.version, 2);
        assert_ne!(first.path, second.path);
        assert_eq!(store.versions("sample.csv").expect("versions"), vec![1, 2]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn latest_tracks_newest_publish() {
        let (root, store) = temp_store("latest");
        let a = write_sample(&root, "sample.csv", "id,price\n1,10\n");
        store.publish(&RAW, &a).expect("v1");
        let b = write_sample(&root, "sample.csv", "id,price\n2,20\n");
        store.publish(&RAW, &b).expect("v2");

        let fetched = store
            .fetch(&"sample.csv:latest".parse().expect("ref"))
            .expect("fetch latest");
        assert_eq!(fetched.meta.version, 2);
        assert_eq!(
            fs::read_to_string(&fetched.path).expect("content"),
            "id,price\n2,20\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fetch_pinned_version_survives_later_publishes() {
        let (root, store) = temp_store("pinned");
        let a = write_sample(&root, "sample.csv", "old\n");
        store.publish(&RAW, &a).expect("v1");
        let b = write_sample(&root, "sample.csv", "new\n");
        store.publish(&RAW, &b).expect("v2");

        let v1 = store
            .fetch(&"sample.csv:v1".parse().expect("ref"))
            .expect("fetch v1");
        assert_eq!(fs::read_to_string(&v1.path).expect("content"), "old\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn alias_moves_are_visible_to_fetch() {
        let (root, store) = temp_store("alias");
        let file = write_sample(&root, "sample.csv", "x\n");
        store.publish(&RAW, &file).expect("v1");
        store.publish(&RAW, &file).expect("v2");

        store
            .set_alias("sample.csv", "reference", 1)
            .expect("set alias");
        let fetched = store
            .fetch(&"sample.csv:reference".parse().expect("ref"))
            .expect("fetch by alias");
        assert_eq!(fetched.meta.version, 1);

        store
            .set_alias("sample.csv", "reference", 2)
            .expect("move alias");
        let fetched = store
            .fetch(&"sample.csv:reference".parse().expect("ref"))
            .expect("fetch moved alias");
        assert_eq!(fetched.meta.version, 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reserved_alias_names_are_rejected() {
        let (root, store) = temp_store("reserved");
        let file = write_sample(&root, "sample.csv", "x\n");
        store.publish(&RAW, &file).expect("v1");
        assert!(store.set_alias("sample.csv", "latest", 1).is_err());
        assert!(store.set_alias("sample.csv", "v2", 1).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_inputs_are_typed_errors() {
        let (root, store) = temp_store("missing");
        let err = store
            .fetch(&"nope.csv:latest".parse().expect("ref"))
            .expect_err("unknown name");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ArtifactNotFound { .. })
        ));

        let file = write_sample(&root, "sample.csv", "x\n");
        store.publish(&RAW, &file).expect("v1");
        let err = store
            .fetch(&"sample.csv:prod".parse().expect("ref"))
            .expect_err("unknown alias");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AliasNotFound { .. })
        ));

        let err = store
            .publish(&RAW, &root.join("does_not_exist.csv"))
            .expect_err("missing file");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::MissingFile { .. })
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reference_parsing_covers_selector_shapes() {
        let r: ArtifactRef = "clean_sample.csv:latest".parse().expect("latest");
        assert_eq!(r.selector, VersionSelector::Alias("latest".to_string()));
        let r: ArtifactRef = "clean_sample.csv:v12".parse().expect("version");
        assert_eq!(r.selector, VersionSelector::Version(12));
        let r: ArtifactRef = "clean_sample.csv".parse().expect("bare name");
        assert_eq!(r.selector, VersionSelector::Alias("latest".to_string()));
        // `vNext` is not a version token, so it is an alias.
        let r: ArtifactRef = "model:vNext".parse().expect("alias");
        assert_eq!(r.selector, VersionSelector::Alias("vNext".to_string()));
        assert!(":latest".parse::<ArtifactRef>().is_err());
        assert!("name:".parse::<ArtifactRef>().is_err());
    }
}
