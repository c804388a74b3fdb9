pub mod fsio;
pub mod hash;
pub mod store;
pub mod table;

pub use fsio::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
pub use hash::{canonical_json_digest, sha256_bytes, sha256_file};
pub use store::{Artifact, ArtifactMeta, ArtifactRef, ArtifactStore, PublishSpec, StoreError};
pub use table::Table;
