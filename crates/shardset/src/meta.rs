//! Shard metadata sidecars.
//!
//! Every shard file `X.zoekt` may carry a JSON sidecar `X.zoekt.meta`
//! describing the repositories it contains. The sidecar is the only part of
//! a shard the control plane reads or writes; the shard payload itself is
//! opaque to everything but the builder and the searcher. Sidecar updates
//! always publish via atomic rename.

use models::{Branch, IndexOptions, RepoId};
use std::path::{Path, PathBuf};

/// Metadata sidecar contents for one shard file.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardMeta {
    pub format_version: u32,
    pub repos: Vec<RepoEntry>,
}

impl ShardMeta {
    /// The entry for `id`, if this shard contains it.
    pub fn repo(&self, id: RepoId) -> Option<&RepoEntry> {
        self.repos.iter().find(|r| r.id == id)
    }

    pub fn has_tombstones(&self) -> bool {
        self.repos.iter().any(|r| r.tombstone)
    }
}

/// One repository recorded inside a shard.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepoEntry {
    pub id: RepoId,
    pub name: String,
    /// A tombstoned repository stays in the shard's bytes but must be
    /// skipped by the searcher until the next compaction.
    pub tombstone: bool,
    /// Unix seconds of the newest commit across the indexed branches.
    pub latest_commit_unix: i64,
    /// Branch manifest as of the build that produced this shard.
    pub branches: Vec<Branch>,
    pub large_files: Vec<String>,
    pub symbols: bool,
    pub priority: f64,
    pub public: bool,
    pub fork: bool,
    pub archived: bool,
}

impl RepoEntry {
    pub fn from_options(opts: &IndexOptions, latest_commit_unix: i64) -> Self {
        Self {
            id: opts.repo_id,
            name: opts.name.clone(),
            tombstone: false,
            latest_commit_unix,
            branches: opts.branches.clone(),
            large_files: opts.large_files.clone(),
            symbols: opts.symbols,
            priority: opts.priority,
            public: opts.public,
            fork: opts.fork,
            archived: opts.archived,
        }
    }

    /// Whether the shard content this entry describes would be reproduced
    /// byte-for-byte by a build of `opts`.
    pub fn content_matches(&self, opts: &IndexOptions) -> bool {
        self.name == opts.name
            && self.branches == opts.branches
            && self.large_files == opts.large_files
            && self.symbols == opts.symbols
    }

    /// Whether every option field, content and metadata alike, matches.
    pub fn matches(&self, opts: &IndexOptions) -> bool {
        self.content_matches(opts)
            && self.priority == opts.priority
            && self.public == opts.public
            && self.fork == opts.fork
            && self.archived == opts.archived
    }

    /// Overwrite the metadata-only fields from `opts`, leaving content
    /// fields untouched.
    pub fn apply_metadata(&mut self, opts: &IndexOptions) {
        self.priority = opts.priority;
        self.public = opts.public;
        self.fork = opts.fork;
        self.archived = opts.archived;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("shard {0:?} has no metadata sidecar")]
    Missing(PathBuf),
    #[error("failed to read metadata sidecar of {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata sidecar of {path:?} is not valid")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("shard {path:?} does not contain repository {id}")]
    NoSuchRepo { path: PathBuf, id: RepoId },
}

/// Path of the sidecar belonging to a shard file.
pub fn sidecar_path(shard: &Path) -> PathBuf {
    let mut name = shard.as_os_str().to_os_string();
    name.push(".meta");
    PathBuf::from(name)
}

/// Read a shard's sidecar.
pub fn read(shard: &Path) -> Result<ShardMeta, MetaError> {
    let path = sidecar_path(shard);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(MetaError::Missing(shard.to_path_buf()))
        }
        Err(err) => return Err(MetaError::Io { path, source: err }),
    };
    serde_json::from_slice(&bytes).map_err(|err| MetaError::Parse { path, source: err })
}

/// Atomically write a shard's sidecar.
pub fn write(shard: &Path, meta: &ShardMeta) -> Result<(), MetaError> {
    let path = sidecar_path(shard);
    let bytes = serde_json::to_vec_pretty(meta).expect("sidecar serialization is infallible");
    crate::write_atomic(&path, &bytes).map_err(|err| MetaError::Io { path, source: err })
}

/// Flip the tombstone flag of `id` inside a shard's sidecar.
pub fn set_tombstone(shard: &Path, id: RepoId, tombstone: bool) -> Result<(), MetaError> {
    let mut meta = read(shard)?;
    let entry = meta
        .repos
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| MetaError::NoSuchRepo {
            path: shard.to_path_buf(),
            id,
        })?;
    if entry.tombstone == tombstone {
        return Ok(());
    }
    entry.tombstone = tombstone;
    write(shard, &meta)
}
