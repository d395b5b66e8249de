use super::RepoId;

/// A branch to index, as a (name, commit identifier) pair.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    /// Commit identifier the branch resolves to.
    pub version: String,
}

impl Branch {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// IndexOptions is the per-repository specification of what the builder
/// should produce. Structural equality of two IndexOptions decides whether a
/// repository's shards are current: a queue entry is "indexed" exactly when
/// the options of its last successful build equal its desired options.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexOptions {
    pub repo_id: RepoId,
    /// Display name, used for logs and shard filenames only.
    pub name: String,
    pub clone_url: String,
    /// Ordered branch list. An empty list means the repository is empty and
    /// is recorded as such with a synthetic shard.
    pub branches: Vec<Branch>,
    /// Glob patterns of large files to index despite the size limit.
    pub large_files: Vec<String>,
    /// Whether to extract symbol information.
    pub symbols: bool,
    pub priority: f64,
    pub public: bool,
    pub fork: bool,
    pub archived: bool,
    /// Whether this repository may be built incrementally from its prior
    /// shards.
    pub allow_delta: bool,
    /// Number of preexisting shards beyond which a delta build aborts back
    /// to a full build.
    pub delta_shard_threshold: u64,
}

impl IndexOptions {
    /// Fields that change the byte content of shards. Two options with equal
    /// content fields can differ only in metadata, which is rewritable in
    /// place via the sidecars.
    pub fn content_eq(&self, other: &IndexOptions) -> bool {
        self.repo_id == other.repo_id
            && self.name == other.name
            && self.branches == other.branches
            && self.large_files == other.large_files
            && self.symbols == other.symbols
    }
}
