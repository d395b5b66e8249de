mod id;
mod options;

pub use id::RepoId;
pub use options::{Branch, IndexOptions};

/// IndexState is the recorded outcome of the most recent indexing attempt
/// for a repository.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexState {
    /// A full build completed and published shards.
    Success,
    /// Only the metadata sidecars were rewritten; shard content is unchanged.
    SuccessMeta,
    /// Existing shards already match the desired options.
    Noop,
    /// The repository has no branches; an empty shard records that fact.
    Empty,
    /// The build failed.
    Fail,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Success => "success",
            IndexState::SuccessMeta => "success-meta",
            IndexState::Noop => "noop",
            IndexState::Empty => "empty",
            IndexState::Fail => "fail",
        }
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
