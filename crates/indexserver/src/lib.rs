//! The indexing control plane daemon: decides what repositories to index
//! and in what order, maintains the on-disk shard set that backs the
//! searcher, and reconciles that shard set against the source of truth.

pub mod controlplane;
pub mod maintenance;
pub mod owner;
pub mod process;
pub mod queue;
pub mod server;
pub mod sync;
pub mod worker;

use shardset::journal::Journal;
use shardset::ShardDir;
use std::sync::Arc;
use std::time::Duration;

/// Server-level configuration, resolved from the CLI at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub hostname: String,
    /// Base cadence of the reconciliation loop; each tick is jittered.
    pub interval: Duration,
    pub merge_interval: Duration,
    pub vacuum_interval: Duration,
    /// Compound shards below this size are exploded by the vacuum pass.
    pub merge_min_size: u64,
    /// Fraction of available cores given to one build.
    pub cpu_fraction: f64,
    /// Per-file size limit passed to the builder.
    pub file_limit: u64,
    /// Hard deadline for one indexing job.
    pub index_timeout: Duration,
    /// Output-silence limit before quit/kill escalation.
    pub silence_timeout: Duration,
    pub git_binary: String,
    pub index_binary: String,
    pub merge_binary: String,
    /// Repository names allowed to build incrementally regardless of their
    /// per-repo flag.
    pub delta_repos: Vec<String>,
    /// Default shard-count cap above which delta builds abort to full.
    pub delta_shard_threshold: u64,
    /// Repository names granted their own metric label.
    pub separate_metrics: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            interval: Duration::from_secs(60),
            merge_interval: Duration::from_secs(8 * 60 * 60),
            vacuum_interval: Duration::from_secs(60 * 60),
            merge_min_size: (18 << 30) / 10,
            cpu_fraction: 1.0,
            file_limit: 2 << 20,
            index_timeout: Duration::from_secs(90 * 60),
            silence_timeout: Duration::from_secs(30 * 60),
            git_binary: "git".to_string(),
            index_binary: "zoekt-git-index".to_string(),
            merge_binary: "zoekt-merge-index".to_string(),
            delta_repos: Vec::new(),
            delta_shard_threshold: 150,
            separate_metrics: Vec::new(),
        }
    }
}

impl Config {
    /// Builder parallelism from the configured CPU fraction.
    pub fn parallelism(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ((cores as f64 * self.cpu_fraction) as usize).max(1)
    }
}

/// The process context: every piece of state shared between the long-lived
/// tasks, constructed once in main and passed by Arc. There are no
/// module-level singletons.
pub struct App {
    pub cfg: Config,
    pub queue: queue::Queue,
    pub shards: ShardDir,
    pub journal: Journal,
    pub cleanup_cfg: shardset::cleanup::CleanupConfig,
    pub merge_policy: shardset::compound::MergePolicy,
    /// Serializes every mutation of the shard directory: cleanup, merge,
    /// vacuum, and the builder's publish step.
    pub dir_lock: Arc<tokio::sync::Mutex<()>>,
    pub runner: Arc<dyn process::CommandRunner>,
    /// Wakes the reconciliation loop out of its jittered sleep.
    pub sync_nudge: tokio::sync::Notify,
}

impl App {
    pub fn new(
        cfg: Config,
        shards: ShardDir,
        backoff: queue::BackoffPolicy,
        cleanup_cfg: shardset::cleanup::CleanupConfig,
        merge_policy: shardset::compound::MergePolicy,
        runner: Arc<dyn process::CommandRunner>,
    ) -> Arc<Self> {
        let journal = Journal::new(shards.shard_log());
        Arc::new(Self {
            cfg,
            queue: queue::Queue::new(backoff),
            shards,
            journal,
            cleanup_cfg,
            merge_policy,
            dir_lock: Arc::new(tokio::sync::Mutex::new(())),
            runner,
            sync_nudge: tokio::sync::Notify::new(),
        })
    }

    /// Whether this repository gets its own label on per-repo metrics.
    pub fn separate_metrics_for(&self, repo_name: &str) -> bool {
        self.cfg.separate_metrics.iter().any(|n| n == repo_name)
    }
}
