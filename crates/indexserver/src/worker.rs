//! The indexing worker: pops one repository at a time off the queue,
//! decides how much of a build is needed, orchestrates git and the builder
//! subprocess, and records the outcome back onto the queue.

use crate::process::Cmd;
use crate::App;
use anyhow::Context;
use models::{IndexOptions, IndexState};
use shardset::scan;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sleep while the pause marker is present.
const PAUSE_RETRY: Duration = Duration::from_secs(5);
/// Sleep when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Well-known id of git's empty tree; the synthetic HEAD commit of an empty
/// repository is a commit of this tree.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

pub struct Worker {
    app: Arc<App>,
}

impl Worker {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.app.shards.paused() {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    tracing::info!(reason, "PAUSE file present, indexing halted");
                    tokio::time::sleep(PAUSE_RETRY).await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to read pause marker");
                    tokio::time::sleep(PAUSE_RETRY).await;
                    continue;
                }
            }
            let Some(opts) = self.app.queue.pop() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            let started = Instant::now();
            let state = match self.index_one(&opts).await {
                Ok(state) => state,
                Err(err) => {
                    tracing::error!(
                        repo = %opts.name,
                        id = %opts.repo_id,
                        err = format!("{err:#}"),
                        "indexing failed"
                    );
                    IndexState::Fail
                }
            };
            self.app.queue.set_indexed(&opts, state);

            let elapsed = started.elapsed();
            metrics::counter!("index_attempts_total", "state" => state.as_str()).increment(1);
            if state == IndexState::Fail {
                metrics::counter!("index_failing_total").increment(1);
            }
            let repo_label = if self.app.separate_metrics_for(&opts.name) {
                opts.name.clone()
            } else {
                "other".to_string()
            };
            metrics::histogram!("index_duration_seconds", "repo" => repo_label)
                .record(elapsed.as_secs_f64());
            tracing::info!(
                repo = %opts.name,
                id = %opts.repo_id,
                %state,
                elapsed_s = elapsed.as_secs(),
                "indexing attempt finished"
            );
        }
    }

    /// Index one repository according to its options. The incremental
    /// pre-check keeps this a metadata-only or no-op operation whenever the
    /// existing shards already carry the right content.
    pub async fn index_one(&self, opts: &IndexOptions) -> anyhow::Result<IndexState> {
        if opts.branches.is_empty() {
            return self.record_empty(opts).await.map(|()| IndexState::Empty);
        }

        let existing = scan::existing_for_repo(&self.app.shards, opts.repo_id)?;
        match scan::compare(&existing, opts) {
            scan::CompareState::Equal => Ok(IndexState::Noop),
            scan::CompareState::MetaOnly => match scan::rewrite_metadata(&existing, opts) {
                Ok(()) => Ok(IndexState::SuccessMeta),
                Err(err) => {
                    tracing::warn!(
                        repo = %opts.name,
                        %err,
                        "metadata rewrite failed, falling back to a full build"
                    );
                    self.build(opts, &existing).await.map(|()| IndexState::Success)
                }
            },
            scan::CompareState::ContentDiffers | scan::CompareState::Corrupt => {
                self.build(opts, &existing).await.map(|()| IndexState::Success)
            }
        }
    }

    /// Full (or delta) build: assemble a bare git dir holding exactly the
    /// requested commits, then hand it to the builder, which publishes
    /// shards into the index directory by atomic rename.
    async fn build(&self, opts: &IndexOptions, existing: &scan::Existing) -> anyhow::Result<()> {
        let cfg = &self.app.cfg;
        let scratch = tempfile::TempDir::new_in(self.app.shards.scratch_dir())
            .context("failed to create build scratch directory")?;
        let git_dir = scratch.path().join("git");
        let git_dir_str = git_dir.to_string_lossy().into_owned();

        self.run_checked(
            Cmd::new(&cfg.git_binary)
                .arg("init")
                .arg("--bare")
                .arg("--quiet")
                .arg(&git_dir_str),
        )
        .await?;

        let prior_commits = self.delta_base(opts, existing);
        let mut fetch = Cmd::new(&cfg.git_binary)
            .arg("-C")
            .arg(&git_dir_str)
            .arg("fetch")
            .arg("--depth=1")
            .arg("--no-tags")
            .arg("--quiet")
            .arg(&opts.clone_url)
            .args(opts.branches.iter().map(|b| b.version.clone()));
        if let Some(prior) = &prior_commits {
            fetch = fetch.args(prior.iter().cloned());
        }
        self.run_checked(
            fetch
                .timeout(cfg.index_timeout)
                .silence_timeout(cfg.silence_timeout),
        )
        .await?;

        for branch in &opts.branches {
            self.run_checked(
                Cmd::new(&cfg.git_binary)
                    .arg("-C")
                    .arg(&git_dir_str)
                    .arg("update-ref")
                    .arg(format!("refs/heads/{}", branch.name))
                    .arg(&branch.version),
            )
            .await?;
        }

        self.write_repo_config(&git_dir_str, opts).await?;
        self.run_builder(&git_dir_str, opts, prior_commits.is_some())
            .await
    }

    /// A repository with zero branches is recorded with an intentionally
    /// empty shard: a synthetic HEAD commit of the empty tree.
    async fn record_empty(&self, opts: &IndexOptions) -> anyhow::Result<()> {
        let cfg = &self.app.cfg;
        let scratch = tempfile::TempDir::new_in(self.app.shards.scratch_dir())
            .context("failed to create build scratch directory")?;
        let git_dir = scratch.path().join("git");
        let git_dir_str = git_dir.to_string_lossy().into_owned();

        self.run_checked(
            Cmd::new(&cfg.git_binary)
                .arg("init")
                .arg("--bare")
                .arg("--quiet")
                .arg(&git_dir_str),
        )
        .await?;

        let output = self
            .run_checked(
                Cmd::new(&cfg.git_binary)
                    .arg("-C")
                    .arg(&git_dir_str)
                    .arg("-c")
                    .arg("user.name=indexserver")
                    .arg("-c")
                    .arg("user.email=indexserver@localhost")
                    .arg("commit-tree")
                    .arg(EMPTY_TREE)
                    .arg("-m")
                    .arg("empty repository"),
            )
            .await?;
        let commit = output.trim().to_string();
        anyhow::ensure!(!commit.is_empty(), "commit-tree produced no commit id");

        self.run_checked(
            Cmd::new(&cfg.git_binary)
                .arg("-C")
                .arg(&git_dir_str)
                .arg("update-ref")
                .arg("refs/heads/HEAD")
                .arg(&commit),
        )
        .await?;

        self.write_repo_config(&git_dir_str, opts).await?;

        let mut empty = opts.clone();
        empty.branches = vec![models::Branch::new("HEAD", commit)];
        self.run_builder(&git_dir_str, &empty, false).await
    }

    /// Repo-level options travel to the builder as `zoekt.*` git config
    /// keys in the bare checkout.
    async fn write_repo_config(&self, git_dir: &str, opts: &IndexOptions) -> anyhow::Result<()> {
        let cfg = &self.app.cfg;
        let keys = [
            ("zoekt.name", opts.name.clone()),
            ("zoekt.repoid", opts.repo_id.to_string()),
            ("zoekt.public", bool_flag(opts.public)),
            ("zoekt.fork", bool_flag(opts.fork)),
            ("zoekt.archived", bool_flag(opts.archived)),
            ("zoekt.priority", opts.priority.to_string()),
        ];
        for (key, value) in keys {
            self.run_checked(
                Cmd::new(&cfg.git_binary)
                    .arg("-C")
                    .arg(git_dir)
                    .arg("config")
                    .arg(key)
                    .arg(value),
            )
            .await?;
        }
        for glob in &opts.large_files {
            self.run_checked(
                Cmd::new(&cfg.git_binary)
                    .arg("-C")
                    .arg(git_dir)
                    .arg("config")
                    .arg("--add")
                    .arg("zoekt.largeFile")
                    .arg(glob),
            )
            .await?;
        }
        Ok(())
    }

    async fn run_builder(
        &self,
        git_dir: &str,
        opts: &IndexOptions,
        delta: bool,
    ) -> anyhow::Result<()> {
        let cfg = &self.app.cfg;
        let branches: Vec<&str> = opts.branches.iter().map(|b| b.name.as_str()).collect();

        let mut cmd = Cmd::new(&cfg.index_binary)
            .arg("-index")
            .arg(self.app.shards.root().to_string_lossy().into_owned())
            .arg("-parallelism")
            .arg(cfg.parallelism().to_string())
            .arg("-file_limit")
            .arg(cfg.file_limit.to_string())
            .arg("-branches")
            .arg(branches.join(","))
            .arg("-incremental");
        if opts.symbols {
            cmd = cmd.arg("-require_ctags");
        }
        if delta {
            cmd = cmd
                .arg("-delta")
                .arg("-delta_shard_number_fallback_threshold")
                .arg(self.delta_threshold(opts).to_string());
        }
        cmd = cmd
            .arg(git_dir)
            .timeout(cfg.index_timeout)
            .silence_timeout(cfg.silence_timeout);

        // The builder mutates the shard directory; serialize with cleanup
        // and the compound maintainer.
        let _guard = self.app.dir_lock.lock().await;
        self.run_checked(cmd).await.map(|_| ())
    }

    /// Decide whether this build may be a delta build, and if so return the
    /// prior commits to fetch alongside the new ones.
    fn delta_base(&self, opts: &IndexOptions, existing: &scan::Existing) -> Option<Vec<String>> {
        let enabled =
            opts.allow_delta || self.app.cfg.delta_repos.iter().any(|n| *n == opts.name);
        if !enabled {
            return None;
        }
        let entry = existing.entry.as_ref()?;

        if existing.files.len() as u64 > self.delta_threshold(opts) {
            tracing::debug!(
                repo = %opts.name,
                shards = existing.files.len(),
                "too many prior shards, falling back to a full build"
            );
            return None;
        }

        // Delta builds need a complete prior manifest: a recorded commit
        // for every branch we are about to index.
        let mut prior = Vec::with_capacity(opts.branches.len());
        for branch in &opts.branches {
            let recorded = entry.branches.iter().find(|b| b.name == branch.name)?;
            prior.push(recorded.version.clone());
        }
        Some(prior)
    }

    fn delta_threshold(&self, opts: &IndexOptions) -> u64 {
        if opts.delta_shard_threshold > 0 {
            opts.delta_shard_threshold
        } else {
            self.app.cfg.delta_shard_threshold
        }
    }

    async fn run_checked(&self, cmd: Cmd) -> anyhow::Result<String> {
        let line = cmd.line();
        let output = self.app.runner.run(cmd).await?;
        if !output.success() {
            anyhow::bail!(
                "{line} exited with {:?}: {}",
                output.code,
                output.stderr_tail()
            );
        }
        Ok(output.stdout_string())
    }
}

fn bool_flag(v: bool) -> String {
    if v { "1" } else { "0" }.to_string()
}
