//! The compound-shard maintainer: a merge loop that packs small simple
//! shards into compound shards, and a vacuum loop that explodes or rewrites
//! compound shards as their live content shrinks.
//!
//! Both loops plan without the directory lock and hold it only around each
//! individual subprocess invocation, so cleanup and the worker interleave
//! between merges.

use crate::process::Cmd;
use crate::App;
use shardset::compound::{self, Candidate, VacuumAction};
use shardset::{cleanup, meta};
use std::sync::Arc;
use std::time::SystemTime;

pub struct Maintainer {
    app: Arc<App>,
}

impl Maintainer {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    pub async fn run_merge_loop(self) -> anyhow::Result<()> {
        loop {
            tokio::time::sleep(self.app.cfg.merge_interval).await;
            if self.paused() {
                continue;
            }
            if let Err(err) = self.merge_pass().await {
                tracing::error!(err = format!("{err:#}"), "merge pass failed");
            }
        }
    }

    pub async fn run_vacuum_loop(self) -> anyhow::Result<()> {
        loop {
            tokio::time::sleep(self.app.cfg.vacuum_interval).await;
            if self.paused() {
                continue;
            }
            if let Err(err) = self.vacuum_pass().await {
                tracing::error!(err = format!("{err:#}"), "vacuum pass failed");
            }
        }
    }

    fn paused(&self) -> bool {
        match self.app.shards.paused() {
            Ok(None) => false,
            Ok(Some(reason)) => {
                tracing::info!(reason, "PAUSE file present, skipping maintenance");
                true
            }
            Err(err) => {
                tracing::warn!(%err, "failed to read pause marker");
                true
            }
        }
    }

    /// Group eligible simple shards and merge each full group into one
    /// compound shard. The under-target tail stays as it is.
    #[tracing::instrument(skip_all)]
    pub async fn merge_pass(&self) -> anyhow::Result<()> {
        let candidates = compound::candidates(
            &self.app.shards,
            SystemTime::now(),
            &self.app.merge_policy,
        )?;
        let (groups, tail) =
            compound::pack(candidates, self.app.merge_policy.target_size);
        tracing::debug!(groups = groups.len(), tail = tail.len(), "merge plan");

        for group in groups {
            if group.len() < 2 {
                continue;
            }
            // Lock per merge, not per pass: a merge of gigabytes takes a
            // while and cleanup must be able to interleave.
            let _guard = self.app.dir_lock.lock().await;
            if let Err(err) = self.merge_group(&group).await {
                tracing::error!(err = format!("{err:#}"), "merge group failed");
            }
        }
        Ok(())
    }

    async fn merge_group(&self, group: &[Candidate]) -> anyhow::Result<()> {
        let cmd = Cmd::new(&self.app.cfg.merge_binary)
            .arg("merge")
            .arg("-index")
            .arg(self.app.shards.root().to_string_lossy().into_owned())
            .args(
                group
                    .iter()
                    .map(|c| c.file.path.to_string_lossy().into_owned()),
            )
            .timeout(self.app.cfg.index_timeout);

        let output = self.app.runner.run(cmd).await?;
        if !output.success() {
            anyhow::bail!(
                "merger exited with {:?}: {}",
                output.code,
                output.stderr_tail()
            );
        }
        let compound_name = output.stdout_string().trim().to_string();

        // The compound shard is already published; the inputs go away in
        // deletion order.
        for path in cleanup::deletion_order(group.iter().map(|c| c.file.path.clone()).collect()) {
            let candidate = group
                .iter()
                .find(|c| c.file.path == path)
                .expect("path came from the group");
            for victim in [path.clone(), meta::sidecar_path(&path)] {
                if let Err(err) = std::fs::remove_file(&victim) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = ?victim, %err, "failed to delete merged input");
                    }
                }
            }
            self.app.journal.record(
                "merge",
                &path,
                candidate.file.len,
                &candidate.repo.name,
                candidate.repo.id,
            );
        }

        metrics::counter!("shard_merges_total").increment(1);
        tracing::info!(
            compound = compound_name,
            inputs = group.len(),
            "merged simple shards into a compound shard"
        );
        Ok(())
    }

    /// Explode undersized compound shards back into simple shards, and
    /// rewrite compound shards that accumulated tombstones.
    #[tracing::instrument(skip_all)]
    pub async fn vacuum_pass(&self) -> anyhow::Result<()> {
        for file in self.app.shards.list_shards()? {
            if !file.is_compound() {
                continue;
            }
            let shard_meta = match meta::read(&file.path) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(shard = %file.base_name(), %err, "skipping unreadable compound");
                    continue;
                }
            };
            match compound::vacuum_action(&file, &shard_meta, self.app.cfg.merge_min_size) {
                VacuumAction::Keep => {}
                VacuumAction::Explode => {
                    let _guard = self.app.dir_lock.lock().await;
                    if let Err(err) = self.explode(&file.path, file.len).await {
                        tracing::error!(err = format!("{err:#}"), "explode failed");
                    }
                }
                VacuumAction::Rewrite => {
                    let _guard = self.app.dir_lock.lock().await;
                    if let Err(err) = self.rewrite(&file.path, file.len).await {
                        tracing::error!(err = format!("{err:#}"), "vacuum rewrite failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// The merger's explode mode replaces the compound shard with simple
    /// shards for its live members; the simple shards re-enter the merge
    /// flow on the next pass.
    async fn explode(&self, path: &std::path::Path, len: u64) -> anyhow::Result<()> {
        let cmd = Cmd::new(&self.app.cfg.merge_binary)
            .arg("explode")
            .arg("-index")
            .arg(self.app.shards.root().to_string_lossy().into_owned())
            .arg(path.to_string_lossy().into_owned())
            .timeout(self.app.cfg.index_timeout);
        let output = self.app.runner.run(cmd).await?;
        if !output.success() {
            anyhow::bail!(
                "explode exited with {:?}: {}",
                output.code,
                output.stderr_tail()
            );
        }
        self.app.journal.record("explode", path, len, "-", models::RepoId::new(0));
        metrics::counter!("shard_explodes_total").increment(1);
        tracing::info!(shard = ?path.file_name(), "exploded compound shard");
        Ok(())
    }

    /// Re-merging a compound shard with itself writes a new compound
    /// without the tombstoned repositories; the original is then deleted.
    async fn rewrite(&self, path: &std::path::Path, len: u64) -> anyhow::Result<()> {
        let cmd = Cmd::new(&self.app.cfg.merge_binary)
            .arg("merge")
            .arg("-index")
            .arg(self.app.shards.root().to_string_lossy().into_owned())
            .arg(path.to_string_lossy().into_owned())
            .timeout(self.app.cfg.index_timeout);
        let output = self.app.runner.run(cmd).await?;
        if !output.success() {
            anyhow::bail!(
                "merger exited with {:?}: {}",
                output.code,
                output.stderr_tail()
            );
        }

        for victim in [path.to_path_buf(), meta::sidecar_path(path)] {
            if let Err(err) = std::fs::remove_file(&victim) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = ?victim, %err, "failed to delete vacuumed compound");
                }
            }
        }
        self.app.journal.record("vacuum", path, len, "-", models::RepoId::new(0));
        metrics::counter!("shard_vacuums_total").increment(1);
        tracing::info!(shard = ?path.file_name(), "vacuumed tombstones out of compound shard");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeRunner;
    use crate::process::Output;
    use crate::testutil::{test_app, test_app_custom};
    use shardset::meta::{RepoEntry, ShardMeta};
    use shardset::FORMAT_VERSION;

    fn write_simple(app: &App, name: &str, id: u32, len: usize, latest_commit: i64) {
        let path = app.shards.root().join(shardset::shard_file_name(name, 0));
        std::fs::write(&path, vec![0u8; len]).unwrap();
        let mut entry = RepoEntry {
            id: models::RepoId::new(id),
            name: name.to_string(),
            ..Default::default()
        };
        entry.latest_commit_unix = latest_commit;
        meta::write(
            &path,
            &ShardMeta {
                format_version: FORMAT_VERSION,
                repos: vec![entry],
            },
        )
        .unwrap();
    }

    fn write_compound(app: &App, base: &str, len: usize, tombstoned: bool) -> std::path::PathBuf {
        let path = app.shards.root().join(format!(
            "{base}_v{FORMAT_VERSION}.00000{}",
            shardset::SHARD_SUFFIX
        ));
        std::fs::write(&path, vec![0u8; len]).unwrap();
        let mut entry = RepoEntry {
            id: models::RepoId::new(9),
            name: "member".to_string(),
            ..Default::default()
        };
        entry.tombstone = tombstoned;
        meta::write(
            &path,
            &ShardMeta {
                format_version: FORMAT_VERSION,
                repos: vec![entry],
            },
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn merge_pass_merges_full_groups_and_deletes_inputs() {
        let runner = FakeRunner::with_handler(|_| Output {
            stdout: b"compound-feed_v16.00000.zoekt\n".to_vec(),
            stderr: Vec::new(),
            code: Some(0),
        });
        // Three cold simple shards: 3 KiB, 3 KiB, 2 KiB. Target 6 KiB packs
        // all three into one group.
        let policy = shardset::compound::MergePolicy {
            target_size: 6 << 10,
            ..Default::default()
        };
        let (app, runner, _tmp) = test_app_custom(runner, crate::Config::default(), policy);

        write_simple(&app, "a", 1, 3 << 10, 1);
        write_simple(&app, "b", 2, 3 << 10, 1);
        write_simple(&app, "c", 3, 2 << 10, 1);

        Maintainer::new(app.clone()).merge_pass().await.unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("zoekt-merge-index merge"));
        for name in ["a", "b", "c"] {
            assert!(lines[0].contains(&shardset::shard_file_name(name, 0)));
            assert!(!app
                .shards
                .root()
                .join(shardset::shard_file_name(name, 0))
                .exists());
        }
    }

    #[tokio::test]
    async fn undersized_groups_are_left_alone() {
        let policy = shardset::compound::MergePolicy {
            target_size: 1 << 20,
            ..Default::default()
        };
        let (app, runner, _tmp) =
            test_app_custom(FakeRunner::succeeding(), crate::Config::default(), policy);

        write_simple(&app, "small", 1, 1024, 1);
        Maintainer::new(app.clone()).merge_pass().await.unwrap();
        assert!(runner.lines().is_empty());
        assert!(app
            .shards
            .root()
            .join(shardset::shard_file_name("small", 0))
            .exists());
    }

    #[tokio::test]
    async fn vacuum_explodes_small_compounds() {
        let (app, runner, _tmp) = test_app(FakeRunner::succeeding());
        write_compound(&app, "compound-small", 100, false);

        Maintainer::new(app.clone()).vacuum_pass().await.unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("zoekt-merge-index explode"));
    }

    #[tokio::test]
    async fn vacuum_rewrites_tombstoned_compounds() {
        let cfg = crate::Config {
            merge_min_size: 10,
            ..Default::default()
        };
        let (app, runner, _tmp) = test_app_custom(
            FakeRunner::succeeding(),
            cfg,
            shardset::compound::MergePolicy::default(),
        );
        let path = write_compound(&app, "compound-dead", 1000, true);

        Maintainer::new(app.clone()).vacuum_pass().await.unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("zoekt-merge-index merge"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn healthy_compounds_are_kept() {
        let cfg = crate::Config {
            merge_min_size: 10,
            ..Default::default()
        };
        let (app, runner, _tmp) = test_app_custom(
            FakeRunner::succeeding(),
            cfg,
            shardset::compound::MergePolicy::default(),
        );
        write_compound(&app, "compound-fine", 1000, false);

        Maintainer::new(app.clone()).vacuum_pass().await.unwrap();
        assert!(runner.lines().is_empty());
    }
}
