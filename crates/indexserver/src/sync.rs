//! The reconciliation loop: drives the queue from the source of truth with
//! bounded staleness, and triggers shard cleanup.
//!
//! The loop wakes on a jittered interval and on an external nudge. Any
//! transport failure is logged and counted; the cycle always completes and
//! the next tick retries. No single repository can stall the loop.

use crate::controlplane::{ConfigItem, ConfigSource, Fingerprint, CONFIG_BATCH_SIZE};
use crate::App;
use anyhow::Context;
use models::RepoId;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub struct SyncLoop {
    app: Arc<App>,
    source: Arc<dyn ConfigSource>,
    /// The last adopted configuration fingerprint. Kept across failed
    /// cycles so the server re-sends any delta we missed.
    fingerprint: Option<Fingerprint>,
}

impl SyncLoop {
    pub fn new(app: Arc<App>, source: Arc<dyn ConfigSource>) -> Self {
        Self {
            app,
            source,
            fingerprint: None,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let wait = jitter(self.app.cfg.interval);
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = self.app.sync_nudge.notified() => {
                    tracing::debug!("sync loop nudged");
                }
            }

            let started = Instant::now();
            if let Err(err) = self.tick().await {
                metrics::counter!("sync_errors_total").increment(1);
                tracing::error!(err = format!("{err:#}"), "sync cycle failed");
            }
            metrics::histogram!("sync_duration_seconds").record(started.elapsed().as_secs_f64());
            metrics::gauge!("index_queue_len").set(self.app.queue.queued_len() as f64);
        }
    }

    /// One reconciliation cycle, in the order the steps must happen:
    /// enumerate → list → prune queue → (cleanup concurrently) → fetch
    /// configuration deltas → bump the unchanged → await cleanup.
    #[tracing::instrument(skip_all)]
    pub async fn tick(&mut self) -> anyhow::Result<()> {
        if let Some(reason) = self
            .app
            .shards
            .paused()
            .context("failed to read pause marker")?
        {
            tracing::info!(reason, "PAUSE file present, skipping sync cycle");
            return Ok(());
        }

        let indexed =
            shardset::scan::indexed_ids(&self.app.shards).context("failed to enumerate shards")?;
        let owned = self
            .source
            .list(&self.app.cfg.hostname, &indexed)
            .await
            .context("list call failed")?;
        let owned_set: HashSet<RepoId> = owned.iter().copied().collect();
        tracing::debug!(owned = owned.len(), indexed = indexed.len(), "listed");

        let dropped = self.app.queue.maybe_remove_missing(&owned_set);
        if dropped > 0 {
            tracing::info!(dropped, "dropped repositories no longer owned");
        }

        // Cleanup observes the owned set exactly as listed this cycle; it
        // runs concurrently with the configuration fetch and is awaited
        // before the cycle ends.
        let cleanup = tokio::spawn(run_cleanup(self.app.clone(), owned_set.clone()));

        let mut returned: HashSet<RepoId> = HashSet::new();
        let mut all_batches_ok = true;
        let mut next_fingerprint = None;
        for batch in owned.chunks(CONFIG_BATCH_SIZE) {
            match self
                .source
                .search_configuration(batch, self.fingerprint.as_ref())
                .await
            {
                Ok(result) => {
                    if result.fingerprint.is_some() {
                        next_fingerprint = result.fingerprint;
                    }
                    self.apply_items(result.items, &mut returned);
                }
                Err(err) => {
                    all_batches_ok = false;
                    metrics::counter!("config_fetch_errors_total").increment(1);
                    tracing::warn!(err = format!("{err:#}"), "configuration batch failed");
                }
            }
        }
        if all_batches_ok {
            if let Some(fingerprint) = next_fingerprint {
                self.fingerprint = Some(fingerprint);
            }
        }

        // Unchanged repositories still get re-validated, and ids the queue
        // has never seen get their options force-fetched without a
        // fingerprint.
        let unchanged: Vec<RepoId> = owned
            .iter()
            .copied()
            .filter(|id| !returned.contains(id))
            .collect();
        let unknown = self.app.queue.bump(&unchanged);
        if !unknown.is_empty() {
            tracing::info!(n = unknown.len(), "force-fetching options for unknown repositories");
            for batch in unknown.chunks(CONFIG_BATCH_SIZE) {
                match self.source.search_configuration(batch, None).await {
                    Ok(result) => self.apply_items(result.items, &mut returned),
                    Err(err) => {
                        metrics::counter!("config_fetch_errors_total").increment(1);
                        tracing::warn!(err = format!("{err:#}"), "force-fetch batch failed");
                    }
                }
            }
        }

        if let Err(err) = self.write_public_snapshot() {
            tracing::warn!(%err, "failed to write public repository snapshot");
        }

        cleanup.await.expect("cleanup task does not panic")?;
        Ok(())
    }

    fn apply_items(&self, items: Vec<ConfigItem>, returned: &mut HashSet<RepoId>) {
        for item in items {
            match item {
                ConfigItem::Options(opts) => {
                    returned.insert(opts.repo_id);
                    self.app.queue.add_or_update(*opts);
                }
                ConfigItem::Error { repo_id, error } => {
                    metrics::counter!("config_repo_errors_total").increment(1);
                    tracing::warn!(%repo_id, error, "per-repository configuration error");
                }
            }
        }
    }

    /// Sorted names of the public repositories currently known, rewritten
    /// atomically for external tooling.
    fn write_public_snapshot(&self) -> std::io::Result<()> {
        let mut names = Vec::new();
        self.app.queue.iterate(|entry| {
            if entry.opts.public {
                names.push(entry.opts.name.clone());
            }
        });
        names.sort();
        names.dedup();
        let mut body = names.join("\n");
        body.push('\n');
        shardset::write_atomic(&self.app.shards.public_file(), body.as_bytes())
    }
}

async fn run_cleanup(app: Arc<App>, owned: HashSet<RepoId>) -> anyhow::Result<()> {
    let _guard = app.dir_lock.clone().lock_owned().await;
    let started = Instant::now();

    let result = tokio::task::spawn_blocking(move || {
        shardset::cleanup::run(
            &app.shards,
            &owned,
            SystemTime::now(),
            &app.cleanup_cfg,
            &app.journal,
        )
    })
    .await
    .expect("cleanup does not panic");

    metrics::histogram!("cleanup_duration_seconds").record(started.elapsed().as_secs_f64());
    result
}

/// Uniform jitter in `(d/2, 3d/2)` so a fleet of daemons spreads its load
/// on the source of truth.
fn jitter(d: Duration) -> Duration {
    d.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}
