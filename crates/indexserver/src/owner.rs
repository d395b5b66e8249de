//! The ownership marker: `owner.txt` records the last hostname that claimed
//! the shard directory. This is a tripwire for two daemons accidentally
//! pointed at the same volume, not a mutex; a foreign hostname is logged and
//! the daemon proceeds.

use crate::App;
use anyhow::Context;
use shardset::ShardDir;
use std::sync::Arc;
use std::time::Duration;

const HEARTBEAT: Duration = Duration::from_secs(10 * 60);

/// Claim the directory now and then keep re-claiming it periodically.
pub async fn heartbeat(app: Arc<App>) -> anyhow::Result<()> {
    loop {
        if let Err(err) = claim(&app.shards, &app.cfg.hostname) {
            tracing::warn!(%err, "failed to write ownership marker");
        }
        tokio::time::sleep(HEARTBEAT).await;
    }
}

/// Write our hostname into the marker, warning if someone else held it.
/// Unreadable or corrupt contents are simply rewritten.
pub fn claim(shards: &ShardDir, hostname: &str) -> anyhow::Result<()> {
    let path = shards.owner_file();
    match std::fs::read_to_string(&path) {
        Ok(previous) => {
            let previous = previous.trim();
            if !previous.is_empty() && previous != hostname {
                tracing::warn!(
                    previous,
                    hostname,
                    "shard directory was last claimed by another host"
                );
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(%err, "ownership marker is unreadable, rewriting");
        }
    }

    shardset::write_atomic(&path, format!("{hostname}\n").as_bytes())
        .context("failed to write ownership marker")
}
