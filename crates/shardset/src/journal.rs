//! The shard-action journal: one TSV row per shard move, restore, delete,
//! tombstone, or compaction, size-rotated in place. The journal is an audit
//! aid; failures to append are logged and never fail the action itself.

use models::RepoId;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_SIZE: u64 = 100 << 20;
pub const DEFAULT_BACKUPS: u32 = 5;

#[derive(Clone, Debug)]
pub struct Journal {
    path: PathBuf,
    max_size: u64,
    backups: u32,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(path, DEFAULT_MAX_SIZE, DEFAULT_BACKUPS)
    }

    pub fn with_limits(path: impl Into<PathBuf>, max_size: u64, backups: u32) -> Self {
        Self {
            path: path.into(),
            max_size,
            backups,
        }
    }

    /// Append one action row: UTC timestamp, action tag, shard basename,
    /// shard size in bytes, repository name, repository id.
    pub fn record(&self, action: &str, shard: &Path, size: u64, repo_name: &str, id: RepoId) {
        if let Err(err) = self.append(action, shard, size, repo_name, id) {
            tracing::warn!(%err, action, shard = ?shard, "failed to append to shard journal");
        }
    }

    fn append(
        &self,
        action: &str,
        shard: &Path,
        size: u64,
        repo_name: &str,
        id: RepoId,
    ) -> std::io::Result<()> {
        self.rotate_if_needed()?;

        let base = shard
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stamp = humantime::format_rfc3339_seconds(std::time::SystemTime::now());
        let row = format!("{stamp}\t{action}\t{base}\t{size}\t{repo_name}\t{id}\n");

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(row.as_bytes())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let len = match std::fs::metadata(&self.path) {
            Ok(md) => md.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if len < self.max_size {
            return Ok(());
        }

        // Shift `log.N` towards `log.{backups}`, dropping the oldest.
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        if self.backups > 0 {
            std::fs::rename(&self.path, self.backup_path(1))?;
        } else {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_tab_separated() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = Journal::new(tmp.path().join("log.tsv"));
        journal.record(
            "trash",
            Path::new("/idx/foo_v16.00000.zoekt"),
            1234,
            "github.com/example/foo",
            RepoId::new(42),
        );

        let contents = std::fs::read_to_string(tmp.path().join("log.tsv")).unwrap();
        let fields: Vec<&str> = contents.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[1], "trash");
        assert_eq!(fields[2], "foo_v16.00000.zoekt");
        assert_eq!(fields[3], "1234");
        assert_eq!(fields[4], "github.com/example/foo");
        assert_eq!(fields[5], "42");
    }

    #[test]
    fn rotation_keeps_bounded_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.tsv");
        let journal = Journal::with_limits(&path, 1, 2);

        for i in 0..5 {
            journal.record("delete", Path::new("s.zoekt"), i, "r", RepoId::new(1));
        }

        assert!(path.exists());
        assert!(tmp.path().join("log.tsv.1").exists());
        assert!(tmp.path().join("log.tsv.2").exists());
        assert!(!tmp.path().join("log.tsv.3").exists());
    }
}
