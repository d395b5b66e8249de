//! Reconciliation of the shard directory against the owned repository set.
//!
//! Cleanup is a pure pass over the directory listing plus the owned set and
//! an injected wall-clock time; it keeps no background state. The caller
//! holds the directory lock for the duration of a run.

use crate::journal::Journal;
use crate::meta;
use crate::scan::{self, ShardEntry};
use crate::{ShardDir, ShardFile};
use models::RepoId;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Clone, Debug)]
pub struct CleanupConfig {
    /// How long a shard may sit in the trash before it is deleted for good.
    pub trash_max_age: Duration,
    /// Whether repositories held inside compound shards are tombstoned in
    /// place rather than evicted with the whole shard. Read once at startup
    /// and stable for the process lifetime.
    pub tombstone_compounds: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            trash_max_age: Duration::from_secs(24 * 60 * 60),
            tombstone_compounds: false,
        }
    }
}

/// One reconciliation pass. Rules apply in a fixed order; every rule leaves
/// the directory in a state the next rule (and the next run) can classify
/// again, which is what makes the pass idempotent.
#[tracing::instrument(skip_all, fields(dir = ?dir.root(), owned = owned.len()))]
pub fn run(
    dir: &ShardDir,
    owned: &HashSet<RepoId>,
    now: SystemTime,
    cfg: &CleanupConfig,
    journal: &Journal,
) -> anyhow::Result<()> {
    let mut cls = scan::classify(dir, cfg.tombstone_compounds)?;

    // Trashed shards past the age limit, or conflicting with a live shard
    // for the same repository, are deleted outright.
    let trash_ids: Vec<RepoId> = cls.trash.keys().copied().collect();
    for id in trash_ids {
        let expired = cls.trash[&id]
            .iter()
            .any(|e| age(now, e.file.mtime) > cfg.trash_max_age);
        let conflict = cls.index.contains_key(&id);
        if expired || conflict {
            let entries = cls.trash.remove(&id).expect("id was just enumerated");
            delete_entries(&entries, journal);
        }
    }
    for file in &cls.trash_unreadable {
        // No sidecar to date them by repo; age out on mtime alone.
        if age(now, file.mtime) > cfg.trash_max_age {
            delete_file(&file.path, file.len, journal, "-", RepoId::new(0));
        } else if file.mtime > now {
            touch(&file.path, now);
        }
    }

    // Eviction times in the future would defer deletion indefinitely.
    for entries in cls.trash.values() {
        for e in entries {
            if e.file.mtime > now {
                touch(&e.file.path, now);
            }
        }
    }

    // A live or trashed copy supersedes a tombstoned one.
    cls.tombstoned
        .retain(|id, _| !cls.index.contains_key(id) && !cls.trash.contains_key(id));

    // A repository present in more than one live shard set, or under
    // inconsistent names (a rename), is inconsistent: drop every occurrence
    // and let re-indexing recreate it.
    let index_ids: Vec<RepoId> = cls.index.keys().copied().collect();
    for id in index_ids {
        let entries = &cls.index[&id];
        let prefixes: HashSet<&str> = entries.iter().map(|e| set_prefix(&e.file)).collect();
        let names: HashSet<&str> = entries.iter().map(|e| e.entry.name.as_str()).collect();
        if prefixes.len() > 1 || names.len() > 1 {
            tracing::warn!(
                %id,
                shards = ?entries.iter().map(|e| e.file.base_name().to_string()).collect::<Vec<_>>(),
                "repository is inconsistent on disk, dropping all occurrences"
            );
            let entries = cls.index.remove(&id).expect("id was just enumerated");
            delete_or_tombstone(&entries, cfg, journal);
        }
    }

    // Owned repositories waiting in the trash come back.
    let restore_ids: Vec<RepoId> = cls
        .trash
        .keys()
        .filter(|id| owned.contains(id))
        .copied()
        .collect();
    for id in restore_ids {
        let entries = cls.trash.remove(&id).expect("id was just enumerated");
        move_set(&entries, dir.root(), now, journal, "restore");
    }

    // Owned repositories surviving only as tombstones come back in place.
    for (id, holder) in &cls.tombstoned {
        if !owned.contains(id) {
            continue;
        }
        match meta::set_tombstone(&holder.file.path, *id, false) {
            Ok(()) => journal.record(
                "untombstone",
                &holder.file.path,
                holder.file.len,
                &holder.entry.name,
                *id,
            ),
            Err(err) => {
                tracing::warn!(%id, %err, "failed to clear tombstone");
            }
        }
    }

    // Live repositories no longer owned are evicted: tombstoned in place
    // when they live inside a compound shard and tombstoning is on, moved
    // to the trash otherwise.
    for (id, entries) in &cls.index {
        if owned.contains(id) {
            continue;
        }
        if cfg.tombstone_compounds && entries.iter().all(|e| e.file.is_compound()) {
            for e in entries {
                match meta::set_tombstone(&e.file.path, *id, true) {
                    Ok(()) => {
                        journal.record("tombstone", &e.file.path, e.file.len, &e.entry.name, *id)
                    }
                    Err(err) => {
                        tracing::warn!(%id, %err, "failed to tombstone");
                    }
                }
            }
        } else {
            move_set(entries, &dir.trash_dir(), now, journal, "trash");
        }
    }

    // Crash residue: companions without their witness, and shards whose
    // sidecar cannot be read (those go through the trash so an operator has
    // the recovery window).
    for file in &cls.orphaned {
        delete_file(&file.path, file.len, journal, "-", RepoId::new(0));
    }
    for file in &cls.unreadable {
        let dest = dir.trash_dir().join(file.base_name());
        match std::fs::rename(&file.path, &dest) {
            Ok(()) => {
                touch(&dest, now);
                journal.record("trash", &file.path, file.len, "-", RepoId::new(0));
            }
            Err(err) => {
                tracing::warn!(shard = %file.base_name(), %err, "failed to trash unreadable shard");
            }
        }
    }

    sweep_residue(dir)?;
    Ok(())
}

/// Deletion order for a set of shard paths: descending, so the `00000`
/// existence witness is always the last file to disappear.
pub fn deletion_order(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort();
    paths.dedup();
    paths.reverse();
    paths
}

fn age(now: SystemTime, mtime: SystemTime) -> Duration {
    now.duration_since(mtime).unwrap_or(Duration::ZERO)
}

fn set_prefix(file: &ShardFile) -> &str {
    file.set_position()
        .map(|(prefix, _)| prefix)
        .unwrap_or_else(|| file.base_name())
}

fn touch(path: &Path, now: SystemTime) {
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(now));
    if let Err(err) = result {
        tracing::warn!(?path, %err, "failed to reset mtime");
    }
}

fn delete_file(path: &Path, len: u64, journal: &Journal, repo_name: &str, id: RepoId) {
    for victim in [path.to_path_buf(), meta::sidecar_path(path)] {
        if let Err(err) = std::fs::remove_file(&victim) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = ?victim, %err, "failed to delete shard file");
            }
        }
    }
    journal.record("delete", path, len, repo_name, id);
}

fn delete_entries(entries: &[ShardEntry], journal: &Journal) {
    for path in deletion_order(entries.iter().map(|e| e.file.path.clone()).collect()) {
        let e = entries
            .iter()
            .find(|e| e.file.path == path)
            .expect("path came from entries");
        delete_file(&path, e.file.len, journal, &e.entry.name, e.entry.id);
    }
}

fn delete_or_tombstone(entries: &[ShardEntry], cfg: &CleanupConfig, journal: &Journal) {
    let mut doomed = Vec::new();
    for e in entries {
        if cfg.tombstone_compounds && e.file.is_compound() {
            match meta::set_tombstone(&e.file.path, e.entry.id, true) {
                Ok(()) => {
                    journal.record(
                        "tombstone",
                        &e.file.path,
                        e.file.len,
                        &e.entry.name,
                        e.entry.id,
                    );
                }
                Err(err) => {
                    tracing::warn!(id = %e.entry.id, %err, "failed to tombstone, deleting instead");
                    doomed.push(e.clone());
                }
            }
        } else {
            doomed.push(e.clone());
        }
    }
    delete_entries(&doomed, journal);
}

/// Move every file of a repository's shard set into `dest_dir`, touching
/// mtimes as we go. Files move in deletion order so a crash never leaves the
/// witness without its companions at the source.
///
/// On any IO error the partial move is unwound: files that reached the
/// destination are deleted, and the repository's remaining source files are
/// deleted too, so no half-visible state survives. The repository re-indexes
/// on the next cycle.
fn move_set(
    entries: &[ShardEntry],
    dest_dir: &Path,
    now: SystemTime,
    journal: &Journal,
    action: &str,
) {
    let paths = deletion_order(entries.iter().map(|e| e.file.path.clone()).collect());
    let mut arrived: Vec<PathBuf> = Vec::new();

    for (i, src) in paths.iter().enumerate() {
        let entry = entries
            .iter()
            .find(|e| &e.file.path == src)
            .expect("path came from entries");
        let dest = dest_dir.join(entry.file.base_name());

        if let Err(err) = std::fs::rename(src, &dest) {
            tracing::warn!(?src, ?dest, %err, "shard move failed, unwinding");
            for reached in &arrived {
                delete_file(reached, 0, journal, &entry.entry.name, entry.entry.id);
            }
            for remaining in &paths[i..] {
                delete_file(remaining, 0, journal, &entry.entry.name, entry.entry.id);
            }
            return;
        }
        // Sidecar follows its shard; a missing sidecar is fine.
        match std::fs::rename(meta::sidecar_path(src), meta::sidecar_path(&dest)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(?src, %err, "failed to move sidecar"),
        }
        touch(&dest, now);
        journal.record(action, &dest, entry.file.len, &entry.entry.name, entry.entry.id);
        arrived.push(dest);
    }
}

/// Remove sidecars whose shard no longer exists, and `*.tmp` residue of
/// crashed builder runs. The directory lock held by the caller guarantees no
/// live builder is producing tmp files concurrently.
fn sweep_residue(dir: &ShardDir) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir.root())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let stale_meta = name
            .strip_suffix(".meta")
            .map(|base| !dir.root().join(base).exists())
            .unwrap_or(false);
        if stale_meta || name.ends_with(".tmp") {
            tracing::debug!(file = name, "sweeping residue");
            if let Err(err) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = name, %err, "failed to sweep residue");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entry, write_shard};
    use crate::ShardDir;
    use pretty_assertions::assert_eq;

    fn owned(ids: &[u32]) -> HashSet<RepoId> {
        ids.iter().copied().map(RepoId::new).collect()
    }

    fn shard_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(crate::SHARD_SUFFIX))
            .collect();
        names.sort();
        names
    }

    fn journal_for(dir: &ShardDir) -> Journal {
        Journal::new(dir.shard_log())
    }

    #[test]
    fn unowned_shards_move_to_trash_and_owned_stay() {
        // Owned = {foo, bar}; index contains {foo, baz}; trash empty.
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();
        write_shard(tmp.path(), "foo", 0, vec![entry(1, "foo")]);
        write_shard(tmp.path(), "baz", 0, vec![entry(3, "baz")]);

        let now = SystemTime::now();
        run(
            &dir,
            &owned(&[1, 2]),
            now,
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();

        assert_eq!(shard_names(dir.root()), vec!["foo_v16.00000.zoekt"]);
        assert_eq!(shard_names(&dir.trash_dir()), vec!["baz_v16.00000.zoekt"]);

        // Eviction time is stamped so the 24 h window starts now.
        let mtime = std::fs::metadata(dir.trash_dir().join("baz_v16.00000.zoekt"))
            .unwrap()
            .modified()
            .unwrap();
        assert!(now.duration_since(mtime).unwrap_or_default() < Duration::from_secs(60));
    }

    #[test]
    fn expired_trash_is_deleted_even_when_owned() {
        // Owned = {foo}; trash contains foo and bar, both evicted 25 h ago.
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();
        let now = SystemTime::now();
        let old = now - Duration::from_secs(25 * 60 * 60);

        for (base, id) in [("foo", 1), ("bar", 2)] {
            let path = write_shard(&dir.trash_dir(), base, 0, vec![entry(id, base)]);
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(old)
                .unwrap();
        }

        run(
            &dir,
            &owned(&[1]),
            now,
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();

        assert!(shard_names(dir.root()).is_empty());
        assert!(shard_names(&dir.trash_dir()).is_empty());
    }

    #[test]
    fn owned_trash_within_window_round_trips_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();
        let now = SystemTime::now();

        write_shard(tmp.path(), "foo", 0, vec![entry(1, "foo")]);
        write_shard(tmp.path(), "foo", 1, vec![entry(1, "foo")]);
        let payload = std::fs::read(tmp.path().join("foo_v16.00000.zoekt")).unwrap();

        // Evict: drop ownership.
        run(
            &dir,
            &owned(&[]),
            now,
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();
        assert!(shard_names(dir.root()).is_empty());
        assert_eq!(shard_names(&dir.trash_dir()).len(), 2);

        // Re-own within the window: both files come back under their old
        // basenames with contents unchanged.
        run(
            &dir,
            &owned(&[1]),
            now + Duration::from_secs(3600),
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();
        assert_eq!(
            shard_names(dir.root()),
            vec!["foo_v16.00000.zoekt", "foo_v16.00001.zoekt"]
        );
        assert!(shard_names(&dir.trash_dir()).is_empty());
        assert_eq!(
            std::fs::read(tmp.path().join("foo_v16.00000.zoekt")).unwrap(),
            payload
        );
    }

    #[test]
    fn cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();
        let now = SystemTime::now();

        write_shard(tmp.path(), "keep", 0, vec![entry(1, "keep")]);
        write_shard(tmp.path(), "evict", 0, vec![entry(2, "evict")]);
        write_shard(&dir.trash_dir(), "back", 0, vec![entry(3, "back")]);

        let cfg = CleanupConfig::default();
        let journal = journal_for(&dir);
        run(&dir, &owned(&[1, 3]), now, &cfg, &journal).unwrap();
        let after_first = (shard_names(dir.root()), shard_names(&dir.trash_dir()));

        run(&dir, &owned(&[1, 3]), now, &cfg, &journal).unwrap();
        let after_second = (shard_names(dir.root()), shard_names(&dir.trash_dir()));

        assert_eq!(after_first, after_second);
        assert_eq!(
            after_first.0,
            vec!["back_v16.00000.zoekt", "keep_v16.00000.zoekt"]
        );
        assert_eq!(after_first.1, vec!["evict_v16.00000.zoekt"]);
    }

    #[test]
    fn deletion_order_removes_witness_last() {
        let paths = vec![
            PathBuf::from("/idx/r_v16.00000.zoekt"),
            PathBuf::from("/idx/r_v16.00002.zoekt"),
            PathBuf::from("/idx/r_v16.00001.zoekt"),
        ];
        let ordered = deletion_order(paths);
        assert_eq!(
            ordered,
            vec![
                PathBuf::from("/idx/r_v16.00002.zoekt"),
                PathBuf::from("/idx/r_v16.00001.zoekt"),
                PathBuf::from("/idx/r_v16.00000.zoekt"),
            ]
        );
    }

    #[test]
    fn duplicate_live_copies_are_dropped() {
        // The same repository in two distinct shard sets is inconsistent;
        // both copies go away and re-indexing recreates one.
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        write_shard(tmp.path(), "old-name", 0, vec![entry(9, "old-name")]);
        write_shard(tmp.path(), "new-name", 0, vec![entry(9, "new-name")]);

        run(
            &dir,
            &owned(&[9]),
            SystemTime::now(),
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();

        assert!(shard_names(dir.root()).is_empty());
        assert!(shard_names(&dir.trash_dir()).is_empty());
    }

    #[test]
    fn tombstones_written_and_cleared_in_compounds() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();
        let cfg = CleanupConfig {
            tombstone_compounds: true,
            ..Default::default()
        };
        let journal = journal_for(&dir);

        let compound = write_shard(
            tmp.path(),
            "compound-ab",
            0,
            vec![entry(1, "r1"), entry(2, "r2")],
        );

        // r2 loses ownership: tombstoned in place, not trashed.
        run(&dir, &owned(&[1]), SystemTime::now(), &cfg, &journal).unwrap();
        let m = meta::read(&compound).unwrap();
        assert!(!m.repo(RepoId::new(1)).unwrap().tombstone);
        assert!(m.repo(RepoId::new(2)).unwrap().tombstone);
        assert!(shard_names(&dir.trash_dir()).is_empty());

        // r2 comes back: un-tombstoned in the holding compound.
        run(&dir, &owned(&[1, 2]), SystemTime::now(), &cfg, &journal).unwrap();
        let m = meta::read(&compound).unwrap();
        assert!(!m.repo(RepoId::new(2)).unwrap().tombstone);
    }

    #[test]
    fn live_copy_wins_over_tombstoned_copies() {
        // C1 holds {r1, r2} both tombstoned (older build); C2 holds
        // {r1 tombstoned, r2 live} (newer build). Owned = {r1, r2}.
        // r2 is served from C2; r1 has no live copy and re-indexes.
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        let mut r1_old = entry(1, "r1");
        r1_old.tombstone = true;
        r1_old.latest_commit_unix = 100;
        let mut r2_old = entry(2, "r2");
        r2_old.tombstone = true;
        r2_old.latest_commit_unix = 100;
        let c1 = write_shard(tmp.path(), "compound-c1", 0, vec![r1_old, r2_old]);

        let mut r1_new = entry(1, "r1");
        r1_new.tombstone = true;
        r1_new.latest_commit_unix = 200;
        let mut r2_new = entry(2, "r2");
        r2_new.latest_commit_unix = 200;
        let c2 = write_shard(tmp.path(), "compound-c2", 0, vec![r1_new, r2_new]);

        run(
            &dir,
            &owned(&[1, 2]),
            SystemTime::now(),
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();

        // r2's live copy in C2 is untouched; its tombstoned copy in C1 is
        // ignored rather than resurrected.
        let m2 = meta::read(&c2).unwrap();
        assert!(!m2.repo(RepoId::new(2)).unwrap().tombstone);
        let m1 = meta::read(&c1).unwrap();
        assert!(m1.repo(RepoId::new(2)).unwrap().tombstone);

        // r1 stays tombstoned everywhere: no live copy exists, so the queue
        // will rebuild it.
        assert!(m1.repo(RepoId::new(1)).unwrap().tombstone);
        assert!(m2.repo(RepoId::new(1)).unwrap().tombstone);
        assert!(crate::scan::indexed_ids(&dir)
            .unwrap()
            .iter()
            .all(|id| *id != RepoId::new(1)));
    }

    #[test]
    fn future_trash_mtimes_are_reset() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();
        let now = SystemTime::now();

        let path = write_shard(&dir.trash_dir(), "skewed", 0, vec![entry(5, "skewed")]);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(now + Duration::from_secs(7 * 24 * 60 * 60))
            .unwrap();

        run(
            &dir,
            &owned(&[]),
            now,
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(mtime <= now + Duration::from_secs(60));
    }

    #[test]
    fn residue_is_swept() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        write_shard(tmp.path(), "live", 0, vec![entry(1, "live")]);
        std::fs::write(tmp.path().join("ghost_v16.00000.zoekt.meta"), b"{}").unwrap();
        std::fs::write(tmp.path().join("builder-scratch.tmp"), b"x").unwrap();
        // A companion without its witness is crash residue too.
        write_shard(tmp.path(), "headless", 1, vec![entry(2, "headless")]);

        run(
            &dir,
            &owned(&[1, 2]),
            SystemTime::now(),
            &CleanupConfig::default(),
            &journal_for(&dir),
        )
        .unwrap();

        assert!(!tmp.path().join("ghost_v16.00000.zoekt.meta").exists());
        assert!(!tmp.path().join("builder-scratch.tmp").exists());
        assert!(!tmp.path().join("headless_v16.00001.zoekt").exists());
        assert!(tmp.path().join("live_v16.00000.zoekt").exists());
        assert!(tmp.path().join("live_v16.00000.zoekt.meta").exists());
    }
}
