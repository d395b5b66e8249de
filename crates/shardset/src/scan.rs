//! Classification of the shard directory: which repositories live where.
//!
//! Shard enumeration treats the `00000` file of a set as the existence
//! witness. Numbered companions without their witness are crash residue and
//! are surfaced separately so cleanup can remove them.

use crate::meta::{self, RepoEntry};
use crate::{ShardDir, ShardFile};
use models::{IndexOptions, RepoId};
use std::collections::{HashMap, HashSet};

/// One repository's presence inside one shard file.
#[derive(Clone, Debug)]
pub struct ShardEntry {
    pub file: ShardFile,
    pub entry: RepoEntry,
}

/// The classified view of the shard directory and its trash.
#[derive(Debug, Default)]
pub struct Classified {
    /// Live (non-tombstoned) occupancy of the index directory.
    pub index: HashMap<RepoId, Vec<ShardEntry>>,
    /// Live occupancy of the trash.
    pub trash: HashMap<RepoId, Vec<ShardEntry>>,
    /// Tombstoned entries in compound shards; at most one holder per id,
    /// the one with the most recent latest-commit timestamp.
    pub tombstoned: HashMap<RepoId, ShardEntry>,
    /// Shards whose sidecar is missing or unparseable.
    pub unreadable: Vec<ShardFile>,
    /// Trashed shards whose sidecar is missing or unparseable.
    pub trash_unreadable: Vec<ShardFile>,
    /// Numbered shard files whose `00000` witness is missing.
    pub orphaned: Vec<ShardFile>,
}

/// Classify the index directory and its trash. Tombstoned entries are only
/// collected when compound tombstoning is in use.
pub fn classify(dir: &ShardDir, tombstones: bool) -> anyhow::Result<Classified> {
    let mut out = Classified::default();

    let (witnessed, orphaned) = witness_filter(dir.list_shards()?);
    out.orphaned = orphaned;

    for file in witnessed {
        let shard_meta = match meta::read(&file.path) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(shard = %file.base_name(), %err, "unreadable shard metadata");
                out.unreadable.push(file);
                continue;
            }
        };
        for entry in shard_meta.repos {
            let shard_entry = ShardEntry {
                file: file.clone(),
                entry,
            };
            if shard_entry.entry.tombstone {
                if !tombstones {
                    continue;
                }
                match out.tombstoned.entry(shard_entry.entry.id) {
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(shard_entry);
                    }
                    std::collections::hash_map::Entry::Occupied(mut slot) => {
                        if shard_entry.entry.latest_commit_unix > slot.get().entry.latest_commit_unix
                        {
                            slot.insert(shard_entry);
                        }
                    }
                }
            } else {
                out.index
                    .entry(shard_entry.entry.id)
                    .or_default()
                    .push(shard_entry);
            }
        }
    }

    // Trash holds whole shard sets by basename; witness filtering applies
    // there too, but orphans in trash simply age out with the rest.
    for file in dir.list_trash()? {
        let shard_meta = match meta::read(&file.path) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(shard = %file.base_name(), %err, "unreadable trashed shard metadata");
                out.trash_unreadable.push(file);
                continue;
            }
        };
        for entry in shard_meta.repos {
            if entry.tombstone {
                continue;
            }
            out.trash.entry(entry.id).or_default().push(ShardEntry {
                file: file.clone(),
                entry,
            });
        }
    }

    Ok(out)
}

/// Ids of repositories with a live shard in the index directory. This is the
/// "currently indexed" set reported to the source of truth.
pub fn indexed_ids(dir: &ShardDir) -> anyhow::Result<Vec<RepoId>> {
    let cls = classify(dir, false)?;
    let mut ids: Vec<RepoId> = cls.index.into_keys().collect();
    ids.sort();
    Ok(ids)
}

/// Partition shard files into witnessed sets and orphans. A set is
/// witnessed when its `00000` member exists; companions of unwitnessed sets
/// are orphans. Files with unparseable names are orphans as well.
fn witness_filter(files: Vec<ShardFile>) -> (Vec<ShardFile>, Vec<ShardFile>) {
    let witnesses: HashSet<String> = files
        .iter()
        .filter_map(|f| f.set_position())
        .filter(|(_, n)| *n == 0)
        .map(|(prefix, _)| prefix.to_string())
        .collect();

    let mut witnessed = Vec::new();
    let mut orphaned = Vec::new();
    for file in files {
        let has_witness = file
            .set_position()
            .map(|(prefix, _)| witnesses.contains(prefix))
            .unwrap_or(false);
        if has_witness {
            witnessed.push(file);
        } else {
            orphaned.push(file);
        }
    }
    (witnessed, orphaned)
}

/// The prior state of a repository's shards, consulted before building.
#[derive(Debug, Default)]
pub struct Existing {
    /// All live shard files holding the repository, sorted by path.
    pub files: Vec<ShardFile>,
    /// The repository's entry from the lowest-numbered shard's sidecar.
    pub entry: Option<RepoEntry>,
    /// Whether any sidecar was unreadable.
    pub corrupt: bool,
}

/// Locate the live shards of one repository.
pub fn existing_for_repo(dir: &ShardDir, id: RepoId) -> anyhow::Result<Existing> {
    let (witnessed, _) = witness_filter(dir.list_shards()?);

    let mut out = Existing::default();
    for file in witnessed {
        match meta::read(&file.path) {
            Ok(m) => match m.repo(id) {
                Some(entry) if !entry.tombstone => {
                    if out.entry.is_none() {
                        out.entry = Some(entry.clone());
                    }
                    out.files.push(file);
                }
                _ => {}
            },
            Err(_) => out.corrupt = true,
        }
    }
    Ok(out)
}

/// Comparison of existing shards against desired options, deciding how much
/// of a build is needed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareState {
    /// Shards already reflect the options.
    Equal,
    /// Only metadata differs; sidecars can be rewritten in place.
    MetaOnly,
    /// Shard content is out of date; a full (or delta) build is required.
    ContentDiffers,
    /// Metadata is unreadable; force a full build.
    Corrupt,
}

pub fn compare(existing: &Existing, opts: &IndexOptions) -> CompareState {
    if existing.corrupt {
        return CompareState::Corrupt;
    }
    let Some(entry) = &existing.entry else {
        return CompareState::ContentDiffers;
    };
    if !entry.content_matches(opts) {
        return CompareState::ContentDiffers;
    }
    if entry.matches(opts) {
        CompareState::Equal
    } else {
        CompareState::MetaOnly
    }
}

/// Rewrite the metadata-only fields of every live shard of `opts.repo_id`.
pub fn rewrite_metadata(existing: &Existing, opts: &IndexOptions) -> Result<(), meta::MetaError> {
    for file in &existing.files {
        let mut shard_meta = meta::read(&file.path)?;
        for entry in shard_meta.repos.iter_mut().filter(|r| r.id == opts.repo_id) {
            entry.apply_metadata(opts);
        }
        meta::write(&file.path, &shard_meta)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entry, write_shard};
    use models::Branch;

    #[test]
    fn classify_separates_live_trash_and_tombstoned() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        write_shard(tmp.path(), "foo", 0, vec![entry(1, "foo")]);
        let mut dead = entry(2, "bar");
        dead.tombstone = true;
        write_shard(tmp.path(), "compound-aa", 0, vec![dead, entry(3, "baz")]);
        write_shard(&dir.trash_dir(), "gone", 0, vec![entry(4, "gone")]);

        let cls = classify(&dir, true).unwrap();
        assert_eq!(cls.index.len(), 2);
        assert!(cls.index.contains_key(&RepoId::new(1)));
        assert!(cls.index.contains_key(&RepoId::new(3)));
        assert!(cls.tombstoned.contains_key(&RepoId::new(2)));
        assert!(cls.trash.contains_key(&RepoId::new(4)));

        // With tombstoning off the tombstoned map is not built.
        let cls = classify(&dir, false).unwrap();
        assert!(cls.tombstoned.is_empty());

        let ids = indexed_ids(&dir).unwrap();
        assert_eq!(ids, vec![RepoId::new(1), RepoId::new(3)]);
    }

    #[test]
    fn tombstoned_dedup_keeps_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        let mut older = entry(7, "r");
        older.tombstone = true;
        older.latest_commit_unix = 100;
        write_shard(tmp.path(), "compound-old", 0, vec![older]);

        let mut newer = entry(7, "r");
        newer.tombstone = true;
        newer.latest_commit_unix = 200;
        write_shard(tmp.path(), "compound-new", 0, vec![newer]);

        let cls = classify(&dir, true).unwrap();
        let holder = &cls.tombstoned[&RepoId::new(7)];
        assert_eq!(holder.entry.latest_commit_unix, 200);
        assert!(holder.file.base_name().starts_with("compound-new"));
    }

    #[test]
    fn companions_without_witness_are_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        write_shard(tmp.path(), "whole", 0, vec![entry(1, "whole")]);
        write_shard(tmp.path(), "whole", 1, vec![entry(1, "whole")]);
        write_shard(tmp.path(), "partial", 1, vec![entry(2, "partial")]);

        let cls = classify(&dir, false).unwrap();
        assert_eq!(cls.index[&RepoId::new(1)].len(), 2);
        assert!(!cls.index.contains_key(&RepoId::new(2)));
        assert_eq!(cls.orphaned.len(), 1);
        assert!(cls.orphaned[0].base_name().starts_with("partial"));
    }

    #[test]
    fn compare_tracks_build_requirements() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        let opts = IndexOptions {
            repo_id: RepoId::new(5),
            name: "r".to_string(),
            branches: vec![Branch::new("main", "abc")],
            ..Default::default()
        };
        let existing = existing_for_repo(&dir, opts.repo_id).unwrap();
        assert_eq!(compare(&existing, &opts), CompareState::ContentDiffers);

        write_shard(
            tmp.path(),
            "r",
            0,
            vec![crate::meta::RepoEntry::from_options(&opts, 0)],
        );
        let existing = existing_for_repo(&dir, opts.repo_id).unwrap();
        assert_eq!(compare(&existing, &opts), CompareState::Equal);

        let mut rescored = opts.clone();
        rescored.priority = 5.0;
        assert_eq!(compare(&existing, &rescored), CompareState::MetaOnly);

        rewrite_metadata(&existing, &rescored).unwrap();
        let existing = existing_for_repo(&dir, opts.repo_id).unwrap();
        assert_eq!(compare(&existing, &rescored), CompareState::Equal);

        let mut moved = rescored.clone();
        moved.branches = vec![Branch::new("main", "def")];
        assert_eq!(compare(&existing, &moved), CompareState::ContentDiffers);
    }
}
