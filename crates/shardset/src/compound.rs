//! Planning for compound-shard maintenance.
//!
//! Everything here is pure: candidate selection and greedy packing for the
//! merge pass, and the per-shard vacuum decision. Driving the merger
//! subprocess and deleting inputs is the daemon's job.

use crate::meta::{self, RepoEntry, ShardMeta};
use crate::{ShardDir, ShardFile};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

#[derive(Clone, Debug)]
pub struct MergePolicy {
    /// Cut a group once its summed size exceeds this.
    pub target_size: u64,
    /// Repositories with commits younger than this churn too much to be
    /// worth compounding yet.
    pub min_age: Duration,
    /// Repositories above this priority stay in their own shards.
    pub max_priority: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            target_size: 2 << 30,
            min_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_priority: 100.0,
        }
    }
}

/// A simple shard eligible for merging.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub file: ShardFile,
    pub repo: RepoEntry,
}

/// Enumerate merge candidates: simple single-file shards whose repository
/// is neither hot nor high-priority. Compound shards are never candidates,
/// so a merge can never produce a compound of compounds.
pub fn candidates(
    dir: &ShardDir,
    now: SystemTime,
    policy: &MergePolicy,
) -> anyhow::Result<Vec<Candidate>> {
    let shards = dir.list_shards()?;

    // Shards with 00001+ companions are excluded wholesale.
    let mut set_sizes: HashMap<String, u32> = HashMap::new();
    for file in &shards {
        if let Some((prefix, _)) = file.set_position() {
            *set_sizes.entry(prefix.to_string()).or_default() += 1;
        }
    }

    let mut out = Vec::new();
    for file in shards {
        if file.is_compound() {
            continue;
        }
        let Some((prefix, number)) = file.set_position() else {
            continue;
        };
        if number != 0 || set_sizes.get(prefix).copied().unwrap_or(0) > 1 {
            continue;
        }
        let shard_meta = match meta::read(&file.path) {
            Ok(m) => m,
            Err(err) => {
                tracing::debug!(shard = %file.base_name(), %err, "skipping unreadable merge candidate");
                continue;
            }
        };
        // A simple shard holds exactly one repository.
        let [repo] = shard_meta.repos.as_slice() else {
            continue;
        };
        let last_commit = SystemTime::UNIX_EPOCH
            + Duration::from_secs(repo.latest_commit_unix.max(0) as u64);
        if now
            .duration_since(last_commit)
            .map(|age| age < policy.min_age)
            .unwrap_or(true)
        {
            continue;
        }
        if repo.priority > policy.max_priority {
            continue;
        }
        out.push(Candidate {
            file,
            repo: repo.clone(),
        });
    }
    Ok(out)
}

/// Greedy packing: accumulate candidates in order until the summed size
/// first exceeds the target, then cut a group. The tail that never exceeds
/// the target is left alone.
pub fn pack(candidates: Vec<Candidate>, target_size: u64) -> (Vec<Vec<Candidate>>, Vec<Candidate>) {
    let mut groups = Vec::new();
    let mut current: Vec<Candidate> = Vec::new();
    let mut sum = 0u64;

    for candidate in candidates {
        sum += candidate.file.len;
        current.push(candidate);
        if sum > target_size {
            groups.push(std::mem::take(&mut current));
            sum = 0;
        }
    }
    (groups, current)
}

/// Name of the compound shard produced from a group of inputs, derived from
/// the member basenames so retries are stable.
pub fn compound_file_name(inputs: &[&ShardFile]) -> String {
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    for input in inputs {
        hasher.update(input.base_name().as_bytes());
        hasher.update(b"\0");
    }
    format!(
        "{}{:016x}_v{}.00000{}",
        crate::COMPOUND_PREFIX,
        hasher.digest(),
        crate::FORMAT_VERSION,
        crate::SHARD_SUFFIX,
    )
}

/// What the vacuum pass should do with one compound shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VacuumAction {
    /// Shrunk below the minimum: explode back into simple shards.
    Explode,
    /// Holds tombstoned repositories: re-merge with itself to strip them.
    Rewrite,
    Keep,
}

pub fn vacuum_action(file: &ShardFile, shard_meta: &ShardMeta, min_size: u64) -> VacuumAction {
    if file.len < min_size {
        VacuumAction::Explode
    } else if shard_meta.has_tombstones() {
        VacuumAction::Rewrite
    } else {
        VacuumAction::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entry, write_shard};
    use std::path::Path;

    fn candidate(name: &str, len: u64) -> Candidate {
        Candidate {
            file: ShardFile {
                path: Path::new("/idx").join(crate::shard_file_name(name, 0)),
                len,
                mtime: SystemTime::UNIX_EPOCH,
            },
            repo: entry(1, name),
        }
    }

    #[test]
    fn packing_cuts_once_target_is_exceeded() {
        // 3 KiB + 3 KiB + 2 KiB at target 6 KiB: all three pack into one
        // group, nothing remains simple.
        let cands = vec![
            candidate("a", 3 << 10),
            candidate("b", 3 << 10),
            candidate("c", 2 << 10),
        ];
        let (groups, tail) = pack(cands, 6 << 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
        assert!(tail.is_empty());

        // At target 4 KiB the first two exceed it and the third is left as
        // the residual simple shard.
        let cands = vec![
            candidate("a", 3 << 10),
            candidate("b", 3 << 10),
            candidate("c", 2 << 10),
        ];
        let (groups, tail) = pack(cands, 4 << 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].repo.name, "c");
    }

    #[test]
    fn candidates_exclude_compounds_hot_and_high_priority() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = crate::ShardDir::create(tmp.path()).unwrap();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100 * 24 * 60 * 60);
        let cold = 10 * 24 * 60 * 60; // well past min_age
        let policy = MergePolicy {
            target_size: 1 << 20,
            ..Default::default()
        };

        let mut ok = entry(1, "ok");
        ok.latest_commit_unix = (100 * 24 * 60 * 60 - cold) as i64;
        write_shard(tmp.path(), "ok", 0, vec![ok.clone()]);

        // Compound shards are never inputs.
        write_shard(tmp.path(), "compound-x", 0, vec![ok.clone()]);

        // A multi-file set is excluded.
        write_shard(tmp.path(), "big", 0, vec![ok.clone()]);
        write_shard(tmp.path(), "big", 1, vec![ok.clone()]);

        // Recent commits exclude a shard.
        let mut hot = entry(2, "hot");
        hot.latest_commit_unix = (100 * 24 * 60 * 60) as i64;
        write_shard(tmp.path(), "hot", 0, vec![hot]);

        // High priority excludes a shard.
        let mut vip = entry(3, "vip");
        vip.latest_commit_unix = ok.latest_commit_unix;
        vip.priority = 500.0;
        write_shard(tmp.path(), "vip", 0, vec![vip]);

        let cands = candidates(&dir, now, &policy).unwrap();
        let names: Vec<&str> = cands.iter().map(|c| c.repo.name.as_str()).collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[test]
    fn vacuum_classifies_by_size_then_tombstones() {
        let file = ShardFile {
            path: Path::new("/idx/compound-a_v16.00000.zoekt").into(),
            len: 100,
            mtime: SystemTime::UNIX_EPOCH,
        };
        let mut shard_meta = ShardMeta::default();
        shard_meta.repos.push(entry(1, "r"));

        assert_eq!(
            vacuum_action(&file, &shard_meta, 1000),
            VacuumAction::Explode
        );
        assert_eq!(vacuum_action(&file, &shard_meta, 10), VacuumAction::Keep);

        shard_meta.repos[0].tombstone = true;
        assert_eq!(vacuum_action(&file, &shard_meta, 10), VacuumAction::Rewrite);
    }

    #[test]
    fn compound_names_are_stable() {
        let a = ShardFile {
            path: Path::new("/idx/a_v16.00000.zoekt").into(),
            len: 0,
            mtime: SystemTime::UNIX_EPOCH,
        };
        let b = ShardFile {
            path: Path::new("/idx/b_v16.00000.zoekt").into(),
            len: 0,
            mtime: SystemTime::UNIX_EPOCH,
        };
        let one = compound_file_name(&[&a, &b]);
        let two = compound_file_name(&[&a, &b]);
        assert_eq!(one, two);
        assert!(one.starts_with(crate::COMPOUND_PREFIX));
        assert_ne!(one, compound_file_name(&[&b, &a]));
    }
}
