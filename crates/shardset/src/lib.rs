//! The shard-directory library: filename scheme, metadata sidecars,
//! enumeration and classification, lifecycle reconciliation, compound-shard
//! planning, and the shard-action journal.
//!
//! All mutations publish through atomic rename so concurrent readers (the
//! search engine) never observe a partially written shard or sidecar.

pub mod cleanup;
pub mod compound;
pub mod journal;
pub mod meta;
pub mod scan;

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// File extension of shard files, including the dot.
pub const SHARD_SUFFIX: &str = ".zoekt";
/// Basename prefix identifying a compound shard.
pub const COMPOUND_PREFIX: &str = "compound-";
/// Subdirectory holding shards pending deletion.
pub const TRASH_DIR: &str = ".trash";
/// Scratch directory for builder temp checkouts, kept on the shard volume.
pub const SCRATCH_DIR: &str = ".indexserver.tmp";
/// Presence of this file halts the indexing worker and the sync tick.
pub const PAUSE_FILE: &str = "PAUSE";
/// Ownership marker recording the last hostname that claimed the directory.
pub const OWNER_FILE: &str = "owner.txt";
/// Sorted snapshot of the public-repo subset, for external tooling.
pub const PUBLIC_FILE: &str = "public.txt";
/// Rotated TSV journal of shard actions.
pub const SHARD_LOG_FILE: &str = "zoekt-indexserver-shard-log.tsv";
/// On-disk shard format version, embedded in shard filenames.
pub const FORMAT_VERSION: u32 = 16;

/// A shard directory rooted at a single flat path.
#[derive(Clone, Debug)]
pub struct ShardDir {
    root: PathBuf,
}

impl ShardDir {
    /// Open the shard directory, creating it and its `.trash/` and scratch
    /// subdirectories if needed.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = Self { root: root.into() };
        std::fs::create_dir_all(&dir.root)?;
        std::fs::create_dir_all(dir.trash_dir())?;
        std::fs::create_dir_all(dir.scratch_dir())?;
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }
    pub fn pause_file(&self) -> PathBuf {
        self.root.join(PAUSE_FILE)
    }
    pub fn owner_file(&self) -> PathBuf {
        self.root.join(OWNER_FILE)
    }
    pub fn public_file(&self) -> PathBuf {
        self.root.join(PUBLIC_FILE)
    }
    pub fn shard_log(&self) -> PathBuf {
        self.root.join(SHARD_LOG_FILE)
    }

    /// Returns the contents of the pause marker if one exists.
    pub fn paused(&self) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.pause_file()) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Enumerate shard files in the index directory, sorted by path.
    pub fn list_shards(&self) -> io::Result<Vec<ShardFile>> {
        list_shard_files(&self.root)
    }

    /// Enumerate shard files in the trash, sorted by path.
    pub fn list_trash(&self) -> io::Result<Vec<ShardFile>> {
        list_shard_files(&self.trash_dir())
    }
}

/// A shard file observed on disk.
#[derive(Clone, Debug)]
pub struct ShardFile {
    pub path: PathBuf,
    pub len: u64,
    pub mtime: SystemTime,
}

impl ShardFile {
    pub fn base_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn is_compound(&self) -> bool {
        self.base_name().starts_with(COMPOUND_PREFIX)
    }

    /// The shard-set prefix and numeric position of this file, parsed from
    /// `{prefix}.{NNNNN}.zoekt`. Returns None for malformed names.
    pub fn set_position(&self) -> Option<(&str, u32)> {
        split_shard_name(self.base_name())
    }
}

fn list_shard_files(dir: &Path) -> io::Result<Vec<ShardFile>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(SHARD_SUFFIX) {
            continue;
        }
        let md = entry.metadata()?;
        if !md.is_file() {
            continue;
        }
        out.push(ShardFile {
            path: entry.path(),
            len: md.len(),
            mtime: md.modified()?,
        });
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Filename of shard `number` of the named repository:
/// `{escaped_name}_v{FORMAT_VERSION}.{NNNNN}.zoekt`.
pub fn shard_file_name(repo_name: &str, number: u32) -> String {
    format!(
        "{}_v{}.{:05}{}",
        escape_repo_name(repo_name),
        FORMAT_VERSION,
        number,
        SHARD_SUFFIX,
    )
}

/// Repository names may contain path separators and other bytes that are not
/// filename-safe; escape everything outside a conservative set.
pub fn escape_repo_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(b as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

/// Split `{prefix}.{NNNNN}.zoekt` into the shard-set prefix and number.
pub fn split_shard_name(base: &str) -> Option<(&str, u32)> {
    let stem = base.strip_suffix(SHARD_SUFFIX)?;
    let (prefix, number) = stem.rsplit_once('.')?;
    if number.len() != 5 {
        return None;
    }
    let number = number.parse::<u32>().ok()?;
    Some((prefix, number))
}

/// Atomically replace `path` with `bytes`: write a temp file in the same
/// directory, then rename over the destination.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_round_trip() {
        let name = shard_file_name("github.com/example/repo", 0);
        assert_eq!(name, "github.com%2Fexample%2Frepo_v16.00000.zoekt");

        let (prefix, number) = split_shard_name(&name).unwrap();
        assert_eq!(prefix, "github.com%2Fexample%2Frepo_v16");
        assert_eq!(number, 0);

        assert!(split_shard_name("not-a-shard.meta").is_none());
        assert!(split_shard_name("missing-number.zoekt").is_none());
    }

    #[test]
    fn compound_names_are_recognized() {
        let file = ShardFile {
            path: PathBuf::from("/idx/compound-00af3c_v16.00000.zoekt"),
            len: 0,
            mtime: SystemTime::UNIX_EPOCH,
        };
        assert!(file.is_compound());
    }

    #[test]
    fn list_skips_non_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ShardDir::create(tmp.path()).unwrap();

        std::fs::write(tmp.path().join("a_v16.00000.zoekt"), b"shard").unwrap();
        std::fs::write(tmp.path().join("a_v16.00000.zoekt.meta"), b"{}").unwrap();
        std::fs::write(tmp.path().join("stray.tmp"), b"x").unwrap();

        let shards = dir.list_shards().unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].base_name(), "a_v16.00000.zoekt");
    }
}
