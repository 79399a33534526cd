//! A durable, per-data-directory record of the first-dirty-offset of
//! every partition that lives in that directory.
//!
//! The file is named `cleaner-offset-checkpoint` and is rewritten
//! atomically: write to a `.tmp` sibling, then `fs::rename` over the real
//! path, so a crash mid-write never leaves a torn checkpoint on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CleanerError, Result};
use crate::log::PartitionId;

const CHECKPOINT_FILE_NAME: &str = "cleaner-offset-checkpoint";
const VERSION: u32 = 0;

/// One `cleaner-offset-checkpoint` file for a single data directory.
/// All reads/writes to it are serialized through an internal lock, so
/// concurrent workers touching different partitions in the same directory
/// never race on the file.
pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<PartitionId, u64>>,
}

impl CheckpointStore {
    /// Opens (or initializes, if absent) the checkpoint file under
    /// `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CHECKPOINT_FILE_NAME);
        let entries = Self::read_file(&path)?;
        Ok(CheckpointStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn read_file(path: &Path) -> Result<BTreeMap<PartitionId, u64>> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(CleanerError::Io(e)),
        };
        let reader = io::BufReader::new(file);
        let mut lines = reader.lines();

        let version: u32 = lines
            .next()
            .ok_or_else(|| malformed(path, "missing version line"))??
            .trim()
            .parse()
            .map_err(|_| malformed(path, "unparsable version line"))?;
        if version != VERSION {
            return Err(malformed(path, "unsupported checkpoint version"));
        }

        let count: usize = lines
            .next()
            .ok_or_else(|| malformed(path, "missing count line"))??
            .trim()
            .parse()
            .map_err(|_| malformed(path, "unparsable count line"))?;

        let mut map = BTreeMap::new();
        for _ in 0..count {
            let line = lines
                .next()
                .ok_or_else(|| malformed(path, "truncated entry list"))??;
            let mut parts = line.trim().splitn(3, ' ');
            let topic = parts
                .next()
                .ok_or_else(|| malformed(path, "missing topic"))?;
            let partition: u32 = parts
                .next()
                .ok_or_else(|| malformed(path, "missing partition"))?
                .parse()
                .map_err(|_| malformed(path, "unparsable partition"))?;
            let offset: u64 = parts
                .next()
                .ok_or_else(|| malformed(path, "missing offset"))?
                .parse()
                .map_err(|_| malformed(path, "unparsable offset"))?;
            map.insert(PartitionId::new(topic, partition), offset);
        }
        Ok(map)
    }

    /// Returns the first-dirty-offset recorded for `partition`, if any.
    pub fn get(&self, partition: &PartitionId) -> Option<u64> {
        self.entries.lock().unwrap().get(partition).copied()
    }

    /// Returns a snapshot of every entry in this directory's checkpoint.
    pub fn snapshot(&self) -> BTreeMap<PartitionId, u64> {
        self.entries.lock().unwrap().clone()
    }

    /// Overlays `(partition -> offset)` onto the current checkpoint and
    /// atomically rewrites the file. Checkpoint values never decrease for a
    /// given partition: a write with a smaller
    /// offset than what's on record is ignored.
    pub fn update(&self, partition: PartitionId, offset: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let advances = entries.get(&partition).map_or(true, |&cur| offset > cur);
        if advances {
            entries.insert(partition, offset);
            self.write_locked(&entries)?;
        }
        Ok(())
    }

    fn write_locked(&self, entries: &BTreeMap<PartitionId, u64>) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp_path)?;
            writeln!(f, "{}", VERSION)?;
            writeln!(f, "{}", entries.len())?;
            for (partition, offset) in entries.iter() {
                writeln!(f, "{} {} {}", partition.topic, partition.partition, offset)?;
            }
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn malformed(path: &Path, why: &str) -> CleanerError {
    CleanerError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed checkpoint file {}: {}", path.display(), why),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty_mapping() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn update_then_reopen_round_trips() {
        let dir = TempDir::new().unwrap();
        let p = PartitionId::new("orders", 0);
        {
            let store = CheckpointStore::open(dir.path()).unwrap();
            store.update(p.clone(), 100).unwrap();
        }
        let reopened = CheckpointStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&p), Some(100));
    }

    #[test]
    fn checkpoint_never_goes_backwards() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let p = PartitionId::new("orders", 0);
        store.update(p.clone(), 100).unwrap();
        store.update(p.clone(), 50).unwrap();
        assert_eq!(store.get(&p), Some(100));
    }

    #[test]
    fn malformed_file_is_an_error_not_silently_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CHECKPOINT_FILE_NAME), "not a version\n").unwrap();
        assert!(CheckpointStore::open(dir.path()).is_err());
    }

    #[test]
    fn no_tmp_file_left_behind_after_update() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.update(PartitionId::new("t", 0), 1).unwrap();
        assert!(!dir.path().join(format!("{}.tmp", CHECKPOINT_FILE_NAME)).exists());
    }
}
