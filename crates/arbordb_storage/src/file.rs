//! CBOR snapshot persistence for the file-backed store.

use crate::error::{StorageError, StorageResult};
use crate::memory::StoreState;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    state: StoreState,
}

/// A snapshot file holding the whole published state.
///
/// Saves write a sibling temp file, sync it and rename it over the
/// snapshot, so a crash leaves either the old or the new state.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, or `None` if the file does not exist yet.
    pub(crate) fn load(&self) -> StorageResult<Option<StoreState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let snapshot: Snapshot =
            ciborium::de::from_reader(reader).map_err(|e| StorageError::Codec(e.to_string()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            )));
        }

        Ok(Some(snapshot.state))
    }

    /// Serializes `state` into snapshot bytes.
    pub(crate) fn encode(state: &StoreState) -> StorageResult<Vec<u8>> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            state,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&snapshot, &mut bytes)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Replaces the snapshot with `bytes`. Blocks on file I/O.
    pub(crate) fn write(&self, bytes: &[u8]) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(bytes)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    state: &'a StoreState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectRecord, Oid, Tid};
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("store.cbor"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested").join("store.cbor"));

        let mut state = StoreState::bootstrap();
        state.last_tid = Tid::new(9);
        file.write(&SnapshotFile::encode(&state).unwrap()).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.last_tid, Tid::new(9));
        assert_eq!(loaded.objects.get(&Oid::ROOT), Some(&ObjectRecord::root()));
        assert!(!file.path().with_extension("tmp").exists());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.cbor");
        std::fs::write(&path, b"not cbor at all").unwrap();

        let result = SnapshotFile::new(path).load();
        assert!(matches!(result, Err(StorageError::Codec(_))));
    }
}
