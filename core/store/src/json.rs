//! Key-value style backend persisting the whole snapshot as one JSON document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use shelfsync_common::{Error, Result};

use crate::backend::StoreBackend;
use crate::snapshot::{Snapshot, WriteBatch};

/// JSON file backend.
///
/// Every commit rewrites the document through a temporary file that is then
/// renamed over the original, so readers see either the old or the new
/// snapshot, never a torn write.
pub struct JsonFileBackend {
    /// Path of the snapshot document.
    path: PathBuf,
}

impl JsonFileBackend {
    /// Open (or prepare) a snapshot file.
    ///
    /// Creates the parent directory if needed. The file itself is created on
    /// the first commit.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StoreBackend for JsonFileBackend {
    fn name(&self) -> &str {
        "json"
    }

    fn load(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            return Ok(Snapshot::default());
        }
        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!(
                "Corrupt snapshot {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn commit(&self, _batch: &WriteBatch, state: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();

        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!(
            "Wrote snapshot {} ({} bytes)",
            self.path.display(),
            json.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OperationKind, PendingOperation};
    use crate::record::Record;
    use shelfsync_common::{FieldMap, RecordId};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let backend = JsonFileBackend::open(temp.path().join("store.json")).unwrap();
        assert_eq!(backend.load().unwrap(), Snapshot::default());
    }

    #[test]
    fn test_persistence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("store.json");

        let record = Record::new_local(FieldMap::new());
        let op = PendingOperation::new(
            record.id.clone(),
            OperationKind::Create { fields: FieldMap::new() },
            0,
        );
        let state = Snapshot::from_parts(
            vec![record.clone()],
            vec![op],
            vec![(RecordId::new_temporary(), RecordId::permanent("3"))],
            1,
        );

        // Write
        {
            let backend = JsonFileBackend::open(&path).unwrap();
            backend.commit(&WriteBatch::default(), &state).unwrap();
        }

        // Reload and verify
        {
            let backend = JsonFileBackend::open(&path).unwrap();
            let loaded = backend.load().unwrap();
            assert_eq!(loaded, state);
            assert!(loaded.operation_for(&record.id).is_some());
        }

        assert!(!temp.path().join("nested").join("store.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();

        let backend = JsonFileBackend::open(&path).unwrap();
        assert!(matches!(backend.load(), Err(Error::Storage(_))));
    }
}
