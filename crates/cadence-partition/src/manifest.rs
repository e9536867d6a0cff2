//! The `partition.json` manifest written next to each partition's root
//! record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PartitionError;

/// File name of the manifest inside a partition directory.
pub const MANIFEST_FILE: &str = "partition.json";

const MANIFEST_TEMP_FILE: &str = "partition.json.tmp";

/// Where a partition sits in its split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    /// Zero-based index of this partition.
    pub index: usize,
    /// Total number of partitions in the split.
    pub count: usize,
    /// Child directory names of the source root, in registration order.
    pub children_order: Vec<String>,
}

impl PartitionManifest {
    /// Child directory names assigned to this partition (round-robin over
    /// `children_order`).
    pub fn assigned(&self) -> Vec<String> {
        self.children_order
            .iter()
            .enumerate()
            .filter(|(position, _)| position.checked_rem(self.count) == Some(self.index))
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Read the manifest in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Manifest`] if the file is missing or
    /// malformed and [`PartitionError::Io`] if it cannot be read.
    pub fn read(dir: &Path) -> Result<Self, PartitionError> {
        let path = manifest_path(dir);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PartitionError::manifest(dir, "no manifest found"));
            }
            Err(err) => return Err(PartitionError::io(path, err)),
        };
        let manifest: Self = serde_json::from_slice(&bytes)
            .map_err(|err| PartitionError::manifest(dir, err.to_string()))?;
        if manifest.index >= manifest.count {
            return Err(PartitionError::manifest(
                dir,
                format!(
                    "index {} out of range for {} partitions",
                    manifest.index, manifest.count
                ),
            ));
        }
        Ok(manifest)
    }

    /// Write the manifest into `dir`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Io`] on filesystem failure.
    pub fn write(&self, dir: &Path) -> Result<(), PartitionError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| PartitionError::manifest(dir, err.to_string()))?;
        let temp = dir.join(MANIFEST_TEMP_FILE);
        fs::write(&temp, bytes).map_err(|err| PartitionError::io(&temp, err))?;
        let path = manifest_path(dir);
        if let Err(err) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(PartitionError::io(path, err));
        }
        Ok(())
    }
}

/// Path of the manifest inside `dir`.
pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn manifest(index: usize, count: usize) -> PartitionManifest {
        PartitionManifest {
            index,
            count,
            children_order: ["a", "b", "c", "d", "e"].map(String::from).to_vec(),
        }
    }

    #[test]
    fn assignment_is_round_robin() {
        assert_eq!(manifest(0, 2).assigned(), vec!["a", "c", "e"]);
        assert_eq!(manifest(1, 2).assigned(), vec!["b", "d"]);
        assert_eq!(manifest(2, 3).assigned(), vec!["c"]);
    }

    #[test]
    fn write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        manifest(1, 3).write(tmp.path()).unwrap();
        assert_eq!(PartitionManifest::read(tmp.path()).unwrap(), manifest(1, 3));
        assert!(!tmp.path().join(MANIFEST_TEMP_FILE).exists());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        manifest(3, 3).write(tmp.path()).unwrap();
        assert!(matches!(
            PartitionManifest::read(tmp.path()),
            Err(PartitionError::Manifest { .. })
        ));
    }

    #[test]
    fn missing_manifest_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            PartitionManifest::read(tmp.path()),
            Err(PartitionError::Manifest { .. })
        ));
    }
}
