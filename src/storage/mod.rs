//! The storage area: a content-addressed blob store.
//!
//! Blobs are keyed by an opaque UUID and tagged with the logical role of the
//! content. The index never stores file content itself, only references into
//! this store; consistency between the two is the ingestion pipeline's
//! responsibility.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{VaultError, VaultResult};

/// Logical role of a stored blob. Values at or above 1024 are available to
/// user-registered content types (`UserContentType` configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileContentKind {
    Dicom,
    DicomAsJson,
    User(i64),
}

impl FileContentKind {
    pub fn to_db(self) -> i64 {
        match self {
            FileContentKind::Dicom => 1,
            FileContentKind::DicomAsJson => 2,
            FileContentKind::User(value) => value,
        }
    }

    pub fn from_db(value: i64) -> VaultResult<Self> {
        match value {
            1 => Ok(FileContentKind::Dicom),
            2 => Ok(FileContentKind::DicomAsJson),
            v if v >= 1024 => Ok(FileContentKind::User(v)),
            v => Err(VaultError::ParameterOutOfRange {
                message: format!("unknown content kind {}", v),
            }),
        }
    }
}

/// Abstraction over the blob store. The default is [`FilesystemStorage`];
/// a plugin may substitute its own implementation.
pub trait StorageArea: Send + Sync {
    /// Store a blob. Write-once: a given `(uuid, kind)` is never rewritten.
    fn create(&self, uuid: &str, content: &[u8], kind: FileContentKind) -> VaultResult<()>;

    /// Read back the exact bytes previously written for `uuid`.
    fn read(&self, uuid: &str, kind: FileContentKind) -> VaultResult<Vec<u8>>;

    /// Remove a blob. Removing an unknown UUID is not an error.
    fn remove(&self, uuid: &str, kind: FileContentKind) -> VaultResult<()>;

    /// Enumerate every UUID present in the store, for the startup sweep of
    /// blobs left orphaned by a crash between commit and removal. Stores
    /// that cannot enumerate return an empty list and skip the sweep.
    fn list_all_uuids(&self) -> VaultResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Blob store over a local directory, sharded two levels deep so that no
/// single directory accumulates millions of entries.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: &Path) -> VaultResult<Self> {
        std::fs::create_dir_all(root).map_err(|_| VaultError::CannotWriteFile {
            path: root.display().to_string(),
        })?;
        info!("Storage directory: {}", root.display());
        Ok(FilesystemStorage {
            root: root.to_path_buf(),
        })
    }

    fn path_of(&self, uuid: &str) -> VaultResult<PathBuf> {
        if uuid.len() < 4 || uuid.contains(['/', '\\', '.']) {
            return Err(VaultError::ParameterOutOfRange {
                message: format!("invalid storage uuid \"{}\"", uuid),
            });
        }
        Ok(self.root.join(&uuid[0..2]).join(&uuid[2..4]).join(uuid))
    }
}

impl StorageArea for FilesystemStorage {
    fn create(&self, uuid: &str, content: &[u8], _kind: FileContentKind) -> VaultResult<()> {
        let path = self.path_of(uuid)?;

        if path.exists() {
            // write-once: the same uuid is never assigned twice
            return Err(VaultError::CannotWriteFile {
                path: path.display().to_string(),
            });
        }

        let parent = path.parent().expect("sharded path has a parent");
        std::fs::create_dir_all(parent).map_err(|_| VaultError::CannotWriteFile {
            path: parent.display().to_string(),
        })?;
        std::fs::write(&path, content).map_err(|e| match e.kind() {
            std::io::ErrorKind::StorageFull => VaultError::FullStorage,
            _ => VaultError::CannotWriteFile {
                path: path.display().to_string(),
            },
        })?;

        debug!("Created attachment {} ({} bytes)", uuid, content.len());
        Ok(())
    }

    fn read(&self, uuid: &str, _kind: FileContentKind) -> VaultResult<Vec<u8>> {
        let path = self.path_of(uuid)?;
        std::fs::read(&path).map_err(|_| VaultError::InexistentFile {
            path: path.display().to_string(),
        })
    }

    fn remove(&self, uuid: &str, _kind: FileContentKind) -> VaultResult<()> {
        let path = self.path_of(uuid)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed attachment {}", uuid);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::Internal {
                message: format!("cannot remove {}: {}", path.display(), e),
            }),
        }
    }

    fn list_all_uuids(&self) -> VaultResult<Vec<String>> {
        let mut uuids = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| VaultError::Internal {
                message: format!("cannot walk storage directory: {}", e),
            })?;
            if entry.file_type().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    uuids.push(name.to_string());
                }
            }
        }
        Ok(uuids)
    }
}

/// Decorator applied when `StoreDicom` is disabled: DICOM blobs are silently
/// dropped on write and reported as unknown on read, while derived content
/// (JSON summaries, user attachments) still reaches the wrapped store.
pub struct DicomlessStorage {
    inner: Arc<dyn StorageArea>,
}

impl DicomlessStorage {
    pub fn new(inner: Arc<dyn StorageArea>) -> Self {
        DicomlessStorage { inner }
    }
}

impl StorageArea for DicomlessStorage {
    fn create(&self, uuid: &str, content: &[u8], kind: FileContentKind) -> VaultResult<()> {
        match kind {
            FileContentKind::Dicom => Ok(()),
            _ => self.inner.create(uuid, content, kind),
        }
    }

    fn read(&self, uuid: &str, kind: FileContentKind) -> VaultResult<Vec<u8>> {
        match kind {
            FileContentKind::Dicom => Err(VaultError::UnknownResource {
                what: format!("DICOM file {} (StoreDicom is disabled)", uuid),
            }),
            _ => self.inner.read(uuid, kind),
        }
    }

    fn remove(&self, uuid: &str, kind: FileContentKind) -> VaultResult<()> {
        match kind {
            FileContentKind::Dicom => Ok(()),
            _ => self.inner.remove(uuid, kind),
        }
    }

    fn list_all_uuids(&self) -> VaultResult<Vec<String>> {
        self.inner.list_all_uuids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fresh() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn round_trip() {
        let (_dir, storage) = fresh();
        let uuid = Uuid::new_v4().to_string();
        let content = b"\x02\x00\x00\x00raw dicom bytes".to_vec();

        storage.create(&uuid, &content, FileContentKind::Dicom).unwrap();
        assert_eq!(storage.read(&uuid, FileContentKind::Dicom).unwrap(), content);
    }

    #[test]
    fn create_is_write_once() {
        let (_dir, storage) = fresh();
        let uuid = Uuid::new_v4().to_string();
        storage.create(&uuid, b"a", FileContentKind::Dicom).unwrap();
        assert!(matches!(
            storage.create(&uuid, b"b", FileContentKind::Dicom),
            Err(VaultError::CannotWriteFile { .. })
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, storage) = fresh();
        let uuid = Uuid::new_v4().to_string();
        storage.create(&uuid, b"a", FileContentKind::Dicom).unwrap();
        storage.remove(&uuid, FileContentKind::Dicom).unwrap();
        storage.remove(&uuid, FileContentKind::Dicom).unwrap();
        assert!(matches!(
            storage.read(&uuid, FileContentKind::Dicom),
            Err(VaultError::InexistentFile { .. })
        ));
    }

    #[test]
    fn listing_sees_sharded_blobs() {
        let (_dir, storage) = fresh();
        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();
        storage.create(&a, b"a", FileContentKind::Dicom).unwrap();
        storage.create(&b, b"b", FileContentKind::DicomAsJson).unwrap();

        let mut listed = storage.list_all_uuids().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn dicomless_storage_drops_dicom_only() {
        let (_dir, storage) = fresh();
        let storage = DicomlessStorage::new(Arc::new(storage));
        let uuid = Uuid::new_v4().to_string();

        storage.create(&uuid, b"dicom", FileContentKind::Dicom).unwrap();
        assert!(matches!(
            storage.read(&uuid, FileContentKind::Dicom),
            Err(VaultError::UnknownResource { .. })
        ));

        let json = Uuid::new_v4().to_string();
        storage.create(&json, b"{}", FileContentKind::DicomAsJson).unwrap();
        assert_eq!(storage.read(&json, FileContentKind::DicomAsJson).unwrap(), b"{}".to_vec());
    }
}
