use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use proto::{InventoryVector, ObjectRecord, StreamId};
use tracing::warn;

use crate::errors::StorageError;

/// Index entry for an object held by a [`PersistentStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub inventory: InventoryVector,
    pub stream: StreamId,
    pub expires: i64,
}

impl From<&ObjectRecord> for ObjectMeta {
    fn from(object: &ObjectRecord) -> Self {
        Self {
            inventory: object.inventory(),
            stream: object.stream(),
            expires: object.expires(),
        }
    }
}

/// Cold tier behind the datastore's object cache.
pub trait PersistentStore: Send + Sync {
    fn get_object(&self, inventory: &InventoryVector) -> Result<Option<ObjectRecord>, StorageError>;
    fn put_object(&self, object: &ObjectRecord) -> Result<(), StorageError>;
    fn remove_objects(&self, inventory: &[InventoryVector]) -> Result<(), StorageError>;
    /// Everything currently stored, read once when the datastore opens.
    fn index(&self) -> Result<Vec<ObjectMeta>, StorageError>;
}

/// Volatile store for tests and nodes that keep nothing across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<InventoryVector, ObjectRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get_object(
        &self,
        inventory: &InventoryVector,
    ) -> Result<Option<ObjectRecord>, StorageError> {
        Ok(self.objects.read().get(inventory).cloned())
    }

    fn put_object(&self, object: &ObjectRecord) -> Result<(), StorageError> {
        self.objects
            .write()
            .insert(object.inventory(), object.clone());
        Ok(())
    }

    fn remove_objects(&self, inventory: &[InventoryVector]) -> Result<(), StorageError> {
        let mut objects = self.objects.write();
        for vector in inventory {
            objects.remove(vector);
        }
        Ok(())
    }

    fn index(&self) -> Result<Vec<ObjectMeta>, StorageError> {
        Ok(self.objects.read().values().map(ObjectMeta::from).collect())
    }
}

/// One file per object, named by the hex inventory vector.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, inventory: &InventoryVector) -> PathBuf {
        self.root.join(inventory.to_string())
    }
}

impl PersistentStore for FileStore {
    fn get_object(
        &self,
        inventory: &InventoryVector,
    ) -> Result<Option<ObjectRecord>, StorageError> {
        let bytes = match fs::read(self.path_for(inventory)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let object = ObjectRecord::from_bytes(bytes)?;
        if object.inventory() != *inventory {
            return Err(StorageError::Corrupted(
                format!("file {inventory} holds a different object").into(),
            ));
        }
        Ok(Some(object))
    }

    fn put_object(&self, object: &ObjectRecord) -> Result<(), StorageError> {
        let path = self.path_for(&object.inventory());
        let staging = path.with_extension("tmp");
        fs::write(&staging, object.as_bytes())?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    fn remove_objects(&self, inventory: &[InventoryVector]) -> Result<(), StorageError> {
        for vector in inventory {
            match fs::remove_file(self.path_for(vector)) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn index(&self) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some() {
                continue;
            }
            match fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|bytes| Ok(ObjectRecord::from_bytes(bytes)?))
            {
                Ok(object) => out.push(ObjectMeta::from(&object)),
                Err(err) => {
                    warn!(path = %path.display(), error = ?err, "skipping unreadable object file");
                }
            }
        }
        Ok(out)
    }
}
