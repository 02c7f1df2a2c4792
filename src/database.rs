//! Example persistence.
//!
//! Minimal failing buffers survive between runs in an [`ExampleDatabase`].
//! The runner saves final minima under a test's primary key and every
//! accepted shrink under a derived secondary key, so an interrupted shrink
//! can resume from its best-so-far on the next run.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot write to database directory: {0}")]
    PermissionDenied(String),
}

/// Identifies the stored examples for one test. Derived by hashing the test
/// name so arbitrary names map to fixed-width filesystem-safe keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseKey {
    digest: [u8; 16],
}

impl DatabaseKey {
    pub fn from_test_name(name: &str) -> Self {
        let hash = Sha256::digest(name.as_bytes());
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hash[..16]);
        DatabaseKey { digest }
    }

    /// The key under which in-progress shrinks are stored.
    pub fn secondary(&self) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&self.digest);
        hasher.update(b"secondary");
        let hash = hasher.finalize();
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hash[..16]);
        DatabaseKey { digest }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Storage for example buffers, keyed by test. All operations are idempotent:
/// saving an existing value or deleting a missing one is not an error.
pub trait ExampleDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()>;

    /// All values stored under `key`, in unspecified order.
    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>>;

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()>;

    fn move_value(
        &mut self,
        src: &DatabaseKey,
        dst: &DatabaseKey,
        value: &[u8],
    ) -> DatabaseResult<()> {
        self.delete(src, value)?;
        self.save(dst, value)
    }
}

/// Process-local database, mostly useful for tests and nested runners.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    entries: HashMap<DatabaseKey, HashSet<Vec<u8>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_count(&self, key: &DatabaseKey) -> usize {
        self.entries.get(key).map_or(0, |set| set.len())
    }
}

impl ExampleDatabase for InMemoryDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        self.entries
            .entry(key.clone())
            .or_insert_with(HashSet::new)
            .insert(value.to_vec());
        Ok(())
    }

    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>> {
        Ok(self
            .entries
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        if let Some(set) = self.entries.get_mut(key) {
            set.remove(value);
            if set.is_empty() {
                self.entries.remove(key);
            }
        }
        Ok(())
    }
}

/// One directory per key, one file per value. Files are named by the hex of
/// the value hash so saves are naturally idempotent, and written atomically
/// via a temporary file and rename.
#[derive(Debug)]
pub struct DirectoryDatabase {
    base_path: PathBuf,
}

impl DirectoryDatabase {
    pub fn new<P: AsRef<Path>>(base_path: P) -> DatabaseResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }
        let probe = base_path.join(".write_test");
        File::create(&probe)
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    DatabaseError::PermissionDenied(base_path.display().to_string())
                }
                _ => DatabaseError::Io(e),
            })?;
        Ok(DirectoryDatabase { base_path })
    }

    fn key_dir(&self, key: &DatabaseKey) -> PathBuf {
        self.base_path.join(key.to_hex())
    }

    fn value_path(&self, key: &DatabaseKey, value: &[u8]) -> PathBuf {
        let value_hash = Sha256::digest(value);
        self.key_dir(key)
            .join(format!("{}.example", hex::encode(&value_hash[..16])))
    }

    fn atomic_write(&self, path: &Path, data: &[u8]) -> DatabaseResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(File::create(&temp_path)?);
            file.write_all(data)?;
            file.flush()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl ExampleDatabase for DirectoryDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        self.atomic_write(&self.value_path(key, value), value)
    }

    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>> {
        let dir = self.key_dir(key);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut values = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "example") {
                // A concurrent delete between readdir and read is fine.
                if let Ok(data) = fs::read(&path) {
                    values.push(data);
                }
            }
        }
        Ok(values)
    }

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let path = self.value_path(key, value);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        let a = DatabaseKey::from_test_name("test_a");
        let b = DatabaseKey::from_test_name("test_b");
        assert_eq!(a, DatabaseKey::from_test_name("test_a"));
        assert_ne!(a, b);
        assert_ne!(a, a.secondary());
        assert_eq!(a.secondary(), a.secondary());
    }

    #[test]
    fn in_memory_round_trip() {
        let mut db = InMemoryDatabase::new();
        let key = DatabaseKey::from_test_name("t");
        db.save(&key, &[1, 2, 3]).unwrap();
        db.save(&key, &[1, 2, 3]).unwrap();
        db.save(&key, &[4]).unwrap();
        let mut values = db.fetch(&key).unwrap();
        values.sort();
        assert_eq!(values, vec![vec![1, 2, 3], vec![4]]);
        db.delete(&key, &[1, 2, 3]).unwrap();
        assert_eq!(db.fetch(&key).unwrap(), vec![vec![4]]);
        db.delete(&key, &[9]).unwrap();
    }

    #[test]
    fn move_value_changes_keys() {
        let mut db = InMemoryDatabase::new();
        let src = DatabaseKey::from_test_name("t");
        let dst = src.secondary();
        db.save(&src, &[5]).unwrap();
        db.move_value(&src, &dst, &[5]).unwrap();
        assert!(db.fetch(&src).unwrap().is_empty());
        assert_eq!(db.fetch(&dst).unwrap(), vec![vec![5]]);
    }

    #[test]
    fn directory_database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DirectoryDatabase::new(dir.path()).unwrap();
        let key = DatabaseKey::from_test_name("t");
        db.save(&key, &[1, 2]).unwrap();
        db.save(&key, &[1, 2]).unwrap();
        db.save(&key, &[3]).unwrap();
        let mut values = db.fetch(&key).unwrap();
        values.sort();
        assert_eq!(values, vec![vec![1, 2], vec![3]]);
        db.delete(&key, &[1, 2]).unwrap();
        db.delete(&key, &[1, 2]).unwrap();
        assert_eq!(db.fetch(&key).unwrap(), vec![vec![3]]);
    }

    #[test]
    fn directory_database_fetch_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = DirectoryDatabase::new(dir.path()).unwrap();
        let key = DatabaseKey::from_test_name("absent");
        assert!(db.fetch(&key).unwrap().is_empty());
    }
}
