//! Durable key/value cells backing the token store
//!
//! The browser deployment of Kangaroo persists its token in `localStorage`.
//! This module provides the equivalent seam for native clients: a small
//! async key/value contract with an in-memory implementation for tests and
//! short-lived processes, and a file-backed implementation for sharing a
//! session across restarts or between processes on the same filesystem.

use std::{collections::HashMap, error};

use async_trait::async_trait;
use tokio::sync::RwLock;

#[cfg(feature = "file")]
pub use file::FileStorage;

/// The boxed error produced by storage implementations
pub type StorageError = Box<dyn error::Error + Send + Sync + 'static>;

/// A durable key/value medium holding serialized values under string keys
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Reads the raw value stored under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes `value` under `key`, replacing any prior value
    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes the value stored under `key`
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// An in-memory key/value store
#[derive(Default, Debug)]
pub struct MemoryStorage {
    cells: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Constructs a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.cells.read().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.cells
            .write()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.cells.write().await.remove(key);
        Ok(())
    }
}

#[cfg(feature = "file")]
mod file {
    use std::{io, path::PathBuf};

    use async_trait::async_trait;
    use tokio::fs::OpenOptions;

    use super::{KeyValueStorage, StorageError};

    /// A key/value store keeping one file per key in a directory
    #[derive(Debug)]
    pub struct FileStorage {
        dir: PathBuf,
    }

    impl FileStorage {
        /// Constructs a store rooted at the given directory
        ///
        /// The directory must already exist.
        pub fn new(dir: PathBuf) -> Self {
            Self { dir }
        }

        fn cell_path(&self, key: &str) -> PathBuf {
            self.dir.join(key)
        }

        async fn read_cell(&self, key: &str) -> Result<Option<String>, io::Error> {
            use tokio::io::AsyncReadExt;

            let mut file = match OpenOptions::new().read(true).open(self.cell_path(key)).await {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err),
            };
            let mut data = String::new();
            file.read_to_string(&mut data).await?;
            Ok(Some(data))
        }

        async fn write_cell(&self, key: &str, value: &str) -> Result<(), io::Error> {
            use tokio::io::AsyncWriteExt;

            let mut file_opts = OpenOptions::new();

            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            file_opts.mode(0o600);

            let mut file = file_opts.open(self.cell_path(key)).await?;
            file.write_all(value.as_bytes()).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStorage for FileStorage {
        async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
            Ok(self.read_cell(key).await?)
        }

        async fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
            Ok(self.write_cell(key, value).await?)
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            match tokio::fs::remove_file(self.cell_path(key)).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        }
    }
}
