// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Small named documents (Makejails, cloud-init snippets, scripts) stored on the entrypoint and
//! referenced by VM profiles.

use std::{io, path::PathBuf};

use crate::{jobs::model::validate_name, locks::LockTable};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("{0}")]
    InvalidKey(String),

    #[error("value is {size} bytes; the limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("metadata I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
    max_size: usize,
    locks: LockTable,
}

impl MetadataStore {
    pub fn new(dir: PathBuf, max_size: usize) -> Self {
        Self {
            dir,
            max_size,
            locks: LockTable::default(),
        }
    }

    fn path(&self, key: &str) -> Result<PathBuf, MetadataError> {
        validate_name("metadata key", key).map_err(MetadataError::InvalidKey)?;
        Ok(self.dir.join(key))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, MetadataError> {
        let path = self.path(key)?;
        let _guard = self.locks.lock(key).await;
        match tokio::fs::read_to_string(path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), MetadataError> {
        let path = self.path(key)?;
        if value.len() > self.max_size {
            return Err(MetadataError::TooLarge {
                size: value.len(),
                max: self.max_size,
            });
        }
        let _guard = self.locks.lock(key).await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Returns whether there was anything to delete.
    pub async fn delete(&self, key: &str) -> Result<bool, MetadataError> {
        let path = self.path(key)?;
        let _guard = self.locks.lock(key).await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("metadata"), 16);

        assert_eq!(store.get("makejail").await.unwrap(), None);
        store.set("makejail", "INCLUDE gh+x").await.unwrap();
        assert_eq!(
            store.get("makejail").await.unwrap().as_deref(),
            Some("INCLUDE gh+x")
        );
        assert!(store.delete("makejail").await.unwrap());
        assert!(!store.delete("makejail").await.unwrap());
    }

    #[tokio::test]
    async fn limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().to_path_buf(), 4);

        assert!(matches!(
            store.set("big", "12345").await,
            Err(MetadataError::TooLarge { size: 5, max: 4 })
        ));
        assert!(matches!(
            store.get("../passwd").await,
            Err(MetadataError::InvalidKey(_))
        ));
    }
}
