//! Bucket backed by a directory on the local filesystem

use super::ObjectStore;
use crate::{Result, StrataError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Temp files are hidden so listings never observe a partial object
const TEMP_PREFIX: &str = ".tmp-";

/// Filesystem object store
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (and create if needed) a bucket rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == ".." || part == ".") {
            return Err(StrataError::Permanent(format!("invalid object key {}", key)));
        }
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    async fn remove_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root {
                break;
            }
            // fails on non-empty directories, which ends the walk
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

fn map_io(err: std::io::Error, key: &str) -> StrataError {
    match err.kind() {
        ErrorKind::NotFound => StrataError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => {
            StrataError::Permanent(format!("permission denied on {}: {}", key, err))
        }
        _ => StrataError::Transient(format!("{}: {}", key, err)),
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // prefixes are directory-aligned in this layout
        let start = self.path(prefix.trim_end_matches('/'))?;
        let mut keys = Vec::new();
        let mut stack = vec![start];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(e, prefix)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(e, prefix))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let file_type = entry.file_type().await.map_err(|e| map_io(e, prefix))?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if let Some(key) = self.key_for(&entry.path()) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path(prefix.trim_end_matches('/'))?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io(e, prefix)),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(e, prefix))? {
            let file_type = entry.file_type().await.map_err(|e| map_io(e, prefix))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() && !name.starts_with('.') {
                dirs.push(name);
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path(key)?;
        let data = fs::read(&path).await.map_err(|e| map_io(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StrataError::Permanent(format!("invalid object key {}", key)))?;
        fs::create_dir_all(parent).await.map_err(|e| map_io(e, key))?;

        // write aside then rename so readers see the old or the new object, never a mix
        let tmp = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        fs::write(&tmp, &data).await.map_err(|e| map_io(e, key))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(e, key));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(e, key)),
        }
        self.remove_empty_parents(&path).await;
        Ok(())
    }
}
