//! Directory-tree object store.
//!
//! Keys map to relative paths under a root directory. Conditional creation
//! writes a temp file next to the target and hard-links it into place, which
//! fails atomically when the target exists.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::{validate_key, ObjectStore, Result, StorageError};

const TEMP_PREFIX: &str = ".tmp-";

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::from_io("list", e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::from_io("list", e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::from_io("list", e))?;

                if file_type.is_dir() {
                    // Only descend where the prefix can still match.
                    if key.starts_with(prefix) || prefix.starts_with(&format!("{key}/")) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::from_io(key, e)),
        }
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        let temp = parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        let linked = tokio::fs::hard_link(&temp, &path).await;
        let _ = tokio::fs::remove_file(&temp).await;

        match linked {
            Ok(()) => {
                debug!(key, len = bytes.len(), "object written");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(StorageError::from_io(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.put_if_absent("flu/2020/a.header", b"hdr").await.unwrap();
        assert_eq!(
            store.get("flu/2020/a.header").await.unwrap(),
            Some(b"hdr".to_vec())
        );
        assert_eq!(store.get("flu/2020/missing").await.unwrap(), None);
        assert!(dir.path().join("flu").join("2020").join("a.header").exists());
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.put_if_absent("k/v", b"first").await.unwrap();
        assert_eq!(
            store.put_if_absent("k/v", b"second").await,
            Err(StorageError::AlreadyExists("k/v".into()))
        );
        assert_eq!(store.get("k/v").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        for key in ["flu/2020/01/a", "flu/2020/02/b", "rsv/2020/01/c"] {
            store.put_if_absent(key, b"x").await.unwrap();
        }

        assert_eq!(
            store.list("flu/").await.unwrap(),
            vec!["flu/2020/01/a", "flu/2020/02/b"]
        );
        assert_eq!(store.list("flu/2020/02").await.unwrap(), vec!["flu/2020/02/b"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("not-yet"));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(matches!(
            store.put_if_absent("../outside", b"x").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_no_temp_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put_if_absent("a/b", b"x").await.unwrap();
        let _ = store.put_if_absent("a/b", b"y").await;

        let names: Vec<_> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b"]);
    }
}
