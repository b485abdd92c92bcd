use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{CaptureError, Result};

/// What an upload does when the destination key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Replace,
    /// Keep the existing object and report the upload as skipped.
    Pass,
    Fail,
}

impl std::str::FromStr for IfExists {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "replace" => Ok(IfExists::Replace),
            "pass" => Ok(IfExists::Pass),
            "fail" => Ok(IfExists::Fail),
            other => Err(format!("unknown if-exists policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded,
    Skipped,
}

/// Object storage as seen by the pipelines: one bucket, `/`-separated keys.
pub trait BlobStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every key starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn upload(&self, local: &Path, key: &str, if_exists: IfExists) -> Result<UploadOutcome>;

    /// Remove `key`. Returns `false` when there was nothing to remove.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// Bucket backed by a directory tree: key `a/b/c.csv` is `<root>/a/b/c.csv`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    bucket: String,
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open an existing bucket directory under `buckets_root`.
    pub fn open(buckets_root: impl AsRef<Path>, bucket: &str) -> Result<Self> {
        let root = buckets_root.as_ref().join(bucket);
        if !root.is_dir() {
            return Err(CaptureError::Storage(format!(
                "bucket {bucket} not found at {}",
                root.display()
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            root,
        })
    }

    /// Open the bucket, creating its directory when missing.
    pub fn create(buckets_root: impl AsRef<Path>, bucket: &str) -> Result<Self> {
        let root = buckets_root.as_ref().join(bucket);
        fs::create_dir_all(&root)?;
        Ok(Self {
            bucket: bucket.to_string(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|p| p.is_empty() || p == "." || p == "..") {
            return Err(CaptureError::Storage(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(key))
    }
}

impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Only walk the deepest directory the prefix pins down.
        let dir_part = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir_part)
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&start) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        debug!(bucket = %self.bucket, prefix, count = keys.len(), "listed objects");
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn upload(&self, local: &Path, key: &str, if_exists: IfExists) -> Result<UploadOutcome> {
        let dest = self.path_for(key)?;
        if dest.is_file() {
            match if_exists {
                IfExists::Replace => {}
                IfExists::Pass => {
                    debug!(bucket = %self.bucket, key, "object exists, upload skipped");
                    return Ok(UploadOutcome::Skipped);
                }
                IfExists::Fail => {
                    return Err(CaptureError::ObjectExists {
                        key: key.to_string(),
                    })
                }
            }
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &dest)?;
        info!(bucket = %self.bucket, key, "object uploaded");
        Ok(UploadOutcome::Uploaded)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!(bucket = %self.bucket, key, "object deleted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn open_requires_existing_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(LocalBlobStore::open(tmp.path(), "missing").is_err());
        LocalBlobStore::create(tmp.path(), "missing").unwrap();
        assert!(LocalBlobStore::open(tmp.path(), "missing").is_ok());
    }

    #[test]
    fn upload_then_list_by_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::create(tmp.path().join("buckets"), "rj-smtr-dev").unwrap();
        let file = staged(tmp.path(), "a.csv", "id\n1\n");

        store
            .upload(&file, "source/source_jae/linha/data=2024-03-10/x.csv", IfExists::Replace)
            .unwrap();
        store
            .upload(&file, "source/source_jae/linha/data=2024-03-11/y.csv", IfExists::Replace)
            .unwrap();
        store
            .upload(&file, "raw/source_jae/linha/data=2024-03-11/y_0.json", IfExists::Replace)
            .unwrap();

        let keys = store.list("source/source_jae/linha/data=").unwrap();
        assert_eq!(
            keys,
            vec![
                "source/source_jae/linha/data=2024-03-10/x.csv",
                "source/source_jae/linha/data=2024-03-11/y.csv",
            ]
        );
        assert!(store.list("source/source_jae/other/data=").unwrap().is_empty());
    }

    #[test]
    fn listing_walks_nested_partitions_and_skips_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::create(tmp.path(), "bucket").unwrap();
        let file = staged(tmp.path(), "page.json", "[]");
        for key in [
            "raw/ds/tbl/data=2024-03-10/hora=01/2024-03-10-01-00-00_0.json",
            "raw/ds/tbl/data=2024-03-10/hora=01/2024-03-10-01-00-00_1.json",
            "raw/ds/tbl/data=2024-03-10/hora=02/2024-03-10-02-00-00_0.json",
        ] {
            store.upload(&file, key, IfExists::Replace).unwrap();
        }
        fs::create_dir_all(store.root().join("raw/ds/tbl/data=2024-03-10/hora=03")).unwrap();

        assert_eq!(store.list("raw/ds/tbl/").unwrap().len(), 3);
        assert_eq!(
            store
                .list("raw/ds/tbl/data=2024-03-10/hora=01/2024-03-10-01-00-00_")
                .unwrap(),
            vec![
                "raw/ds/tbl/data=2024-03-10/hora=01/2024-03-10-01-00-00_0.json",
                "raw/ds/tbl/data=2024-03-10/hora=01/2024-03-10-01-00-00_1.json",
            ]
        );
    }

    #[test]
    fn if_exists_policies() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::create(tmp.path(), "bucket").unwrap();
        let first = staged(tmp.path(), "first.csv", "first");
        let second = staged(tmp.path(), "second.csv", "second");
        let key = "source/ds/tbl/data=2024-03-10/f.csv";

        assert_eq!(store.upload(&first, key, IfExists::Fail).unwrap(), UploadOutcome::Uploaded);
        assert_eq!(store.upload(&second, key, IfExists::Pass).unwrap(), UploadOutcome::Skipped);
        assert_eq!(fs::read_to_string(store.root().join(key)).unwrap(), "first");

        assert!(matches!(
            store.upload(&second, key, IfExists::Fail),
            Err(CaptureError::ObjectExists { .. })
        ));

        store.upload(&second, key, IfExists::Replace).unwrap();
        assert_eq!(fs::read_to_string(store.root().join(key)).unwrap(), "second");
    }

    #[test]
    fn delete_removes_only_the_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::create(tmp.path(), "bucket").unwrap();
        let file = staged(tmp.path(), "page.json", "[]");
        store.upload(&file, "raw/ds/tbl/data=2024-03-10/a_0.json", IfExists::Replace).unwrap();
        store.upload(&file, "raw/ds/tbl/data=2024-03-10/a_1.json", IfExists::Replace).unwrap();

        assert!(store.delete("raw/ds/tbl/data=2024-03-10/a_1.json").unwrap());
        assert!(!store.delete("raw/ds/tbl/data=2024-03-10/a_1.json").unwrap());
        assert_eq!(
            store.list("raw/ds/tbl/").unwrap(),
            vec!["raw/ds/tbl/data=2024-03-10/a_0.json"]
        );
    }

    #[test]
    fn traversal_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::create(tmp.path(), "bucket").unwrap();
        assert!(store.exists("../etc/passwd").is_err());
        assert!(store.exists("a//b").is_err());
    }

    #[test]
    fn if_exists_parses_cli_values() {
        assert_eq!("pass".parse::<IfExists>().unwrap(), IfExists::Pass);
        assert!("skip".parse::<IfExists>().is_err());
    }
}
