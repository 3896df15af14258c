/*
Copyright 2025 The xflops Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

pub mod puller;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use common::{lock_ptr, new_ptr, trace_fn, MutexPtr, VimanaError};

/// On-disk index record for one pulled image version, written atomically
/// next to the two blob files it describes. The registry host/port are not
/// stored here: they are a property of the request that resolved this image,
/// not of the image content, so callers thread the [`crate::identity::ImageId`]
/// they already parsed through to wire responses instead of reconstructing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub domain: String,
    pub service: String,
    pub version: String,
    pub manifest_digest: String,
    pub config_digest: String,
    pub component_digest: String,
    pub component_size: u64,
    pub metadata_digest: String,
    pub metadata_size: u64,
    pub labels: HashMap<String, String>,
}

pub struct FsUsage {
    pub used_bytes: u64,
    pub inodes_used: u64,
}

/// Content-addressed store of pulled component images, rooted at a single
/// directory tree: `<root>/<domain>/<service>/<version>.{component,metadata,json}`.
/// Writes to one image key are serialized against each other; different keys
/// proceed in parallel.
#[derive(Clone)]
pub struct ImageStore {
    root: PathBuf,
    write_locks: MutexPtr<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn key(domain: &str, service: &str, version: &str) -> String {
    format!("{domain}/{service}/{version}")
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: new_ptr(HashMap::new()),
        }
    }

    fn service_dir(&self, domain: &str, service: &str) -> PathBuf {
        self.root.join(domain).join(service)
    }

    fn component_path(&self, domain: &str, service: &str, version: &str) -> PathBuf {
        self.service_dir(domain, service)
            .join(format!("{version}.component"))
    }

    fn metadata_path(&self, domain: &str, service: &str, version: &str) -> PathBuf {
        self.service_dir(domain, service)
            .join(format!("{version}.metadata"))
    }

    fn index_path(&self, domain: &str, service: &str, version: &str) -> PathBuf {
        self.service_dir(domain, service)
            .join(format!("{version}.json"))
    }

    pub async fn lock_for(&self, domain: &str, service: &str, version: &str) -> Arc<AsyncMutex<()>> {
        let k = key(domain, service, version);
        let mut locks = lock_ptr!(self.write_locks).expect("write_locks mutex poisoned");
        locks.entry(k).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub async fn get(
        &self,
        domain: &str,
        service: &str,
        version: &str,
    ) -> Result<Option<ImageRecord>, VimanaError> {
        trace_fn!("ImageStore::get");

        let path = self.index_path(domain, service, version);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: ImageRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| VimanaError::Internal(format!("corrupt image index: {e}")))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the component blob, metadata blob, and index record for one
    /// image version. The caller already holds the per-image write lock (via
    /// [`ImageStore::lock_for`]) for the duration of the pull.
    pub async fn put(
        &self,
        record: &ImageRecord,
        component: &[u8],
        metadata: &[u8],
    ) -> Result<(), VimanaError> {
        trace_fn!("ImageStore::put");

        let dir = self.service_dir(&record.domain, &record.service);
        tokio::fs::create_dir_all(&dir).await?;

        write_atomic(
            &self.component_path(&record.domain, &record.service, &record.version),
            component,
        )
        .await?;
        write_atomic(
            &self.metadata_path(&record.domain, &record.service, &record.version),
            metadata,
        )
        .await?;

        let encoded = serde_json::to_vec_pretty(record)
            .map_err(|e| VimanaError::Internal(format!("encode image index: {e}")))?;
        write_atomic(
            &self.index_path(&record.domain, &record.service, &record.version),
            &encoded,
        )
        .await?;

        Ok(())
    }

    /// Deletes the three files for one version. Idempotent: removing an
    /// already-absent image is not an error. Cleans up the service/domain
    /// directories once they are empty.
    pub async fn remove(&self, domain: &str, service: &str, version: &str) -> Result<(), VimanaError> {
        trace_fn!("ImageStore::remove");

        let _guard = self.lock_for(domain, service, version).await;
        for path in [
            self.component_path(domain, service, version),
            self.metadata_path(domain, service, version),
            self.index_path(domain, service, version),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let service_dir = self.service_dir(domain, service);
        remove_if_empty(&service_dir).await?;
        if let Some(domain_dir) = service_dir.parent() {
            remove_if_empty(domain_dir).await?;
        }

        Ok(())
    }

    /// Walks the root directory to compute byte and inode usage. Never
    /// touches the write locks: an in-progress pull's partial files may be
    /// observed, which is fine since the atomic index rename is what makes an
    /// image logically present.
    pub async fn fs_info(&self) -> Result<FsUsage, VimanaError> {
        trace_fn!("ImageStore::fs_info");

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|e| VimanaError::Internal(format!("fs walk task panicked: {e}")))?
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VimanaError> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("part")
    ));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_empty(dir: &Path) -> Result<(), VimanaError> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_none() {
                match tokio::fs::remove_dir(dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn walk(root: &Path) -> Result<FsUsage, VimanaError> {
    let mut used_bytes = 0u64;
    let mut inodes_used = 0u64;

    if !root.exists() {
        return Ok(FsUsage {
            used_bytes: 0,
            inodes_used: 0,
        });
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            inodes_used += 1;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                used_bytes += entry.metadata()?.len();
            }
        }
    }

    Ok(FsUsage {
        used_bytes,
        inodes_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(domain: &str, service: &str, version: &str) -> ImageRecord {
        ImageRecord {
            domain: domain.to_string(),
            service: service.to_string(),
            version: version.to_string(),
            manifest_digest: "sha256:m".to_string(),
            config_digest: "sha256:c".to_string(),
            component_digest: "sha256:a".to_string(),
            component_size: 3,
            metadata_digest: "sha256:b".to_string(),
            metadata_size: 3,
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let rec = record("d", "s", "1.0.0");
        store.put(&rec, b"abc", b"def").await.unwrap();

        let got = store.get("d", "s", "1.0.0").await.unwrap();
        assert!(got.is_some());

        let usage = store.fs_info().await.unwrap();
        assert_eq!(usage.used_bytes, 6);
        assert_eq!(usage.inodes_used, 3);

        store.remove("d", "s", "1.0.0").await.unwrap();
        assert!(store.get("d", "s", "1.0.0").await.unwrap().is_none());

        // Service and domain directories are cleaned up once empty.
        assert!(!dir.path().join("d").exists());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        store.remove("d", "s", "1.0.0").await.unwrap();
        store.remove("d", "s", "1.0.0").await.unwrap();
    }

    #[tokio::test]
    async fn two_versions_share_service_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        store.put(&record("d", "s", "1.0.0"), b"abc", b"def").await.unwrap();
        let baseline = store.fs_info().await.unwrap().inodes_used;

        store.put(&record("d", "s", "2.0.0"), b"ghi", b"jkl").await.unwrap();
        let after_second = store.fs_info().await.unwrap().inodes_used;
        assert_eq!(after_second, baseline + 3);

        store.remove("d", "s", "2.0.0").await.unwrap();
        assert_eq!(store.fs_info().await.unwrap().inodes_used, baseline);

        store.remove("d", "s", "1.0.0").await.unwrap();
        assert_eq!(store.fs_info().await.unwrap().inodes_used, 0);
        assert!(!dir.path().join("d").join("s").exists());
        assert!(!dir.path().join("d").exists());
    }
}
