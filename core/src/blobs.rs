//! Attachment and icon storage.
//!
//! Objects are written once through a single-use upload URL and addressed by
//! a random id afterwards. On disk each blob lives under a directory named
//! after the first two characters of its id, next to a JSON sidecar with its
//! metadata.

use crate::clock::Clock;
use crate::error::{ChatError, Result};
use crate::model::BlobRef;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

/// Upload URLs stop working after an hour.
pub const UPLOAD_TOKEN_TTL_MS: i64 = 60 * 60 * 1000;

/// External object storage as seen by the chat core.
pub trait BlobStore: Send + Sync {
    /// A short-lived URL the client posts the object body to.
    fn generate_upload_url(&self, owner: Uuid) -> Result<Url>;
    /// Where the object can be downloaded, if it still exists.
    fn get_url(&self, blob: &BlobRef) -> Option<Url>;
    /// Remove the object. Deleting a missing object is not an error.
    fn delete(&self, blob: &BlobRef) -> Result<()>;
    /// The user who uploaded the object, if it exists.
    fn owner(&self, blob: &BlobRef) -> Option<Uuid>;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub content_type: String,
    pub size: u64,
    pub sha256: String,
    pub uploaded_by: Uuid,
    pub uploaded_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct UploadToken {
    owner: Uuid,
    expires_at: i64,
}

/// Blob store backed by a local directory.
pub struct FsBlobStore {
    base: PathBuf,
    public_base: Url,
    clock: Arc<dyn Clock>,
    tokens: Mutex<HashMap<String, UploadToken>>,
}

fn url_error(err: url::ParseError) -> ChatError {
    ChatError::Io(io::Error::new(io::ErrorKind::InvalidInput, err))
}

/// Determine the on-disk path for a blob id within the store.
pub fn file_path<P: AsRef<Path>>(base: P, blob: &BlobRef) -> PathBuf {
    let id = blob.to_string();
    base.as_ref().join(&id[..2]).join(id)
}

fn meta_path<P: AsRef<Path>>(base: P, blob: &BlobRef) -> PathBuf {
    file_path(base, blob).with_extension("json")
}

impl FsBlobStore {
    /// `public_base` is the externally reachable origin of the HTTP server;
    /// generated URLs point below its `/api/storage/` path.
    pub fn new(base: impl Into<PathBuf>, public_base: &Url, clock: Arc<dyn Clock>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let public_base = public_base.join("api/storage/").map_err(url_error)?;
        Ok(Self {
            base,
            public_base,
            clock,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Consume an upload token and persist `data`.
    pub async fn store(&self, token: &str, content_type: &str, data: Bytes) -> Result<BlobRef> {
        let now = self.clock.now_ms();
        let granted = self
            .tokens
            .lock()
            .remove(token)
            .filter(|t| t.expires_at > now)
            .ok_or(ChatError::Unauthorized)?;

        let blob = BlobRef(Uuid::new_v4());
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let meta = BlobMeta {
            content_type: content_type.to_string(),
            size: data.len() as u64,
            sha256: format!("{:x}", hasher.finalize()),
            uploaded_by: granted.owner,
            uploaded_at: now,
        };
        let path = file_path(&self.base, &blob);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&path, &data).await?;
        fs::write(meta_path(&self.base, &blob), serde_json::to_vec(&meta)?).await?;
        debug!(blob = %blob, size = meta.size, "stored blob");
        Ok(blob)
    }

    /// Path and metadata of a stored blob.
    pub fn open(&self, blob: &BlobRef) -> Result<Option<(PathBuf, BlobMeta)>> {
        let path = file_path(&self.base, blob);
        let raw = match std::fs::read(meta_path(&self.base, blob)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some((path, serde_json::from_slice(&raw)?)))
    }

    /// Every blob in the store with its metadata. Unreadable sidecars are skipped.
    pub fn list(&self) -> Result<Vec<(BlobRef, BlobMeta)>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.base).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| ChatError::Io(e.into()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match std::fs::read(path)
                .map_err(ChatError::from)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(ChatError::from))
            {
                Ok(meta) => out.push((BlobRef(id), meta)),
                Err(e) => warn!(path = %path.display(), "skipping blob metadata: {e}"),
            }
        }
        out.sort_by_key(|(blob, _)| *blob);
        Ok(out)
    }

    /// Delete blobs older than `cutoff` that are not in `referenced`.
    pub fn collect_orphans(&self, referenced: &HashSet<BlobRef>, cutoff: i64) -> Result<usize> {
        let mut removed = 0;
        for (blob, meta) in self.list()? {
            if meta.uploaded_at < cutoff && !referenced.contains(&blob) {
                self.delete(&blob)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl BlobStore for FsBlobStore {
    fn generate_upload_url(&self, owner: Uuid) -> Result<Url> {
        let now = self.clock.now_ms();
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let url = self
            .public_base
            .join(&format!("upload/{token}"))
            .map_err(url_error)?;
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, t| t.expires_at > now);
        tokens.insert(
            token,
            UploadToken {
                owner,
                expires_at: now + UPLOAD_TOKEN_TTL_MS,
            },
        );
        Ok(url)
    }

    fn get_url(&self, blob: &BlobRef) -> Option<Url> {
        if !file_path(&self.base, blob).exists() {
            return None;
        }
        self.public_base.join(&blob.to_string()).ok()
    }

    fn delete(&self, blob: &BlobRef) -> Result<()> {
        remove_if_present(&file_path(&self.base, blob))?;
        remove_if_present(&meta_path(&self.base, blob))?;
        debug!(blob = %blob, "deleted blob");
        Ok(())
    }

    fn owner(&self, blob: &BlobRef) -> Option<Uuid> {
        self.open(blob).ok().flatten().map(|(_, meta)| meta.uploaded_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store(dir: &Path) -> (FsBlobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let base = Url::parse("http://chat.test/").unwrap();
        (FsBlobStore::new(dir, &base, clock.clone()).unwrap(), clock)
    }

    fn token_of(url: &Url) -> String {
        url.path_segments().unwrap().last().unwrap().to_string()
    }

    #[tokio::test]
    async fn upload_then_download() {
        let tmp = tempfile::tempdir().unwrap();
        let (blobs, _) = store(tmp.path());
        let owner = Uuid::new_v4();
        let url = blobs.generate_upload_url(owner).unwrap();
        assert!(url.as_str().starts_with("http://chat.test/api/storage/upload/"));

        let blob = blobs
            .store(&token_of(&url), "image/png", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let (path, meta) = blobs.open(&blob).unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        // first two chars of the id name the shard directory
        assert!(path.parent().unwrap().ends_with(&blob.to_string()[..2]));
        assert_eq!(meta.size, 5);
        assert_eq!(
            meta.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(blobs.owner(&blob), Some(owner));
        assert_eq!(
            blobs.get_url(&blob).unwrap().as_str(),
            format!("http://chat.test/api/storage/{blob}")
        );
    }

    #[tokio::test]
    async fn tokens_are_single_use_and_expire() {
        let tmp = tempfile::tempdir().unwrap();
        let (blobs, clock) = store(tmp.path());
        let once = token_of(&blobs.generate_upload_url(Uuid::nil()).unwrap());
        blobs.store(&once, "text/plain", Bytes::new()).await.unwrap();
        assert!(matches!(
            blobs.store(&once, "text/plain", Bytes::new()).await,
            Err(ChatError::Unauthorized)
        ));

        let stale = token_of(&blobs.generate_upload_url(Uuid::nil()).unwrap());
        clock.advance(UPLOAD_TOKEN_TTL_MS);
        assert!(matches!(
            blobs.store(&stale, "text/plain", Bytes::new()).await,
            Err(ChatError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (blobs, _) = store(tmp.path());
        let token = token_of(&blobs.generate_upload_url(Uuid::nil()).unwrap());
        let blob = blobs.store(&token, "text/plain", Bytes::from_static(b"x")).await.unwrap();
        blobs.delete(&blob).unwrap();
        blobs.delete(&blob).unwrap();
        assert!(blobs.get_url(&blob).is_none());
        assert!(blobs.owner(&blob).is_none());
        assert!(blobs.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphans_are_collected_after_cutoff() {
        let tmp = tempfile::tempdir().unwrap();
        let (blobs, clock) = store(tmp.path());
        let mut ids = Vec::new();
        for _ in 0..2 {
            let token = token_of(&blobs.generate_upload_url(Uuid::nil()).unwrap());
            ids.push(blobs.store(&token, "text/plain", Bytes::from_static(b"x")).await.unwrap());
        }
        let kept: HashSet<_> = [ids[0]].into_iter().collect();
        assert_eq!(blobs.collect_orphans(&kept, 1_000).unwrap(), 0);
        clock.advance(1);
        assert_eq!(blobs.collect_orphans(&kept, clock.now_ms()).unwrap(), 1);
        let left: Vec<_> = blobs.list().unwrap().into_iter().map(|(b, _)| b).collect();
        assert_eq!(left, vec![ids[0]]);
    }
}
