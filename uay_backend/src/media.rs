use crate::config::UayPaths;
use crate::utils::sanitize_filename;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const WRITE_CHUNK: usize = 64 * 1024;

/// Called with `(bytes_written, total_bytes)` as an upload makes progress.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Durable blob storage, namespaced by owner id.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `data` and returns a URI that stays valid.
    async fn upload(
        &self,
        owner_id: &str,
        file_name: &str,
        data: Bytes,
        progress: ProgressFn,
    ) -> Result<String>;
}

/// A file picked for upload, held in memory.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub name: String,
    pub data: Bytes,
}

impl PendingFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload")
            .to_string();
        Ok(Self::new(name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Object store writing under `files/uploads/{owner}/{millis}-{name}`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(paths: &UayPaths) -> Self {
        Self::with_root(paths.uploads_dir.clone())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn create_target(&self, owner_id: &str, file_name: &str) -> Result<(PathBuf, fs::File)> {
        let directory = self.root.join(sanitize_filename(owner_id));
        fs::create_dir_all(&directory).await.with_context(|| {
            format!("failed to create upload directory {}", directory.display())
        })?;

        let millis = Utc::now().timestamp_millis();
        let name = sanitize_filename(file_name);
        let mut path = directory.join(format!("{millis}-{name}"));
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let suffix = Uuid::new_v4().simple().to_string();
                    path = directory.join(format!("{millis}-{}-{name}", &suffix[..8]));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", path.display()))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(
        &self,
        owner_id: &str,
        file_name: &str,
        data: Bytes,
        progress: ProgressFn,
    ) -> Result<String> {
        let (path, mut file) = self.create_target(owner_id, file_name).await?;
        write_or_discard(&path, &mut file, &data, &progress).await?;
        if let Err(err) = file.sync_all().await {
            discard_partial(&path).await;
            return Err(err).with_context(|| format!("failed to sync {}", path.display()));
        }

        tracing::debug!(owner_id, path = %path.display(), bytes = data.len(), "stored upload");
        Ok(format!("file://{}", path.display()))
    }
}

/// Streams `data` into `writer`. A failed write removes the file at `path`
/// so no truncated object is left under `uploads/`.
async fn write_or_discard<W>(
    path: &Path,
    writer: &mut W,
    data: &[u8],
    progress: &ProgressFn,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match write_chunks(writer, data, progress).await {
        Ok(()) => Ok(()),
        Err(err) => {
            discard_partial(path).await;
            Err(err).with_context(|| format!("failed to write {}", path.display()))
        }
    }
}

async fn write_chunks<W>(
    writer: &mut W,
    data: &[u8],
    progress: &ProgressFn,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total = data.len() as u64;
    let mut written = 0u64;
    progress(0, total);
    for chunk in data.chunks(WRITE_CHUNK) {
        writer.write_all(chunk).await?;
        written += chunk.len() as u64;
        progress(written, total);
    }
    writer.flush().await
}

async fn discard_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove partial upload");
    }
}
