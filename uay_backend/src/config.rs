use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_MAX_ATTACHMENTS: usize = 4;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct UayConfig {
    pub paths: UayPaths,
    pub feed: FeedConfig,
    pub upload: UploadConfig,
    pub write: WriteConfig,
}

impl UayConfig {
    pub fn from_env() -> Result<Self> {
        let paths = match env::var("UAY_HOME") {
            Ok(raw) if !raw.trim().is_empty() => UayPaths::from_base_dir(raw.trim())?,
            _ => UayPaths::discover()?,
        };
        Ok(Self {
            paths,
            feed: FeedConfig::from_env(),
            upload: UploadConfig::from_env(),
            write: WriteConfig::from_env(),
        })
    }

    pub fn new(paths: UayPaths) -> Self {
        Self {
            paths,
            feed: FeedConfig::default(),
            upload: UploadConfig::default(),
            write: WriteConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Items per page for every feed mode.
    pub page_size: usize,
    /// Authors per following-only partition. Never above the store's
    /// membership filter cap.
    pub partition_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            partition_size: crate::store::MAX_IN_VALUES,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let page_size = parse_env("UAY_PAGE_SIZE")
            .filter(|size: &usize| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self {
            page_size,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_attachments: usize,
    pub max_upload_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadConfig {
    pub fn from_env() -> Self {
        let max_upload_bytes =
            parse_env("UAY_MAX_UPLOAD_BYTES").unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let max_attachments =
            parse_env("UAY_MAX_ATTACHMENTS").unwrap_or(DEFAULT_MAX_ATTACHMENTS);
        Self {
            max_attachments,
            max_upload_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// Attempts for version-guarded read-modify-write cycles before giving up.
    pub max_write_attempts: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }
}

impl WriteConfig {
    pub fn from_env() -> Self {
        let max_write_attempts = parse_env("UAY_MAX_WRITE_ATTEMPTS")
            .filter(|attempts: &usize| *attempts > 0)
            .unwrap_or(DEFAULT_MAX_WRITE_ATTEMPTS);
        Self { max_write_attempts }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UayPaths {
    pub base: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub files_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl UayPaths {
    pub fn discover() -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|err| anyhow!("failed to resolve current executable: {err}"))?;
        let base = exe_path
            .parent()
            .ok_or_else(|| anyhow!("executable path missing parent"))?
            .to_path_buf();
        Self::from_base_dir(base)
    }

    pub fn from_base_dir<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let data_dir = base.join("data");
        let db_path = data_dir.join("uay.db");
        let files_dir = base.join("files");
        let uploads_dir = files_dir.join("uploads");
        let logs_dir = base.join("logs");

        Ok(Self {
            base,
            data_dir,
            db_path,
            files_dir,
            uploads_dir,
            logs_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_base() {
        let paths = UayPaths::from_base_dir("/tmp/uay-home").unwrap();
        assert_eq!(paths.db_path, PathBuf::from("/tmp/uay-home/data/uay.db"));
        assert_eq!(
            paths.uploads_dir,
            PathBuf::from("/tmp/uay-home/files/uploads")
        );
    }

    #[test]
    fn defaults_match_store_limits() {
        let feed = FeedConfig::default();
        assert_eq!(feed.page_size, 10);
        assert!(feed.partition_size <= crate::store::MAX_IN_VALUES);
        let upload = UploadConfig::default();
        assert_eq!(upload.max_attachments, 4);
        assert_eq!(upload.max_upload_bytes, 50 * 1024 * 1024);
    }
}
