//! Local directory connector

use crate::UnderFileSystem;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tierio_common::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// UFS backed by a directory on the local filesystem (or a mounted share)
#[derive(Debug, Clone)]
pub struct LocalUfs {
    root: PathBuf,
}

impl LocalUfs {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a UFS path under the root; absolute paths and `..` are refused
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::invalid_argument(format!("invalid UFS path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

fn ufs_error(op: &str, path: &str, err: &std::io::Error) -> Error {
    Error::ufs(format!("{op} {path}: {err}"))
}

#[async_trait]
impl UnderFileSystem for LocalUfs {
    fn name(&self) -> &str {
        "local"
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let full = self.resolve(path)?;
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| ufs_error("open", path, &e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| ufs_error("seek", path, &e))?;
        let mut buf = Vec::new();
        file.take(len)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ufs_error("read", path, &e))?;
        Ok(Bytes::from(buf))
    }

    async fn write_all(&self, path: &str, data: Bytes) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ufs_error("mkdir", path, &e))?;
        }

        // Write aside, then rename over the target
        let staging = full.with_extension(format!("staging-{}", uuid::Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&staging).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&staging, &full).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(ufs_error("write", path, &e));
        }

        debug!(path, bytes = data.len(), "ufs object written");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| ufs_error("stat", path, &e))
    }
}
