use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Local};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info};

use console_client::ClientFacade;
use console_core::types::BackupArtifact;
use console_core::{CatalogError, ConsoleError, OpContext, Result};

use super::{ARCHIVE_EXTENSION, STAGING_DIR, archive, next_backup_name, validate_name};

/// Removes a file on drop unless disarmed.
struct RemoveOnDrop {
    path: PathBuf,
    armed: bool,
}

impl RemoveOnDrop {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Cannot remove {}: {e}", self.path.display()),
        }
    }
}

fn modified_at(meta: &std::fs::Metadata) -> DateTime<Local> {
    meta.modified()
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now())
}

/// Directory of backup archives.
///
/// An archive becomes visible only once it is complete: it is built under
/// `<dir>/.staging/` and renamed into place.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    dir: PathBuf,
    scratch_dir: PathBuf,
}

impl BackupCatalog {
    pub fn new(dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn check_dir(&self) -> Result<()> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(CatalogError::DirectoryMissing(self.dir.clone()).into()),
        }
    }

    /// Pull a snapshot from the cluster and publish it as a new archive.
    pub async fn create(&self, facade: &ClientFacade, ctx: &OpContext) -> Result<BackupArtifact> {
        self.check_dir().await?;
        let chunks = facade.snapshot(ctx).await?;
        self.store(chunks, &next_backup_name(), ctx).await
    }

    /// Persist `chunks` under `name`: scratch file, staged archive, then rename into place.
    async fn store<S>(&self, mut chunks: S, name: &str, ctx: &OpContext) -> Result<BackupArtifact>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let temp_path = self.scratch_dir.join(name);
        let _temp = RemoveOnDrop::new(temp_path.clone());

        let received = ctx
            .run(async {
                let mut file = tokio::fs::File::create(&temp_path).await?;
                let mut received = 0u64;
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    received += chunk.len() as u64;
                }
                file.sync_all().await?;
                Ok::<_, ConsoleError>(received)
            })
            .await?;
        debug!("Snapshot {name} staged at {} ({received} bytes)", temp_path.display());

        let staging = self.dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;
        let file_name = format!("{name}.{ARCHIVE_EXTENSION}");
        let staged_path = staging.join(&file_name);
        let mut staged = RemoveOnDrop::new(staged_path.clone());
        archive_snapshot(&temp_path, &staged_path, name, ctx).await?;

        let final_path = self.dir.join(&file_name);
        tokio::fs::rename(&staged_path, &final_path).await?;
        staged.disarm();
        if let Err(e) = sync_dir(&self.dir).await {
            debug!("Cannot sync {}: {e}", self.dir.display());
        }

        let meta = tokio::fs::metadata(&final_path).await?;
        info!("Backup {file_name} created ({} bytes)", meta.len());
        Ok(BackupArtifact {
            name: file_name,
            size_bytes: meta.len(),
            created_at: modified_at(&meta),
        })
    }

    /// Every valid archive in the catalog, unordered.
    pub async fn list(&self, ctx: &OpContext) -> Result<Vec<BackupArtifact>> {
        self.check_dir().await?;
        ctx.run(async {
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            let mut checks = JoinSet::new();
            while let Some(entry) = entries.next_entry().await? {
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) => {
                        debug!("Skipping {}: {e}", entry.path().display());
                        continue;
                    }
                };
                if meta.is_dir() {
                    continue;
                }
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                checks.spawn_blocking(move || {
                    archive::is_valid_archive(&path).then(|| BackupArtifact {
                        name,
                        size_bytes: meta.len(),
                        created_at: modified_at(&meta),
                    })
                });
            }

            let mut backups = Vec::new();
            while let Some(joined) = checks.join_next().await {
                match joined {
                    Ok(Some(artifact)) => backups.push(artifact),
                    Ok(None) => {}
                    Err(e) => debug!("Archive check failed: {e}"),
                }
            }
            Ok::<_, ConsoleError>(backups)
        })
        .await
    }

    pub async fn delete(&self, name: &str, ctx: &OpContext) -> Result<()> {
        validate_name(name)?;
        self.check_dir().await?;
        let path = self.dir.join(name);
        ctx.run(async {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CatalogError::NotFound(name.to_string()).into());
                }
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                return Err(CatalogError::NotFound(name.to_string()).into());
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|source| CatalogError::Remove {
                    name: name.to_string(),
                    source,
                })?;
            info!("Backup {name} deleted");
            Ok::<_, ConsoleError>(())
        })
        .await
    }

    /// Stream the raw archive bytes of `name` into `sink`.
    pub async fn retrieve<W>(&self, name: &str, sink: &mut W, ctx: &OpContext) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        validate_name(name)?;
        self.check_dir().await?;
        let path = self.dir.join(name);
        ctx.run(async {
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CatalogError::NotFound(name.to_string()).into());
                }
                Err(e) => return Err(e.into()),
            };
            if file.metadata().await?.is_dir() {
                return Err(CatalogError::NotFound(name.to_string()).into());
            }
            let copied = tokio::io::copy(&mut file, sink).await?;
            sink.flush().await?;
            Ok::<_, ConsoleError>(copied)
        })
        .await
    }
}

/// Build the archive on a blocking thread, bounded by `ctx`.
///
/// When `ctx` ends first the writer is told to stop and remove its partial output.
async fn archive_snapshot(
    source: &Path,
    target: &Path,
    entry: &str,
    ctx: &OpContext,
) -> Result<u64> {
    let abort = Arc::new(AtomicBool::new(false));
    let writer = {
        let abort = Arc::clone(&abort);
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        let entry = entry.to_string();
        tokio::task::spawn_blocking(move || {
            archive::write_archive(&source, &target, &entry, &abort)
        })
    };
    let written = ctx
        .run(async {
            match writer.await {
                Ok(written) => written.map_err(ConsoleError::from),
                Err(e) => Err(CatalogError::Archive(e.to_string()).into()),
            }
        })
        .await;
    if written.is_err() {
        abort.store(true, Ordering::Relaxed);
    }
    written
}

async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn chunks(data: &[u8]) -> impl Stream<Item = Result<Bytes>> + Unpin {
        let parts: Vec<Result<Bytes>> = data
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(parts)
    }

    fn is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    fn ctx() -> OpContext {
        OpContext::with_timeout(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn failed_rename_discards_staged_archive() {
        let catalog_dir = TempDir::new().unwrap();
        let scratch_dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(catalog_dir.path(), scratch_dir.path());

        // A directory squatting on the final name makes the rename fail.
        let squatter = catalog_dir.path().join("feedface.zip");
        std::fs::create_dir(&squatter).unwrap();
        std::fs::write(squatter.join("keep"), b"x").unwrap();

        let data = vec![42u8; 10_000];
        let err = catalog
            .store(chunks(&data), "feedface", &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Catalog(CatalogError::Io(_))));
        assert!(is_empty(&catalog_dir.path().join(STAGING_DIR)));
        assert!(is_empty(scratch_dir.path()));
        assert!(catalog.list(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_step_ends_with_its_context() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("snap");
        let data: Vec<u8> = (0..8 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();
        let target = tmp.path().join("snap.zip");

        let op = ctx();
        op.cancel();
        let err = archive_snapshot(&source, &target, "snap", &op)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Cancelled));

        // The abandoned writer removes its partial output once it sees the abort.
        for _ in 0..200 {
            if !target.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!target.exists());
    }
}
