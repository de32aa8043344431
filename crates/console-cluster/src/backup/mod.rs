//! Snapshot backups kept as zip archives in a catalog directory.

mod archive;
mod catalog;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use console_core::{ConsoleError, Result};

pub use catalog::BackupCatalog;

/// Hidden directory inside the catalog where archives are built before publication.
pub const STAGING_DIR: &str = ".staging";

pub const ARCHIVE_EXTENSION: &str = "zip";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Fresh, content-free backup name: 64 hex characters.
pub fn next_backup_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let digest = Sha256::digest(format!("{nanos}-{seq}-snapshot").as_bytes());
    hex::encode(digest)
}

/// A backup name must be exactly one path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(ConsoleError::Validation(format!(
            "invalid backup name {name:?}"
        )));
    }
    Ok(())
}
