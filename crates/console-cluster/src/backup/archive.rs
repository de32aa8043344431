use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Datelike, Local, Timelike};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use console_core::CatalogError;

/// Bytes copied between checks of the abort flag.
const COPY_BLOCK: usize = 64 * 1024;

fn archive_error(e: zip::result::ZipError) -> CatalogError {
    CatalogError::Archive(e.to_string())
}

fn aborted() -> CatalogError {
    CatalogError::Archive("archive write aborted".into())
}

fn zip_time(at: &DateTime<Local>) -> Option<zip::DateTime> {
    zip::DateTime::from_date_and_time(
        u16::try_from(at.year()).ok()?,
        at.month() as u8,
        at.day() as u8,
        at.hour() as u8,
        at.minute() as u8,
        at.second() as u8,
    )
    .ok()
}

/// Write `source` as the single deflated entry `entry_name` of a new archive at `target`.
///
/// The entry header carries the source's size, modification time and permissions.
/// The archive is flushed to disk before returning. Once `abort` is raised the write
/// stops at the next block and `target` is removed.
pub(crate) fn write_archive(
    source: &Path,
    target: &Path,
    entry_name: &str,
    abort: &AtomicBool,
) -> Result<u64, CatalogError> {
    if abort.load(Ordering::Relaxed) {
        return Err(aborted());
    }
    let mut input = File::open(source)?;
    let meta = input.metadata()?;

    let mut options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(meta.len() >= u64::from(u32::MAX));
    let modified = meta
        .modified()
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());
    if let Some(at) = zip_time(&modified) {
        options = options.last_modified_time(at);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(meta.permissions().mode());
    }

    let mut zip = ZipWriter::new(File::create(target)?);
    zip.start_file(entry_name, options).map_err(archive_error)?;
    let mut block = vec![0u8; COPY_BLOCK];
    let mut copied = 0u64;
    loop {
        if abort.load(Ordering::Relaxed) {
            drop(zip);
            let _ = std::fs::remove_file(target);
            return Err(aborted());
        }
        let n = input.read(&mut block)?;
        if n == 0 {
            break;
        }
        zip.write_all(&block[..n])?;
        copied += n as u64;
    }
    let output = zip.finish().map_err(archive_error)?;
    output.sync_all()?;
    Ok(copied)
}

pub(crate) fn is_valid_archive(path: &Path) -> bool {
    File::open(path)
        .ok()
        .and_then(|f| ZipArchive::new(f).ok())
        .is_some()
}
