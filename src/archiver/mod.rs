//! The archiver stage: once a day, rolls oversized output files, compresses
//! inactive ones with bzip2-tar, and removes the source on success.
//!
//! No lock is shared with the dumper. The dumper opens files on every
//! append, so a rename here is transparent: the next flush re-creates the
//! original path.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Local;
use snafu::Snafu;
use tokio::process::Command;
use tracing::{debug, info, warn};

use tail_source::{Scanner, OFFSET_FILE_NAME};

use crate::{cli::ArchiverOpts, dumper::OFFSETS_DIR_NAME, schedule, signal};

const ARCHIVE_EXT: &str = "tar.bz2";

#[derive(Debug, Snafu)]
pub enum ArchiverError {
    #[snafu(display("Log root {} is not a directory", path.display()))]
    MissingLogRoot { path: PathBuf },
    #[snafu(display("Log root is not expressible as a scan pattern"))]
    UnusableScanPattern,
}

#[derive(Debug, PartialEq)]
enum Action {
    /// Rename to the next free `<path>.<N>`, then compress the result.
    Roll,
    Compress,
    Skip,
}

pub async fn run(opts: ArchiverOpts) -> Result<(), ArchiverError> {
    if !opts.log_path.is_dir() {
        return Err(ArchiverError::MissingLogRoot {
            path: opts.log_path.clone(),
        });
    }
    let exclude = vec![
        opts.log_path.join("**").join(format!("*.{ARCHIVE_EXT}")),
        opts.log_path.join("**").join("*.offset"),
        opts.log_path.join(OFFSETS_DIR_NAME).join("**"),
        opts.log_path.join(OFFSET_FILE_NAME),
        opts.log_path.join(format!("{OFFSET_FILE_NAME}.new")),
    ];
    let scanner =
        Scanner::new(&opts.log_path, &exclude).ok_or(ArchiverError::UnusableScanPattern)?;

    info!(
        message = "Archiver starting.",
        log_path = ?opts.log_path,
        expire_days = opts.expire_days,
        dry_run = opts.runtime.dry_run,
    );

    let shutdown = signal::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let wait =
            schedule::until_next_daily(Local::now().naive_local(), schedule::ARCHIVE_DAILY_AT);
        debug!(message = "Next archive run scheduled.", in_secs = wait.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(wait) => archive_pass(&scanner, &opts).await,
            _ = &mut shutdown => return Ok(()),
        }
    }
}

async fn archive_pass(scanner: &Scanner, opts: &ArchiverOpts) {
    let expire = Duration::from_secs(opts.expire_days * 86_400);
    for path in scanner.scan() {
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(error) => {
                warn!(message = "Unable to stat file; skipping.", ?path, %error);
                continue;
            }
        };
        let age = mtime_age(&meta);

        match classify(&path, meta.len(), age, opts.max_size, expire) {
            Action::Skip => {}
            Action::Compress => compress(&path, opts.runtime.dry_run).await,
            Action::Roll => {
                let rolled = next_roll_path(&path);
                info!(message = "Rolling oversized file.", ?path, ?rolled);
                if opts.runtime.dry_run {
                    continue;
                }
                match tokio::fs::rename(&path, &rolled).await {
                    Ok(()) => compress(&rolled, false).await,
                    Err(error) => {
                        warn!(message = "Unable to roll file.", ?path, %error);
                    }
                }
            }
        }
    }
}

/// What the daily pass does with one file. A leftover from an earlier
/// interrupted roll (numeric suffix) goes straight to compression so it is
/// never rolled twice.
fn classify(path: &Path, len: u64, age: Duration, max_size: u64, expire: Duration) -> Action {
    if has_numeric_suffix(path) {
        return Action::Compress;
    }
    if len >= max_size {
        return Action::Roll;
    }
    if age >= expire {
        return Action::Compress;
    }
    Action::Skip
}

fn has_numeric_suffix(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| !ext.is_empty() && ext.bytes().all(|b| b.is_ascii_digit()))
}

/// Smallest unused `<path>.<N>` for rolling.
fn next_roll_path(path: &Path) -> PathBuf {
    let mut n = 1u32;
    loop {
        let candidate = suffixed(path, &n.to_string());
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// `<path>.tar.bz2`, bumping an integer suffix until the name is free.
fn free_archive_path(path: &Path) -> PathBuf {
    let direct = suffixed(path, ARCHIVE_EXT);
    if !direct.exists() {
        return direct;
    }
    let mut n = 1u32;
    loop {
        let candidate = suffixed(path, &format!("{n}.{ARCHIVE_EXT}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Invoke bzip2-tar on the file's basename from its parent directory and
/// delete the source on success. Failures leave the source in place for the
/// next cycle.
async fn compress(path: &Path, dry_run: bool) {
    let (Some(parent), Some(basename)) = (path.parent(), path.file_name()) else {
        warn!(message = "Refusing to archive a bare root path.", ?path);
        return;
    };
    let archive = free_archive_path(path);
    let Some(archive_name) = archive.file_name() else {
        return;
    };

    info!(
        message = "Archiving file.",
        ?path,
        archive = ?archive,
        dry_run,
    );
    if dry_run {
        return;
    }

    let status = Command::new("tar")
        .arg("-jcf")
        .arg(archive_name)
        .arg(basename)
        .current_dir(parent)
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            if let Err(error) = tokio::fs::remove_file(path).await {
                warn!(message = "Unable to remove archived source.", ?path, %error);
            }
        }
        Ok(status) => {
            warn!(message = "tar exited with failure; source left in place.", ?path, %status);
        }
        Err(error) => {
            warn!(message = "Unable to run tar; source left in place.", ?path, %error);
        }
    }
}

fn mtime_age(meta: &std::fs::Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::{classify, free_archive_path, has_numeric_suffix, next_roll_path, Action};

    const GIB10: u64 = 10 * 1024 * 1024 * 1024;
    const DAYS30: Duration = Duration::from_secs(30 * 86_400);

    #[test]
    fn classify_by_size_then_age() {
        let path = Path::new("/var/log/apps/web/access.log");
        assert_eq!(classify(path, GIB10 + 1, Duration::ZERO, GIB10, DAYS30), Action::Roll);
        assert_eq!(classify(path, GIB10, Duration::ZERO, GIB10, DAYS30), Action::Roll);
        assert_eq!(classify(path, 100, DAYS30, GIB10, DAYS30), Action::Compress);
        assert_eq!(classify(path, 100, Duration::ZERO, GIB10, DAYS30), Action::Skip);
    }

    #[test]
    fn roll_leftovers_compress_without_rerolling() {
        let path = Path::new("/var/log/apps/web/access.log.1");
        assert_eq!(classify(path, GIB10 + 1, Duration::ZERO, GIB10, DAYS30), Action::Compress);
    }

    #[test]
    fn numeric_suffix_detection() {
        assert!(has_numeric_suffix(Path::new("/a/b.log.12")));
        assert!(!has_numeric_suffix(Path::new("/a/b.log")));
        assert!(!has_numeric_suffix(Path::new("/a/b.log.bak1")));
    }

    #[test]
    fn roll_path_takes_smallest_free_integer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "x").unwrap();

        assert_eq!(next_roll_path(&path), suffixed(&path, "1"));
        std::fs::write(suffixed(&path, "1"), "x").unwrap();
        std::fs::write(suffixed(&path, "2"), "x").unwrap();
        assert_eq!(next_roll_path(&path), suffixed(&path, "3"));
    }

    #[test]
    fn archive_path_bumps_until_free() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "x").unwrap();

        assert_eq!(free_archive_path(&path), suffixed(&path, "tar.bz2"));
        std::fs::write(suffixed(&path, "tar.bz2"), "x").unwrap();
        assert_eq!(free_archive_path(&path), suffixed(&path, "1.tar.bz2"));
    }

    fn suffixed(path: &Path, suffix: &str) -> PathBuf {
        super::suffixed(path, suffix)
    }
}
