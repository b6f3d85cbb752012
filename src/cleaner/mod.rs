//! The cleaner stage: hourly expiry of old compressed artifacts and of
//! rotated source files nothing has touched for a while.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use snafu::Snafu;
use tracing::{debug, info, warn};

use crate::{cli::CleanerOpts, signal};

#[derive(Debug, Snafu)]
pub enum CleanerError {
    #[snafu(display("Log root {} is not a directory", path.display()))]
    MissingLogRoot { path: PathBuf },
}

pub async fn run(opts: CleanerOpts) -> Result<(), CleanerError> {
    if !opts.log_path.is_dir() {
        return Err(CleanerError::MissingLogRoot {
            path: opts.log_path.clone(),
        });
    }

    info!(
        message = "Cleaner starting.",
        log_path = ?opts.log_path,
        expire_days = opts.expire_days,
        idle_expire_secs = opts.idle_expire_secs,
        dry_run = opts.runtime.dry_run,
    );

    let shutdown = signal::shutdown_signal();
    tokio::pin!(shutdown);
    let mut scan = tokio::time::interval(Duration::from_secs(opts.scan_interval.max(1)));
    loop {
        tokio::select! {
            _ = scan.tick() => clean_pass(&opts).await,
            _ = &mut shutdown => return Ok(()),
        }
    }
}

async fn clean_pass(opts: &CleanerOpts) {
    debug!(message = "Start cleaning scan.");
    let artifact_expire = Duration::from_secs(opts.expire_days * 86_400);
    for path in glob_files(&opts.log_path, "*.tar.bz2") {
        remove_if_older(&path, artifact_expire, opts.runtime.dry_run).await;
    }

    // Rotated splits (app.log.1, app.log.2024-05-01, ...) left behind by
    // logrotate; gone once nothing has written them for the idle window.
    let idle_expire = Duration::from_secs(opts.idle_expire_secs);
    for path in glob_files(&opts.log_path, "*.log.*") {
        if rotated_candidate(&path) {
            remove_if_older(&path, idle_expire, opts.runtime.dry_run).await;
        }
    }
}

/// Recursive glob for regular files matching `pattern` under `root`.
fn glob_files(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let Some(full) = root.join("**").join(pattern).to_str().map(str::to_owned) else {
        return Vec::new();
    };
    match glob::glob(&full) {
        Ok(entries) => entries.flatten().filter(|path| path.is_file()).collect(),
        Err(error) => {
            warn!(message = "Failed to read clean pattern.", %error);
            Vec::new()
        }
    }
}

/// Rotated-file filter: `*.log.*` also matches archives and would match
/// offset bookkeeping; both stay out of the idle expiry.
fn rotated_candidate(path: &Path) -> bool {
    let name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
    !name.ends_with(".tar.bz2") && !name.ends_with(".offset")
}

async fn remove_if_older(path: &Path, threshold: Duration, dry_run: bool) {
    let age = match std::fs::metadata(path) {
        Ok(meta) => meta
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default(),
        Err(error) => {
            warn!(message = "Unable to stat file; skipping.", ?path, %error);
            return;
        }
    };
    if age < threshold {
        return;
    }

    info!(message = "Removing expired file.", ?path, age_secs = age.as_secs(), dry_run);
    if dry_run {
        return;
    }
    if let Err(error) = tokio::fs::remove_file(path).await {
        warn!(message = "Unable to remove file.", ?path, %error);
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{clean_pass, rotated_candidate, remove_if_older};
    use crate::cli::{CleanerOpts, RuntimeOpts};

    fn opts(root: &Path, dry_run: bool) -> CleanerOpts {
        CleanerOpts {
            log_path: root.to_path_buf(),
            expire_days: 0,
            idle_expire_secs: 0,
            scan_interval: 3600,
            runtime: RuntimeOpts { debug: false, dry_run },
        }
    }

    #[test]
    fn rotated_filter_excludes_bookkeeping() {
        assert!(rotated_candidate(Path::new("/a/app.log.1")));
        assert!(rotated_candidate(Path::new("/a/app.log.2024-05-01")));
        assert!(!rotated_candidate(Path::new("/a/app.log.1.tar.bz2")));
        assert!(!rotated_candidate(Path::new("/a/web.log.0.offset")));
    }

    #[tokio::test]
    async fn expired_files_are_removed() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("web")).unwrap();
        let artifact = dir.path().join("web/access.log.tar.bz2");
        let rotated = dir.path().join("web/access.log.1");
        let live = dir.path().join("web/access.log");
        std::fs::write(&artifact, "x").unwrap();
        std::fs::write(&rotated, "x").unwrap();
        std::fs::write(&live, "x").unwrap();

        // Zero thresholds make everything expirable immediately.
        clean_pass(&opts(dir.path(), false)).await;

        assert!(!artifact.exists());
        assert!(!rotated.exists());
        assert!(live.exists(), "the live output file is never cleaned");
    }

    #[tokio::test]
    async fn dry_run_removes_nothing() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("access.log.tar.bz2");
        std::fs::write(&artifact, "x").unwrap();

        clean_pass(&opts(dir.path(), true)).await;
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn fresh_files_survive_a_real_threshold() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("access.log.tar.bz2");
        std::fs::write(&artifact, "x").unwrap();

        remove_if_older(&artifact, Duration::from_secs(3600), false).await;
        assert!(artifact.exists());
    }
}
