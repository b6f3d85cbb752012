use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::FilePosition;

pub const OFFSET_FILE_NAME: &str = "offsets.json";
const TMP_FILE_SUFFIX: &str = "new";
const EXPIRATION_GRACE_DURATION: chrono::Duration = chrono::Duration::seconds(60);

/// The persisted form is a flat map of absolute path to committed byte
/// offset. This is the on-disk contract shared with operators and tooling,
/// so it stays a plain map rather than anything richer.
type State = BTreeMap<PathBuf, FilePosition>;

/// Durable store of committed read offsets, one entry per watched file.
///
/// The in-memory view is shared with the read loops; persistence rewrites
/// the whole file atomically so a crash can never leave a half-written map.
pub struct OffsetStore {
    tmp_file_path: PathBuf,
    stable_file_path: PathBuf,
    offsets: Arc<OffsetsView>,
    last: Mutex<Option<State>>,
}

/// A thread-safe handle for reading and writing offsets in-memory across
/// multiple tasks.
#[derive(Debug, Default)]
pub struct OffsetsView {
    committed: DashMap<PathBuf, FilePosition>,
    removed_times: DashMap<PathBuf, DateTime<Utc>>,
}

impl OffsetsView {
    pub fn update(&self, path: &Path, pos: FilePosition) {
        self.committed.insert(path.to_path_buf(), pos);
        self.removed_times.remove(path);
    }

    pub fn get(&self, path: &Path) -> Option<FilePosition> {
        self.committed.get(path).map(|r| *r.value())
    }

    /// Mark a path as gone (removed, renamed, or truncated). The entry is
    /// retained for a grace period so a rediscovered file under the same
    /// path resumes cleanly, then dropped by `remove_expired`.
    pub fn set_dead(&self, path: &Path) {
        self.removed_times.insert(path.to_path_buf(), Utc::now());
    }

    /// Discard the committed state for a path immediately. Used when a file
    /// is truncated in place and must restart from offset 0.
    pub fn reset(&self, path: &Path) {
        self.committed.remove(path);
        self.removed_times.remove(path);
    }

    /// Paths currently holding a committed offset.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.committed
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn remove_expired(&self) {
        let now = Utc::now();

        // Collect the expired keys first. Removing while iterating can
        // deadlock, and the set is small.
        let to_remove = self
            .removed_times
            .iter()
            .filter(|entry| now - *entry.value() >= EXPIRATION_GRACE_DURATION)
            .map(|entry| entry.key().clone())
            .collect::<Vec<PathBuf>>();

        for path in to_remove {
            self.committed.remove(&path);
            self.removed_times.remove(&path);
        }
    }

    fn set_state(&self, state: State) {
        for (path, pos) in state {
            self.committed.insert(path, pos);
        }
    }

    fn get_state(&self) -> State {
        self.committed
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl OffsetStore {
    pub fn new(offset_file_path: &Path) -> OffsetStore {
        let mut tmp_file_path = offset_file_path.as_os_str().to_owned();
        tmp_file_path.push(".");
        tmp_file_path.push(TMP_FILE_SUFFIX);

        OffsetStore {
            tmp_file_path: PathBuf::from(tmp_file_path),
            stable_file_path: offset_file_path.to_path_buf(),
            offsets: Arc::new(OffsetsView::default()),
            last: Mutex::new(None),
        }
    }

    pub fn view(&self) -> Arc<OffsetsView> {
        Arc::clone(&self.offsets)
    }

    /// Persist the current offsets to disk, making our best effort to do so
    /// in an atomic way that allows recovering the previous state in the
    /// event of a crash.
    pub fn write_offsets(&self) -> Result<usize, io::Error> {
        // First drop entries for files that disappeared a while ago, so we
        // don't keep rewriting offsets nobody will read again.
        self.offsets.remove_expired();

        let current = self.offsets.get_state();

        let mut last = self.last.lock().expect("offset state poisoned");
        if last.as_ref() != Some(&current) {
            // Write the new offsets to a tmp file and flush it fully to
            // disk. If the process dies anywhere in this section the
            // existing stable file is still valid and recoverable.
            let mut f = io::BufWriter::new(fs::File::create(&self.tmp_file_path)?);
            serde_json::to_writer(&mut f, &current)?;
            f.into_inner()?.sync_all()?;

            // Renaming over the stable file is atomic on POSIX systems, so
            // there is always at least one full valid file to recover from.
            fs::rename(&self.tmp_file_path, &self.stable_file_path)?;

            *last = Some(current);
        }

        Ok(self.offsets.committed.len())
    }

    /// Read persisted offsets from disk. A leftover tmp file means the
    /// previous process was interrupted mid-write and holds the freshest
    /// data, so it is preferred over the stable file.
    pub fn read_offsets(&mut self) {
        match self.read_offsets_file(&self.tmp_file_path) {
            Ok(state) => {
                warn!(message = "Recovered offset data from interrupted process.");
                self.offsets.set_state(state);

                if let Err(error) = fs::rename(&self.tmp_file_path, &self.stable_file_path) {
                    warn!(message = "Error persisting recovered offset file.", %error);
                }
                return;
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                // This is expected, so no warning needed
            }
            Err(error) => {
                error!(message = "Unable to recover offset data from interrupted process.", %error);
            }
        }

        match self.read_offsets_file(&self.stable_file_path) {
            Ok(state) => {
                info!(message = "Loaded offset data.");
                self.offsets.set_state(state);
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                // First run, nothing to load
            }
            Err(error) => {
                warn!(message = "Unable to load offset data.", %error);
            }
        }
    }

    fn read_offsets_file(&self, path: &Path) -> Result<State, io::Error> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use chrono::{Duration, Utc};
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::{OffsetStore, OFFSET_FILE_NAME};

    #[test]
    fn test_offset_store_basics() {
        let data_dir = tempdir().unwrap();
        let store = OffsetStore::new(&data_dir.path().join(OFFSET_FILE_NAME));
        let view = store.view();

        let path = Path::new("/var/log/apps/web/access.log");
        assert_eq!(view.get(path), None);
        view.update(path, 1234);
        assert_eq!(view.get(path), Some(1234));
        view.reset(path);
        assert_eq!(view.get(path), None);
    }

    #[test]
    fn test_offset_store_serialization() {
        let data_dir = tempdir().unwrap();
        let stable = data_dir.path().join(OFFSET_FILE_NAME);
        let store = OffsetStore::new(&stable);

        store.view().update(Path::new("/var/log/a.log"), 77);
        store.write_offsets().unwrap();

        assert!(stable.exists());
        assert!(!data_dir.path().join("offsets.json.new").exists());

        let content = std::fs::read_to_string(&stable).unwrap();
        assert_eq!(content, r#"{"/var/log/a.log":77}"#);
    }

    #[test]
    fn test_offset_store_deserialization() {
        let data_dir = tempdir().unwrap();
        let stable = data_dir.path().join(OFFSET_FILE_NAME);

        {
            let store = OffsetStore::new(&stable);
            store.view().update(Path::new("/var/log/a.log"), 77);
            store.write_offsets().unwrap();
        }

        {
            let mut store = OffsetStore::new(&stable);
            store.read_offsets();
            assert_eq!(store.view().get(Path::new("/var/log/a.log")), Some(77));
        }
    }

    #[test]
    fn test_offset_store_recovers_tmp_file() {
        let data_dir = tempdir().unwrap();
        let stable = data_dir.path().join(OFFSET_FILE_NAME);

        {
            let store = OffsetStore::new(&stable);
            store.view().update(Path::new("/var/log/a.log"), 77);
            store.write_offsets().unwrap();
        }

        // Simulate a crash mid-persist by leaving a newer tmp file behind.
        std::fs::write(
            data_dir.path().join("offsets.json.new"),
            r#"{"/var/log/a.log":99}"#,
        )
        .unwrap();

        {
            let mut store = OffsetStore::new(&stable);
            store.read_offsets();
            assert_eq!(store.view().get(Path::new("/var/log/a.log")), Some(99));
            // The recovered state was promoted to the stable location.
            assert!(!data_dir.path().join("offsets.json.new").exists());
        }
    }

    #[test]
    fn test_offset_store_expiration() {
        let data_dir = tempdir().unwrap();
        let store = OffsetStore::new(&data_dir.path().join(OFFSET_FILE_NAME));
        let view = store.view();
        let path = Path::new("/var/log/a.log");

        view.update(path, 1234);
        view.set_dead(path);
        view.remove_expired();
        assert_eq!(view.get(path), Some(1234));

        // Hack the removal timestamp into the past.
        let past = Utc::now() - Duration::seconds(61);
        view.removed_times.insert(path.to_path_buf(), past);

        view.remove_expired();
        assert_eq!(view.get(path), None);
    }

    #[test]
    fn test_offset_store_update_revives_dead_entry() {
        let data_dir = tempdir().unwrap();
        let store = OffsetStore::new(&data_dir.path().join(OFFSET_FILE_NAME));
        let view = store.view();
        let path = Path::new("/var/log/a.log");

        view.update(path, 10);
        view.set_dead(path);
        view.update(path, 20);

        // The update cleared the removal mark, so expiry leaves it alone.
        assert!(!view.removed_times.contains_key(path));
        view.remove_expired();
        assert_eq!(view.get(path), Some(20));
    }
}
