//! Build Record Store.
//!
//! One record per canonical string, keyed by [`record_key`]. Updates replace
//! the whole record (delete then insert); there is no partial patch. Reads
//! through [`RecordStore::dump_all`] are a best-effort snapshot.

use crate::error::{Result, StageError};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use rebuilder_common::identity::PackageIdentity;
use rebuilder_common::record::{BuildRecord, record_key};
use rebuilder_common::task::BuildTask;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::sync::Mutex;

const LOCK_FILE: &str = ".lock";
const RECORD_EXTENSION: &str = "json";

/// Durable store of build records.
#[cfg_attr(test, mockall::automock)]
pub trait RecordStore: Send + Sync {
    /// Returns the record of `identity`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Store`] when the record cannot be read.
    fn get(&self, identity: &PackageIdentity) -> Result<Option<BuildRecord>>;

    /// Replaces the record of the task's identity with a fresh projection.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Store`] when the record cannot be written.
    fn upsert(&self, task: &BuildTask) -> Result<BuildRecord>;

    /// Removes the record of `identity`. Returns `true` when one existed;
    /// deleting an absent record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Store`] when the record cannot be removed.
    fn delete(&self, identity: &PackageIdentity) -> Result<bool>;

    /// Returns up to `limit` records ordered by canonical string.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Store`] when the store cannot be listed.
    fn dump_all(&self, limit: Option<usize>) -> Result<Vec<BuildRecord>>;
}

/// Store keeping one JSON document per record under `{state_dir}/records/`.
///
/// Writers serialise on an exclusive `fs2` lock; readers take a shared one.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: Utf8PathBuf,
}

impl JsonFileStore {
    /// Opens (and creates) the store below `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Store`] when the directory cannot be created.
    pub fn open(state_dir: &Utf8Path) -> Result<Self> {
        let dir = state_dir.join("records");
        fs::create_dir_all(&dir)
            .map_err(|err| StageError::store(format!("cannot create {dir}: {err}")))?;
        Ok(Self { dir })
    }

    /// Directory holding the record documents.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn record_path(&self, identity: &PackageIdentity) -> Utf8PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", record_key(identity)))
    }

    fn lock(&self, exclusive: bool) -> Result<File> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| StageError::store(format!("cannot open {path}: {err}")))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|err| StageError::store(format!("cannot lock {path}: {err}")))?;
        Ok(file)
    }

    fn read_record(path: &Utf8Path) -> Result<Option<BuildRecord>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StageError::store(format!("cannot read {path}: {err}"))),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| StageError::store(format!("malformed record {path}: {err}")))
    }

    fn remove(path: &Utf8Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StageError::store(format!("cannot remove {path}: {err}"))),
        }
    }
}

impl RecordStore for JsonFileStore {
    fn get(&self, identity: &PackageIdentity) -> Result<Option<BuildRecord>> {
        let _guard = self.lock(false)?;
        Self::read_record(&self.record_path(identity))
    }

    fn upsert(&self, task: &BuildTask) -> Result<BuildRecord> {
        let record = BuildRecord::from_task(task);
        let payload = serde_json::to_vec_pretty(&record).map_err(StageError::store)?;
        let path = self.record_path(&task.identity);

        let _guard = self.lock(true)?;
        Self::remove(&path)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(StageError::store)?;
        staged.write_all(&payload).map_err(StageError::store)?;
        staged
            .persist(&path)
            .map_err(|err| StageError::store(format!("cannot write {path}: {}", err.error)))?;
        Ok(record)
    }

    fn delete(&self, identity: &PackageIdentity) -> Result<bool> {
        let _guard = self.lock(true)?;
        Self::remove(&self.record_path(identity))
    }

    fn dump_all(&self, limit: Option<usize>) -> Result<Vec<BuildRecord>> {
        let _guard = self.lock(false)?;
        let entries = self
            .dir
            .read_dir_utf8()
            .map_err(|err| StageError::store(format!("cannot list {}: {err}", self.dir)))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StageError::store)?;
            if entry.path().extension() != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(record) = Self::read_record(entry.path())? {
                records.push(record);
            }
        }
        Ok(sorted_and_limited(records, limit))
    }
}

/// In-process store used by tests and single-shot commands.
///
/// Keeps the number of upserts per canonical string so that tests can
/// observe how often Report recorded a package.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, BuildRecord>>,
    upserts: Mutex<BTreeMap<String, usize>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserts recorded for `identity`.
    #[must_use]
    pub fn upsert_count(&self, identity: &PackageIdentity) -> usize {
        self.upserts
            .lock()
            .map(|counts| counts.get(&identity.canonical()).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, identity: &PackageIdentity) -> Result<Option<BuildRecord>> {
        let records = self.records.lock().map_err(StageError::store)?;
        Ok(records.get(&record_key(identity)).cloned())
    }

    fn upsert(&self, task: &BuildTask) -> Result<BuildRecord> {
        let record = BuildRecord::from_task(task);
        {
            let mut records = self.records.lock().map_err(StageError::store)?;
            records.remove(&record.key);
            records.insert(record.key.clone(), record.clone());
        }
        let mut upserts = self.upserts.lock().map_err(StageError::store)?;
        *upserts.entry(task.canonical()).or_default() += 1;
        Ok(record)
    }

    fn delete(&self, identity: &PackageIdentity) -> Result<bool> {
        let mut records = self.records.lock().map_err(StageError::store)?;
        Ok(records.remove(&record_key(identity)).is_some())
    }

    fn dump_all(&self, limit: Option<usize>) -> Result<Vec<BuildRecord>> {
        let records = self.records.lock().map_err(StageError::store)?;
        Ok(sorted_and_limited(records.values().cloned().collect(), limit))
    }
}

fn sorted_and_limited(mut records: Vec<BuildRecord>, limit: Option<usize>) -> Vec<BuildRecord> {
    records.sort_by_cached_key(BuildRecord::canonical);
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuilder_common::task::BuildStatus;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct FileStore {
        _dir: TempDir,
        store: JsonFileStore,
    }

    #[fixture]
    fn file_store() -> FileStore {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf-8 path");
        let store = JsonFileStore::open(&root).expect("open store");
        FileStore { _dir: dir, store }
    }

    fn task(name: &str, status: BuildStatus) -> BuildTask {
        let identity = PackageIdentity::new(name, None, "1.0-1", "amd64", "bullseye");
        let mut task = BuildTask::new(identity, format!("{name}_1.0-1_amd64.buildinfo"));
        task.status = status;
        task
    }

    fn exercise(store: &dyn RecordStore) {
        let first = task("bash", BuildStatus::Retry);
        assert_eq!(store.get(&first.identity).expect("get"), None);

        store.upsert(&first).expect("insert");
        let mut updated = first.clone();
        updated.status = BuildStatus::Reproducible;
        updated.retries = 1;
        store.upsert(&updated).expect("replace");

        let record = store
            .get(&first.identity)
            .expect("get")
            .expect("record exists");
        assert_eq!(record.status, BuildStatus::Reproducible);
        assert_eq!(record.retries, 1);

        store.upsert(&task("apt", BuildStatus::Failure)).expect("insert");
        let dump = store.dump_all(None).expect("dump");
        let names: Vec<_> = dump.iter().map(|r| r.identity.name().to_owned()).collect();
        assert_eq!(names, ["apt", "bash"]);
        assert_eq!(store.dump_all(Some(1)).expect("dump").len(), 1);

        assert!(store.delete(&first.identity).expect("delete"));
        assert!(!store.delete(&first.identity).expect("idempotent delete"));
        assert_eq!(store.get(&first.identity).expect("get"), None);
    }

    #[rstest]
    fn json_store_honours_contract(file_store: FileStore) {
        exercise(&file_store.store);
    }

    #[rstest]
    fn memory_store_honours_contract() {
        exercise(&MemoryStore::new());
    }

    #[rstest]
    fn json_store_keeps_one_file_per_identity(file_store: FileStore) {
        let bash = task("bash", BuildStatus::Retry);
        let mut other_dist = bash.clone();
        other_dist.identity = PackageIdentity::new("bash", None, "1.0-1", "amd64", "bookworm");
        file_store.store.upsert(&bash).expect("insert");
        file_store.store.upsert(&other_dist).expect("replace");

        let documents = file_store
            .store
            .dir()
            .read_dir_utf8()
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension() == Some("json"))
            .count();
        assert_eq!(documents, 1);
    }

    #[rstest]
    fn memory_store_counts_upserts() {
        let store = MemoryStore::new();
        let bash = task("bash", BuildStatus::Retry);
        store.upsert(&bash).expect("insert");
        store.upsert(&bash).expect("replace");
        assert_eq!(store.upsert_count(&bash.identity), 2);
    }

    #[rstest]
    fn malformed_documents_are_store_errors(file_store: FileStore) {
        let bash = task("bash", BuildStatus::Retry);
        let path = file_store
            .store
            .dir()
            .join(format!("{}.json", record_key(&bash.identity)));
        fs::write(&path, "{not json").expect("write garbage");
        assert!(matches!(
            file_store.store.get(&bash.identity),
            Err(StageError::Store { .. })
        ));
    }
}
