//! Durable key database: one file per record with in-memory indices.

use crate::error::{KeywardenError, KeywardenResult};
use crate::record::Record;
use log::warn;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Capability set every record store must provide.
///
/// The default implementation is the local [`DirStore`]; a KMIP-backed store
/// that delegates key material to an external vault implements the same
/// surface with metadata kept locally.
pub trait RecordStore: Send + Sync {
    /// Persist `rec` (insert or replace) and return the stored copy.
    fn upsert(&self, rec: Record) -> KeywardenResult<Record>;

    fn get_by_uuid(&self, uuid: &str) -> Option<Record>;

    fn get_by_id(&self, id: &str) -> Option<Record>;

    /// Snapshot of all records, most recently retrieved first.
    fn list(&self) -> Vec<Record>;

    /// Remove the record and its durable representation.
    fn erase(&self, uuid: &str) -> KeywardenResult<()>;

    /// Re-read one record from durable storage, replacing the in-memory
    /// copy. Returns `None` (and forgets the record) when it no longer
    /// exists on disk.
    fn reload(&self, uuid: &str) -> KeywardenResult<Option<Record>>;
}

#[derive(Default)]
struct Indexes {
    by_uuid: HashMap<String, Record>,
    by_id: HashMap<String, String>,
}

impl Indexes {
    fn insert(&mut self, rec: Record) {
        if !rec.id.is_empty() {
            self.by_id.insert(rec.id.clone(), rec.uuid.clone());
        }
        self.by_uuid.insert(rec.uuid.clone(), rec);
    }

    fn remove(&mut self, uuid: &str) -> Option<Record> {
        let rec = self.by_uuid.remove(uuid)?;
        self.by_id.retain(|_, mapped| mapped != uuid);
        Some(rec)
    }
}

/// Directory-backed record store.
///
/// Every record lives in `<dir>/<uuid>` as tagged JSON (the volume key hex
/// encoded), mode 0600. Mutations write a temporary file in the same
/// directory and atomically rename it over the final name, so a reader
/// observes either the old or the new record, never a torn one. File I/O
/// happens under the exclusive lock to keep the disk and the in-memory view
/// in step.
pub struct DirStore {
    dir: PathBuf,
    inner: RwLock<Indexes>,
}

impl DirStore {
    /// Load every record file in `dir`, skipping (with a logged warning)
    /// files that fail to parse.
    pub fn open<P: AsRef<Path>>(dir: P) -> KeywardenResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut indexes = Indexes::default();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            match read_record_file(&path) {
                Ok(rec) => indexes.insert(rec),
                Err(err) => warn!(
                    "skipping unreadable key record {}: {err}",
                    path.display()
                ),
            }
        }
        Ok(DirStore {
            dir,
            inner: RwLock::new(indexes),
        })
    }

    /// Load exactly one record; used by operator commands that must not page
    /// the whole database in.
    pub fn open_one<P: AsRef<Path>>(dir: P, uuid: &str) -> KeywardenResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut indexes = Indexes::default();
        let rec = read_record_file(&record_path(&dir, uuid))?;
        if rec.uuid != uuid {
            return Err(KeywardenError::Invalid(format!(
                "record file for {uuid} names UUID {}",
                rec.uuid
            )));
        }
        indexes.insert(rec);
        Ok(DirStore {
            dir,
            inner: RwLock::new(indexes),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("keydb lock poisoned").by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_record_file(&self, rec: &Record) -> KeywardenResult<()> {
        let payload = serde_json::to_vec_pretty(rec)
            .map_err(|err| KeywardenError::Invalid(format!("encode record {}: {err}", rec.uuid)))?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.as_file_mut().write_all(&payload)?;
        temp.as_file_mut().flush()?;
        #[cfg(unix)]
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
        temp.as_file().sync_all()?;
        temp.persist(record_path(&self.dir, &rec.uuid))
            .map_err(|err| KeywardenError::Io(err.error))?;
        let _ = sync_dir(&self.dir);
        Ok(())
    }
}

impl RecordStore for DirStore {
    fn upsert(&self, rec: Record) -> KeywardenResult<Record> {
        rec.validate()?;
        let mut inner = self.inner.write().expect("keydb lock poisoned");
        self.write_record_file(&rec)?;
        inner.insert(rec.clone());
        Ok(rec)
    }

    fn get_by_uuid(&self, uuid: &str) -> Option<Record> {
        self.inner
            .read()
            .expect("keydb lock poisoned")
            .by_uuid
            .get(uuid)
            .cloned()
    }

    fn get_by_id(&self, id: &str) -> Option<Record> {
        let inner = self.inner.read().expect("keydb lock poisoned");
        let uuid = inner.by_id.get(id)?;
        inner.by_uuid.get(uuid).cloned()
    }

    fn list(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .inner
            .read()
            .expect("keydb lock poisoned")
            .by_uuid
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.last_retrieval
                .timestamp
                .cmp(&a.last_retrieval.timestamp)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        records
    }

    fn erase(&self, uuid: &str) -> KeywardenResult<()> {
        let mut inner = self.inner.write().expect("keydb lock poisoned");
        if inner.by_uuid.get(uuid).is_none() {
            return Err(KeywardenError::NotFound(format!(
                "no key record for {uuid}"
            )));
        }
        match fs::remove_file(record_path(&self.dir, uuid)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(KeywardenError::Io(err)),
        }
        inner.remove(uuid);
        let _ = sync_dir(&self.dir);
        Ok(())
    }

    fn reload(&self, uuid: &str) -> KeywardenResult<Option<Record>> {
        let mut inner = self.inner.write().expect("keydb lock poisoned");
        match read_record_file(&record_path(&self.dir, uuid)) {
            Ok(rec) => {
                inner.insert(rec.clone());
                Ok(Some(rec))
            }
            Err(KeywardenError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                inner.remove(uuid);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// File name for a record; path separators in identifiers (which can carry a
/// `SERIAL:` prefix) are flattened.
fn record_path(dir: &Path, uuid: &str) -> PathBuf {
    let safe: String = uuid
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' { '_' } else { ch })
        .collect();
    dir.join(safe)
}

fn read_record_file(path: &Path) -> KeywardenResult<Record> {
    let payload = fs::read(path)?;
    let rec: Record = serde_json::from_slice(&payload).map_err(|err| {
        KeywardenError::Invalid(format!("parse record {}: {err}", path.display()))
    })?;
    rec.validate()?;
    Ok(rec)
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CommandContent, KEY_LEN};
    use tempfile::tempdir;

    fn record(uuid: &str) -> Record {
        let mut rec = Record::new(uuid, vec![0xA5; KEY_LEN]);
        rec.mapped_name = format!("crypt-{}", rec.id);
        rec.mount_point = "/secure".into();
        rec.mount_options = vec!["noatime".into()];
        rec
    }

    #[test]
    fn upsert_then_fresh_open_returns_identical_record() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let mut rec = record("aaaa-bbbb-cccc");
        rec.key = (0..KEY_LEN as u8).collect();
        rec.push_alive("10.0.0.1", "h1", 1234);
        rec.add_pending_command("10.0.0.1", CommandContent::Umount, 1000, 600);
        rec.touch_retrieval("10.0.0.1", "h1", 1234);
        store.upsert(rec.clone()).unwrap();

        let reopened = DirStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_by_uuid("aaaa-bbbb-cccc").unwrap(), rec);
    }

    #[test]
    fn record_files_are_owner_only() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        store.upsert(record("perm-check")).unwrap();
        let meta = fs::metadata(dir.path().join("perm-check")).unwrap();
        #[cfg(unix)]
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn id_index_follows_upserts() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let rec = record("deadbeef-0001");
        store.upsert(rec.clone()).unwrap();
        assert_eq!(store.get_by_id(&rec.id).unwrap().uuid, rec.uuid);
        assert!(store.get_by_id("unknown").is_none());
    }

    #[test]
    fn list_sorts_by_last_retrieval_descending() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        for (uuid, ts) in [("u-one", 100), ("u-two", 300), ("u-three", 200)] {
            let mut rec = record(uuid);
            rec.touch_retrieval("10.0.0.1", "h1", ts);
            store.upsert(rec).unwrap();
        }
        let listed: Vec<String> = store.list().iter().map(|r| r.uuid.clone()).collect();
        assert_eq!(listed, vec!["u-two", "u-three", "u-one"]);
    }

    #[test]
    fn erase_removes_file_and_indices() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let rec = record("gone-soon");
        store.upsert(rec.clone()).unwrap();

        store.erase("gone-soon").unwrap();
        assert!(store.get_by_uuid("gone-soon").is_none());
        assert!(store.get_by_id(&rec.id).is_none());
        assert!(!dir.path().join("gone-soon").exists());

        assert!(matches!(
            store.erase("gone-soon"),
            Err(KeywardenError::NotFound(_))
        ));
    }

    #[test]
    fn open_skips_unparsable_files() {
        let dir = tempdir().unwrap();
        {
            let store = DirStore::open(dir.path()).unwrap();
            store.upsert(record("keep-me")).unwrap();
        }
        fs::write(dir.path().join("torn"), b"not json at all").unwrap();

        let store = DirStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get_by_uuid("keep-me").is_some());
    }

    #[test]
    fn open_one_loads_a_single_record() {
        let dir = tempdir().unwrap();
        {
            let store = DirStore::open(dir.path()).unwrap();
            store.upsert(record("only-this")).unwrap();
            store.upsert(record("not-that")).unwrap();
        }
        let store = DirStore::open_one(dir.path(), "only-this").unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get_by_uuid("only-this").is_some());
        assert!(store.get_by_uuid("not-that").is_none());

        assert!(DirStore::open_one(dir.path(), "absent").is_err());
    }

    #[test]
    fn reload_picks_up_external_edits_and_deletions() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let rec = record("shared");
        store.upsert(rec.clone()).unwrap();

        // Another process (the CLI) rewrites the file directly.
        let other = DirStore::open_one(dir.path(), "shared").unwrap();
        let mut edited = other.get_by_uuid("shared").unwrap();
        edited.max_active = 9;
        other.upsert(edited).unwrap();

        let reloaded = store.reload("shared").unwrap().unwrap();
        assert_eq!(reloaded.max_active, 9);
        assert_eq!(store.get_by_uuid("shared").unwrap().max_active, 9);

        fs::remove_file(dir.path().join("shared")).unwrap();
        assert!(store.reload("shared").unwrap().is_none());
        assert!(store.get_by_uuid("shared").is_none());
    }

    #[test]
    fn upsert_rejects_invalid_records() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let mut rec = record("bad-key");
        rec.key = vec![0u8; 16];
        assert!(store.upsert(rec).is_err());
        assert!(store.is_empty());
        assert!(!dir.path().join("bad-key").exists());
    }

    #[test]
    fn serial_prefixed_identifiers_get_flat_file_names() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        store
            .upsert(record("SERIAL:3600140585b053f0"))
            .unwrap();
        assert!(dir.path().join("SERIAL:3600140585b053f0").exists());

        let reopened = DirStore::open(dir.path()).unwrap();
        assert!(reopened.get_by_uuid("SERIAL:3600140585b053f0").is_some());
    }
}
