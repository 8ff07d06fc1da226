use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use vup_core::types::{FileRecord, FileState, RevisionRecord};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("persisting metadata store: {0:#}")]
    Persist(anyhow::Error),

    #[error("metadata store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    revisions: BTreeMap<String, RevisionRecord>,
}

/// Records plus a counter bumped by every committed change.
#[derive(Default)]
struct Cache {
    data: StoreData,
    generation: u64,
}

enum Undo {
    File(String, Option<FileRecord>),
    Revision(String, Option<RevisionRecord>),
}

/// JSON-backed (or purely in-memory) store of File and Revision records.
///
/// Transactions only touch memory and mark the store dirty. Disk writes
/// happen in [`MetadataStore::flush`] (or [`MetadataStore::persist`] from
/// async code), so any number of changes coalesce into one rewrite.
pub struct MetadataStore {
    path: Option<PathBuf>,
    cache: Mutex<Cache>,
    /// Generation last written to disk; also serializes writers
    written: Mutex<u64>,
}

impl MetadataStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading metadata store: {}", path.display()))
                .map_err(StoreError::Persist)?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing metadata store: {}", path.display()))
                .map_err(StoreError::Persist)?
        } else {
            StoreData::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            cache: Mutex::new(Cache {
                data,
                generation: 0,
            }),
            written: Mutex::new(0),
        })
    }

    /// A store that never touches disk (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cache: Mutex::new(Cache::default()),
            written: Mutex::new(0),
        }
    }

    pub fn read_file(&self, id: &str) -> StoreResult<Option<FileRecord>> {
        Ok(self.lock()?.data.files.get(id).cloned())
    }

    pub fn read_revision(&self, id: &str) -> StoreResult<Option<RevisionRecord>> {
        Ok(self.lock()?.data.revisions.get(id).cloned())
    }

    pub fn file_by_upload_id(&self, upload_id: Uuid) -> StoreResult<Option<FileRecord>> {
        Ok(self
            .lock()?
            .data
            .files
            .values()
            .find(|f| f.upload_id == Some(upload_id))
            .cloned())
    }

    /// All files currently in one of `states`, oldest queued first.
    pub fn files_in_states(&self, states: &[FileState]) -> StoreResult<Vec<FileRecord>> {
        let mut files: Vec<FileRecord> = self
            .lock()?
            .data
            .files
            .values()
            .filter(|f| states.contains(&f.state))
            .cloned()
            .collect();
        files.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(files)
    }

    /// Cache paths of every block recorded on any revision.
    pub fn block_paths(&self) -> StoreResult<HashSet<PathBuf>> {
        Ok(self
            .lock()?
            .data
            .revisions
            .values()
            .flat_map(|r| r.blocks.iter().map(|b| b.local_path.clone()))
            .collect())
    }

    /// Whether committed changes are waiting for a flush.
    pub fn is_dirty(&self) -> StoreResult<bool> {
        let generation = self.lock()?.generation;
        let written = *self.written.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.path.is_some() && generation != written)
    }

    /// Run `f` as one unit of work.
    ///
    /// Changes become visible only if `f` returns `Ok`; otherwise every
    /// touched record is restored. Nothing is written to disk here.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut cache = self.lock()?;
        let cache = &mut *cache;
        let mut tx = Transaction {
            data: &mut cache.data,
            undo: Vec::new(),
        };

        match f(&mut tx) {
            Ok(value) => {
                if !tx.undo.is_empty() {
                    cache.generation += 1;
                }
                Ok(value)
            }
            Err(e) => {
                let undone = tx.undo.len();
                tx.rollback();
                if undone > 0 {
                    tracing::debug!(records = undone, "rolled back metadata transaction");
                }
                Err(e)
            }
        }
    }

    /// Write the store to disk if anything changed since the last write.
    ///
    /// Blocking. The record lock is held only while serializing, so
    /// transactions keep going during the write itself. Returns whether a
    /// write happened.
    pub fn flush(&self) -> StoreResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mut written = self.written.lock().map_err(|_| StoreError::Poisoned)?;
        let (generation, json) = {
            let cache = self.lock()?;
            if cache.generation == *written {
                return Ok(false);
            }
            let json = serde_json::to_vec_pretty(&cache.data)
                .context("serializing metadata store")
                .map_err(StoreError::Persist)?;
            (cache.generation, json)
        };

        write_atomic(path, &json).map_err(StoreError::Persist)?;
        *written = generation;
        tracing::trace!(generation, bytes = json.len(), "metadata store flushed");
        Ok(true)
    }

    /// [`MetadataStore::flush`] on the blocking pool.
    pub async fn persist(self: &Arc<Self>) -> StoreResult<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| StoreError::Persist(anyhow::anyhow!("flush task failed: {e}")))??;
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Cache>> {
        self.cache.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("failed to flush metadata store on drop: {e}");
        }
    }
}

fn write_atomic(path: &Path, json: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating store dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)
        .with_context(|| format!("writing metadata store temp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming metadata store: {}", path.display()))?;
    Ok(())
}

/// Mutable view of the store inside one unit of work.
pub struct Transaction<'a> {
    data: &'a mut StoreData,
    undo: Vec<Undo>,
}

impl Transaction<'_> {
    pub fn file(&self, id: &str) -> StoreResult<&FileRecord> {
        self.data
            .files
            .get(id)
            .ok_or_else(|| StoreError::FileNotFound(id.to_string()))
    }

    pub fn revision(&self, id: &str) -> StoreResult<&RevisionRecord> {
        self.data
            .revisions
            .get(id)
            .ok_or_else(|| StoreError::RevisionNotFound(id.to_string()))
    }

    pub fn file_mut(&mut self, id: &str) -> StoreResult<&mut FileRecord> {
        let original = self.file(id)?.clone();
        self.undo.push(Undo::File(id.to_string(), Some(original)));
        self.data
            .files
            .get_mut(id)
            .ok_or_else(|| StoreError::FileNotFound(id.to_string()))
    }

    pub fn revision_mut(&mut self, id: &str) -> StoreResult<&mut RevisionRecord> {
        let original = self.revision(id)?.clone();
        self.undo.push(Undo::Revision(id.to_string(), Some(original)));
        self.data
            .revisions
            .get_mut(id)
            .ok_or_else(|| StoreError::RevisionNotFound(id.to_string()))
    }

    pub fn put_file(&mut self, file: FileRecord) {
        let previous = self.data.files.insert(file.id.clone(), file.clone());
        self.undo.push(Undo::File(file.id, previous));
    }

    pub fn put_revision(&mut self, revision: RevisionRecord) {
        let previous = self
            .data
            .revisions
            .insert(revision.id.clone(), revision.clone());
        self.undo.push(Undo::Revision(revision.id, previous));
    }

    pub fn remove_file(&mut self, id: &str) -> Option<FileRecord> {
        let previous = self.data.files.remove(id);
        if previous.is_some() {
            self.undo.push(Undo::File(id.to_string(), previous.clone()));
        }
        previous
    }

    pub fn remove_revision(&mut self, id: &str) -> Option<RevisionRecord> {
        let previous = self.data.revisions.remove(id);
        if previous.is_some() {
            self.undo.push(Undo::Revision(id.to_string(), previous.clone()));
        }
        previous
    }

    fn rollback(&mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::File(id, Some(record)) => {
                    self.data.files.insert(id, record);
                }
                Undo::File(id, None) => {
                    self.data.files.remove(&id);
                }
                Undo::Revision(id, Some(record)) => {
                    self.data.revisions.insert(id, record);
                }
                Undo::Revision(id, None) => {
                    self.data.revisions.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vup_core::types::{FileKind, RevisionUploadState};

    fn file(id: &str, state: FileState, queued_at: u64) -> FileRecord {
        FileRecord {
            id: id.into(),
            upload_id: Some(Uuid::new_v4()),
            state,
            kind: FileKind::Regular,
            name: format!("{id}.bin"),
            source_path: None,
            size: 10,
            keys: None,
            signature_email: None,
            active_revision_draft: Some(format!("{id}-rev")),
            active_revision: None,
            revisions: vec![],
            queued_at,
            last_error: None,
        }
    }

    fn revision(id: &str, file_id: &str) -> RevisionRecord {
        RevisionRecord {
            id: id.into(),
            file_id: file_id.into(),
            upload_state: RevisionUploadState::Created,
            size: 10,
            encrypted_size: 0,
            cleartext_path: None,
            modification_time: None,
            xattrs: None,
            signature_address: None,
            manifest_signature: None,
            blocks: vec![],
            thumbnails: vec![],
            session: None,
            media: None,
        }
    }

    #[test]
    fn dropped_store_flushes_committed_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = MetadataStore::open(&path).unwrap();
            store
                .transaction(|tx| {
                    tx.put_file(file("a", FileState::Uploading, 1));
                    tx.put_revision(revision("a-rev", "a"));
                    Ok::<_, StoreError>(())
                })
                .unwrap();
        }

        let reopened = MetadataStore::open(&path).unwrap();
        assert_eq!(reopened.read_file("a").unwrap().unwrap().name, "a.bin");
        assert_eq!(
            reopened.read_revision("a-rev").unwrap().unwrap().upload_state,
            RevisionUploadState::Created
        );
    }

    #[test]
    fn transactions_stay_in_memory_until_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = MetadataStore::open(&path).unwrap();

        for i in 0..100 {
            store
                .transaction(|tx| {
                    tx.put_file(file(&format!("f{i}"), FileState::Uploading, i));
                    Ok::<_, StoreError>(())
                })
                .unwrap();
        }
        assert!(!path.exists());
        assert!(store.is_dirty().unwrap());

        assert!(store.flush().unwrap());
        assert!(!store.is_dirty().unwrap());
        assert!(!store.flush().unwrap(), "nothing changed since the last write");

        let reopened = MetadataStore::open(&path).unwrap();
        assert_eq!(reopened.files_in_states(&[FileState::Uploading]).unwrap().len(), 100);
    }

    #[test]
    fn transactions_do_not_wait_for_a_write_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(&dir.path().join("state.json")).unwrap());
        // a flush holds this for the whole disk write
        let writing = store.written.lock().unwrap();

        let workers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .transaction(|tx| {
                            tx.put_file(file(id, FileState::Uploading, 1));
                            Ok::<_, StoreError>(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(store.read_file("a").unwrap().is_some());
        assert!(store.read_file("b").unwrap().is_some());
        drop(writing);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_and_persist_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(MetadataStore::open(&path).unwrap());

        let mut tasks = Vec::new();
        for prefix in ["x", "y"] {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..200u64 {
                    store
                        .transaction(|tx| {
                            tx.put_file(file(&format!("{prefix}{i}"), FileState::Uploading, i));
                            Ok::<_, StoreError>(())
                        })
                        .unwrap();
                    if i % 25 == 0 {
                        store.persist().await.unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        store.persist().await.unwrap();

        let reopened = MetadataStore::open(&path).unwrap();
        assert_eq!(reopened.files_in_states(&[FileState::Uploading]).unwrap().len(), 400);
    }

    #[test]
    fn block_paths_cover_every_revision() {
        let store = MetadataStore::in_memory();
        let mut rev = revision("a-rev", "a");
        rev.blocks = vec![vup_core::types::BlockRecord {
            index: 1,
            size: 1,
            hash: String::new(),
            clear_size: 1,
            signature: String::new(),
            signature_email: String::new(),
            local_path: PathBuf::from("/cache/one.block"),
            uploaded: false,
            upload_token: None,
        }];
        store
            .transaction(|tx| {
                tx.put_revision(rev);
                tx.put_revision(revision("b-rev", "b"));
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let paths = store.block_paths().unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths.contains(Path::new("/cache/one.block")));
    }

    #[test]
    fn failed_transaction_rolls_back_every_change() {
        let store = MetadataStore::in_memory();
        store
            .transaction(|tx| {
                tx.put_file(file("a", FileState::Uploading, 1));
                tx.put_revision(revision("a-rev", "a"));
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.revision_mut("a-rev")?.upload_state = RevisionUploadState::Encrypted;
            tx.file_mut("a")?.state = FileState::Active;
            tx.put_file(file("b", FileState::Uploading, 2));
            tx.remove_revision("a-rev");
            tx.file("missing")?;
            Ok(())
        });

        assert!(matches!(result, Err(StoreError::FileNotFound(id)) if id == "missing"));
        assert_eq!(store.read_file("a").unwrap().unwrap().state, FileState::Uploading);
        assert!(store.read_file("b").unwrap().is_none());
        assert_eq!(
            store.read_revision("a-rev").unwrap().unwrap().upload_state,
            RevisionUploadState::Created
        );
    }

    #[test]
    fn files_in_states_is_fifo() {
        let store = MetadataStore::in_memory();
        store
            .transaction(|tx| {
                tx.put_file(file("late", FileState::Waiting, 30));
                tx.put_file(file("early", FileState::Waiting, 10));
                tx.put_file(file("done", FileState::Active, 5));
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let waiting = store.files_in_states(&[FileState::Waiting]).unwrap();
        let ids: Vec<_> = waiting.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn lookup_by_upload_id() {
        let store = MetadataStore::in_memory();
        let record = file("a", FileState::Uploading, 1);
        let upload_id = record.upload_id.unwrap();
        store
            .transaction(|tx| {
                tx.put_file(record);
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(store.file_by_upload_id(upload_id).unwrap().unwrap().id, "a");
        assert!(store.file_by_upload_id(Uuid::new_v4()).unwrap().is_none());
    }
}
