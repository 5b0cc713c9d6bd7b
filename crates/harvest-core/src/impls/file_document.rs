//! FileDocumentStore - one JSON file per document.
//!
//! Layout: `<root>/<collection>/<id>.json`. Writes go to a uniquely named
//! temp file in the same directory and are renamed over the target, so
//! readers never see a half-written document.
//!
//! Writers take an exclusive OS lock on `<root>/.locks/<collection>.lock`
//! for the whole read, revision check, write and rename. Several processes
//! (or several store instances) may share one root.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{HarvestError, HarvestResult};
use crate::ports::{Document, DocumentStore};

pub struct FileDocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDocumentStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> HarvestResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> HarvestResult<PathBuf> {
        check_name("collection", collection)?;
        Ok(self.root.join(collection))
    }

    fn lock_path(&self, collection: &str) -> PathBuf {
        self.root.join(".locks").join(format!("{collection}.lock"))
    }

    /// Block (off the runtime) until this process holds the collection lock.
    async fn lock_collection(&self, collection: &str) -> HarvestResult<CollectionLock> {
        let path = self.lock_path(collection);
        tokio::task::spawn_blocking(move || CollectionLock::acquire(&path))
            .await
            .map_err(|e| HarvestError::Document(format!("lock task failed: {e}")))?
    }

    fn document_path(&self, collection: &str, id: &str) -> HarvestResult<PathBuf> {
        check_name("document id", id)?;
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }

    async fn read(&self, path: &Path) -> HarvestResult<Option<Document>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                HarvestError::Document(format!("{} is corrupt: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn write_atomic(&self, path: &Path, doc: &Document) -> HarvestResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| HarvestError::Document(format!("{} has no parent", path.display())))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_error(dir, e))?;

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path, e));
        }
        Ok(())
    }
}

/// Exclusive lock on a collection's lock file, released on drop.
struct CollectionLock {
    file: File,
    path: PathBuf,
}

impl CollectionLock {
    fn acquire(path: &Path) -> HarvestResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.lock_exclusive().map_err(|e| io_error(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "unlock failed; closing releases it");
        }
    }
}

/// Ids become file names: restrict them to a safe alphabet.
fn check_name(what: &str, name: &str) -> HarvestResult<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(HarvestError::Validation(format!(
            "{what} '{name}' is not usable as a file name"
        )))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> HarvestError {
    HarvestError::Document(format!("{}: {err}", path.display()))
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> HarvestResult<Option<Document>> {
        let path = self.document_path(collection, id)?;
        self.read(&path).await
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
    ) -> HarvestResult<Document> {
        let path = self.document_path(collection, id)?;
        let _guard = self.write_lock.lock().await;
        let _lock = self.lock_collection(collection).await?;
        if self.read(&path).await?.is_some() {
            return Err(HarvestError::conflict(
                "document",
                format!("{collection}/{id}"),
                "already exists",
            ));
        }
        let doc = Document {
            id: id.to_string(),
            revision: 1,
            body,
        };
        self.write_atomic(&path, &doc).await?;
        Ok(doc)
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        expected_revision: u64,
    ) -> HarvestResult<Document> {
        let path = self.document_path(collection, id)?;
        let _guard = self.write_lock.lock().await;
        let _lock = self.lock_collection(collection).await?;
        let Some(current) = self.read(&path).await? else {
            return Err(HarvestError::not_found("document", format!("{collection}/{id}")));
        };
        if current.revision != expected_revision {
            return Err(HarvestError::conflict(
                "document",
                format!("{collection}/{id}"),
                format!(
                    "revision is {}, caller expected {expected_revision}",
                    current.revision
                ),
            ));
        }
        let doc = Document {
            id: id.to_string(),
            revision: current.revision + 1,
            body,
        };
        self.write_atomic(&path, &doc).await?;
        Ok(doc)
    }

    async fn list(&self, collection: &str) -> HarvestResult<Vec<Document>> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // None: removed between read_dir and read.
            if let Some(doc) = self.read(&path).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileDocumentStore::open(dir.path()).await.unwrap();
            store.insert("tasks", "t1", json!({"a": 1})).await.unwrap();
            store.put("tasks", "t1", json!({"a": 2}), 1).await.unwrap();
        }
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        let doc = store.get("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(doc.revision, 2);
        assert_eq!(doc.body, json!({"a": 2}));
        assert_eq!(store.list("tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        store.insert("tasks", "t1", json!({})).await.unwrap();
        store.put("tasks", "t1", json!({"x": 1}), 1).await.unwrap();
        let err = store.put("tasks", "t1", json!({"x": 2}), 1).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        for bad in ["../escape", "a/b", "", ".hidden"] {
            let err = store.insert("tasks", bad, json!({})).await.unwrap_err();
            assert!(matches!(err, HarvestError::Validation(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn corrupt_document_fails_the_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        store.insert("tasks", "t1", json!({})).await.unwrap();
        std::fs::write(dir.path().join("tasks").join("t2.json"), b"{\"id\": \"t2\", ").unwrap();

        let err = store.list("tasks").await.unwrap_err();
        assert!(matches!(err, HarvestError::Document(ref m) if m.contains("t2.json")), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_sharing_a_root_admit_one_writer_per_revision() {
        let dir = tempfile::tempdir().unwrap();
        let a = std::sync::Arc::new(FileDocumentStore::open(dir.path()).await.unwrap());
        let b = std::sync::Arc::new(FileDocumentStore::open(dir.path()).await.unwrap());
        a.insert("tasks", "t1", json!({"n": 0})).await.unwrap();

        for round in 1..=40u64 {
            let (sa, sb) = (a.clone(), b.clone());
            let (ra, rb) = tokio::join!(
                tokio::spawn(async move { sa.put("tasks", "t1", json!({"by": "a"}), round).await }),
                tokio::spawn(async move { sb.put("tasks", "t1", json!({"by": "b"}), round).await }),
            );
            let results = [ra.unwrap(), rb.unwrap()];
            let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(won.len(), 1, "round {round}: {results:?}");
            assert_eq!(won[0].revision, round + 1);
            let lost = results.iter().find_map(|r| r.as_ref().err()).unwrap();
            assert!(lost.is_conflict(), "{lost}");
        }

        let doc = b.get("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(doc.revision, 41);
    }

    #[tokio::test]
    async fn leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        store.insert("tasks", "t1", json!({})).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path().join("tasks"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["t1.json".to_string()]);
    }
}
