use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tollgate_core::store::merge_partial;
use tollgate_core::{DocumentStore, Query, TollgateError, TollgateResult};

/// File-based document store: `<dir>/<collection>/<id>.json`.
///
/// Writes go through a temp file and a rename so readers never observe a
/// half-written document. A single writer lock makes `update` atomic within
/// the process.
pub struct FileDocumentStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDocumentStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn new(dir: PathBuf) -> TollgateResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn collection_dir(&self, collection: &str) -> TollgateResult<PathBuf> {
        validate_segment(collection)?;
        Ok(self.dir.join(collection))
    }

    fn doc_path(&self, collection: &str, id: &str) -> TollgateResult<PathBuf> {
        validate_segment(id)?;
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }

    async fn read_doc(path: &Path) -> TollgateResult<Option<Value>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => {
                let doc = serde_json::from_str(&data).map_err(|e| {
                    TollgateError::Store(format!("corrupt document {}: {e}", path.display()))
                })?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_doc(&self, collection: &str, id: &str, doc: &Value) -> TollgateResult<()> {
        let dir = self.collection_dir(collection)?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.doc_path(collection, id)?;
        let tmp = dir.join(format!(".{id}.json.tmp"));
        let json = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Ids and collection names become path segments; keep them boring.
pub(crate) fn validate_segment(segment: &str) -> TollgateResult<()> {
    let ok = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(TollgateError::Validation(format!(
            "invalid document path segment: {segment:?}"
        )))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> TollgateResult<Option<Value>> {
        let path = self.doc_path(collection, id)?;
        Self::read_doc(&path).await
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> TollgateResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_doc(collection, id, &doc).await
    }

    async fn update(&self, collection: &str, id: &str, partial: Value) -> TollgateResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.doc_path(collection, id)?;
        let mut doc = Self::read_doc(&path)
            .await?
            .ok_or_else(|| TollgateError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        merge_partial(&mut doc, partial)?;
        self.write_doc(collection, id, &doc).await
    }

    async fn query(&self, collection: &str, query: &Query) -> TollgateResult<Vec<Value>> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_doc = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'));
            if !is_doc {
                continue;
            }
            if let Some(doc) = Self::read_doc(&path).await? {
                docs.push(doc);
            }
        }
        Ok(query.apply(docs))
    }
}
