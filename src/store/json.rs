use crate::error::{Error, Result};
use crate::store::{Collection, Store};
use crate::util::blocking;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

/// One pretty-printed JSON file per document: `<root>/<collection>/<key>.json`.
///
/// Each write goes to its own temp file that is renamed over the target, so
/// readers never observe a half-written document. Writes to one document
/// are serialised.
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn document_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, collection: Collection, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('.')
            || key.contains(['/', '\\'])
        {
            return Err(Error::Persistence(format!("invalid document key '{}'", key)));
        }
        Ok(self
            .root
            .join(collection.as_str())
            .join(format!("{}.json", key)))
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Persistence(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn read_document(path: &Path) -> Result<Option<serde_json::Value>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn upsert(
        &self,
        collection: Collection,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let path = self.document_path(collection, key)?;
        let contents = serde_json::to_string_pretty(&value)?;
        debug!(path = %path.display(), "JsonStore::upsert");
        let lock = self.document_lock(&path);
        let _guard = lock.lock().await;
        blocking(move || write_atomic(&path, &contents)).await
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.document_path(collection, key)?;
        blocking(move || read_document(&path)).await
    }

    async fn list(&self, collection: Collection) -> Result<Vec<serde_json::Value>> {
        let dir = self.root.join(collection.as_str());
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            paths.sort();
            let mut docs = Vec::with_capacity(paths.len());
            for path in paths {
                if let Some(doc) = read_document(&path)? {
                    docs.push(doc);
                }
            }
            Ok(docs)
        })
        .await
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        let path = self.document_path(collection, key)?;
        let lock = self.document_lock(&path);
        let _guard = lock.lock().await;
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        let root = self.root.clone();
        blocking(move || {
            fs::create_dir_all(&root)?;
            let probe = root.join(".ping");
            fs::write(&probe, b"ok")?;
            fs::remove_file(&probe)?;
            Ok(())
        })
        .await
    }
}
