use async_trait::async_trait;
use bytes::Bytes;
use ferry_storage::{ByteStream, Metadata, RemoteFilesystem, StorageError, StorageResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

struct MockObject {
    content: Bytes,
    token: String,
}

/// In-memory backend that counts content downloads, so tests can observe
/// when the cache short-circuits a transfer.
#[derive(Default)]
pub struct CountingBackend {
    objects: Mutex<HashMap<String, MockObject>>,
    open_calls: AtomicUsize,
    put_seq: AtomicUsize,
    strip_tokens: AtomicBool,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an object with an explicit revision token.
    pub fn insert(&self, key: &str, content: &[u8], token: &str) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MockObject {
                content: Bytes::copy_from_slice(content),
                token: token.to_string(),
            },
        );
    }

    /// Number of content downloads served so far.
    pub fn open_count(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Simulate a degraded backend that stops supplying revision tokens.
    pub fn strip_tokens(&self, strip: bool) {
        self.strip_tokens.store(strip, Ordering::SeqCst);
    }

    fn lookup(&self, path: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .map(|obj| obj.content.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn has_children(&self, path: &str) -> bool {
        let dir_prefix = format!("{}/", path.trim_end_matches('/'));
        self.objects
            .lock()
            .unwrap()
            .keys()
            .any(|key| key.starts_with(&dir_prefix))
    }
}

#[async_trait]
impl RemoteFilesystem for CountingBackend {
    async fn info(&self, path: &str) -> StorageResult<Metadata> {
        let objects = self.objects.lock().unwrap();
        if let Some(obj) = objects.get(path) {
            let revision_token = if self.strip_tokens.load(Ordering::SeqCst) {
                None
            } else {
                Some(obj.token.clone())
            };
            return Ok(Metadata {
                size: Some(obj.content.len() as u64),
                revision_token,
                is_directory: false,
            });
        }
        drop(objects);

        if self.has_children(path) {
            return Ok(Metadata {
                size: None,
                revision_token: None,
                is_directory: true,
            });
        }
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn open(&self, path: &str) -> StorageResult<ByteStream> {
        let content = self.lookup(path)?;
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        // Split into small chunks so the incremental hashing path is real.
        let chunks: Vec<StorageResult<Bytes>> = content
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn get(&self, path: &str, local: &Path) -> StorageResult<()> {
        let content = self.lookup(path)?;
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, &content)?;
        Ok(())
    }

    async fn put(&self, local: &Path, path: &str) -> StorageResult<()> {
        let content = std::fs::read(local)?;
        let token = format!("tok-{}", self.put_seq.fetch_add(1, Ordering::SeqCst));
        self.insert(path, &content, &token);
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let mut objects = self.objects.lock().unwrap();
        if recursive {
            let dir_prefix = format!("{}/", path.trim_end_matches('/'));
            objects.retain(|key, _| key != path && !key.starts_with(&dir_prefix));
            return Ok(());
        }
        objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let dir_prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let objects = self.objects.lock().unwrap();
        let mut results: Vec<String> = objects
            .keys()
            .filter(|key| key.starts_with(&dir_prefix))
            .cloned()
            .collect();
        results.sort();
        Ok(results)
    }

    async fn mkdirs(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let direct = self.objects.lock().unwrap().contains_key(path);
        Ok(direct || self.has_children(path))
    }

    async fn isfile(&self, path: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }

    async fn isdir(&self, path: &str) -> StorageResult<bool> {
        Ok(self.has_children(path))
    }

    fn backend_name(&self) -> &'static str {
        "counting-mock"
    }
}
