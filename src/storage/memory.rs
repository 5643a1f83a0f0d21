use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::{ObjectReader, ObjectSink, ObjectStore};

/// In-memory object store for tests and local development runs.
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    write_faults: Arc<Mutex<HashMap<String, String>>>,
    base_url: String,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            write_faults: Arc::new(Mutex::new(HashMap::new())),
            base_url: format!("memory://{bucket}"),
        }
    }

    /// Seed an object directly.
    pub fn insert(&self, object: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(object.to_string(), data.into());
    }

    pub fn get(&self, object: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(object)
            .cloned()
    }

    /// Make the next write to `object` fail with `message`.
    pub fn fail_writes(&self, object: &str, message: &str) {
        self.write_faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(object.to_string(), message.to_string());
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_read(&self, object: &str) -> Result<ObjectReader> {
        let data = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(object)
            .cloned();
        match data {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.to_vec()))),
            None => bail!("object not found: {object}"),
        }
    }

    async fn open_write(&self, object: &str, _content_type: &str) -> Result<Box<dyn ObjectSink>> {
        let fault = self
            .write_faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(object);

        Ok(Box::new(MemoryObjectSink {
            object: object.to_string(),
            buffer: Vec::new(),
            objects: Arc::clone(&self.objects),
            fault,
        }))
    }

    fn upload_grant(&self, object: &str, content_type: &str, ttl: Duration) -> String {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            + ttl;
        format!(
            "{}/{}?contentType={}&expires={}&token={}",
            self.base_url,
            object,
            content_type,
            expires.as_secs(),
            Uuid::new_v4()
        )
    }

    fn object_url(&self, object: &str) -> String {
        format!("{}/{}", self.base_url, object)
    }
}

struct MemoryObjectSink {
    object: String,
    buffer: Vec<u8>,
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    fault: Option<String>,
}

#[async_trait]
impl ObjectSink for MemoryObjectSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        if let Some(message) = self.fault {
            bail!("{message}");
        }
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.object, Bytes::from(self.buffer));
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let store = MemoryObjectStore::new("test");

        let mut sink = store.open_write("a/b.txt", "text/plain").await.unwrap();
        sink.write_chunk(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write_chunk(Bytes::from_static(b"world")).await.unwrap();
        sink.finish().await.unwrap();

        let mut reader = store.open_read("a/b.txt").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn injected_fault_fails_finish_and_stores_nothing() {
        let store = MemoryObjectStore::new("test");
        store.fail_writes("x.bin", "disk full");

        let mut sink = store.open_write("x.bin", "application/octet-stream").await.unwrap();
        sink.write_chunk(Bytes::from_static(b"data")).await.unwrap();
        let err = sink.finish().await.unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        assert!(store.get("x.bin").is_none());
    }

    #[tokio::test]
    async fn aborted_upload_stores_nothing() {
        let store = MemoryObjectStore::new("test");

        let mut sink = store.open_write("y.bin", "application/octet-stream").await.unwrap();
        sink.write_chunk(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await;

        assert!(store.get("y.bin").is_none());
    }

    #[tokio::test]
    async fn missing_object_is_an_error() {
        let store = MemoryObjectStore::new("test");
        assert!(store.open_read("nope").await.is_err());
    }
}
