use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use super::{ObjectReader, ObjectSink, ObjectStore};

/// Chunks buffered between the sink and the outbound request body.
const UPLOAD_CHANNEL_DEPTH: usize = 16;

/// HTTP object store speaking plain bucket-addressed GET/PUT.
///
/// Objects live at `{base}/{bucket}/{object}`. Authentication is expected
/// to sit in front of the store (gateway or network policy), which is also
/// why upload grants carry only an expiry and a nonce rather than a
/// cryptographic signature.
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, bucket: &str) -> Result<Self> {
        // No overall request timeout: relayed uploads can legitimately run
        // for a long time
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        })
    }

    fn object_path(&self, object: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, object)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn open_read(&self, object: &str) -> Result<ObjectReader> {
        let resp = self
            .client
            .get(self.object_path(object))
            .send()
            .await
            .with_context(|| format!("GET {object} failed"))?;

        if !resp.status().is_success() {
            bail!("HTTP request for {object} failed with status: {}", resp.status());
        }

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn open_write(&self, object: &str, content_type: &str) -> Result<Box<dyn ObjectSink>> {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(UPLOAD_CHANNEL_DEPTH);
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
        let request = self
            .client
            .put(self.object_path(object))
            .header("Content-Type", content_type)
            .body(body);

        let object = object.to_string();
        let upload: JoinHandle<Result<()>> = tokio::spawn(async move {
            let resp = request.send().await?;
            if !resp.status().is_success() {
                bail!("Upload of {object} failed with status: {}", resp.status());
            }
            Ok(())
        });

        Ok(Box::new(HttpObjectSink {
            tx: Some(tx),
            upload,
        }))
    }

    fn upload_grant(&self, object: &str, content_type: &str, ttl: Duration) -> String {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            + ttl;
        format!(
            "{}?contentType={}&expires={}&token={}",
            self.object_path(object),
            content_type,
            expires.as_secs(),
            Uuid::new_v4()
        )
    }

    fn object_url(&self, object: &str) -> String {
        self.object_path(object)
    }
}

struct HttpObjectSink {
    tx: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    upload: JoinHandle<Result<()>>,
}

#[async_trait]
impl ObjectSink for HttpObjectSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let Some(tx) = &self.tx else {
            bail!("upload already closed");
        };
        if tx.send(Ok(chunk)).await.is_err() {
            bail!("upload connection closed early");
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        // Dropping the sender ends the request body; the response settles
        // only once the store has accepted the full object
        this.tx.take();
        this.upload.await.context("upload task panicked")?
    }

    async fn abort(self: Box<Self>) {
        let mut this = *self;
        if let Some(tx) = this.tx.take() {
            // Poison the body stream so the request fails instead of
            // finishing as a short, apparently-valid object
            let _ = tx
                .send(Err(std::io::Error::other("upload aborted")))
                .await;
        }
        let _ = this.upload.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_carries_expiry_and_nonce() {
        let store = HttpObjectStore::new("http://storage.local/", "bucket").unwrap();
        let url = store.upload_grant("incoming/s1/a.zip", "application/zip", Duration::from_secs(900));

        assert!(url.starts_with("http://storage.local/bucket/incoming/s1/a.zip?"));
        assert!(url.contains("contentType=application/zip"));
        assert!(url.contains("expires="));
        assert!(url.contains("token="));
    }

    #[test]
    fn object_url_is_deterministic() {
        let store = HttpObjectStore::new("http://storage.local", "bucket").unwrap();
        assert_eq!(
            store.object_url("unzipped/x.png"),
            "http://storage.local/bucket/unzipped/x.png"
        );
    }
}
