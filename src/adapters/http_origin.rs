//! HTTP Origin Adapter
//!
//! `OriginStore` over plain HTTP: HEAD for sizes, streamed GET for bodies.
//! Objects live at `<base_url>/<storage key>`.

use std::io;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::cache::ByteStream;
use crate::domain::ports::OriginStore;
use crate::error::{Error, Result};

/// Origin blob store reachable over HTTP
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: Client,
    base_url: String,
}

impl HttpOrigin {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn check_status(key: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        let reason = if status == StatusCode::NOT_FOUND {
            "no such object".to_string()
        } else {
            format!("unexpected status {}", status)
        };
        Err(Error::Origin {
            key: key.to_string(),
            reason,
        })
    }
}

#[async_trait]
impl OriginStore for HttpOrigin {
    async fn stat_object(&self, key: &str) -> Result<u64> {
        let url = self.object_url(key);
        let response = self.client.head(&url).send().await?;
        Self::check_status(key, response.status())?;

        // Read the header directly: a HEAD response has no body to size
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| Error::Origin {
                key: key.to_string(),
                reason: "missing Content-Length".to_string(),
            })?;

        debug!("Origin stat {} -> {} bytes", url, size);
        Ok(size)
    }

    async fn get_object(&self, key: &str) -> Result<ByteStream> {
        let url = self.object_url(key);
        let response = self.client.get(&url).send().await?;
        Self::check_status(key, response.status())?;

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(body)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_object_url_joins_cleanly() {
        let origin = HttpOrigin::new("https://blobs.example.com/models/").unwrap();
        assert_eq!(
            origin.object_url("/scene/a.glb"),
            "https://blobs.example.com/models/scene/a.glb"
        );
        assert_eq!(
            origin.object_url("b.glb"),
            "https://blobs.example.com/models/b.glb"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(HttpOrigin::check_status("k", StatusCode::OK).is_ok());
        assert_matches!(
            HttpOrigin::check_status("k", StatusCode::NOT_FOUND),
            Err(Error::Origin { ref reason, .. }) if reason == "no such object"
        );
        assert_matches!(
            HttpOrigin::check_status("k", StatusCode::BAD_GATEWAY),
            Err(Error::Origin { ref reason, .. }) if reason.contains("502")
        );
    }
}
