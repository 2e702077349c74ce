//! S3-compatible HTTP blob store.
//!
//! Talks plain HTTP to an S3-like endpoint (MinIO, object-storage gateways):
//! `GET`/`PUT`/`HEAD`/`DELETE` on `<base>/<path>`, plus ListObjectsV2 for
//! prefix deletion. Authentication is an optional bearer token; signed
//! requests belong to a fronting gateway.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{BlobStats, BlobStore, BlobStoreError, BoxFuture};

/// Blob store over an S3-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    base_url: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpBlobStore {
    /// Creates a store against `base_url` (scheme + host + bucket path).
    pub fn new(base_url: impl Into<String>, bearer: Option<String>) -> Result<Self, BlobStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BlobStoreError::Backend(format!("http client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer,
            client,
        })
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn map_err(e: reqwest::Error) -> BlobStoreError {
        if e.is_connect() || e.is_timeout() {
            BlobStoreError::Unavailable(e.to_string())
        } else {
            BlobStoreError::Backend(e.to_string())
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), BlobStoreError> {
        let mut url = format!(
            "{}?list-type=2&prefix={}&max-keys=1000",
            self.base_url, prefix
        );
        if let Some(token) = continuation {
            url.push_str(&format!("&continuation-token={token}"));
        }
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(Self::map_err)?;
        if !resp.status().is_success() {
            return Err(BlobStoreError::Backend(format!(
                "list failed with HTTP {}",
                resp.status()
            )));
        }
        let body = resp.text().await.map_err(Self::map_err)?;
        let keys = extract_tags(&body, "Key");
        let truncated = extract_tags(&body, "IsTruncated")
            .first()
            .map(|v| v.as_str() == "true")
            .unwrap_or(false);
        let next = truncated
            .then(|| extract_tags(&body, "NextContinuationToken").into_iter().next())
            .flatten();
        Ok((keys, next))
    }
}

/// Pulls the text content of every `<tag>...</tag>` pair out of a ListObjects
/// response. The fields we need are flat and unattributed, so a scan is
/// enough; no XML dependency.
fn extract_tags(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                out.push(after[..end].to_string());
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

impl BlobStore for HttpBlobStore {
    fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        ttl_hint: Duration,
    ) -> BoxFuture<'_, Result<(), BlobStoreError>> {
        let url = self.object_url(path);
        let content_type = content_type.to_string();
        Box::pin(async move {
            let resp = self
                .authed(self.client.put(&url))
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .header(
                    reqwest::header::CACHE_CONTROL,
                    format!("public, max-age={}", ttl_hint.as_secs()),
                )
                .body(bytes)
                .send()
                .await
                .map_err(Self::map_err)?;
            if resp.status().is_success() {
                debug!(url = %url, "blob uploaded");
                Ok(())
            } else {
                Err(BlobStoreError::Backend(format!(
                    "put failed with HTTP {}",
                    resp.status()
                )))
            }
        })
    }

    fn get(&self, path: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, BlobStoreError>> {
        let url = self.object_url(path);
        Box::pin(async move {
            let resp = self
                .authed(self.client.get(&url))
                .send()
                .await
                .map_err(Self::map_err)?;
            match resp.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    let bytes = resp.bytes().await.map_err(Self::map_err)?;
                    Ok(Some(bytes.to_vec()))
                }
                status => Err(BlobStoreError::Backend(format!(
                    "get failed with HTTP {status}"
                ))),
            }
        })
    }

    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool, BlobStoreError>> {
        let url = self.object_url(path);
        Box::pin(async move {
            let resp = self
                .authed(self.client.head(&url))
                .send()
                .await
                .map_err(Self::map_err)?;
            match resp.status() {
                StatusCode::NOT_FOUND => Ok(false),
                status if status.is_success() => Ok(true),
                status => Err(BlobStoreError::Backend(format!(
                    "head failed with HTTP {status}"
                ))),
            }
        })
    }

    fn delete_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<u64, BlobStoreError>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut removed = 0u64;
            let mut continuation: Option<String> = None;
            loop {
                let (keys, next) = self.list_page(&prefix, continuation.as_deref()).await?;
                if keys.is_empty() && next.is_none() {
                    break;
                }
                for key in keys {
                    let resp = self
                        .authed(self.client.delete(self.object_url(&key)))
                        .send()
                        .await
                        .map_err(Self::map_err)?;
                    if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
                        removed += 1;
                    } else {
                        warn!(key = %key, status = %resp.status(), "blob delete failed");
                    }
                }
                match next {
                    Some(token) => continuation = Some(token),
                    None => break,
                }
            }
            Ok(removed)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<BlobStats, BlobStoreError>> {
        // Remote stores only offer paginated listings; counting the whole
        // bucket on a stats call is not worth the round trips.
        Box::pin(async move { Ok(BlobStats::default()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let store = HttpBlobStore::new("http://minio:9000/tiles-cache/", None).unwrap();
        assert_eq!(
            store.object_url("tiles/a.png"),
            "http://minio:9000/tiles-cache/tiles/a.png"
        );
    }

    #[test]
    fn test_extract_tags() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>false</IsTruncated>
            <Contents><Key>tiles/a.png</Key><Size>10</Size></Contents>
            <Contents><Key>tiles/b.png</Key><Size>20</Size></Contents>
        </ListBucketResult>"#;
        assert_eq!(extract_tags(xml, "Key"), vec!["tiles/a.png", "tiles/b.png"]);
        assert_eq!(extract_tags(xml, "IsTruncated"), vec!["false"]);
        assert!(extract_tags(xml, "NextContinuationToken").is_empty());
    }

    #[test]
    fn test_extract_tags_unclosed() {
        assert!(extract_tags("<Key>oops", "Key").is_empty());
    }

    #[tokio::test]
    async fn test_get_against_unreachable_host_is_unavailable() {
        let store = HttpBlobStore::new("http://127.0.0.1:1/none", None).unwrap();
        let err = store.get("tiles/a.png").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::Unavailable(_)));
    }
}
