//! Content-addressed storage for metadata documents.

use std::{fmt, future::Future, time::Duration};

use reqwest::{
    StatusCode,
    multipart::{Form, Part},
};
use serde::Deserialize;
use url::Url;

use crate::{
    error::StoreError,
    metadata::{ContentRef, MetadataKind},
};

/// URI scheme prefixed to content identifiers.
pub const IPFS_SCHEME: &str = "ipfs://";

/// Uploads payloads to content-addressed storage.
///
/// Byte-identical payloads must yield the same URI.
pub trait ContentStore {
    fn upload(
        &self,
        kind: MetadataKind,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<ContentRef, StoreError>> + Send;
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// An IPFS HTTP `add` endpoint authenticated with a static API key.
pub struct IpfsStore {
    client: reqwest::Client,
    api_url: Url,
    api_key: Option<String>,
}

impl fmt::Debug for IpfsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpfsStore")
            .field("api_url", &self.api_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl IpfsStore {
    pub fn new(api_url: Url, api_key: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url,
            api_key,
        })
    }
}

impl ContentStore for IpfsStore {
    async fn upload(&self, kind: MetadataKind, payload: Vec<u8>) -> Result<ContentRef, StoreError> {
        let size = payload.len();
        let part = Part::bytes(payload)
            .file_name(format!("{}-metadata.json", kind))
            .mime_str("application/json")
            .map_err(|e| StoreError::Rejected(e.to_string()))?;

        let mut request = self
            .client
            .post(self.api_url.clone())
            .multipart(Form::new().part("path", part));
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("malformed add response: {}", e)))?;

        if added.hash.trim().is_empty() {
            return Err(StoreError::Unavailable(
                "add response carries an empty hash".to_string(),
            ));
        }

        let uri = format!("{}{}", IPFS_SCHEME, added.hash.trim());
        tracing::debug!(%kind, size, %uri, "Payload stored");

        Ok(ContentRef { kind, uri })
    }
}

/// Map a non-success HTTP status onto the store error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> StoreError {
    let detail = format!("HTTP {}: {}", status, body.trim());
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StoreError::Unavailable(detail),
        s if s.is_client_error() => StoreError::Rejected(detail),
        _ => StoreError::Unavailable(detail),
    }
}
