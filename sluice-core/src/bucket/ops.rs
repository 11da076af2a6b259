//! Single-shot bucket operations
//!
//! Plain request/response endpoints: delete, multi-object delete, and
//! object metadata. The streaming pipelines live in `crate::stream`.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::info;

use super::{service_error, Bucket};
use crate::error::{Result, SluiceError};

/// Upper bound on keys per multi-delete request, fixed by the S3 API
const MULTI_DELETE_MAX: usize = 1000;

impl Bucket {
    /// Delete the object at `path` along with its md5 sidecar.
    ///
    /// Deleting a key that does not exist is not an error.
    pub async fn delete(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(SluiceError::EmptyPath);
        }
        self.delete_one(path).await?;
        self.delete_one(&super::md5_sidecar_path(path)).await?;
        info!(path, bucket = %self.name(), "object deleted");
        Ok(())
    }

    async fn delete_one(&self, path: &str) -> Result<()> {
        let url = self.object_url(path)?;
        let resp = self
            .retry_request(Method::DELETE, url, None, None)
            .await?;
        if resp.status().as_u16() != 204 {
            return Err(service_error(resp).await);
        }
        Ok(())
    }

    /// Delete many keys, batching `MULTI_DELETE_MAX` per request
    pub async fn multi_delete(&self, paths: &[String]) -> Result<()> {
        for batch in paths.chunks(MULTI_DELETE_MAX) {
            self.multi_delete_batch(batch).await?;
        }
        info!(
            count = paths.len(),
            bucket = %self.name(),
            "keys deleted"
        );
        Ok(())
    }

    async fn multi_delete_batch(&self, keys: &[String]) -> Result<()> {
        let body = multi_delete_body(keys);
        let digest = md5::compute(body.as_bytes());

        let mut url = self.object_url("")?;
        url.set_query(Some("delete"));

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("content-md5"),
            HeaderValue::from_str(&BASE64_STANDARD.encode(digest.0)).map_err(|e| {
                SluiceError::Internal {
                    message: format!("content-md5 header: {e}"),
                }
            })?,
        );

        let resp = self
            .retry_request(Method::POST, url, Some(&headers), Some(Bytes::from(body)))
            .await?;
        if resp.status().as_u16() != 200 {
            return Err(service_error(resp).await);
        }
        Ok(())
    }

    /// Fetch the object's response headers without its body.
    ///
    /// Returns [`SluiceError::ObjectNotExist`] on 404.
    pub async fn object_metadata(&self, path: &str) -> Result<HeaderMap> {
        if path.is_empty() {
            return Err(SluiceError::EmptyPath);
        }
        let url = self.object_url(path)?;
        let resp = self.retry_request(Method::HEAD, url, None, None).await?;
        match resp.status().as_u16() {
            200 => Ok(resp.headers().clone()),
            404 => Err(SluiceError::ObjectNotExist),
            _ => Err(service_error(resp).await),
        }
    }
}

fn multi_delete_body(keys: &[String]) -> String {
    let mut body = String::with_capacity(64 + keys.len() * 48);
    body.push_str("<Delete><Quiet>true</Quiet>");
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&quick_xml::escape::escape(key.as_str()));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    body
}
