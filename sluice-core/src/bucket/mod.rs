//! Buckets, configuration, and request plumbing
//!
//! An [`Endpoint`] names an S3-compatible service, a [`Bucket`] binds it
//! to a bucket name, a signer, and a [`Config`]. All URL construction and
//! signed request dispatch for the pipelines lives here.

pub mod list;
pub mod ops;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Url};
use tracing::debug;

use crate::error::{Result, ServiceError, SluiceError};
use crate::sign::RequestSigner;

pub use list::{KeyContent, Listing};

/// Default part size for multipart gets and puts (20 MiB)
pub const DEFAULT_PART_SIZE: u64 = 20 * 1024 * 1024;

/// Default number of concurrent part transfers
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default maximum attempts per part
pub const DEFAULT_N_TRY: u32 = 10;

/// Default endpoint for the U.S. S3 service
pub const DEFAULT_DOMAIN: &str = "s3.amazonaws.com";

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

const VERSION_PARAM: &str = "versionId";

/// RFC 3986 unreserved characters and `/` stay literal in object paths;
/// everything else (including `+`, `,`, and `?`) is percent-encoded.
const PATH_ESCAPE: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Query values additionally escape `/`
const QUERY_ESCAPE: AsciiSet = PATH_ESCAPE.add(b'/');

/// Configuration for transfer pipelines
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP client used for all requests; carries its own timeout
    pub client: Client,
    /// Number of parts to get or put concurrently
    pub concurrency: usize,
    /// Initial part size in bytes for multipart gets and puts
    pub part_size: u64,
    /// Maximum attempts for each part
    pub n_try: u32,
    /// Store the object's md5 at `.md5/<key>.md5` on put and verify it on get
    pub md5_check: bool,
    /// URL scheme, `https` by default
    pub scheme: String,
    /// Use path-style bucket addressing instead of virtual-host style
    pub path_style: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: client_with_timeout(CLIENT_TIMEOUT),
            concurrency: DEFAULT_CONCURRENCY,
            part_size: DEFAULT_PART_SIZE,
            n_try: DEFAULT_N_TRY,
            md5_check: true,
            scheme: "https".to_string(),
            path_style: false,
        }
    }
}

/// Build an HTTP client with the given total request timeout
pub fn client_with_timeout(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .expect("HTTP client construction")
}

/// An S3-compatible service endpoint
#[derive(Debug, Clone)]
pub struct Endpoint {
    domain: String,
}

impl Endpoint {
    /// An empty domain falls back to [`DEFAULT_DOMAIN`]
    pub fn new(domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            domain: if domain.is_empty() {
                DEFAULT_DOMAIN.to_string()
            } else {
                domain
            },
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Service region inferred from the domain
    pub fn region(&self) -> Option<String> {
        crate::sign::infer_region(&self.domain)
    }

    /// Bind this endpoint to a bucket
    pub fn bucket(&self, name: impl Into<String>, signer: Arc<dyn RequestSigner>) -> Bucket {
        Bucket::new(self.clone(), name, signer)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

/// A bucket on an S3-compatible service
#[derive(Clone)]
pub struct Bucket {
    endpoint: Endpoint,
    name: String,
    signer: Arc<dyn RequestSigner>,
    config: Config,
}

impl Bucket {
    pub fn new(endpoint: Endpoint, name: impl Into<String>, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            endpoint,
            name: name.into(),
            signer,
            config: Config::default(),
        }
    }

    /// Replace the default configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the request URL for an object path.
    ///
    /// A `?versionId=<v>` suffix is lifted out of the path and re-encoded
    /// as the request query; any other `?` is treated as part of the key
    /// and escaped. Buckets with a dot in the name are always addressed
    /// path-style because virtual-host TLS certificates cannot match them.
    pub(crate) fn object_url(&self, path: &str) -> Result<Url> {
        let (key_path, version) = split_version(path);

        let (host, full_path) = if self.name.contains('.') || self.config.path_style {
            (
                self.endpoint.domain.clone(),
                clean_path(&format!("/{}/{}", self.name, key_path)),
            )
        } else {
            (
                format!("{}.{}", self.name, self.endpoint.domain),
                clean_path(&format!("/{key_path}")),
            )
        };

        let mut raw = format!(
            "{}://{}{}",
            self.config.scheme,
            host,
            utf8_percent_encode(&full_path, &PATH_ESCAPE)
        );
        if let Some(v) = version {
            raw.push('?');
            raw.push_str(VERSION_PARAM);
            raw.push('=');
            raw.push_str(&utf8_percent_encode(&v, &QUERY_ESCAPE).to_string());
        }
        Url::parse(&raw).map_err(|e| SluiceError::Internal {
            message: format!("invalid object url {raw:?}: {e}"),
        })
    }

    /// Sign and dispatch a request
    pub(crate) async fn send(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        self.signer.sign(&mut request);
        self.config
            .client
            .execute(request)
            .await
            .map_err(SluiceError::from)
    }

    /// Dispatch with transport-level retry.
    ///
    /// Responses are returned regardless of status; only connection and
    /// body failures are retried, up to `n_try` attempts.
    pub(crate) async fn retry_request(
        &self,
        method: Method,
        url: Url,
        headers: Option<&HeaderMap>,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let n_try = self.config.n_try.max(1);
        let mut last = None;
        for attempt in 0..n_try {
            let mut request = reqwest::Request::new(method.clone(), url.clone());
            if let Some(h) = headers {
                *request.headers_mut() = h.clone();
            }
            if let Some(b) = &body {
                *request.body_mut() = Some(reqwest::Body::from(b.clone()));
            }
            match self.send(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!(attempt, error = %e, %url, "request attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(SluiceError::Internal {
            message: "request retries exhausted".to_string(),
        }))
    }
}

/// Consume a non-2xx response into a structured service error
pub(crate) async fn service_error(resp: reqwest::Response) -> SluiceError {
    let status = resp.status().as_u16();
    let body = resp.bytes().await.unwrap_or_default();
    SluiceError::Service(ServiceError::from_xml(status, &body))
}

/// Sidecar object path holding the md5 digest for `path`
pub(crate) fn md5_sidecar_path(path: &str) -> String {
    format!(".md5/{}.md5", path.trim_start_matches('/'))
}

/// Lift a trailing `?versionId=<v>` query off an object path
fn split_version(path: &str) -> (&str, Option<String>) {
    if let Some((key, query)) = path.split_once('?') {
        let version = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("versionId=").map(str::to_string));
        if version.is_some() {
            return (key, version);
        }
    }
    // no version parameter: any '?' belongs to the key itself
    (path, None)
}

/// Normalize an absolute path: collapse repeats, resolve `.` and `..`
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}
