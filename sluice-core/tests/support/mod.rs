//! In-process S3 stub for integration tests
//!
//! Speaks just enough HTTP/1.1 for the transfer engine: ranged GETs,
//! plain and multipart PUTs, delete, multi-delete, and ListObjectsV2.
//! State is shared so tests can inspect stored objects and upload
//! bookkeeping after the fact.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const BUCKET: &str = "bkt";

#[derive(Default)]
pub struct StubState {
    pub objects: HashMap<String, Vec<u8>>,
    pub uploads: HashMap<String, Upload>,
    pub aborted: Vec<String>,
    pub completed: Vec<String>,
    pub last_completed_parts: Vec<u32>,
    pub ranged_gets: usize,
    pub next_upload: u64,
    /// Artificial latency for ranged GETs
    pub get_delay: Duration,
    /// Artificial latency for part PUTs
    pub put_delay: Duration,
}

pub struct Upload {
    pub key: String,
    pub parts: BTreeMap<u32, Vec<u8>>,
}

pub struct StubS3 {
    pub port: u16,
    pub state: Arc<Mutex<StubState>>,
}

impl StubS3 {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(StubState::default()));

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(conn, conn_state).await;
                });
            }
        });

        Self { port, state }
    }

    pub fn domain(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn put_object(&self, key: &str, data: Vec<u8>) {
        self.state.lock().objects.insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    pub fn completed_uploads(&self) -> Vec<String> {
        self.state.lock().completed.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    pub fn set_get_delay(&self, delay: Duration) {
        self.state.lock().get_delay = delay;
    }

    pub fn set_put_delay(&self, delay: Duration) {
        self.state.lock().put_delay = delay;
    }

    pub fn ranged_gets(&self) -> usize {
        self.state.lock().ranged_gets
    }

    pub fn last_completed_parts(&self) -> Vec<u32> {
        self.state.lock().last_completed_parts.clone()
    }
}

struct Request {
    method: String,
    key: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn serve(conn: TcpStream, state: Arc<Mutex<StubState>>) -> std::io::Result<()> {
    let (read_half, mut write_half) = conn.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = match read_request(&mut reader).await? {
            Some(req) => req,
            None => return Ok(()),
        };
        let head_only = request.method == "HEAD";
        let response = route(&request, &state).await;
        write_response(&mut write_half, response, head_only).await?;
    }
}

async fn read_request(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Option<Request>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut pieces = line.trim_end().split_whitespace();
    let method = pieces.next().unwrap_or_default().to_string();
    let target = pieces.next().unwrap_or_default().to_string();
    if method.is_empty() || target.is_empty() {
        return Ok(None);
    }

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await? == 0 {
            return Ok(None);
        }
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let body = if let Some(len) = headers.get("content-length") {
        let len: usize = len.parse().unwrap_or(0);
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        body
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked(reader).await?
    } else {
        Vec::new()
    };

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target.as_str(), ""),
    };
    let decoded = percent_decode_str(raw_path).decode_utf8_lossy().to_string();
    let key = decoded
        .strip_prefix(&format!("/{BUCKET}"))
        .unwrap_or(&decoded)
        .trim_start_matches('/')
        .to_string();

    let mut query = HashMap::new();
    for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(
            name.to_string(),
            percent_decode_str(value)
                .decode_utf8_lossy()
                .replace('+', " "),
        );
    }

    Ok(Some(Request {
        method,
        key,
        query,
        headers,
        body,
    }))
}

async fn read_chunked(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
        if size == 0 {
            // trailing CRLF after the last chunk
            let mut crlf = String::new();
            let _ = reader.read_line(&mut crlf).await?;
            return Ok(body);
        }
        let mut chunk = vec![0u8; size + 2];
        reader.read_exact(&mut chunk).await?;
        chunk.truncate(size);
        body.extend_from_slice(&chunk);
    }
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }

    fn xml_error(status: u16, code: &str, message: &str) -> Self {
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>{code}</Code><Message>{message}</Message>\
             <Resource>/</Resource><RequestId>stub-req-1</RequestId></Error>"
        );
        Self::new(status, body.into_bytes())
    }
}

async fn write_response(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    response: Response,
    head_only: bool,
) -> std::io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", response.body.len()));
    writer.write_all(head.as_bytes()).await?;
    if !head_only {
        writer.write_all(&response.body).await?;
    }
    writer.flush().await
}

async fn route(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    match req.method.as_str() {
        "GET" if req.query.contains_key("list-type") => list_objects(req, state),
        "GET" => get_object(req, state).await,
        "HEAD" => head_object(req, state),
        "PUT" if req.query.contains_key("uploadId") => put_part(req, state).await,
        "PUT" => put_object(req, state),
        "POST" if req.query.contains_key("uploads") => initiate_upload(req, state),
        "POST" if req.query.contains_key("uploadId") => complete_upload(req, state),
        "POST" if req.query.contains_key("delete") => multi_delete(req, state),
        "DELETE" if req.query.contains_key("uploadId") => abort_upload(req, state),
        "DELETE" => {
            state.lock().objects.remove(&req.key);
            Response::new(204, Vec::new())
        }
        _ => Response::xml_error(400, "BadRequest", "unsupported request"),
    }
}

async fn get_object(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    let (data, delay) = {
        let mut guard = state.lock();
        if req.headers.contains_key("range") {
            guard.ranged_gets += 1;
        }
        (guard.objects.get(&req.key).cloned(), guard.get_delay)
    };
    let Some(data) = data else {
        return Response::xml_error(404, "NoSuchKey", "The specified key does not exist.");
    };
    match req.headers.get("range") {
        Some(range) => {
            let Some((start, end)) = parse_range(range, data.len()) else {
                return Response::xml_error(400, "InvalidRange", "bad range");
            };
            if !delay.is_zero() {
                // deterministic per-chunk jitter so completion order varies
                let factor = ((start / 1024) % 3) as u32 + 1;
                tokio::time::sleep(delay * factor).await;
            }
            Response::new(206, data[start..end].to_vec()).with_header(
                "Content-Range",
                format!("bytes {}-{}/{}", start, end - 1, data.len()),
            )
        }
        None => Response::new(200, data),
    }
}

fn head_object(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    match state.lock().objects.get(&req.key) {
        // body carried only as the Content-Length header; HEAD writes no body
        Some(data) => Response::new(200, data.clone()),
        None => Response::xml_error(404, "NoSuchKey", "The specified key does not exist."),
    }
}

fn put_object(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    if req.key.is_empty() {
        return Response::xml_error(400, "MissingKey", "A key must be specified");
    }
    let etag = format!("\"{:x}\"", md5::compute(&req.body));
    state
        .lock()
        .objects
        .insert(req.key.clone(), req.body.clone());
    Response::new(200, Vec::new()).with_header("ETag", etag)
}

fn initiate_upload(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    if req.key.is_empty() {
        return Response::xml_error(400, "MissingKey", "A key must be specified");
    }
    let mut guard = state.lock();
    guard.next_upload += 1;
    let upload_id = format!("upload-{}", guard.next_upload);
    guard.uploads.insert(
        upload_id.clone(),
        Upload {
            key: req.key.clone(),
            parts: BTreeMap::new(),
        },
    );
    let body = format!(
        "<InitiateMultipartUploadResult><Bucket>{BUCKET}</Bucket>\
         <Key>{}</Key><UploadId>{upload_id}</UploadId>\
         </InitiateMultipartUploadResult>",
        req.key
    );
    Response::new(200, body.into_bytes())
}

async fn put_part(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    let upload_id = req.query.get("uploadId").cloned().unwrap_or_default();
    let number: u32 = req
        .query
        .get("partNumber")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    let delay = state.lock().put_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let etag = format!("\"{:x}\"", md5::compute(&req.body));
    let mut guard = state.lock();
    let Some(upload) = guard.uploads.get_mut(&upload_id) else {
        return Response::xml_error(404, "NoSuchUpload", "The specified upload does not exist.");
    };
    upload.parts.insert(number, req.body.clone());
    Response::new(200, Vec::new()).with_header("ETag", etag)
}

fn complete_upload(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    let upload_id = req.query.get("uploadId").cloned().unwrap_or_default();
    let body = String::from_utf8_lossy(&req.body).to_string();

    // part numbers as listed in the completion document
    let mut listed: Vec<u32> = Vec::new();
    for piece in body.split("<PartNumber>").skip(1) {
        if let Some(end) = piece.find("</PartNumber>") {
            if let Ok(n) = piece[..end].parse() {
                listed.push(n);
            }
        }
    }
    if listed.windows(2).any(|w| w[0] >= w[1]) {
        return Response::xml_error(400, "InvalidPartOrder", "parts not in ascending order");
    }

    let mut guard = state.lock();
    let Some(upload) = guard.uploads.remove(&upload_id) else {
        return Response::xml_error(404, "NoSuchUpload", "The specified upload does not exist.");
    };
    guard.last_completed_parts = listed.clone();
    let mut assembled = Vec::new();
    for number in &listed {
        match upload.parts.get(number) {
            Some(part) => assembled.extend_from_slice(part),
            None => {
                return Response::xml_error(400, "InvalidPart", "listed part was never uploaded")
            }
        }
    }
    guard.objects.insert(upload.key.clone(), assembled);
    guard.completed.push(upload_id);
    let body = format!(
        "<CompleteMultipartUploadResult><Key>{}</Key>\
         </CompleteMultipartUploadResult>",
        upload.key
    );
    Response::new(200, body.into_bytes())
}

fn abort_upload(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    let upload_id = req.query.get("uploadId").cloned().unwrap_or_default();
    let mut guard = state.lock();
    guard.uploads.remove(&upload_id);
    guard.aborted.push(upload_id);
    Response::new(204, Vec::new())
}

fn multi_delete(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    let body = String::from_utf8_lossy(&req.body).to_string();
    let mut guard = state.lock();
    for piece in body.split("<Key>").skip(1) {
        if let Some(end) = piece.find("</Key>") {
            let key = piece[..end]
                .replace("&amp;", "&")
                .replace("&lt;", "<")
                .replace("&gt;", ">");
            guard.objects.remove(&key);
        }
    }
    Response::new(200, b"<DeleteResult/>".to_vec())
}

fn list_objects(req: &Request, state: &Arc<Mutex<StubState>>) -> Response {
    let prefix = req.query.get("prefix").cloned().unwrap_or_default();
    let guard = state.lock();
    let mut keys: Vec<&String> = guard
        .objects
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .collect();
    keys.sort();
    let mut body = String::from("<ListBucketResult><IsTruncated>false</IsTruncated>");
    for key in keys {
        let size = guard.objects[key].len();
        body.push_str(&format!(
            "<Contents><Key>{key}</Key><Size>{size}</Size>\
             <StorageClass>STANDARD</StorageClass></Contents>"
        ));
    }
    body.push_str("</ListBucketResult>");
    Response::new(200, body.into_bytes())
}

fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    if start > end || start >= len {
        return None;
    }
    Some((start, (end + 1).min(len)))
}

/// Bucket wired to the stub with test-friendly settings
pub fn bucket_for(
    stub: &StubS3,
    part_size: u64,
    concurrency: usize,
    md5_check: bool,
) -> sluice_core::Bucket {
    let config = sluice_core::Config {
        client: sluice_core::bucket::client_with_timeout(Duration::from_secs(30)),
        concurrency,
        part_size,
        n_try: 3,
        md5_check,
        scheme: "http".to_string(),
        path_style: true,
    };
    sluice_core::Endpoint::new(stub.domain())
        .bucket(BUCKET, Arc::new(sluice_core::AnonymousSigner))
        .with_config(config)
}

/// Poll until `check` passes or `timeout` elapses
pub async fn wait_for(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Deterministic pseudo-random payload for round-trip checks
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

/// `AsyncWrite` sink whose contents stay inspectable from the test body
#[derive(Clone, Default)]
pub struct SharedSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

impl tokio::io::AsyncWrite for SharedSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.buf.lock().extend_from_slice(data);
        std::task::Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
