//! Request/response client for the image API.
//!
//! Requests are submitted together with the session generation they belong
//! to and complete asynchronously. Completions are collected by polling, so
//! the caller decides on its own thread whether a result is still wanted.

use crate::config::Endpoints;
use crate::protocol::{CommentRecord, ImageSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Content types accepted for upload.
pub const SUPPORTED_IMAGE_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// API errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Http(String),
    #[error("Server responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response: {0}")]
    Decode(String),
    #[error("Request worker is not running")]
    WorkerGone,
}

/// A file chosen for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn is_supported_image(&self) -> bool {
        SUPPORTED_IMAGE_TYPES.contains(&self.content_type.as_str())
    }

    /// Title sent with the upload: the file name without its extension.
    pub fn title(&self) -> String {
        match self.file_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => self.file_name.clone(),
        }
    }
}

/// One API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRequest {
    CreateImage { title: String, upload: Upload },
    FetchImage { id: String },
    PostComment {
        id: String,
        left: f64,
        top: f64,
        message: String,
    },
}

/// Which kind of request a completion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    CreateImage,
    FetchImage,
    PostComment,
}

impl ApiRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            ApiRequest::CreateImage { .. } => RequestKind::CreateImage,
            ApiRequest::FetchImage { .. } => RequestKind::FetchImage,
            ApiRequest::PostComment { .. } => RequestKind::PostComment,
        }
    }
}

/// Result of a submitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCompletion {
    /// Session generation the request was issued under.
    pub generation: u64,
    pub kind: RequestKind,
    pub result: Result<ImageSnapshot, ApiError>,
}

/// Asynchronous image API.
pub trait ImageApi: Send {
    /// Start a request. The outcome is reported by a later poll.
    fn submit(&mut self, generation: u64, request: ApiRequest);

    /// Drain finished requests (non-blocking).
    fn poll_completions(&mut self) -> Vec<ApiCompletion>;
}

// ============================================================================
// HTTP client
// ============================================================================

mod http {
    use super::*;
    use reqwest::blocking::{Client, multipart};
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// HTTP client running requests on a background thread.
    pub struct HttpApi {
        job_tx: Option<Sender<(u64, ApiRequest)>>,
        done_rx: Receiver<ApiCompletion>,
        /// Completions produced without reaching the worker.
        local: Vec<ApiCompletion>,
        _thread: Option<JoinHandle<()>>,
    }

    impl HttpApi {
        pub fn new(endpoints: Endpoints) -> Self {
            let (job_tx, job_rx) = channel::<(u64, ApiRequest)>();
            let (done_tx, done_rx) = channel::<ApiCompletion>();

            let handle = thread::spawn(move || {
                let client = Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .map_err(|e| {
                        log::error!("Failed to build HTTP client: {}", e);
                        ApiError::Http(format!("HTTP client unavailable: {}", e))
                    });
                run_worker(client, &endpoints, job_rx, done_tx);
            });

            Self {
                job_tx: Some(job_tx),
                done_rx,
                local: Vec::new(),
                _thread: Some(handle),
            }
        }
    }

    impl ImageApi for HttpApi {
        fn submit(&mut self, generation: u64, request: ApiRequest) {
            let kind = request.kind();
            let sent = self
                .job_tx
                .as_ref()
                .is_some_and(|tx| tx.send((generation, request)).is_ok());
            if !sent {
                self.job_tx = None;
                self.local.push(ApiCompletion {
                    generation,
                    kind,
                    result: Err(ApiError::WorkerGone),
                });
            }
        }

        fn poll_completions(&mut self) -> Vec<ApiCompletion> {
            let mut completions = std::mem::take(&mut self.local);
            while let Ok(completion) = self.done_rx.try_recv() {
                completions.push(completion);
            }
            completions
        }
    }

    impl Drop for HttpApi {
        fn drop(&mut self) {
            // Closing the job queue ends the worker loop
            self.job_tx = None;
            self._thread = None;
        }
    }

    /// Answer every job until the queue closes. Without a client each job
    /// fails with the build error.
    fn run_worker(
        client: Result<Client, ApiError>,
        endpoints: &Endpoints,
        job_rx: Receiver<(u64, ApiRequest)>,
        done_tx: Sender<ApiCompletion>,
    ) {
        while let Ok((generation, request)) = job_rx.recv() {
            let kind = request.kind();
            let result = match &client {
                Ok(client) => perform(client, endpoints, request),
                Err(error) => Err(error.clone()),
            };
            if let Err(e) = &result {
                log::warn!("{:?} request failed: {}", kind, e);
            }
            let completion = ApiCompletion {
                generation,
                kind,
                result,
            };
            if done_tx.send(completion).is_err() {
                break;
            }
        }
        log::debug!("HTTP worker exiting");
    }

    fn perform(
        client: &Client,
        endpoints: &Endpoints,
        request: ApiRequest,
    ) -> Result<ImageSnapshot, ApiError> {
        let response = match request {
            ApiRequest::CreateImage { title, upload } => {
                let part = multipart::Part::bytes(upload.bytes)
                    .file_name(upload.file_name)
                    .mime_str(&upload.content_type)
                    .map_err(|e| ApiError::Http(e.to_string()))?;
                let form = multipart::Form::new().text("title", title).part("image", part);
                client.post(endpoints.images()).multipart(form).send()
            }
            ApiRequest::FetchImage { id } => client.get(endpoints.image(&id)).send(),
            ApiRequest::PostComment {
                id,
                left,
                top,
                message,
            } => {
                let form = [
                    ("message", message),
                    ("left", left.to_string()),
                    ("top", top.to_string()),
                ];
                client.post(endpoints.comments(&id)).form(&form).send()
            }
        }
        .map_err(|e| ApiError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| ApiError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        ImageSnapshot::from_json(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

}

pub use http::HttpApi;

// ============================================================================
// In-memory API
// ============================================================================

#[derive(Debug, Default)]
struct MemoryApiInner {
    images: HashMap<String, ImageSnapshot>,
    requests: Vec<(u64, ApiRequest)>,
    pending: Vec<ApiCompletion>,
    /// Keep completions queued until released.
    held: bool,
    fail_next: Option<ApiError>,
    next_id: u64,
    clock: u64,
}

fn lock(inner: &Mutex<MemoryApiInner>) -> MutexGuard<'_, MemoryApiInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryApiInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn handle(&mut self, request: &ApiRequest) -> Result<ImageSnapshot, ApiError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        match request {
            ApiRequest::CreateImage { title, .. } => {
                self.next_id += 1;
                let id = format!("img-{}", self.next_id);
                let snapshot = ImageSnapshot {
                    id: id.clone(),
                    title: Some(title.clone()),
                    url: format!("memory://{}/image", id),
                    mask: None,
                    timestamp: Some(self.tick()),
                    comments: Vec::new(),
                };
                self.images.insert(id, snapshot.clone());
                Ok(snapshot)
            }
            ApiRequest::FetchImage { id } => self.images.get(id).cloned().ok_or_else(not_found),
            ApiRequest::PostComment {
                id,
                left,
                top,
                message,
            } => {
                let timestamp = self.tick();
                let snapshot = self.images.get_mut(id).ok_or_else(not_found)?;
                let key = format!("c{}", snapshot.comments.len() + 1);
                snapshot.comments.push((
                    key,
                    CommentRecord {
                        left: *left,
                        top: *top,
                        message: message.clone(),
                        timestamp,
                    },
                ));
                Ok(snapshot.clone())
            }
        }
    }
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        body: "not found".to_string(),
    }
}

/// In-process image API; the paired [`MemoryApiHandle`] inspects and steers it.
#[derive(Debug)]
pub struct MemoryApi {
    inner: Arc<Mutex<MemoryApiInner>>,
}

/// Control side of a [`MemoryApi`].
#[derive(Debug, Clone)]
pub struct MemoryApiHandle {
    inner: Arc<Mutex<MemoryApiInner>>,
}

impl MemoryApi {
    pub fn new() -> (Self, MemoryApiHandle) {
        let inner = Arc::new(Mutex::new(MemoryApiInner::default()));
        (
            Self {
                inner: inner.clone(),
            },
            MemoryApiHandle { inner },
        )
    }
}

impl ImageApi for MemoryApi {
    fn submit(&mut self, generation: u64, request: ApiRequest) {
        let mut inner = lock(&self.inner);
        let result = inner.handle(&request);
        inner.pending.push(ApiCompletion {
            generation,
            kind: request.kind(),
            result,
        });
        inner.requests.push((generation, request));
    }

    fn poll_completions(&mut self) -> Vec<ApiCompletion> {
        let mut inner = lock(&self.inner);
        if inner.held {
            return Vec::new();
        }
        std::mem::take(&mut inner.pending)
    }
}

impl MemoryApiHandle {
    /// Store an image as if it had been uploaded earlier.
    pub fn insert_image(&self, snapshot: ImageSnapshot) {
        lock(&self.inner)
            .images
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Current server-side state of an image.
    pub fn image(&self, id: &str) -> Option<ImageSnapshot> {
        lock(&self.inner).images.get(id).cloned()
    }

    /// Add a comment server-side without a client request.
    pub fn add_comment(&self, id: &str, left: f64, top: f64, message: &str) -> Option<CommentRecord> {
        let mut inner = lock(&self.inner);
        let timestamp = inner.tick();
        let snapshot = inner.images.get_mut(id)?;
        let record = CommentRecord {
            left,
            top,
            message: message.to_string(),
            timestamp,
        };
        let key = format!("c{}", snapshot.comments.len() + 1);
        snapshot.comments.push((key, record.clone()));
        Some(record)
    }

    /// Replace an image's mask reference server-side.
    pub fn set_mask(&self, id: &str, mask: &str) {
        if let Some(snapshot) = lock(&self.inner).images.get_mut(id) {
            snapshot.mask = Some(mask.to_string());
        }
    }

    /// Requests received so far, with their generations.
    pub fn requests(&self) -> Vec<(u64, ApiRequest)> {
        lock(&self.inner).requests.clone()
    }

    /// Hold completions back until released.
    pub fn hold(&self) {
        lock(&self.inner).held = true;
    }

    pub fn release(&self) {
        lock(&self.inner).held = false;
    }

    /// Fail the next request with `error`.
    pub fn fail_next(&self, error: ApiError) {
        lock(&self.inner).fail_next = Some(error);
    }
}
