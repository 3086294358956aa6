//! In-memory image store shared by all connections.

use dashmap::DashMap;
use pinmark_core::protocol::{CommentRecord, ImageSnapshot, WireEvent};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Per-image broadcast capacity
const CHANNEL_CAPACITY: usize = 256;

/// One uploaded image and its annotations
struct StoredImage {
    snapshot: ImageSnapshot,
    content_type: String,
    bytes: Vec<u8>,
    /// Latest mask PNG
    mask: Option<Vec<u8>>,
    mask_revision: u64,
    /// Encoded live events for everyone viewing this image
    tx: broadcast::Sender<String>,
}

/// Shared application state
pub struct AppState {
    images: DashMap<String, StoredImage>,
    /// Externally reachable base URL, used in image and mask references
    public_url: String,
}

impl AppState {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            images: DashMap::new(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Store a new image and return its snapshot
    pub fn create_image(&self, title: Option<String>, content_type: &str, bytes: Vec<u8>) -> ImageSnapshot {
        let id = Uuid::new_v4().simple().to_string();
        let snapshot = ImageSnapshot {
            id: id.clone(),
            title,
            url: format!("{}/pic/{}/image", self.public_url, id),
            mask: None,
            timestamp: Some(now_millis()),
            comments: Vec::new(),
        };
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.images.insert(
            id,
            StoredImage {
                snapshot: snapshot.clone(),
                content_type: content_type.to_string(),
                bytes,
                mask: None,
                mask_revision: 0,
                tx,
            },
        );
        snapshot
    }

    pub fn snapshot(&self, id: &str) -> Option<ImageSnapshot> {
        self.images.get(id).map(|image| image.snapshot.clone())
    }

    /// Uploaded image bytes and their content type
    pub fn image(&self, id: &str) -> Option<(String, Vec<u8>)> {
        self.images
            .get(id)
            .map(|image| (image.content_type.clone(), image.bytes.clone()))
    }

    pub fn mask(&self, id: &str) -> Option<Vec<u8>> {
        self.images.get(id).and_then(|image| image.mask.clone())
    }

    /// Append a comment and broadcast it. Returns the updated snapshot.
    pub fn add_comment(&self, id: &str, left: f64, top: f64, message: String) -> Option<ImageSnapshot> {
        let mut image = self.images.get_mut(id)?;
        let record = CommentRecord {
            left,
            top,
            message,
            timestamp: now_millis(),
        };
        let key = Uuid::new_v4().simple().to_string();
        image.snapshot.comments.push((key, record.clone()));

        broadcast(&image.tx, &WireEvent::Comment { comment: record });
        Some(image.snapshot.clone())
    }

    /// Replace the mask and broadcast its new reference.
    pub fn set_mask(&self, id: &str, png: Vec<u8>) -> Option<String> {
        let mut image = self.images.get_mut(id)?;
        image.mask_revision += 1;
        let url = format!(
            "{}/pic/{}/mask?rev={}",
            self.public_url, id, image.mask_revision
        );
        image.mask = Some(png);
        image.snapshot.mask = Some(url.clone());

        broadcast(&image.tx, &WireEvent::Mask { url: url.clone() });
        Some(url)
    }

    /// Subscribe to an image's live events, together with its current state
    pub fn subscribe(&self, id: &str) -> Option<(broadcast::Receiver<String>, ImageSnapshot)> {
        let image = self.images.get(id)?;
        Some((image.tx.subscribe(), image.snapshot.clone()))
    }
}

fn broadcast(tx: &broadcast::Sender<String>, event: &WireEvent) {
    match event.to_json() {
        // No receivers is fine: nobody is viewing the image
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!("Failed to encode live event: {}", e),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
