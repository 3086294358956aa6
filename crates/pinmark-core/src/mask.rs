//! Mask snapshot exchange.
//!
//! The local drawing is pushed as one PNG after a quiet period; remote masks
//! replace the background layer wholesale. There is no merge: the last write
//! wins.

use crate::channel::{ChannelError, LiveChannel};
use crate::debounce::Debouncer;
use std::time::{Duration, Instant};

/// Leading bytes of every PNG stream.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// PNG encoding of the cumulative local drawing.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskSnapshot {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl MaskSnapshot {
    pub fn is_png(&self) -> bool {
        self.bytes.starts_with(&PNG_SIGNATURE)
    }
}

/// Remote mask shown beneath the drawing surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackgroundLayer {
    /// Mask image reference; `None` is the blank baseline.
    pub reference: Option<String>,
    /// Bumped on every replacement so the host knows to reload.
    pub revision: u64,
}

/// Debounced mask push plus the remote background layer.
#[derive(Debug, Clone)]
pub struct MaskSync {
    debounce: Debouncer,
    background: BackgroundLayer,
    pushed: u64,
}

impl MaskSync {
    pub fn new(delay: Duration) -> Self {
        Self {
            debounce: Debouncer::new(delay),
            background: BackgroundLayer::default(),
            pushed: 0,
        }
    }

    /// Arm or re-arm the trailing push.
    pub fn schedule(&mut self, now: Instant) {
        self.debounce.trigger(now);
    }

    pub fn is_pending(&self) -> bool {
        self.debounce.is_pending()
    }

    /// True exactly once when the quiet period has elapsed.
    ///
    /// The caller rasterizes only after this fires, so a burst of strokes
    /// pushes the latest state once.
    pub fn take_due(&mut self, now: Instant) -> bool {
        self.debounce.poll(now)
    }

    /// Send a snapshot as one binary frame. Fire-and-forget.
    pub fn push(
        &mut self,
        snapshot: MaskSnapshot,
        channel: &mut dyn LiveChannel,
    ) -> Result<(), ChannelError> {
        let size = snapshot.bytes.len();
        match channel.send_binary(snapshot.bytes) {
            Ok(()) => {
                self.pushed += 1;
                log::debug!(
                    "Pushed mask {}x{} ({} bytes)",
                    snapshot.width,
                    snapshot.height,
                    size
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("Mask push dropped: {}", e);
                Err(e)
            }
        }
    }

    /// Number of masks handed to the channel.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Replace the background with a remote mask.
    pub fn apply_remote(&mut self, reference: impl Into<String>) {
        self.background.reference = Some(reference.into());
        self.background.revision += 1;
    }

    pub fn background(&self) -> &BackgroundLayer {
        &self.background
    }

    /// Cancel a pending push and blank the background.
    pub fn reset(&mut self) {
        self.debounce.cancel();
        if self.background.reference.take().is_some() {
            self.background.revision += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::curve::CurveRenderer;
    use crate::session::{PointerMode, SessionContext};
    use kurbo::Point;

    const DELAY: Duration = Duration::from_millis(100);

    fn open_channel() -> (MemoryChannel, crate::channel::MemoryChannelHandle) {
        let (mut channel, handle) = MemoryChannel::new();
        channel.open("ws://x/pic/a").unwrap();
        channel.poll_events();
        (channel, handle)
    }

    #[test]
    fn test_burst_pushes_latest_state_once() {
        let (mut channel, handle) = open_channel();
        let mut renderer = CurveRenderer::new(64, 64, 4.0).unwrap();
        let mut sync = MaskSync::new(DELAY);
        let ctx = SessionContext {
            mode: PointerMode::Drawing,
            ..SessionContext::default()
        };
        let start = Instant::now();

        for i in 0..5u64 {
            let now = start + Duration::from_millis(i * 30);
            let x = 8.0 + i as f64 * 10.0;
            renderer.begin_stroke(&ctx, Point::new(x, 8.0));
            renderer.extend_stroke(Point::new(x, 40.0));
            renderer.end_stroke();
            sync.schedule(now);
            assert!(!sync.take_due(now));
        }

        let due = start + Duration::from_millis(120) + DELAY;
        assert!(sync.take_due(due));
        let snapshot = renderer.snapshot().unwrap();
        let expected = snapshot.clone();
        sync.push(snapshot, &mut channel).unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], expected.bytes);
        assert!(expected.is_png());
        // The pushed mask covers all five strokes
        assert_eq!(renderer.curves().len(), 5);
        assert!(!sync.take_due(due + DELAY));
    }

    #[test]
    fn test_push_failure_is_reported() {
        let (mut channel, handle) = MemoryChannel::new();
        let mut sync = MaskSync::new(DELAY);
        let snapshot = MaskSnapshot {
            bytes: PNG_SIGNATURE.to_vec(),
            width: 1,
            height: 1,
        };

        assert_eq!(sync.push(snapshot, &mut channel), Err(ChannelError::NotOpen));
        assert_eq!(sync.pushed(), 0);
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_apply_remote_replaces() {
        let mut sync = MaskSync::new(DELAY);
        sync.apply_remote("http://x/mask-1.png");
        sync.apply_remote("http://x/mask-2.png");

        let background = sync.background();
        assert_eq!(background.reference.as_deref(), Some("http://x/mask-2.png"));
        assert_eq!(background.revision, 2);
    }

    #[test]
    fn test_reset_cancels_and_blanks() {
        let mut sync = MaskSync::new(DELAY);
        let now = Instant::now();
        sync.apply_remote("m");
        sync.schedule(now);

        sync.reset();
        assert!(!sync.is_pending());
        assert!(!sync.take_due(now + DELAY));
        assert_eq!(sync.background().reference, None);
        assert_eq!(sync.background().revision, 2);
    }
}
