//! Session controller.
//!
//! Owns the one live annotation session: its image metadata, comment
//! threads, drawing surface, mask sync and live channel. Everything runs on
//! the host's thread; network work completes in the background and is only
//! applied inside [`SessionController::poll`].
//!
//! Every API request is tagged with the session generation it was issued
//! under. [`SessionController::reset`] bumps the generation, so responses
//! that belong to a previous session are discarded on arrival.

use crate::api::{ApiCompletion, ApiRequest, ImageApi, RequestKind, Upload};
use crate::channel::LiveChannel;
use crate::comments::{AnchorKey, CloseOutcome, CommentStore};
use crate::config::{EngineConfig, Endpoints};
use crate::curve::{BrushColor, CurveRenderer};
use crate::dispatcher::{Backoff, DispatchEvent, Dispatcher, RouteTargets, dispatch};
use crate::error::{SessionError, SessionResult};
use crate::link;
use crate::mask::{BackgroundLayer, MaskSync};
use crate::protocol::ImageSnapshot;
use crate::storage::{RememberedSession, SessionMemory};
use kurbo::Point;
use std::time::{Duration, Instant};

/// What the pointer does on the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerMode {
    #[default]
    Idle,
    Drawing,
    Commenting,
}

/// Per-session UI state the engine reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionContext {
    pub mode: PointerMode,
    /// Comment markers shown; new remote threads open their popover.
    pub comments_visible: bool,
}

impl SessionContext {
    pub fn drawing_enabled(&self) -> bool {
        self.mode == PointerMode::Drawing
    }

    pub fn comment_mode_enabled(&self) -> bool {
        self.mode == PointerMode::Commenting
    }
}

/// The image being annotated.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    /// Reference to the uploaded image.
    pub image_url: String,
    /// Latest known mask reference.
    pub mask: Option<String>,
    /// The server acknowledged the image.
    pub confirmed: bool,
}

impl Session {
    pub fn from_snapshot(snapshot: &ImageSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            title: snapshot.title.clone(),
            image_url: snapshot.url.clone(),
            mask: snapshot.mask.clone(),
            confirmed: true,
        }
    }

    /// Take over metadata from a newer snapshot of the same image.
    pub fn apply_snapshot(&mut self, snapshot: &ImageSnapshot) {
        if snapshot.title.is_some() {
            self.title = snapshot.title.clone();
        }
        self.image_url = snapshot.url.clone();
        if snapshot.mask.is_some() {
            self.mask = snapshot.mask.clone();
        }
    }
}

/// Something the host should react to.
#[derive(Debug)]
pub enum SessionNotice {
    /// A new image was uploaded and joined.
    Started { id: String, share_link: Option<String> },
    /// An existing image was loaded and joined.
    Resumed { id: String, share_link: Option<String> },
    /// State was rebuilt from the server after a reconnect.
    Refreshed,
    /// The previous session was torn down.
    Reset,
    PictureUpdated,
    CommentsChanged,
    MaskChanged,
    Connected,
    ChannelLost { retry_in: Duration },
    Reconnected,
    /// The server reported a problem on the live channel.
    ServerError(String),
    Failed(SessionError),
}

/// Load in flight.
#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Creating,
    Resuming(String),
    /// Full re-fetch of the current session after a reconnect.
    Refreshing(String),
}

/// Drives one annotation session.
pub struct SessionController<A: ImageApi, C: LiveChannel> {
    config: EngineConfig,
    endpoints: Endpoints,
    api: A,
    dispatcher: Dispatcher<C>,
    context: SessionContext,
    session: Option<Session>,
    pending: Option<Pending>,
    generation: u64,
    comments: CommentStore,
    renderer: CurveRenderer,
    mask: MaskSync,
    memory: Option<Box<dyn SessionMemory>>,
    notices: Vec<SessionNotice>,
}

impl<A: ImageApi, C: LiveChannel> SessionController<A, C> {
    pub fn new(config: EngineConfig, api: A, channel: C) -> SessionResult<Self> {
        let endpoints = config.endpoints()?;
        let renderer = CurveRenderer::new(
            config.surface_width,
            config.surface_height,
            config.brush_radius,
        )?;
        let backoff = Backoff::new(config.reconnect_min(), config.reconnect_max());

        Ok(Self {
            endpoints,
            api,
            dispatcher: Dispatcher::new(channel, backoff),
            context: SessionContext::default(),
            session: None,
            pending: None,
            generation: 0,
            comments: CommentStore::new(),
            renderer,
            mask: MaskSync::new(config.push_delay()),
            memory: None,
            notices: Vec::new(),
            config,
        })
    }

    /// Remember joined sessions in `memory`.
    pub fn with_memory(mut self, memory: Box<dyn SessionMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn comments(&self) -> &CommentStore {
        &self.comments
    }

    pub fn renderer(&self) -> &CurveRenderer {
        &self.renderer
    }

    pub fn background(&self) -> &BackgroundLayer {
        self.mask.background()
    }

    pub fn dispatcher(&self) -> &Dispatcher<C> {
        &self.dispatcher
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while an upload or load is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(
            self.pending,
            Some(Pending::Creating) | Some(Pending::Resuming(_))
        )
    }

    /// Link that opens the current session.
    pub fn share_link(&self) -> Option<String> {
        let session = self.session.as_ref()?;
        match link::share_link(self.config.share_base(), &session.id) {
            Ok(link) => Some(link),
            Err(e) => {
                log::warn!("Cannot build share link: {}", e);
                None
            }
        }
    }

    pub fn set_pointer_mode(&mut self, mode: PointerMode) {
        self.context.mode = mode;
    }

    pub fn set_comments_visible(&mut self, visible: bool) {
        self.context.comments_visible = visible;
    }

    pub fn set_brush_color(&mut self, color: BrushColor) {
        self.renderer.set_color(color);
    }

    /// Match the drawing surface to the displayed image.
    pub fn resize_surface(&mut self, width: u32, height: u32) -> SessionResult<()> {
        self.renderer.resize(width, height)?;
        Ok(())
    }

    /// Upload a new image and start a session on it.
    ///
    /// The file type is checked before anything else; a rejected file leaves
    /// the current session untouched.
    pub fn start_new(&mut self, upload: Upload) -> SessionResult<()> {
        if !upload.is_supported_image() {
            return Err(SessionError::Validation(format!(
                "unsupported image type: {}",
                upload.content_type
            )));
        }

        self.reset();
        self.pending = Some(Pending::Creating);
        log::info!(
            "Uploading {} ({} bytes)",
            upload.file_name,
            upload.bytes.len()
        );
        let title = upload.title();
        self.api
            .submit(self.generation, ApiRequest::CreateImage { title, upload });
        Ok(())
    }

    /// Drag-and-drop entry point. Refuses to replace an open session.
    pub fn load_dropped(&mut self, upload: Upload) -> SessionResult<()> {
        if self.session.is_some() || self.is_loading() {
            return Err(SessionError::Conflict(
                "an image is already open; use a new upload to replace it".to_string(),
            ));
        }
        self.start_new(upload)
    }

    /// Load an existing image with its comments and mask.
    pub fn resume(&mut self, id: &str) -> SessionResult<()> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SessionError::Validation("empty session id".to_string()));
        }

        self.reset();
        self.pending = Some(Pending::Resuming(id.to_string()));
        log::info!("Resuming session {}", id);
        self.api.submit(
            self.generation,
            ApiRequest::FetchImage { id: id.to_string() },
        );
        Ok(())
    }

    /// Resume the session named by a share link, or the remembered one.
    pub fn resume_from_link(&mut self, link: &str) -> SessionResult<()> {
        let id = match link::session_id_from_link(link) {
            Some(id) => id,
            None => self.remembered_id()?.ok_or(SessionError::NoSession)?,
        };
        self.resume(&id)
    }

    /// Tear down the current session.
    ///
    /// Late responses and channel frames of the old session are never applied.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.dispatcher.leave();
        self.comments.clear();
        self.renderer.clear();
        self.mask.reset();

        let had_session = self.session.take().is_some();
        let had_pending = self.pending.take().is_some();
        if had_session || had_pending {
            log::info!("Session reset (generation {})", self.generation);
            self.notices.push(SessionNotice::Reset);
        }
    }

    /// Post a message to the thread at `key`.
    pub fn submit_comment(&mut self, key: AnchorKey, text: &str) -> SessionResult<()> {
        let session = self.session.as_ref().ok_or(SessionError::NoSession)?;
        let message = text.trim();
        if message.is_empty() {
            return Err(SessionError::Validation("comment is empty".to_string()));
        }

        self.api.submit(
            self.generation,
            ApiRequest::PostComment {
                id: session.id.clone(),
                left: key.x as f64,
                top: key.y as f64,
                message: message.to_string(),
            },
        );
        Ok(())
    }

    pub fn close_comment(&mut self, key: AnchorKey) -> CloseOutcome {
        let outcome = self.comments.close(key);
        if outcome != CloseOutcome::Missing {
            self.notices.push(SessionNotice::CommentsChanged);
        }
        outcome
    }

    pub fn expand_comment(&mut self, key: AnchorKey) -> bool {
        let expanded = self.comments.expand(key);
        if expanded {
            self.notices.push(SessionNotice::CommentsChanged);
        }
        expanded
    }

    /// Pointer pressed on the image. Returns true if it was consumed.
    pub fn pointer_down(&mut self, point: Point) -> bool {
        if self.session.is_none() {
            return false;
        }
        match self.context.mode {
            PointerMode::Drawing => self.renderer.begin_stroke(&self.context, point),
            PointerMode::Commenting => {
                self.comments.create_local(point);
                self.notices.push(SessionNotice::CommentsChanged);
                true
            }
            PointerMode::Idle => false,
        }
    }

    pub fn pointer_move(&mut self, point: Point) -> bool {
        self.renderer.extend_stroke(point)
    }

    /// Pointer released. A finished stroke arms the mask push.
    pub fn pointer_up(&mut self, now: Instant) -> bool {
        if !self.renderer.end_stroke() {
            return false;
        }
        self.mask.schedule(now);
        true
    }

    /// Per-frame hook for the drawing surface.
    pub fn render_frame(&mut self) -> bool {
        self.renderer.render_frame()
    }

    /// Apply finished requests and channel events, push a due mask.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionNotice> {
        for completion in self.api.poll_completions() {
            if completion.generation != self.generation {
                log::debug!(
                    "Discarding {:?} completion from generation {}",
                    completion.kind,
                    completion.generation
                );
                continue;
            }
            self.handle_completion(completion);
        }

        for event in self.dispatcher.poll(now) {
            self.handle_dispatch(event);
        }

        if self.mask.take_due(now) {
            self.push_mask();
        }

        std::mem::take(&mut self.notices)
    }

    fn handle_completion(&mut self, completion: ApiCompletion) {
        let ApiCompletion { kind, result, .. } = completion;
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(error) => {
                log::warn!("{:?} failed: {}", kind, error);
                if kind != RequestKind::PostComment {
                    self.pending = None;
                }
                self.notices.push(SessionNotice::Failed(error.into()));
                return;
            }
        };

        match (kind, self.pending.take()) {
            (RequestKind::CreateImage, Some(Pending::Creating)) => {
                self.open_session(snapshot, true);
            }
            (RequestKind::FetchImage, Some(Pending::Resuming(_))) => {
                self.open_session(snapshot, false);
            }
            (RequestKind::FetchImage, Some(Pending::Refreshing(_))) => {
                self.refresh(snapshot);
            }
            (RequestKind::PostComment, pending) => {
                self.pending = pending;
                self.reconcile_comments(&snapshot);
            }
            (kind, pending) => {
                log::debug!("Ignoring unexpected {:?} completion", kind);
                self.pending = pending;
            }
        }
    }

    fn open_session(&mut self, snapshot: ImageSnapshot, created: bool) {
        let session = Session::from_snapshot(&snapshot);
        let id = session.id.clone();
        self.session = Some(session);

        // Oldest first so thread order matches the server's
        self.comments.reconcile_snapshot(
            snapshot.keyed_comment_events(),
            self.context.comments_visible,
        );
        if let Some(mask) = snapshot.mask {
            self.mask.apply_remote(mask);
        }

        let url = self.endpoints.channel(&id);
        if let Err(e) = self.dispatcher.join(&id, &url) {
            log::error!("Failed to join live channel: {}", e);
            self.notices.push(SessionNotice::Failed(e.into()));
        }

        let share_link = self.share_link();
        self.remember(&id, share_link.clone());
        log::info!("Session {} ready", id);
        self.notices.push(if created {
            SessionNotice::Started { id, share_link }
        } else {
            SessionNotice::Resumed { id, share_link }
        });
    }

    /// Catch up on comments and background from a full snapshot.
    ///
    /// Entries are merged by server key, so threads the user has open,
    /// including an unsent draft, stay as they are.
    fn refresh(&mut self, snapshot: ImageSnapshot) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id != snapshot.id {
            return;
        }
        session.apply_snapshot(&snapshot);

        self.comments.reconcile_snapshot(
            snapshot.keyed_comment_events(),
            self.context.comments_visible,
        );
        if let Some(mask) = snapshot.mask {
            if self.mask.background().reference.as_ref() != Some(&mask) {
                self.mask.apply_remote(mask);
            }
        }
        self.notices.push(SessionNotice::Refreshed);
    }

    fn reconcile_comments(&mut self, snapshot: &ImageSnapshot) {
        if self.session.as_ref().map(|s| s.id.as_str()) != Some(snapshot.id.as_str()) {
            return;
        }
        let changed = self.comments.reconcile_snapshot(
            snapshot.keyed_comment_events(),
            self.context.comments_visible,
        );
        if changed {
            self.notices.push(SessionNotice::CommentsChanged);
        }
    }

    fn handle_dispatch(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Remote(event) => {
                let mut targets = RouteTargets {
                    comments: &mut self.comments,
                    mask: &mut self.mask,
                    session: &mut self.session,
                    context: &self.context,
                };
                if let Some(notice) = dispatch(event, &mut targets) {
                    self.notices.push(notice);
                }
            }
            DispatchEvent::Connected => self.notices.push(SessionNotice::Connected),
            DispatchEvent::ChannelLost { retry_in } => {
                self.notices.push(SessionNotice::ChannelLost { retry_in });
            }
            DispatchEvent::Resubscribed => {
                // Events missed while offline are recovered by a full re-fetch
                if let Some(session) = &self.session {
                    let id = session.id.clone();
                    self.pending = Some(Pending::Refreshing(id.clone()));
                    self.api
                        .submit(self.generation, ApiRequest::FetchImage { id });
                }
                self.notices.push(SessionNotice::Reconnected);
            }
            DispatchEvent::Dropped(_) => {}
        }
    }

    fn push_mask(&mut self) {
        if self.session.is_none() {
            return;
        }
        match self.renderer.snapshot() {
            Ok(snapshot) => {
                // Failures are logged by the push; there is no retry
                let _ = self.mask.push(snapshot, self.dispatcher.channel_mut());
            }
            Err(e) => log::error!("Failed to rasterize mask: {}", e),
        }
    }

    fn remember(&self, id: &str, share_link: Option<String>) {
        let Some(memory) = &self.memory else {
            return;
        };
        let session = RememberedSession {
            id: id.to_string(),
            share_link,
        };
        if let Err(e) = memory.remember(&session) {
            log::warn!("Failed to remember session: {}", e);
        }
    }

    fn remembered_id(&self) -> SessionResult<Option<String>> {
        let Some(memory) = &self.memory else {
            return Ok(None);
        };
        Ok(memory.recall()?.map(|s| s.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MemoryApi, MemoryApiHandle};
    use crate::channel::{ConnectionState, MemoryChannel, MemoryChannelHandle};
    use crate::comments::Message;
    use crate::mask::PNG_SIGNATURE;
    use crate::protocol::{CommentRecord, WireEvent};
    use crate::storage::MemorySessionStore;

    type TestController = SessionController<MemoryApi, MemoryChannel>;

    fn controller() -> (TestController, MemoryApiHandle, MemoryChannelHandle) {
        let (api, api_handle) = MemoryApi::new();
        let (channel, channel_handle) = MemoryChannel::new();
        let config = EngineConfig {
            surface_width: 64,
            surface_height: 64,
            ..EngineConfig::default()
        };
        let controller = SessionController::new(config, api, channel).unwrap();
        (controller, api_handle, channel_handle)
    }

    fn png() -> Upload {
        Upload::new("cat.png", "image/png", vec![0; 16])
    }

    /// Controller with an uploaded, connected session.
    fn started(now: Instant) -> (TestController, MemoryApiHandle, MemoryChannelHandle, String) {
        let (mut c, api, channel) = controller();
        c.start_new(png()).unwrap();
        c.poll(now);
        c.poll(now);
        let id = c.session().unwrap().id.clone();
        (c, api, channel, id)
    }

    fn record(left: f64, top: f64, message: &str, timestamp: u64) -> CommentRecord {
        CommentRecord {
            left,
            top,
            message: message.to_string(),
            timestamp,
        }
    }

    fn thread_contents(c: &TestController) -> Vec<(AnchorKey, Vec<Message>)> {
        c.comments()
            .threads()
            .map(|t| (t.key(), t.messages().to_vec()))
            .collect()
    }

    #[test]
    fn test_start_rejects_unsupported_type() {
        let (mut c, api, _channel) = controller();
        let result = c.start_new(Upload::new("notes.txt", "text/plain", vec![1]));

        let err = result.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert!(err.is_blocking());
        assert!(api.requests().is_empty());
        assert_eq!(c.generation(), 0);
    }

    #[test]
    fn test_start_new_joins_and_shares() {
        let (mut c, _api, channel) = controller();
        let now = Instant::now();
        c.start_new(png()).unwrap();
        assert!(c.is_loading());

        let notices = c.poll(now);
        assert!(notices.iter().any(|n| matches!(
            n,
            SessionNotice::Started { id, share_link: Some(link) }
                if id == "img-1" && link == "http://localhost:3030/?id=img-1"
        )));
        assert!(!c.is_loading());
        assert!(c.session().unwrap().confirmed);
        assert_eq!(c.session().unwrap().title.as_deref(), Some("cat"));
        assert_eq!(channel.opened(), vec!["ws://localhost:3030/pic/img-1".to_string()]);
        assert!(notices.iter().any(|n| matches!(n, SessionNotice::Connected)));
    }

    #[test]
    fn test_drop_conflicts_with_open_session() {
        let now = Instant::now();
        let (mut c, api, _channel, id) = started(now);
        let requests = api.requests().len();

        let err = c.load_dropped(png()).unwrap_err();
        assert!(matches!(err, SessionError::Conflict(_)));
        assert!(!err.is_blocking());
        assert_eq!(c.session().unwrap().id, id);
        assert_eq!(api.requests().len(), requests);
    }

    #[test]
    fn test_drop_on_empty_controller_uploads() {
        let (mut c, _api, _channel) = controller();
        c.load_dropped(png()).unwrap();
        c.poll(Instant::now());
        assert!(c.session().is_some());
    }

    #[test]
    fn test_stale_completion_ignored() {
        let (mut c, api, channel) = controller();
        api.hold();
        c.start_new(png()).unwrap();
        c.reset();
        api.release();

        let notices = c.poll(Instant::now());
        assert!(matches!(notices.as_slice(), [SessionNotice::Reset]));
        assert!(c.session().is_none());
        assert!(channel.opened().is_empty());
    }

    #[test]
    fn test_superseded_resume_ignored() {
        let (mut c, api, _channel) = controller();
        for id in ["first", "second"] {
            api.insert_image(ImageSnapshot {
                id: id.to_string(),
                title: None,
                url: format!("http://x/{}", id),
                mask: None,
                timestamp: None,
                comments: Vec::new(),
            });
        }
        api.hold();
        c.resume("first").unwrap();
        c.resume("second").unwrap();
        api.release();

        c.poll(Instant::now());
        assert_eq!(c.session().unwrap().id, "second");
    }

    fn seeded_image(api: &MemoryApiHandle) {
        api.insert_image(ImageSnapshot {
            id: "abc".to_string(),
            title: Some("cat".to_string()),
            url: "http://x/img".to_string(),
            mask: Some("http://x/mask-3.png".to_string()),
            timestamp: Some(1),
            comments: vec![
                ("k9".to_string(), record(120.0, 80.0, "hi", 2)),
                ("k1".to_string(), record(120.0, 80.0, "there", 1)),
                ("k5".to_string(), record(10.0, 10.0, "elsewhere", 3)),
            ],
        });
    }

    #[test]
    fn test_resume_replays_in_server_order() {
        let (mut c, api, channel) = controller();
        seeded_image(&api);

        c.resume("abc").unwrap();
        let notices = c.poll(Instant::now());
        assert!(notices
            .iter()
            .any(|n| matches!(n, SessionNotice::Resumed { id, .. } if id == "abc")));

        let thread = c.comments().get(AnchorKey::new(120, 80)).unwrap();
        let texts: Vec<&str> = thread.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "there"]);
        assert_eq!(c.comments().len(), 2);
        assert_eq!(
            c.background().reference.as_deref(),
            Some("http://x/mask-3.png")
        );
        assert_eq!(channel.opened(), vec!["ws://localhost:3030/pic/abc".to_string()]);
    }

    #[test]
    fn test_reset_then_resume_rebuilds_same_store() {
        let (mut c, api, _channel) = controller();
        seeded_image(&api);
        let now = Instant::now();

        c.resume("abc").unwrap();
        c.poll(now);
        let before = thread_contents(&c);

        c.reset();
        assert!(c.comments().is_empty());
        c.resume("abc").unwrap();
        c.poll(now);
        assert_eq!(thread_contents(&c), before);
    }

    #[test]
    fn test_draft_comment_and_echo_share_thread() {
        let now = Instant::now();
        let (mut c, api, channel, id) = started(now);
        c.set_pointer_mode(PointerMode::Commenting);

        assert!(c.pointer_down(Point::new(50.0, 50.0)));
        let key = AnchorKey::new(50, 50);
        assert!(c.comments().get(key).unwrap().is_ephemeral());

        c.submit_comment(key, "  x ").unwrap();
        c.poll(now);

        // The live echo of the same comment arrives too
        let stored = api.image(&id).unwrap().comments[0].1.clone();
        assert_eq!(stored.message, "x");
        let echo = format!(
            r#"{{"event":"comment","comment":{{"left":{},"top":{},"message":"x","timestamp":{}}}}}"#,
            stored.left, stored.top, stored.timestamp
        );
        channel.push_text(echo);
        c.poll(now);

        assert_eq!(c.comments().len(), 1);
        let thread = c.comments().get(key).unwrap();
        assert_eq!(thread.messages().len(), 1);
        assert_eq!(thread.messages()[0].text, "x");
        assert!(thread.is_expanded());
    }

    #[test]
    fn test_submit_comment_checks() {
        let (mut c, _api, _channel) = controller();
        assert!(matches!(
            c.submit_comment(AnchorKey::new(1, 1), "hello"),
            Err(SessionError::NoSession)
        ));

        let (mut c, _api, _channel, _id) = started(Instant::now());
        assert!(matches!(
            c.submit_comment(AnchorKey::new(1, 1), "   "),
            Err(SessionError::Validation(_))
        ));
    }

    #[test]
    fn test_pointer_routing_by_mode() {
        let now = Instant::now();
        let (mut c, _api, _channel, _id) = started(now);

        assert!(!c.pointer_down(Point::new(5.0, 5.0)));

        c.set_pointer_mode(PointerMode::Drawing);
        assert!(c.pointer_down(Point::new(5.0, 5.0)));
        assert!(c.pointer_move(Point::new(9.0, 9.0)));
        assert!(c.pointer_up(now));
        assert_eq!(c.renderer().curves().len(), 1);
        assert!(c.comments().is_empty());

        c.set_pointer_mode(PointerMode::Commenting);
        assert!(c.pointer_down(Point::new(20.0, 20.0)));
        assert!(!c.pointer_move(Point::new(25.0, 25.0)));
        assert!(!c.pointer_up(now));
        assert_eq!(c.renderer().curves().len(), 1);
        assert_eq!(c.comments().len(), 1);
    }

    #[test]
    fn test_no_annotation_without_session() {
        let (mut c, _api, _channel) = controller();
        c.set_pointer_mode(PointerMode::Drawing);
        assert!(!c.pointer_down(Point::new(5.0, 5.0)));
        c.set_pointer_mode(PointerMode::Commenting);
        assert!(!c.pointer_down(Point::new(5.0, 5.0)));
    }

    #[test]
    fn test_mask_push_after_quiet_period() {
        let start = Instant::now();
        let (mut c, _api, channel, _id) = started(start);
        c.set_pointer_mode(PointerMode::Drawing);

        for i in 0..3u64 {
            let now = start + Duration::from_millis(i * 20);
            let x = 10.0 + i as f64 * 10.0;
            c.pointer_down(Point::new(x, 10.0));
            c.pointer_move(Point::new(x, 50.0));
            c.pointer_up(now);
            c.poll(now);
        }
        c.poll(start + Duration::from_millis(139));
        assert!(channel.sent().is_empty());

        c.poll(start + Duration::from_millis(140));
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(&PNG_SIGNATURE));

        c.poll(start + Duration::from_secs(2));
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn test_render_frame_only_when_dirty() {
        let now = Instant::now();
        let (mut c, _api, _channel, _id) = started(now);
        assert!(!c.render_frame());

        c.set_pointer_mode(PointerMode::Drawing);
        c.pointer_down(Point::new(30.0, 30.0));
        assert!(c.render_frame());
        assert!(!c.render_frame());
    }

    #[test]
    fn test_remote_mask_replaces_background_only() {
        let now = Instant::now();
        let (mut c, _api, channel, _id) = started(now);
        c.set_pointer_mode(PointerMode::Drawing);
        c.pointer_down(Point::new(30.0, 30.0));
        c.pointer_up(now);

        channel.push_text(r#"{"event":"mask","url":"http://x/mask-9.png"}"#);
        let notices = c.poll(now);

        assert!(notices.iter().any(|n| matches!(n, SessionNotice::MaskChanged)));
        assert_eq!(
            c.background().reference.as_deref(),
            Some("http://x/mask-9.png")
        );
        assert_eq!(c.renderer().curves().len(), 1);
        // The local push still goes out
        c.poll(now + Duration::from_millis(100));
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn test_unknown_event_is_dropped() {
        let now = Instant::now();
        let (mut c, _api, channel, id) = started(now);
        channel.push_text(r#"{"event":"cursor","x":1}"#);
        channel.push_text("{broken");

        let notices = c.poll(now);
        assert!(notices.is_empty());
        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(c.session().unwrap().id, id);
    }

    #[test]
    fn test_server_error_is_not_fatal() {
        let now = Instant::now();
        let (mut c, _api, channel, _id) = started(now);
        channel.push_text(r#"{"event":"error","message":"mask too large"}"#);

        let notices = c.poll(now);
        assert!(matches!(
            notices.as_slice(),
            [SessionNotice::ServerError(message)] if message == "mask too large"
        ));
        assert!(c.session().is_some());
    }

    #[test]
    fn test_reconnect_refetches_state() {
        let start = Instant::now();
        let (mut c, api, channel, id) = started(start);

        channel.drop_connection();
        let notices = c.poll(start);
        assert!(matches!(
            notices.as_slice(),
            [SessionNotice::ChannelLost { retry_in }] if *retry_in == Duration::from_secs(1)
        ));

        // Missed while offline
        api.add_comment(&id, 5.0, 5.0, "missed");
        api.set_mask(&id, "http://x/missed-mask.png");

        let notices = c.poll(start + Duration::from_secs(1));
        assert!(notices.iter().any(|n| matches!(n, SessionNotice::Reconnected)));

        let notices = c.poll(start + Duration::from_secs(1));
        assert!(notices.iter().any(|n| matches!(n, SessionNotice::Refreshed)));
        assert_eq!(
            c.comments().get(AnchorKey::new(5, 5)).unwrap().messages()[0].text,
            "missed"
        );
        assert_eq!(
            c.background().reference.as_deref(),
            Some("http://x/missed-mask.png")
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let now = Instant::now();
        let (mut c, _api, channel, _id) = started(now);
        c.set_pointer_mode(PointerMode::Drawing);
        c.pointer_down(Point::new(10.0, 10.0));
        c.pointer_up(now);
        channel.push_text(r#"{"event":"mask","url":"m"}"#);
        channel.push_text(
            r#"{"event":"comment","comment":{"left":1,"top":1,"message":"a","timestamp":1}}"#,
        );
        c.poll(now);

        c.reset();
        assert!(c.session().is_none());
        assert!(c.comments().is_empty());
        assert!(c.renderer().curves().is_empty());
        assert!(c.renderer().surface().is_blank());
        assert_eq!(c.background().reference, None);
        assert!(!c.dispatcher().is_joined());
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        // The armed push was cancelled with the session
        channel.push_text(r#"{"event":"mask","url":"late"}"#);
        let notices = c.poll(now + Duration::from_secs(1));
        assert!(matches!(notices.as_slice(), [SessionNotice::Reset]));
        assert!(channel.sent().is_empty());
        assert_eq!(c.background().reference, None);
    }

    #[test]
    fn test_resume_keeps_identical_comments_apart() {
        let (mut c, api, channel) = controller();
        api.insert_image(ImageSnapshot {
            id: "dup".to_string(),
            title: None,
            url: "http://x/img".to_string(),
            mask: None,
            timestamp: None,
            comments: vec![
                ("k1".to_string(), record(10.0, 10.0, "+1", 1000)),
                ("k2".to_string(), record(10.0, 10.0, "+1", 1000)),
            ],
        });
        let now = Instant::now();

        c.resume("dup").unwrap();
        c.poll(now);
        let key = AnchorKey::new(10, 10);
        assert_eq!(c.comments().get(key).unwrap().messages().len(), 2);

        // The picture event sent on connect replays the same map
        let pic = WireEvent::Pic {
            pic: api.image("dup").unwrap(),
        };
        channel.push_text(pic.to_json().unwrap());
        c.poll(now);
        assert_eq!(c.comments().get(key).unwrap().messages().len(), 2);

        let before = thread_contents(&c);
        c.reset();
        c.resume("dup").unwrap();
        c.poll(now);
        assert_eq!(thread_contents(&c), before);
    }

    #[test]
    fn test_refresh_keeps_open_draft() {
        let start = Instant::now();
        let (mut c, api, channel, id) = started(start);
        api.add_comment(&id, 1.0, 1.0, "old");
        c.resume(&id).unwrap();
        c.poll(start);
        c.poll(start);

        c.set_pointer_mode(PointerMode::Commenting);
        assert!(c.pointer_down(Point::new(7.0, 7.0)));
        let draft = AnchorKey::new(7, 7);

        channel.drop_connection();
        c.poll(start);
        api.add_comment(&id, 30.0, 30.0, "missed");
        c.poll(start + Duration::from_secs(1));
        let notices = c.poll(start + Duration::from_secs(1));
        assert!(notices.iter().any(|n| matches!(n, SessionNotice::Refreshed)));

        let thread = c.comments().get(draft).unwrap();
        assert!(thread.is_ephemeral());
        assert!(thread.is_expanded());
        assert_eq!(c.comments().expanded(), Some(draft));
        assert_eq!(c.comments().get(AnchorKey::new(1, 1)).unwrap().messages().len(), 1);
        assert_eq!(
            c.comments().get(AnchorKey::new(30, 30)).unwrap().messages()[0].text,
            "missed"
        );
    }

    #[test]
    fn test_failed_upload_reports_network_error() {
        let (mut c, api, _channel) = controller();
        api.fail_next(ApiError::Http("connection refused".to_string()));
        c.start_new(png()).unwrap();

        let notices = c.poll(Instant::now());
        assert!(matches!(
            notices.as_slice(),
            [SessionNotice::Failed(SessionError::Network(_))]
        ));
        assert!(c.session().is_none());
        assert!(!c.is_loading());
    }

    #[test]
    fn test_resume_from_link_and_memory() {
        let (mut c, api, _channel) = controller();
        seeded_image(&api);

        c.resume_from_link("http://localhost:3030/?id=abc").unwrap();
        c.poll(Instant::now());
        assert_eq!(c.session().unwrap().id, "abc");

        // No id in the link and nothing remembered
        let (mut c, _api, _channel) = controller();
        assert!(matches!(
            c.resume_from_link("http://localhost:3030/"),
            Err(SessionError::NoSession)
        ));

        let store = MemorySessionStore::new();
        store
            .remember(&RememberedSession {
                id: "abc".to_string(),
                share_link: None,
            })
            .unwrap();
        let (c, api, _channel) = controller();
        seeded_image(&api);
        let mut c = c.with_memory(Box::new(store));
        c.resume_from_link("http://localhost:3030/").unwrap();
        c.poll(Instant::now());
        assert_eq!(c.session().unwrap().id, "abc");
    }

    #[test]
    fn test_joined_session_is_remembered() {
        let (c, _api, _channel) = controller();
        let mut c = c.with_memory(Box::new(MemorySessionStore::new()));
        c.start_new(png()).unwrap();
        c.poll(Instant::now());

        assert_eq!(c.remembered_id().unwrap().as_deref(), Some("img-1"));
    }
}
