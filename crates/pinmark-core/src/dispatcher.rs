//! Realtime event dispatcher.
//!
//! Binds one session to the live channel: opens and closes it, decodes
//! inbound frames, reconnects with exponential backoff after an unexpected
//! loss, and routes decoded events through [`dispatch`].

use crate::channel::{ChannelError, ChannelEvent, ConnectionState, LiveChannel};
use crate::comments::CommentStore;
use crate::debounce::deadline_after;
use crate::mask::MaskSync;
use crate::protocol::{ProtocolError, RemoteEvent, decode_event};
use crate::session::{Session, SessionContext, SessionNotice};
use std::time::{Duration, Instant};

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }
}

/// What the dispatcher observed during one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A decoded event to route.
    Remote(RemoteEvent),
    /// First connection of the current join.
    Connected,
    /// Connection restored after a loss; local state may be stale.
    Resubscribed,
    /// Connection lost; a reconnect is scheduled.
    ChannelLost { retry_in: Duration },
    /// A frame that could not be decoded.
    Dropped(ProtocolError),
}

#[derive(Debug, Clone)]
struct Subscription {
    session_id: String,
    url: String,
}

/// Owns the live channel for the current session.
pub struct Dispatcher<C: LiveChannel> {
    channel: C,
    subscription: Option<Subscription>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    /// A loss happened since the last successful open.
    recovering: bool,
}

impl<C: LiveChannel> Dispatcher<C> {
    pub fn new(channel: C, backoff: Backoff) -> Self {
        Self {
            channel,
            subscription: None,
            backoff,
            reconnect_at: None,
            recovering: false,
        }
    }

    /// Subscribe to `session_id` on `url`, leaving any previous session.
    pub fn join(&mut self, session_id: &str, url: &str) -> Result<(), ChannelError> {
        self.leave();
        self.channel.open(url)?;
        log::info!("Joining live channel for {}", session_id);
        self.subscription = Some(Subscription {
            session_id: session_id.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }

    /// Close the channel. No reconnect follows.
    pub fn leave(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            log::info!("Leaving live channel for {}", subscription.session_id);
        }
        if self.channel.state() != ConnectionState::Disconnected {
            self.channel.close();
        }
        self.reconnect_at = None;
        self.recovering = false;
        self.backoff.reset();
    }

    pub fn session_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn is_joined(&self) -> bool {
        self.subscription.is_some()
    }

    /// When the next reconnect attempt is due.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Service the channel: reconnect if due, drain and decode events.
    pub fn poll(&mut self, now: Instant) -> Vec<DispatchEvent> {
        let mut out = Vec::new();
        let Some(subscription) = self.subscription.clone() else {
            return out;
        };

        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            log::info!("Reconnecting live channel for {}", subscription.session_id);
            if let Err(e) = self.channel.open(&subscription.url) {
                log::warn!("Reconnect failed: {}", e);
                out.push(self.schedule_reconnect(now));
            }
        }

        for event in self.channel.poll_events() {
            match event {
                ChannelEvent::Opened => {
                    self.backoff.reset();
                    if self.recovering {
                        self.recovering = false;
                        out.push(DispatchEvent::Resubscribed);
                    } else {
                        out.push(DispatchEvent::Connected);
                    }
                }
                ChannelEvent::Text(text) => match decode_event(&text) {
                    Ok(event) => out.push(DispatchEvent::Remote(event)),
                    Err(e) => {
                        log::warn!("Dropping live frame: {}", e);
                        out.push(DispatchEvent::Dropped(e));
                    }
                },
                ChannelEvent::Closed => {
                    log::warn!("Live channel closed");
                    out.push(self.schedule_reconnect(now));
                }
                ChannelEvent::Error(message) => {
                    log::warn!("Live channel error: {}", message);
                    out.push(self.schedule_reconnect(now));
                }
            }
        }
        out
    }

    fn schedule_reconnect(&mut self, now: Instant) -> DispatchEvent {
        let retry_in = self.backoff.next_delay();
        self.reconnect_at = Some(deadline_after(now, retry_in));
        self.recovering = true;
        DispatchEvent::ChannelLost { retry_in }
    }
}

/// State a remote event can touch.
pub struct RouteTargets<'a> {
    pub comments: &'a mut CommentStore,
    pub mask: &'a mut MaskSync,
    pub session: &'a mut Option<Session>,
    pub context: &'a SessionContext,
}

/// Apply one remote event. Returns the notice to raise, if any.
pub fn dispatch(event: RemoteEvent, targets: &mut RouteTargets<'_>) -> Option<SessionNotice> {
    match event {
        RemoteEvent::CommentAdded(comment) => targets
            .comments
            .reconcile_remote(&comment, targets.context.comments_visible)
            .then_some(SessionNotice::CommentsChanged),
        RemoteEvent::PictureUpdated(snapshot) => {
            let session = targets.session.as_mut()?;
            if session.id != snapshot.id {
                log::warn!("Ignoring picture update for {}", snapshot.id);
                return None;
            }
            session.apply_snapshot(&snapshot);
            if let Some(mask) = &snapshot.mask {
                if targets.mask.background().reference.as_ref() != Some(mask) {
                    targets.mask.apply_remote(mask.clone());
                }
            }
            targets.comments.reconcile_snapshot(
                snapshot.keyed_comment_events(),
                targets.context.comments_visible,
            );
            Some(SessionNotice::PictureUpdated)
        }
        RemoteEvent::MaskUpdated(reference) => {
            if let Some(session) = targets.session.as_mut() {
                session.mask = Some(reference.clone());
            }
            targets.mask.apply_remote(reference);
            Some(SessionNotice::MaskChanged)
        }
        RemoteEvent::ProtocolError(message) => {
            log::warn!("Server reported: {}", message);
            Some(SessionNotice::ServerError(message))
        }
    }
}
