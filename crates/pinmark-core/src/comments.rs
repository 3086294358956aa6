//! Positional comment threads.
//!
//! A thread is identified by its anchor: the comment position rounded to
//! whole image pixels. Local drafts and server-delivered comments share that
//! identity space, so a draft echoed back by the server lands in the same
//! thread instead of creating a second one.
//!
//! Comments reach the store twice: keyed, inside image snapshots, and
//! unkeyed, as live events. Snapshot entries are deduplicated by server key.
//! A live event and a snapshot entry with the same anchor, text and timestamp
//! are taken to be the same comment, each pairing at most once, so identical
//! but distinct comments all survive.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Rounded image-local position identifying a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorKey {
    pub x: i64,
    pub y: i64,
}

impl AnchorKey {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Dedupe key for a position.
    pub fn from_point(point: Point) -> Self {
        Self {
            x: point.x.round() as i64,
            y: point.y.round() as i64,
        }
    }

    pub fn position(&self) -> Point {
        Point::new(self.x as f64, self.y as f64)
    }
}

/// One confirmed message in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    /// Server timestamp in milliseconds.
    pub timestamp: u64,
}

/// A comment delivered by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentEvent {
    pub position: Point,
    pub message: Message,
}

/// A comment thread anchored at one position.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    key: AnchorKey,
    messages: Vec<Message>,
    expanded: bool,
}

impl CommentThread {
    fn new(key: AnchorKey, expanded: bool) -> Self {
        Self {
            key,
            messages: Vec::new(),
            expanded,
        }
    }

    pub fn key(&self) -> AnchorKey {
        self.key
    }

    /// Messages in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// A thread without confirmed messages only exists while its popover is open.
    pub fn is_ephemeral(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Result of closing a thread's popover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The thread had no messages and was removed.
    Discarded,
    /// The thread was collapsed and kept.
    Retained,
    /// No thread exists at that key.
    Missing,
}

/// Identity used to pair live events with snapshot entries.
type Fingerprint = (AnchorKey, Message);

/// In-memory collection of comment threads.
#[derive(Debug, Clone, Default)]
pub struct CommentStore {
    threads: HashMap<AnchorKey, CommentThread>,
    /// Creation order of threads.
    order: Vec<AnchorKey>,
    /// Server keys already applied from snapshots.
    server_keys: HashSet<String>,
    /// Live comments not yet seen in a snapshot.
    unpaired_live: HashMap<Fingerprint, usize>,
    /// Snapshot comments not yet seen as a live event.
    unpaired_keyed: HashMap<Fingerprint, usize>,
}

impl CommentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, key: AnchorKey) -> Option<&CommentThread> {
        self.threads.get(&key)
    }

    /// Threads in creation order.
    pub fn threads(&self) -> impl Iterator<Item = &CommentThread> {
        self.order.iter().filter_map(|key| self.threads.get(key))
    }

    /// The currently expanded thread, if any.
    pub fn expanded(&self) -> Option<AnchorKey> {
        self.threads().find(|t| t.expanded).map(|t| t.key)
    }

    /// Open a draft thread at `position`.
    ///
    /// Reuses an existing thread at the same anchor. The thread ends up as the
    /// only expanded one.
    pub fn create_local(&mut self, position: Point) -> AnchorKey {
        let key = AnchorKey::from_point(position);
        if !self.threads.contains_key(&key) {
            self.insert(CommentThread::new(key, false));
        }
        self.expand(key);
        key
    }

    /// Apply a live comment event.
    ///
    /// Returns true if the store changed. The event is absorbed without a
    /// change when it pairs with a snapshot entry applied earlier.
    pub fn reconcile_remote(&mut self, event: &CommentEvent, comments_visible: bool) -> bool {
        let fingerprint = (AnchorKey::from_point(event.position), event.message.clone());
        if take_one(&mut self.unpaired_keyed, &fingerprint) {
            return false;
        }
        self.append(event, comments_visible);
        *self.unpaired_live.entry(fingerprint).or_insert(0) += 1;
        true
    }

    /// Apply one entry of a server snapshot's comment map.
    ///
    /// Returns true if the store changed. An entry whose `server_key` was
    /// applied before is ignored, as is one that pairs with an earlier live
    /// event.
    pub fn reconcile_keyed(
        &mut self,
        server_key: &str,
        event: &CommentEvent,
        comments_visible: bool,
    ) -> bool {
        if !self.server_keys.insert(server_key.to_string()) {
            return false;
        }
        let fingerprint = (AnchorKey::from_point(event.position), event.message.clone());
        if take_one(&mut self.unpaired_live, &fingerprint) {
            return false;
        }
        self.append(event, comments_visible);
        *self.unpaired_keyed.entry(fingerprint).or_insert(0) += 1;
        true
    }

    /// Apply a snapshot's comment map in order. Returns true if anything changed.
    pub fn reconcile_snapshot<'a>(
        &mut self,
        entries: impl IntoIterator<Item = (&'a str, CommentEvent)>,
        comments_visible: bool,
    ) -> bool {
        let mut changed = false;
        for (server_key, event) in entries {
            changed |= self.reconcile_keyed(server_key, &event, comments_visible);
        }
        changed
    }

    /// Append a message, materializing its thread if needed.
    fn append(&mut self, event: &CommentEvent, comments_visible: bool) {
        let key = AnchorKey::from_point(event.position);

        if !self.threads.contains_key(&key) {
            // Never steal the popover from another open thread
            let expand = comments_visible && self.expanded().is_none();
            self.insert(CommentThread::new(key, expand));
            log::debug!("Materialized remote thread at ({}, {})", key.x, key.y);
        }

        if let Some(thread) = self.threads.get_mut(&key) {
            thread.messages.push(event.message.clone());
        }
    }

    /// Close a thread's popover.
    pub fn close(&mut self, key: AnchorKey) -> CloseOutcome {
        let Some(thread) = self.threads.get_mut(&key) else {
            return CloseOutcome::Missing;
        };
        if thread.is_ephemeral() {
            self.remove(key);
            return CloseOutcome::Discarded;
        }
        thread.expanded = false;
        CloseOutcome::Retained
    }

    /// Expand `key`, closing every other thread first.
    ///
    /// Returns false if no thread exists at `key`.
    pub fn expand(&mut self, key: AnchorKey) -> bool {
        if !self.threads.contains_key(&key) {
            return false;
        }

        let others: Vec<AnchorKey> = self
            .threads
            .values()
            .filter(|t| t.expanded && t.key != key)
            .map(|t| t.key)
            .collect();
        for other in others {
            self.close(other);
        }

        if let Some(thread) = self.threads.get_mut(&key) {
            thread.expanded = true;
        }
        true
    }

    /// Drop every thread and everything known about applied comments.
    pub fn clear(&mut self) {
        self.threads.clear();
        self.order.clear();
        self.server_keys.clear();
        self.unpaired_live.clear();
        self.unpaired_keyed.clear();
    }

    fn insert(&mut self, thread: CommentThread) {
        self.order.push(thread.key);
        self.threads.insert(thread.key, thread);
    }

    fn remove(&mut self, key: AnchorKey) {
        self.threads.remove(&key);
        self.order.retain(|k| *k != key);
    }
}

/// Decrement the count for `fingerprint`; false if there was none.
fn take_one(counts: &mut HashMap<Fingerprint, usize>, fingerprint: &Fingerprint) -> bool {
    match counts.get_mut(fingerprint) {
        Some(count) if *count > 1 => {
            *count -= 1;
            true
        }
        Some(_) => {
            counts.remove(fingerprint);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(x: f64, y: f64, text: &str, timestamp: u64) -> CommentEvent {
        CommentEvent {
            position: Point::new(x, y),
            message: Message {
                text: text.to_string(),
                timestamp,
            },
        }
    }

    fn texts(store: &CommentStore, key: AnchorKey) -> Vec<String> {
        store
            .get(key)
            .unwrap()
            .messages()
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }

    #[test]
    fn test_anchor_key_rounds() {
        assert_eq!(AnchorKey::from_point(Point::new(49.6, 50.4)), AnchorKey::new(50, 50));
        assert_eq!(AnchorKey::from_point(Point::new(-0.4, 0.5)), AnchorKey::new(0, 1));
    }

    #[test]
    fn test_remote_messages_in_arrival_order() {
        let mut store = CommentStore::new();
        store.reconcile_remote(&event(120.0, 80.0, "hi", 2), false);
        store.reconcile_remote(&event(120.0, 80.0, "there", 1), false);

        assert_eq!(store.len(), 1);
        assert_eq!(texts(&store, AnchorKey::new(120, 80)), vec!["hi", "there"]);
    }

    #[test]
    fn test_same_key_dedupes_threads() {
        let mut store = CommentStore::new();
        for i in 0..20u64 {
            // Interleave a second key and jitter within the rounding window
            store.reconcile_remote(&event(10.2, 10.4, &format!("m{}", i), i), false);
            store.reconcile_remote(&event(300.0, 5.0, &format!("o{}", i), i), false);
            store.reconcile_remote(&event(9.6, 9.7, &format!("n{}", i), i), false);
        }

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(AnchorKey::new(10, 10)).unwrap().messages().len(), 40);
    }

    #[test]
    fn test_keyed_replay_is_idempotent() {
        let mut store = CommentStore::new();
        assert!(store.reconcile_keyed("k1", &event(1.0, 1.0, "x", 5), false));
        assert!(!store.reconcile_keyed("k1", &event(1.0, 1.0, "x", 5), false));
        assert_eq!(texts(&store, AnchorKey::new(1, 1)), vec!["x"]);
    }

    #[test]
    fn test_identical_comments_under_distinct_keys_survive() {
        let mut store = CommentStore::new();
        assert!(store.reconcile_keyed("k1", &event(10.0, 10.0, "+1", 1000), false));
        assert!(store.reconcile_keyed("k2", &event(10.0, 10.0, "+1", 1000), false));
        // Replaying the same map changes nothing
        assert!(!store.reconcile_keyed("k2", &event(10.0, 10.0, "+1", 1000), false));

        assert_eq!(texts(&store, AnchorKey::new(10, 10)), vec!["+1", "+1"]);
    }

    #[test]
    fn test_identical_live_events_survive() {
        let mut store = CommentStore::new();
        assert!(store.reconcile_remote(&event(1.0, 1.0, "x", 5), false));
        assert!(store.reconcile_remote(&event(1.0, 1.0, "x", 5), false));
        assert_eq!(texts(&store, AnchorKey::new(1, 1)), vec!["x", "x"]);
    }

    #[test]
    fn test_live_event_pairs_with_snapshot_entry_once() {
        let mut store = CommentStore::new();
        store.reconcile_keyed("k1", &event(1.0, 1.0, "x", 5), false);

        // The echo of k1 is absorbed, a second identical event is a new comment
        assert!(!store.reconcile_remote(&event(1.0, 1.0, "x", 5), false));
        assert!(store.reconcile_remote(&event(1.0, 1.0, "x", 5), false));
        assert_eq!(texts(&store, AnchorKey::new(1, 1)), vec!["x", "x"]);
    }

    #[test]
    fn test_snapshot_entry_pairs_with_earlier_live_event() {
        let mut store = CommentStore::new();
        store.reconcile_remote(&event(1.0, 1.0, "x", 5), false);

        assert!(!store.reconcile_keyed("k1", &event(1.0, 1.0, "x", 5), false));
        assert!(store.reconcile_keyed("k2", &event(1.0, 1.0, "x", 5), false));
        assert_eq!(texts(&store, AnchorKey::new(1, 1)), vec!["x", "x"]);
    }

    #[test]
    fn test_clear_forgets_applied_keys() {
        let mut store = CommentStore::new();
        store.reconcile_keyed("k1", &event(1.0, 1.0, "x", 5), false);
        store.clear();

        assert!(store.reconcile_keyed("k1", &event(1.0, 1.0, "x", 5), false));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_local_draft_then_echo() {
        let mut store = CommentStore::new();
        let key = store.create_local(Point::new(50.0, 50.0));
        store.reconcile_remote(&event(50.0, 50.0, "x", 99), false);

        assert_eq!(store.len(), 1);
        assert_eq!(texts(&store, key), vec!["x"]);
        // The echo keeps the draft open
        assert!(store.get(key).unwrap().is_expanded());
    }

    #[test]
    fn test_close_ephemeral_discards() {
        let mut store = CommentStore::new();
        let key = store.create_local(Point::new(5.0, 5.0));
        assert_eq!(store.close(key), CloseOutcome::Discarded);
        assert!(store.get(key).is_none());
        assert_eq!(store.close(key), CloseOutcome::Missing);
    }

    #[test]
    fn test_close_confirmed_retains() {
        let mut store = CommentStore::new();
        let key = store.create_local(Point::new(5.0, 5.0));
        store.reconcile_remote(&event(5.0, 5.0, "kept", 1), false);

        assert_eq!(store.close(key), CloseOutcome::Retained);
        let thread = store.get(key).unwrap();
        assert!(!thread.is_expanded());
        assert_eq!(thread.messages().len(), 1);
    }

    #[test]
    fn test_expand_is_exclusive() {
        let mut store = CommentStore::new();
        let a = AnchorKey::new(1, 1);
        let b = AnchorKey::new(2, 2);
        let c = AnchorKey::new(3, 3);
        for (key, text) in [(a, "a"), (b, "b"), (c, "c")] {
            store.reconcile_remote(&event(key.x as f64, key.y as f64, text, 1), false);
        }

        for key in [a, b, c, b, a, a, c] {
            assert!(store.expand(key));
            assert_eq!(store.expanded(), Some(key));
            assert_eq!(store.threads().filter(|t| t.is_expanded()).count(), 1);
        }
        assert!(!store.expand(AnchorKey::new(9, 9)));
    }

    #[test]
    fn test_expand_discards_open_draft() {
        let mut store = CommentStore::new();
        store.reconcile_remote(&event(1.0, 1.0, "a", 1), false);
        let draft = store.create_local(Point::new(40.0, 40.0));

        store.expand(AnchorKey::new(1, 1));
        assert!(store.get(draft).is_none());
    }

    #[test]
    fn test_create_local_collapses_other() {
        let mut store = CommentStore::new();
        store.reconcile_remote(&event(1.0, 1.0, "a", 1), false);
        store.expand(AnchorKey::new(1, 1));

        let key = store.create_local(Point::new(70.0, 70.0));
        assert_eq!(store.expanded(), Some(key));
        assert!(!store.get(AnchorKey::new(1, 1)).unwrap().is_expanded());
    }

    #[test]
    fn test_visibility_toggle_expands_new_remote_thread() {
        let mut store = CommentStore::new();
        store.reconcile_remote(&event(1.0, 1.0, "a", 1), true);
        assert_eq!(store.expanded(), Some(AnchorKey::new(1, 1)));

        // A second thread does not take over the open popover
        store.reconcile_remote(&event(2.0, 2.0, "b", 1), true);
        assert_eq!(store.expanded(), Some(AnchorKey::new(1, 1)));

        store.reconcile_remote(&event(3.0, 3.0, "c", 1), false);
        assert!(!store.get(AnchorKey::new(3, 3)).unwrap().is_expanded());
    }

    #[test]
    fn test_threads_in_creation_order() {
        let mut store = CommentStore::new();
        store.reconcile_remote(&event(30.0, 0.0, "1", 1), false);
        store.reconcile_remote(&event(10.0, 0.0, "2", 1), false);
        store.reconcile_remote(&event(20.0, 0.0, "3", 1), false);

        let xs: Vec<i64> = store.threads().map(|t| t.key().x).collect();
        assert_eq!(xs, vec![30, 10, 20]);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.threads().count(), 0);
    }
}
