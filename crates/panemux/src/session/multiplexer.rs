//! Session output multiplexer.
//!
//! Fans a session's output out to any number of subscribers. Every chunk is
//! appended to the session's scrollback and offered to each subscriber's
//! bounded queue before the next chunk is looked at, so all subscribers
//! observe the same order. Sends never block: a subscriber whose queue is
//! full is handled by the [`OverflowPolicy`] and cannot stall the others.
//!
//! The exit event is queued past the capacity limit, so it reaches every
//! subscriber still attached no matter how far behind it is.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::backend::ExitStatus;
use super::scrollback::Scrollback;

/// Identifier of a subscriber, unique within one session.
pub type SubscriberId = u64;

/// Default number of events buffered per subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of raw process output.
    Data(Bytes),
    /// The process exited. Always the last event of a subscription.
    Exit(ExitStatus),
}

/// What happens to a subscriber whose queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Detach the subscriber. Its stream ends without an exit event once the
    /// buffered events are drained, and it can re-subscribe with replay.
    #[default]
    Disconnect,
    /// Discard that subscriber's oldest queued chunk to make room and mark
    /// it as lagging.
    Drop,
}

/// Options for [`SessionOutputBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliver the current scrollback before live output.
    pub replay: bool,
    /// Queue capacity; the broadcaster default when `None`.
    pub capacity: Option<usize>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            replay: true,
            capacity: None,
        }
    }
}

impl SubscribeOptions {
    pub fn live_only() -> Self {
        Self {
            replay: false,
            capacity: None,
        }
    }
}

/// Delivery statistics for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Chunks queued for the subscriber.
    pub delivered: u64,
    /// Queued chunks discarded unread to make room for newer ones.
    pub dropped: u64,
    /// Whether the most recent chunk pushed an older one out.
    pub lagging: bool,
}

enum Delivery {
    Sent,
    Disconnect,
}

struct InboxState {
    events: VecDeque<SessionEvent>,
    capacity: usize,
    /// No more events will be queued.
    closed: bool,
}

/// Bounded event queue shared by one subscriber and the broadcaster.
struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                events: VecDeque::new(),
                capacity,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the final event regardless of capacity and closes the inbox.
    fn finish(&self, event: SessionEvent) {
        let mut state = self.lock();
        if !state.closed {
            state.events.push_back(event);
            state.closed = true;
        }
        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

struct SubscriberHandle {
    id: SubscriberId,
    inbox: Arc<Inbox>,
    stats: SubscriberStats,
}

impl SubscriberHandle {
    /// Queues a data chunk without blocking.
    fn offer(&mut self, chunk: &Bytes, policy: OverflowPolicy, label: &str) -> Delivery {
        let mut inbox = self.inbox.lock();
        if inbox.closed {
            return Delivery::Disconnect;
        }

        if inbox.events.len() < inbox.capacity {
            inbox.events.push_back(SessionEvent::Data(chunk.clone()));
            drop(inbox);
            self.inbox.notify.notify_one();
            self.stats.delivered += 1;
            if self.stats.lagging {
                self.stats.lagging = false;
                tracing::debug!(session_key = %label, subscriber = self.id, "Subscriber caught up");
            }
            return Delivery::Sent;
        }

        match policy {
            OverflowPolicy::Disconnect => {
                inbox.closed = true;
                drop(inbox);
                self.inbox.notify.notify_one();
                tracing::warn!(
                    session_key = %label,
                    subscriber = self.id,
                    delivered = self.stats.delivered,
                    "Subscriber fell behind, disconnecting"
                );
                Delivery::Disconnect
            }
            OverflowPolicy::Drop => {
                inbox.events.pop_front();
                inbox.events.push_back(SessionEvent::Data(chunk.clone()));
                drop(inbox);
                self.inbox.notify.notify_one();
                self.stats.delivered += 1;
                self.stats.dropped += 1;
                if !self.stats.lagging {
                    self.stats.lagging = true;
                    tracing::warn!(
                        session_key = %label,
                        subscriber = self.id,
                        dropped = self.stats.dropped,
                        "Subscriber is lagging, dropping oldest output"
                    );
                }
                Delivery::Sent
            }
        }
    }
}

struct OutputState {
    scrollback: Scrollback,
    subscribers: Vec<SubscriberHandle>,
    next_id: SubscriberId,
    data_closed: bool,
    exit: Option<ExitStatus>,
}

/// Scrollback plus subscriber set of one session.
pub struct SessionOutputBroadcaster {
    label: String,
    state: Mutex<OutputState>,
    policy: OverflowPolicy,
    default_capacity: usize,
    last_activity: AtomicU64,
}

impl SessionOutputBroadcaster {
    /// `label` only appears in log events.
    pub fn new(
        label: impl Into<String>,
        scrollback: Scrollback,
        policy: OverflowPolicy,
        default_capacity: usize,
    ) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(OutputState {
                scrollback,
                subscribers: Vec::new(),
                next_id: 1,
                data_closed: false,
                exit: None,
            }),
            policy,
            default_capacity: default_capacity.max(1),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber.
    ///
    /// The replayed scrollback and the registration are taken under the
    /// same lock as [`publish`](Self::publish), so a chunk is either part of
    /// the replay or delivered live, never both and never neither. On a
    /// finished session the subscription yields the replay and the exit
    /// event, then ends.
    pub fn subscribe(self: &Arc<Self>, options: SubscribeOptions) -> Subscription {
        let capacity = options.capacity.unwrap_or(self.default_capacity).max(1);
        let inbox = Arc::new(Inbox::new(capacity));

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let backlog: VecDeque<Bytes> = if options.replay {
            state.scrollback.snapshot().into()
        } else {
            VecDeque::new()
        };

        if let Some(exit) = state.exit.clone() {
            inbox.finish(SessionEvent::Exit(exit));
        } else {
            state.subscribers.push(SubscriberHandle {
                id,
                inbox: Arc::clone(&inbox),
                stats: SubscriberStats::default(),
            });
        }
        let subscribers = state.subscribers.len();
        drop(state);

        tracing::debug!(
            session_key = %self.label,
            subscriber = id,
            replayed = backlog.len(),
            subscribers,
            "Subscriber attached"
        );

        Subscription {
            id,
            backlog,
            inbox,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Removes a subscriber, returning its final statistics.
    pub fn unsubscribe(&self, id: SubscriberId) -> Option<SubscriberStats> {
        let mut state = self.lock();
        let index = state.subscribers.iter().position(|s| s.id == id)?;
        let handle = state.subscribers.swap_remove(index);
        drop(state);
        handle.inbox.close();

        tracing::debug!(session_key = %self.label, subscriber = id, "Subscriber detached");
        Some(handle.stats)
    }

    /// Appends a chunk to the scrollback and offers it to every subscriber.
    ///
    /// Returns the number of subscribers the chunk was queued for. Once the
    /// output is closed this is a no-op.
    pub fn publish(&self, chunk: Bytes) -> usize {
        if chunk.is_empty() {
            return 0;
        }

        let mut state = self.lock();
        if state.data_closed {
            return 0;
        }
        self.last_activity.store(now_millis(), Ordering::Relaxed);

        state.scrollback.push(chunk.clone());

        let policy = self.policy;
        let label = self.label.as_str();
        let mut delivered = 0;
        state.subscribers.retain_mut(|handle| match handle.offer(&chunk, policy, label) {
            Delivery::Sent => {
                delivered += 1;
                true
            }
            Delivery::Disconnect => {
                tracing::debug!(session_key = %label, subscriber = handle.id, "Removed subscriber");
                false
            }
        });

        delivered
    }

    /// Stops accepting output. Subscribers stay attached for the exit event.
    pub fn close(&self) {
        self.lock().data_closed = true;
    }

    /// Records the exit status and delivers the exit event to every
    /// subscriber, then detaches them all.
    ///
    /// Only the first call has any effect; it returns `true`.
    pub fn finish(&self, status: ExitStatus) -> bool {
        let mut state = self.lock();
        if state.exit.is_some() {
            return false;
        }
        state.data_closed = true;
        state.exit = Some(status.clone());

        let subscribers = std::mem::take(&mut state.subscribers);
        drop(state);

        let count = subscribers.len();
        for handle in subscribers {
            handle.inbox.finish(SessionEvent::Exit(status.clone()));
        }

        tracing::debug!(
            session_key = %self.label,
            subscribers = count,
            status = %status,
            "Broadcast exit"
        );
        true
    }

    /// Whether new output is still accepted.
    pub fn is_open(&self) -> bool {
        !self.lock().data_closed
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.lock().exit.clone()
    }

    pub fn scrollback_snapshot(&self) -> Vec<Bytes> {
        self.lock().scrollback.snapshot()
    }

    pub fn scrollback_contents(&self) -> Vec<u8> {
        self.lock().scrollback.contents()
    }

    pub fn scrollback_tail(&self, max_bytes: usize) -> Vec<u8> {
        self.lock().scrollback.tail(max_bytes)
    }

    pub fn scrollback_len(&self) -> usize {
        self.lock().scrollback.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn subscriber_stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.lock()
            .subscribers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.stats.clone())
    }

    pub fn all_subscriber_stats(&self) -> HashMap<SubscriberId, SubscriberStats> {
        self.lock()
            .subscribers
            .iter()
            .map(|s| (s.id, s.stats.clone()))
            .collect()
    }

    /// Unix milliseconds of the last published chunk (or of creation).
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// A live attachment to a session's output.
///
/// Dropping the subscription detaches it.
pub struct Subscription {
    id: SubscriberId,
    backlog: VecDeque<Bytes>,
    inbox: Arc<Inbox>,
    broadcaster: Weak<SessionOutputBroadcaster>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Replayed chunks not yet consumed.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Next event: replayed scrollback first, then live events.
    ///
    /// `None` means the stream is over. If no [`SessionEvent::Exit`] came
    /// before it, the subscriber was detached for falling behind.
    ///
    /// Cancel safe: an event is only taken once the future completes.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let notified = self.inbox.notify.notified();
            {
                if let Some(chunk) = self.backlog.pop_front() {
                    return Some(SessionEvent::Data(chunk));
                }
                let mut inbox = self.inbox.lock();
                if let Some(event) = inbox.events.pop_front() {
                    return Some(event);
                }
                if inbox.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        if let Some(chunk) = self.backlog.pop_front() {
            return Some(SessionEvent::Data(chunk));
        }
        self.inbox.lock().events.pop_front()
    }

    /// Detaches explicitly, returning the final statistics if still attached.
    pub fn unsubscribe(self) -> Option<SubscriberStats> {
        self.broadcaster
            .upgrade()
            .and_then(|broadcaster| broadcaster.unsubscribe(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
