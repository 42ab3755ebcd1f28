//! Per-agent event bus: ordered pub/sub over the three channels.
//!
//! One monotonically increasing cursor per bus, incremented on every emit
//! across all channels. Each subscriber owns an independent bounded queue;
//! a subscriber that cannot keep up is dropped with a single
//! `subscriber lag` warning so it can re-subscribe from its last bookmark.
//! A ring buffer of recent envelopes serves short-term replays.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{AgentEvent, Channel, ErrorPhase, EventEnvelope, Severity};
use crate::types::Bookmark;

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// How many recent envelopes are retained for replay.
    pub ring_capacity: usize,
    /// Queue size used when a subscriber does not pick its own.
    pub default_queue_size: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        BusOptions {
            ring_capacity: 1024,
            default_queue_size: 256,
        }
    }
}

/// Subscription parameters.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay every retained event after this bookmark before going live.
    pub from: Option<Bookmark>,
    /// Per-subscriber queue bound; falls back to the bus default.
    pub queue_size: Option<usize>,
}

struct Subscriber {
    id: u64,
    channels: Vec<Channel>,
    tx: mpsc::Sender<EventEnvelope>,
}

impl Subscriber {
    fn wants(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }
}

struct BusInner {
    cursor: i64,
    ring: VecDeque<EventEnvelope>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Ordered event bus for a single agent.
pub struct EventBus {
    options: BusOptions,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(options: BusOptions) -> Self {
        EventBus {
            options,
            inner: Mutex::new(BusInner {
                cursor: 0,
                ring: VecDeque::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                closed: false,
            }),
        }
    }

    /// Publishes one event, assigning the next cursor. Returns the bookmark
    /// stamped onto the envelope.
    pub fn emit(&self, event: AgentEvent) -> Bookmark {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let mut pending = VecDeque::new();
        pending.push_back(event);
        let mut first = None;

        // Dropping a lagging subscriber enqueues one follow-up warning, so
        // drain a queue instead of recursing.
        while let Some(event) = pending.pop_front() {
            let bookmark = Self::deliver(&self.options, &mut inner, event, &mut pending);
            first.get_or_insert(bookmark);
        }
        first.expect("at least one event was delivered")
    }

    fn deliver(
        options: &BusOptions,
        inner: &mut BusInner,
        event: AgentEvent,
        pending: &mut VecDeque<AgentEvent>,
    ) -> Bookmark {
        inner.cursor += 1;
        let bookmark = Bookmark {
            seq: inner.cursor,
            timestamp: Utc::now(),
        };
        let envelope = EventEnvelope {
            cursor: inner.cursor,
            bookmark,
            channel: event.channel(),
            event,
        };

        inner.ring.push_back(envelope.clone());
        while inner.ring.len() > options.ring_capacity {
            inner.ring.pop_front();
        }

        if inner.closed {
            return bookmark;
        }

        let mut lagged = 0usize;
        inner.subscribers.retain(|sub| {
            if !sub.wants(envelope.channel) {
                return true;
            }
            match sub.tx.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = sub.id, cursor = envelope.cursor, "subscriber lag");
                    lagged += 1;
                    false
                }
            }
        });
        for _ in 0..lagged {
            pending.push_back(AgentEvent::Error {
                severity: Severity::Warn,
                phase: ErrorPhase::System,
                message: "subscriber lag".to_string(),
                detail: None,
            });
        }

        bookmark
    }

    /// Current cursor (0 before the first emit).
    pub fn cursor(&self) -> i64 {
        self.inner.lock().expect("bus lock poisoned").cursor
    }

    /// Registers a subscriber for a subset of channels.
    ///
    /// With `from` set, every retained event with a greater cursor is queued
    /// first, in cursor order, followed seamlessly by live events. A replay
    /// that overflows the subscriber's own queue drops the subscriber
    /// immediately, like any other lag.
    pub fn subscribe(&self, channels: &[Channel], opts: SubscribeOptions) -> Subscription {
        let queue_size = opts
            .queue_size
            .unwrap_or(self.options.default_queue_size)
            .max(1);
        let (tx, rx) = mpsc::channel(queue_size);

        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.closed {
            // Channel with no sender: recv() yields None right away.
            return Subscription { rx };
        }

        let mut keep = true;
        if let Some(from) = opts.from {
            for envelope in inner.ring.iter() {
                if envelope.cursor <= from.seq || !channels.contains(&envelope.channel) {
                    continue;
                }
                if tx.try_send(envelope.clone()).is_err() {
                    warn!(cursor = envelope.cursor, "subscriber lag during replay");
                    keep = false;
                    break;
                }
            }
        }

        if keep {
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber {
                id,
                channels: channels.to_vec(),
                tx,
            });
        }
        Subscription { rx }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("bus lock poisoned").subscribers.len()
    }

    /// Terminates every subscription. Subsequent emits still advance the
    /// cursor so bookmarks stay monotone.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.closed = true;
        inner.subscribers.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(BusOptions::default())
    }
}

/// A live event sequence. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<EventEnvelope>,
}

impl Subscription {
    /// Next envelope, or `None` once the bus (or this subscription) closed.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DoneReason;
    use crate::types::AgentState;

    fn text_event(step: u64) -> AgentEvent {
        AgentEvent::TextChunk {
            step,
            delta: format!("chunk-{step}"),
        }
    }

    #[tokio::test]
    async fn cursor_increases_across_channels() {
        let bus = EventBus::default();
        let b1 = bus.emit(text_event(1));
        let b2 = bus.emit(AgentEvent::StateChanged {
            state: AgentState::Working,
        });
        let b3 = bus.emit(AgentEvent::Done {
            step: 1,
            reason: DoneReason::Completed,
        });
        assert_eq!((b1.seq, b2.seq, b3.seq), (1, 2, 3));
        assert_eq!(bus.cursor(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_only_their_channels() {
        let bus = EventBus::default();
        let mut progress = bus.subscribe(&[Channel::Progress], SubscribeOptions::default());
        let mut monitor = bus.subscribe(&[Channel::Monitor], SubscribeOptions::default());

        bus.emit(text_event(1));
        bus.emit(AgentEvent::StateChanged {
            state: AgentState::Ready,
        });

        let envelope = progress.recv().await.unwrap();
        assert_eq!(envelope.channel, Channel::Progress);
        assert_eq!(envelope.cursor, 1);

        let envelope = monitor.recv().await.unwrap();
        assert_eq!(envelope.channel, Channel::Monitor);
        assert_eq!(envelope.cursor, 2);
    }

    #[tokio::test]
    async fn replay_from_bookmark_then_live() {
        let bus = EventBus::default();
        let mut bookmarks = Vec::new();
        for step in 1..=5 {
            bookmarks.push(bus.emit(text_event(step)));
        }

        let mut sub = bus.subscribe(
            &[Channel::Progress],
            SubscribeOptions {
                from: Some(bookmarks[1]),
                queue_size: None,
            },
        );
        bus.emit(text_event(6));

        let cursors: Vec<i64> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.cursor)
        .collect();
        assert_eq!(cursors, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn slow_subscriber_dropped_with_single_warning() {
        let bus = EventBus::default();
        let mut stalled = bus.subscribe(
            &[Channel::Progress],
            SubscribeOptions {
                from: None,
                queue_size: Some(2),
            },
        );
        let mut healthy = bus.subscribe(&[Channel::Progress, Channel::Monitor], SubscribeOptions {
            from: None,
            queue_size: Some(64),
        });

        for step in 1..=4 {
            bus.emit(text_event(step));
        }
        assert_eq!(bus.subscriber_count(), 1);

        // Stalled consumer drains what fit and then sees end-of-stream.
        assert_eq!(stalled.recv().await.unwrap().cursor, 1);
        assert_eq!(stalled.recv().await.unwrap().cursor, 2);
        assert!(stalled.recv().await.is_none());

        // Healthy consumer observes every event plus exactly one warning.
        let mut warnings = 0;
        let mut cursors = Vec::new();
        while let Some(envelope) = healthy.try_recv() {
            if let AgentEvent::Error { message, .. } = &envelope.event {
                assert_eq!(message, "subscriber lag");
                warnings += 1;
            }
            cursors.push(envelope.cursor);
        }
        assert_eq!(warnings, 1);
        let mut sorted = cursors.clone();
        sorted.sort_unstable();
        assert_eq!(cursors, sorted);
    }

    #[tokio::test]
    async fn close_terminates_subscriptions() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(&[Channel::Progress], SubscribeOptions::default());
        bus.close();
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);

        // Cursor keeps advancing after close.
        bus.emit(text_event(1));
        assert_eq!(bus.cursor(), 1);
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let bus = EventBus::new(BusOptions {
            ring_capacity: 3,
            default_queue_size: 16,
        });
        let mut bookmarks = Vec::new();
        for step in 1..=6 {
            bookmarks.push(bus.emit(text_event(step)));
        }

        // Only the last three envelopes survive for replay.
        let mut sub = bus.subscribe(
            &[Channel::Progress],
            SubscribeOptions {
                from: Some(bookmarks[0]),
                queue_size: None,
            },
        );
        let first = sub.recv().await.unwrap();
        assert_eq!(first.cursor, 4);
    }
}
