use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering},
};

use cascade_timing::{Duration, Instant};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

/// Named control message delivered into a filter between processing cycles.
/// Delivery time in the past (the default) means "next cycle"; timeouts are
/// expressed as delivery-time deltas.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    params: Value,
    when: Instant,
    reply: Option<Sender<Value>>,
}

impl Event {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self { name: name.into(), params, when: Instant::ZERO, reply: None }
    }

    /// Delays delivery until `when`.
    pub fn at(mut self, when: Instant) -> Self {
        self.when = when;
        self
    }

    /// Delays delivery by `delay` from now.
    pub fn after(self, delay: Duration) -> Self {
        let when = Instant::now() + delay;
        self.at(when)
    }

    /// Attaches a sink the handler can answer through.
    pub fn with_reply(mut self, reply: Sender<Value>) -> Self {
        self.reply = Some(reply);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn params(&self) -> &Value {
        &self.params
    }

    #[inline]
    pub fn when(&self) -> Instant {
        self.when
    }

    /// Sends `value` to the response sink, if any. A gone receiver is the
    /// control plane's problem, not the filter's.
    pub fn respond(&self, value: Value) {
        if let Some(reply) = &self.reply {
            if reply.try_send(value).is_err() {
                warn!(event = %self.name, "event response dropped, receiver gone");
            }
        }
    }
}

struct Pending {
    event: Event,
    seq: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.event.when == other.event.when && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Inverted so the BinaryHeap pops earliest delivery first, push order
    // breaking ties.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.event.when, other.seq).cmp(&(self.event.when, self.seq))
    }
}

/// Per-filter pending-event store. Producers (the control plane, other
/// filters) serialize on the mutex; the owning filter drains due events at
/// its wake frequency.
#[derive(Default)]
pub struct EventQueue {
    heap: Mutex<BinaryHeap<Pending>>,
    seq: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Pending { event, seq });
    }

    /// The earliest event whose delivery time has been reached.
    pub fn pop_due(&self, now: Instant) -> Option<Event> {
        let mut heap = self.heap.lock();
        if heap.peek().is_some_and(|p| p.event.when <= now) {
            heap.pop().map(|p| p.event)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").field("pending", &self.len()).finish()
    }
}
