use std::{
    cell::UnsafeCell,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use cascade_utils::soft_assert;

use crate::frame::{Frame, StreamSpec};

/// Bounded single-producer / single-consumer ring of pooled frames.
///
/// The producer cursor (`tail`) counts committed frames, the consumer cursor
/// (`head`) counts released ones; `tail - head` frames are readable at any
/// time. The slot at `tail % capacity` belongs exclusively to the producer
/// until committed, the slot at `head % capacity` exclusively to the
/// consumer until released, so the fast path needs no lock, only the two
/// counters.
///
/// Exactly one [`Writer`](crate::io::Writer) and one
/// [`Reader`](crate::io::Reader) may be bound to a queue; they are the sole
/// callers of the crate-private cursor methods and are not clonable, which
/// is what makes the aliasing below sound.
pub struct FrameQueue {
    slots: Box<[UnsafeCell<Frame>]>,
    tail: AtomicU64,
    head: AtomicU64,
    /// Cleared by either endpoint on disconnect; the peer observes it.
    attached: AtomicBool,
    overflows: AtomicU64,
    underflows: AtomicU64,
    spec: StreamSpec,
}

unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}

impl FrameQueue {
    /// Depth must be non-zero; every slot is pre-allocated at `max_payload`.
    pub fn new(spec: StreamSpec, depth: usize, max_payload: usize) -> Arc<Self> {
        assert!(depth > 0, "queue depth must be non-zero");
        let slots = (0..depth)
            .map(|_| UnsafeCell::new(Frame::with_capacity(max_payload, spec.kind)))
            .collect();
        Arc::new(Self {
            slots,
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            attached: AtomicBool::new(true),
            overflows: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            spec,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// Committed but not yet released frames.
    #[inline]
    pub fn readable(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail - head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.readable() == self.capacity()
    }

    /// Overflow polls observed on the producer side, for diagnostics.
    #[inline]
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Empty polls observed on the consumer side, for diagnostics.
    #[inline]
    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// Producer side: the next free slot, or `None` when full.
    ///
    /// # Safety
    /// Must only be called by the single bound `Writer`. The returned
    /// pointer is valid until `commit_rear`.
    pub(crate) unsafe fn rear(&self) -> Option<*mut Frame> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if (tail - head) as usize == self.capacity() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let idx = (tail as usize) % self.capacity();
        Some(self.slots[idx].get())
    }

    /// Publishes the checked-out rear slot to the consumer.
    pub(crate) fn commit_rear(&self) {
        soft_assert!(!self.is_full(), "commit on a full ring");
        self.tail.fetch_add(1, Ordering::Release);
    }

    /// Consumer side: the oldest readable frame, or `None` when empty.
    ///
    /// # Safety
    /// Must only be called by the single bound `Reader`. The returned
    /// pointer is valid until `release_front`.
    pub(crate) unsafe fn front(&self) -> Option<*const Frame> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if tail == head {
            self.underflows.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let idx = (head as usize) % self.capacity();
        Some(self.slots[idx].get() as *const Frame)
    }

    /// Returns the front slot to the pool.
    pub(crate) fn release_front(&self) {
        soft_assert!(!self.is_empty(), "release on an empty ring");
        self.head.fetch_add(1, Ordering::Release);
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("kind", &self.spec.kind)
            .field("capacity", &self.capacity())
            .field("readable", &self.readable())
            .field("attached", &self.is_attached())
            .finish()
    }
}
