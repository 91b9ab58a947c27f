use std::sync::Arc;

use tracing::debug;

use crate::{
    FilterId,
    error::QueueFault,
    frame::Frame,
    queue::FrameQueue,
};

/// Producer endpoint of a queue, owned by the upstream filter's output
/// port. Not clonable: the queue's single-producer contract hangs on there
/// being exactly one of these per queue.
#[derive(Debug, Default)]
pub struct Writer {
    queue: Option<Arc<FrameQueue>>,
    /// Downstream filter, reported as an enabled peer after commits.
    peer: Option<FilterId>,
    checked_out: bool,
}

impl Writer {
    pub(crate) fn bind(queue: Arc<FrameQueue>, peer: FilterId) -> Self {
        Self { queue: Some(queue), peer: Some(peer), checked_out: false }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_attached())
    }

    #[inline]
    pub fn peer(&self) -> Option<FilterId> {
        self.peer
    }

    pub(crate) fn queue(&self) -> Option<&Arc<FrameQueue>> {
        self.queue.as_ref()
    }

    /// True when a frame could be obtained right now.
    pub fn has_room(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_attached() && !q.is_full())
    }

    /// The next writable slot, checking it out; `None` when the queue is
    /// full or the endpoint is disconnected. Repeated calls before `commit`
    /// return the same slot.
    pub fn frame(&mut self) -> Option<&mut Frame> {
        let queue = self.queue.as_ref().filter(|q| q.is_attached())?;
        // SAFETY: this Writer is the queue's only producer and the slot
        // stays checked out until commit_rear.
        let slot = unsafe { queue.rear() }?;
        self.checked_out = true;
        // SAFETY: exclusive producer ownership of the rear slot; the
        // returned borrow is tied to &mut self, so it ends before commit.
        Some(unsafe { &mut *slot })
    }

    /// Commits the checked-out slot, handing the frame to the consumer.
    pub fn commit(&mut self) -> Result<(), QueueFault> {
        if !self.checked_out {
            return Err(QueueFault::CommitWithoutCheckout);
        }
        self.checked_out = false;
        if let Some(q) = self.queue.as_ref() {
            q.commit_rear();
        }
        Ok(())
    }

    /// Returns a checked-out slot without committing it.
    pub fn abort(&mut self) {
        self.checked_out = false;
    }

    /// Detaches from the queue and tells the peer through it. Safe to call
    /// repeatedly; a disconnected writer just reports no room.
    pub fn disconnect(&mut self) {
        if let Some(q) = self.queue.take() {
            q.detach();
            debug!(peer = ?self.peer, "writer disconnected");
        }
        self.checked_out = false;
        self.peer = None;
    }
}

/// Consumer endpoint of a queue, owned by the downstream filter's input
/// port. Exactly one per queue, same as `Writer`.
#[derive(Debug, Default)]
pub struct Reader {
    queue: Option<Arc<FrameQueue>>,
    /// Upstream filter, kept only so teardown can be reported against it.
    peer: Option<FilterId>,
}

impl Reader {
    pub(crate) fn bind(queue: Arc<FrameQueue>, peer: FilterId) -> Self {
        Self { queue: Some(queue), peer: Some(peer) }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_attached())
    }

    #[inline]
    pub fn peer(&self) -> Option<FilterId> {
        self.peer
    }

    pub(crate) fn queue(&self) -> Option<&Arc<FrameQueue>> {
        self.queue.as_ref()
    }

    /// True when a frame is readable right now.
    pub fn has_frame(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| !q.is_empty())
    }

    /// Peeks the oldest readable frame without consuming it; `None` when
    /// empty or disconnected. The frame stays owned by this reader until
    /// `remove`.
    pub fn frame(&self) -> Option<&Frame> {
        let queue = self.queue.as_ref()?;
        // SAFETY: this Reader is the queue's only consumer; the front slot
        // is untouchable by the producer until release_front, and the
        // returned borrow of self forbids calling remove while held.
        let front = unsafe { queue.front() }?;
        Some(unsafe { &*front })
    }

    /// Releases the frame last returned by [`Self::frame`].
    pub fn remove(&mut self) -> Result<(), QueueFault> {
        let Some(queue) = self.queue.as_ref() else {
            return Err(QueueFault::ReleaseWithoutFrame);
        };
        if queue.is_empty() {
            return Err(QueueFault::ReleaseWithoutFrame);
        }
        queue.release_front();
        Ok(())
    }

    /// Detaches from the queue; a disconnected reader reports no frames.
    pub fn disconnect(&mut self) {
        if let Some(q) = self.queue.take() {
            q.detach();
            debug!(peer = ?self.peer, "reader disconnected");
        }
        self.peer = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::StreamSpec;

    fn pair() -> (Writer, Reader) {
        let q = FrameQueue::new(StreamSpec::data(), 4, 64);
        (Writer::bind(Arc::clone(&q), 2), Reader::bind(q, 1))
    }

    #[test]
    fn commit_requires_checkout() {
        let (mut w, _r) = pair();
        assert_eq!(w.commit(), Err(QueueFault::CommitWithoutCheckout));
        w.frame().unwrap().fill_from(b"x");
        assert!(w.commit().is_ok());
        assert_eq!(w.commit(), Err(QueueFault::CommitWithoutCheckout));
    }

    #[test]
    fn remove_requires_frame() {
        let (mut w, mut r) = pair();
        assert_eq!(r.remove(), Err(QueueFault::ReleaseWithoutFrame));
        w.frame().unwrap().fill_from(b"x");
        w.commit().unwrap();
        assert_eq!(r.frame().unwrap().payload(), b"x");
        assert!(r.remove().is_ok());
        assert!(r.frame().is_none());
    }

    #[test]
    fn abort_reuses_slot() {
        let (mut w, r) = pair();
        w.frame().unwrap().fill_from(b"dropped");
        w.abort();
        assert!(r.frame().is_none());
        w.frame().unwrap().fill_from(b"kept");
        w.commit().unwrap();
        assert_eq!(r.frame().unwrap().payload(), b"kept");
    }

    #[test]
    fn disconnect_is_seen_by_peer_and_soft() {
        let (mut w, mut r) = pair();
        assert!(w.is_connected() && r.is_connected());
        w.disconnect();
        assert!(!r.is_connected());
        assert!(w.frame().is_none());
        w.disconnect(); // repeat is non-fatal
        r.disconnect();
    }

    #[test]
    fn reader_disconnect_reports_full_to_writer() {
        let (mut w, mut r) = pair();
        r.disconnect();
        assert!(!w.is_connected());
        assert!(w.frame().is_none());
        assert!(!w.has_room());
    }
}
