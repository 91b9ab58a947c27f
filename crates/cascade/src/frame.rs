use cascade_timing::Instant;
use serde::{Deserialize, Serialize};

/// Coarse media class of a stream; selects queue sizing and frame pooling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    #[default]
    Data,
}

/// Descriptor of the stream flowing out of a writer port. Source and sink
/// adapters exchange these at the core boundary; `alloc_queue` sizes rings
/// from the kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub kind: MediaKind,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

impl StreamSpec {
    pub fn audio(codec: impl Into<String>, sample_rate: u32, channels: u8) -> Self {
        Self { kind: MediaKind::Audio, codec: codec.into(), sample_rate, channels, ..Self::default() }
    }

    pub fn video(codec: impl Into<String>, width: u32, height: u32, frame_rate: f64) -> Self {
        Self { kind: MediaKind::Video, codec: codec.into(), width, height, frame_rate, ..Self::default() }
    }

    pub fn data() -> Self {
        Self::default()
    }
}

/// One typed unit of media. Frames are pool-allocated per queue: the buffer
/// is sized once at queue construction and slots are reused, so ownership
/// moves between producer and consumer as ring indices, never as heap
/// traffic.
pub struct Frame {
    buf: Box<[u8]>,
    len: usize,
    pts: Instant,
    seq: u64,
    kind: MediaKind,
}

impl Frame {
    pub(crate) fn with_capacity(max_len: usize, kind: MediaKind) -> Self {
        Self { buf: vec![0; max_len].into_boxed_slice(), len: 0, pts: Instant::ZERO, seq: 0, kind }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole pooled buffer; pair with `set_len` after writing into it.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn max_len(&self) -> usize {
        self.buf.len()
    }

    /// Clamped to the pooled capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    /// Copies `src` into the payload, truncating at capacity. Returns the
    /// number of bytes kept.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&src[..n]);
        self.len = n;
        n
    }

    #[inline]
    pub fn pts(&self) -> Instant {
        self.pts
    }

    #[inline]
    pub fn set_pts(&mut self, pts: Instant) {
        self.pts = pts;
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    #[inline]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Copies everything but the buffer allocation from `src`.
    pub fn clone_metadata_from(&mut self, src: &Frame) {
        self.pts = src.pts;
        self.seq = src.seq;
        self.kind = src.kind;
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("seq", &self.seq)
            .field("pts", &self.pts)
            .field("len", &self.len)
            .field("max_len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_truncates_at_capacity() {
        let mut f = Frame::with_capacity(4, MediaKind::Data);
        assert_eq!(f.fill_from(b"abcdef"), 4);
        assert_eq!(f.payload(), b"abcd");
        assert_eq!(f.max_len(), 4);
    }

    #[test]
    fn set_len_is_clamped() {
        let mut f = Frame::with_capacity(8, MediaKind::Audio);
        f.set_len(64);
        assert_eq!(f.len(), 8);
    }

    #[test]
    fn metadata_copy() {
        let mut a = Frame::with_capacity(8, MediaKind::Video);
        a.set_pts(Instant(42));
        a.set_seq(7);
        let mut b = Frame::with_capacity(8, MediaKind::Data);
        b.clone_metadata_from(&a);
        assert_eq!(b.pts(), Instant(42));
        assert_eq!(b.seq(), 7);
        assert_eq!(b.kind(), MediaKind::Video);
    }
}
