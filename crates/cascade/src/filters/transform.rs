use cascade_timing::Instant;

use crate::{
    PortId,
    filter::{
        DestFrames, FilterEvents, ManyToOneKernel, OneToManyKernel, OneToOneKernel, SourceFrames,
    },
    frame::{Frame, StreamSpec},
};

/// OneToOne payload copier; the bypass transform.
pub struct PassThrough {
    spec: StreamSpec,
}

impl PassThrough {
    pub fn new(spec: StreamSpec) -> Self {
        Self { spec }
    }
}

impl FilterEvents for PassThrough {}

impl OneToOneKernel for PassThrough {
    fn descriptor(&self, _writer: PortId) -> StreamSpec {
        self.spec.clone()
    }

    fn transform(&mut self, src: &Frame, dst: &mut Frame) -> bool {
        dst.fill_from(src.payload());
        dst.clone_metadata_from(src);
        true
    }
}

/// OneToMany copy fan-out: every destination with capacity gets the frame.
pub struct Splitter {
    spec: StreamSpec,
}

impl Splitter {
    pub fn new(spec: StreamSpec) -> Self {
        Self { spec }
    }
}

impl FilterEvents for Splitter {}

impl OneToManyKernel for Splitter {
    fn descriptor(&self, _writer: PortId) -> StreamSpec {
        self.spec.clone()
    }

    fn transform(&mut self, src: &Frame, dsts: &mut DestFrames<'_>) -> bool {
        for dst in dsts.values_mut() {
            dst.fill_from(src.payload());
            dst.clone_metadata_from(src);
        }
        true
    }
}

/// ManyToOne concatenating merge, input payloads in port order. Output
/// sequence numbers are the merger's own; the presentation timestamp is the
/// earliest of the inputs.
pub struct Merger {
    spec: StreamSpec,
    seq: u64,
}

impl Merger {
    pub fn new(spec: StreamSpec) -> Self {
        Self { spec, seq: 0 }
    }
}

impl FilterEvents for Merger {}

impl ManyToOneKernel for Merger {
    fn descriptor(&self, _writer: PortId) -> StreamSpec {
        self.spec.clone()
    }

    fn combine(&mut self, srcs: &SourceFrames<'_>, dst: &mut Frame) -> bool {
        let mut written = 0;
        let mut pts = Instant::MAX;
        for src in srcs.values() {
            let room = dst.max_len() - written;
            let n = src.payload().len().min(room);
            dst.buffer_mut()[written..written + n].copy_from_slice(&src.payload()[..n]);
            written += n;
            pts = pts.min(src.pts());
        }
        dst.set_len(written);
        dst.set_pts(if pts == Instant::MAX { Instant::now() } else { pts });
        dst.set_seq(self.seq);
        self.seq += 1;
        true
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::frame::MediaKind;

    fn frame(payload: &[u8], seq: u64) -> Frame {
        let mut f = Frame::with_capacity(64, MediaKind::Data);
        f.fill_from(payload);
        f.set_seq(seq);
        f.set_pts(Instant(seq * 100));
        f
    }

    #[test]
    fn pass_through_copies_payload_and_metadata() {
        let src = frame(b"abc", 9);
        let mut dst = Frame::with_capacity(64, MediaKind::Data);
        assert!(PassThrough::new(StreamSpec::data()).transform(&src, &mut dst));
        assert_eq!(dst.payload(), b"abc");
        assert_eq!(dst.seq(), 9);
        assert_eq!(dst.pts(), Instant(900));
    }

    #[test]
    fn splitter_copies_to_every_destination() {
        let src = frame(b"xy", 1);
        let mut a = Frame::with_capacity(64, MediaKind::Data);
        let mut b = Frame::with_capacity(64, MediaKind::Data);
        let mut dsts = DestFrames::new();
        dsts.insert(1, &mut a);
        dsts.insert(2, &mut b);
        assert!(Splitter::new(StreamSpec::data()).transform(&src, &mut dsts));
        drop(dsts);
        assert_eq!(a.payload(), b"xy");
        assert_eq!(b.payload(), b"xy");
    }

    #[test]
    fn merger_concatenates_in_port_order() {
        let left = frame(b"aa", 3);
        let right = frame(b"bb", 5);
        let mut srcs: BTreeMap<PortId, &Frame> = BTreeMap::new();
        srcs.insert(2, &right);
        srcs.insert(1, &left);
        let mut dst = Frame::with_capacity(64, MediaKind::Data);

        let mut merger = Merger::new(StreamSpec::data());
        assert!(merger.combine(&srcs, &mut dst));
        assert_eq!(dst.payload(), b"aabb");
        assert_eq!(dst.seq(), 0);
        assert_eq!(dst.pts(), Instant(300));

        assert!(merger.combine(&srcs, &mut dst));
        assert_eq!(dst.seq(), 1);
    }
}
