use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use cascade_timing::{Duration, Instant};
use serde_json::Value;
use tracing::debug;

use crate::{
    PortId,
    error::QueueFault,
    event::Event,
    filter::{FilterEvents, HeadKernel, Outputs},
    frame::StreamSpec,
};

/// Production counters shared out of a running [`FrameSource`].
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Frames committed to at least one output.
    pub produced: AtomicU64,
    /// Cycles where every connected output was full.
    pub stalls: AtomicU64,
}

/// Head filter synthesizing sequenced frames at a fixed interval. Paces
/// itself to wall time through its wake-delay hints and widens them while
/// downstream queues stay full, so congestion turns into slower wakes
/// instead of drops on the floor.
///
/// Events: `setInterval {"micros": n}` retunes the cadence, `reset` rewinds
/// the sequence counter.
pub struct FrameSource {
    spec: StreamSpec,
    interval: Duration,
    limit: Option<u64>,
    payload: Vec<u8>,
    seq: u64,
    congestion: u32,
    stats: Arc<SourceStats>,
}

impl FrameSource {
    pub fn new(spec: StreamSpec, interval: Duration) -> Self {
        Self {
            spec,
            interval,
            limit: None,
            payload: Vec::new(),
            seq: 0,
            congestion: 0,
            stats: Arc::new(SourceStats::default()),
        }
    }

    /// Stops producing after `limit` frames.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Fixed payload prefix; the sequence number is appended after it.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Grab before handing the kernel to [`Filter::head`](crate::filter::Filter::head).
    pub fn stats_handle(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }
}

impl FilterEvents for FrameSource {
    fn on_event(&mut self, event: &Event) -> bool {
        match event.name() {
            "setInterval" => {
                if let Some(us) = event.params().get("micros").and_then(Value::as_u64) {
                    self.interval = Duration::from_micros(us);
                    debug!(interval = %self.interval, "source cadence changed");
                }
                true
            }
            "reset" => {
                self.seq = 0;
                true
            }
            _ => false,
        }
    }
}

impl HeadKernel for FrameSource {
    fn descriptor(&self, _writer: PortId) -> StreamSpec {
        self.spec.clone()
    }

    fn produce(&mut self, outs: &mut Outputs<'_>) -> Result<Duration, QueueFault> {
        if self.limit.is_some_and(|limit| self.seq >= limit) {
            return Ok(self.interval);
        }
        let ports = outs.ports();
        if ports.is_empty() {
            return Ok(self.interval);
        }

        let mut committed = 0;
        for port in ports {
            if !outs.has_room(port) {
                continue;
            }
            let Some(frame) = outs.frame(port) else {
                continue;
            };
            let n = frame.fill_from(&self.payload);
            let seq_bytes = self.seq.to_be_bytes();
            let end = (n + seq_bytes.len()).min(frame.max_len());
            frame.buffer_mut()[n..end].copy_from_slice(&seq_bytes[..end - n]);
            frame.set_len(end);
            frame.set_seq(self.seq);
            frame.set_pts(Instant::now());
            outs.commit(port)?;
            committed += 1;
        }

        if committed == 0 {
            // every live output is full: widen the hint so backpressure
            // becomes pacing rather than a busy loop
            self.congestion = (self.congestion + 1).min(15);
            self.stats.stalls.fetch_add(1, Ordering::Relaxed);
            return Ok(self.interval * (self.congestion + 1));
        }

        self.congestion = 0;
        self.seq += 1;
        self.stats.produced.fetch_add(1, Ordering::Relaxed);
        Ok(self.interval)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn set_interval_event_is_recognized() {
        let mut source = FrameSource::new(StreamSpec::data(), Duration::from_millis(10));
        assert!(source.on_event(&Event::new("setInterval", json!({"micros": 500}))));
        assert_eq!(source.interval, Duration::from_micros(500));
        assert!(source.on_event(&Event::new("reset", Value::Null)));
        assert!(!source.on_event(&Event::new("noSuchEvent", Value::Null)));
    }
}
