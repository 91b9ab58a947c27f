use std::sync::Arc;

use cascade_timing::{Duration, Instant};
use parking_lot::Mutex;

use crate::{
    PortId,
    error::QueueFault,
    filter::{FilterEvents, Inputs, TailKernel},
};

/// One consumed frame, as observed by a [`FrameSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkRecord {
    pub port: PortId,
    pub seq: u64,
    pub pts: Instant,
    pub len: usize,
}

/// Shared view over everything a sink has drained; the test-side half of
/// the kernel.
#[derive(Clone, Debug, Default)]
pub struct SinkHandle(Arc<Mutex<Vec<SinkRecord>>>);

impl SinkHandle {
    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.0.lock().clone()
    }

    pub fn seqs(&self) -> Vec<u64> {
        self.0.lock().iter().map(|r| r.seq).collect()
    }

    pub fn seqs_on(&self, port: PortId) -> Vec<u64> {
        self.0.lock().iter().filter(|r| r.port == port).map(|r| r.seq).collect()
    }
}

/// Tail filter draining its readers into an inspectable log. When a reader
/// is empty it yields a poll hint instead of blocking, the way a network
/// sink re-polls its queue. An optional pace bounds it to one frame per
/// cycle for slow-consumer setups.
pub struct FrameSink {
    records: SinkHandle,
    poll: Duration,
    pace: Option<Duration>,
}

impl Default for FrameSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink {
    pub fn new() -> Self {
        Self { records: SinkHandle::default(), poll: Duration::from_millis(1), pace: None }
    }

    /// Re-poll delay when all inputs are empty.
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Consume at most one frame per cycle, waking every `pace`.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Grab before handing the kernel to [`Filter::tail`](crate::filter::Filter::tail).
    pub fn handle(&self) -> SinkHandle {
        self.records.clone()
    }
}

impl FilterEvents for FrameSink {}

impl TailKernel for FrameSink {
    fn consume(&mut self, ins: &mut Inputs<'_>) -> Result<Duration, QueueFault> {
        let mut consumed = false;
        'ports: for port in ins.ports() {
            while ins.has_frame(port) {
                let record = {
                    let Some(frame) = ins.frame(port) else {
                        break;
                    };
                    SinkRecord { port, seq: frame.seq(), pts: frame.pts(), len: frame.len() }
                };
                ins.remove(port)?;
                self.records.0.lock().push(record);
                consumed = true;
                if self.pace.is_some() {
                    break 'ports;
                }
            }
        }

        Ok(match (consumed, self.pace) {
            (true, Some(pace)) => pace,
            (true, None) => Duration::ZERO,
            (false, _) => self.poll,
        })
    }
}
