use cascade_timing::Duration;
use serde::{Deserialize, Serialize};

use crate::frame::MediaKind;

/// Queue sizing for one media kind: ring depth and the fixed payload
/// capacity of every pooled frame in it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub depth: usize,
    pub max_payload: usize,
}

/// Runtime tuning knobs. Queue depth per media type is deliberately
/// configuration, not a constant: audio wants shallow rings for latency,
/// video wants room for bursts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub audio: QueuePolicy,
    pub video: QueuePolicy,
    pub data: QueuePolicy,
    /// Wake-delay hint handed to the scheduler when a filter's demand is not
    /// satisfied (queue full, inputs empty, ports unconnected).
    pub backoff: Duration,
    /// Worker re-poll interval when none of its runnables has a wake time.
    pub idle_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            audio: QueuePolicy { depth: 8, max_payload: 16 * 1024 },
            video: QueuePolicy { depth: 16, max_payload: 512 * 1024 },
            data: QueuePolicy { depth: 8, max_payload: 64 * 1024 },
            backoff: Duration::from_millis(1),
            idle_poll: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    pub fn policy(&self, kind: MediaKind) -> QueuePolicy {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
            MediaKind::Data => self.data,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_per_kind() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.policy(MediaKind::Audio).depth, 8);
        assert_eq!(cfg.policy(MediaKind::Video).depth, 16);
        assert!(cfg.policy(MediaKind::Video).max_payload > cfg.policy(MediaKind::Audio).max_payload);
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"audio":{"depth":4,"max_payload":2048}}"#)
            .expect("partial config");
        assert_eq!(cfg.audio.depth, 4);
        assert_eq!(cfg.video.depth, 16);
        assert_eq!(cfg.backoff, Duration::from_millis(1));
    }
}
