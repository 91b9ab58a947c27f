use core_affinity::CoreId;
use tracing::warn;

/// Scheduling class of a worker thread, chosen by the media its filters
/// carry. The realtime classes request `SCHED_FIFO`, which needs
/// CAP_SYS_NICE; when the kernel refuses, the thread stays on the default
/// scheduler and the engine keeps pacing through wake-delay hints alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerClass {
    /// Default scheduler; control-plane and bulk-data pipelines.
    #[default]
    Background,
    /// Realtime, below audio; frame-rate video pipelines.
    Video,
    /// Realtime, highest media class. A late audio wake is audible where a
    /// late video frame is not.
    Audio,
    /// Hand-tuned `SCHED_FIFO` priority for unusual deployments.
    Fifo(i32),
}

impl WorkerClass {
    /// Media classes sit mid-range of FIFO's 1..=99, leaving headroom for
    /// system threads above and batch helpers below.
    fn fifo_priority(self) -> Option<i32> {
        match self {
            WorkerClass::Background => None,
            WorkerClass::Video => Some(50),
            WorkerClass::Audio => Some(70),
            WorkerClass::Fifo(priority) => Some(priority.clamp(1, 99)),
        }
    }

    /// Applies this class to the calling thread, optionally pinning it to
    /// `core` first. Refusals are logged and survived.
    pub fn apply(self, core: Option<usize>) {
        if let Some(id) = core {
            if !core_affinity::set_for_current(CoreId { id }) {
                warn!(core = id, "core pin refused");
            }
        }
        if let Some(priority) = self.fifo_priority() {
            if !request_fifo(priority) {
                warn!(class = ?self, priority, "realtime scheduling refused, staying on the default scheduler");
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn request_fifo(priority: i32) -> bool {
    let param = libc::sched_param { sched_priority: priority };
    // SAFETY: plain scheduling syscall on the calling thread.
    unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 }
}

#[cfg(not(target_os = "linux"))]
fn request_fifo(_priority: i32) -> bool {
    false
}
