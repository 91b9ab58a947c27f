use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use cascade_timing::Instant;
use parking_lot::{Mutex, RwLock};
use tinyvec::TinyVec;

use crate::{FilterId, error::QueueFault};

/// Downstream filters that received a frame this cycle; workers use it to
/// wake co-located runnables without waiting out their hints.
pub type EnabledPeers = TinyVec<[FilterId; 8]>;

pub(crate) const UNSET_ID: FilterId = FilterId::MAX;

/// The scheduling-facing contract of a filter. Workers drive these and
/// nothing else; the frame machinery stays behind it.
pub trait Runnable: Send + Sync {
    fn id(&self) -> FilterId;

    /// One-shot; refuses reassignment and the reserved sentinel.
    fn set_id(&self, id: FilterId) -> bool;

    /// Short label for spans and diagnostics.
    fn label(&self) -> &str;

    fn next_wake(&self) -> Instant;

    /// Wall clock has reached the next wake time.
    fn ready(&self, now: Instant) -> bool {
        self.next_wake() <= now
    }

    /// Pulls the wake time to now; used for enabled-peer fast wakes.
    fn wake_now(&self);

    fn sleep_until_ready(&self) {
        let remaining = self.next_wake().remaining();
        if !remaining.is_zero() {
            std::thread::sleep(remaining.into());
        }
    }

    /// Runs one processing cycle, updates the next wake time from the
    /// returned hint, and reports which peers got frames. `Err` is an
    /// invariant violation: the caller must abort its loop and quiesce.
    fn run_process_frame(&self) -> Result<EnabledPeers, QueueFault>;

    fn is_running(&self) -> bool;

    /// First call in a stopped group arms the shared liveness counter to
    /// the group size; every call marks this member running.
    fn set_running(&self);

    /// Decrements the shared counter; at zero the whole group transitions
    /// to non-running together.
    fn unset_running(&self);

    /// Forces the group non-running immediately (fatal-fault path).
    fn quiesce(&self);

    fn group_cell(&self) -> &GroupCell;

    fn group_ids(&self) -> Vec<FilterId>;
}

struct GroupMember {
    id: Arc<AtomicU32>,
    run: Arc<AtomicBool>,
    cell: std::sync::Weak<RwLock<Arc<Mutex<GroupCore>>>>,
}

pub(crate) struct GroupCore {
    running: usize,
    members: Vec<GroupMember>,
}

impl GroupCore {
    fn member_ids(&self) -> Vec<FilterId> {
        self.members.iter().map(|m| m.id.load(Ordering::Relaxed)).collect()
    }

    fn stop_all(&mut self) {
        self.running = 0;
        for m in &self.members {
            m.run.store(false, Ordering::Release);
        }
    }
}

/// Handle onto a shared liveness group. Every runnable starts alone in its
/// own group; [`group_runnables`] melds groups so cohorts (an A/V pair, a
/// head and its chain) start and stop together.
pub struct GroupCell(Arc<RwLock<Arc<Mutex<GroupCore>>>>);

impl GroupCell {
    fn solo(id: Arc<AtomicU32>, run: Arc<AtomicBool>) -> Self {
        let cell = Arc::new(RwLock::new(Arc::new(Mutex::new(GroupCore {
            running: 0,
            members: Vec::new(),
        }))));
        let member = GroupMember { id, run, cell: Arc::downgrade(&cell) };
        cell.read().lock().members.push(member);
        Self(cell)
    }

    /// Clones out the current core; the guard is dropped before the caller
    /// locks the core, so melds never see a held cell.
    fn core(&self) -> Arc<Mutex<GroupCore>> {
        self.0.read().clone()
    }
}

/// Links the groups of `a` and `b` into one, melding members and repointing
/// every absorbed member at the surviving core. Must not race with
/// start/stop; the pipeline manager serializes both behind its lock.
pub fn group_runnables(a: &dyn Runnable, b: &dyn Runnable) {
    let core_a = a.group_cell().core();
    let core_b = b.group_cell().core();
    if Arc::ptr_eq(&core_a, &core_b) {
        return;
    }

    // Address order keeps concurrent melds off each other's toes.
    let (keep, absorb) = if Arc::as_ptr(&core_a) < Arc::as_ptr(&core_b) {
        (core_a, core_b)
    } else {
        (core_b, core_a)
    };

    let mut keep_guard = keep.lock();
    let mut absorb_guard = absorb.lock();
    keep_guard.running += absorb_guard.running;
    for member in absorb_guard.members.drain(..) {
        if let Some(cell) = member.cell.upgrade() {
            *cell.write() = Arc::clone(&keep);
        }
        let dup = keep_guard.members.iter().any(|m| Arc::ptr_eq(&m.run, &member.run));
        if !dup {
            keep_guard.members.push(member);
        }
    }
}

/// Shared scheduling state embedded in every filter: wake time, run flag,
/// group membership, id.
pub(crate) struct RunState {
    id: Arc<AtomicU32>,
    next_wake: AtomicU64,
    run: Arc<AtomicBool>,
    group: GroupCell,
}

impl RunState {
    pub(crate) fn new() -> Self {
        let id = Arc::new(AtomicU32::new(UNSET_ID));
        let run = Arc::new(AtomicBool::new(false));
        let group = GroupCell::solo(Arc::clone(&id), Arc::clone(&run));
        Self { id, next_wake: AtomicU64::new(0), run, group }
    }

    #[inline]
    pub(crate) fn id(&self) -> FilterId {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: FilterId) -> bool {
        if id == UNSET_ID {
            return false;
        }
        self.id.compare_exchange(UNSET_ID, id, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[inline]
    pub(crate) fn next_wake(&self) -> Instant {
        Instant(self.next_wake.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_next_wake(&self, at: Instant) {
        self.next_wake.store(at.as_micros(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self) {
        let core = self.group.core();
        let mut core = core.lock();
        if core.running == 0 {
            core.running = core.members.len();
        }
        self.run.store(true, Ordering::Release);
    }

    pub(crate) fn unset_running(&self) {
        let core = self.group.core();
        let mut core = core.lock();
        if core.running > 0 {
            core.running -= 1;
        }
        if core.running == 0 {
            core.stop_all();
        }
    }

    pub(crate) fn quiesce(&self) {
        let core = self.group.core();
        core.lock().stop_all();
    }

    pub(crate) fn group_cell(&self) -> &GroupCell {
        &self.group
    }

    pub(crate) fn group_ids(&self) -> Vec<FilterId> {
        let core = self.group.core();
        let ids = core.lock().member_ids();
        ids
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Stub {
        state: RunState,
    }

    impl Stub {
        fn new(id: FilterId) -> Self {
            let state = RunState::new();
            assert!(state.set_id(id));
            Self { state }
        }
    }

    impl Runnable for Stub {
        fn id(&self) -> FilterId {
            self.state.id()
        }
        fn set_id(&self, id: FilterId) -> bool {
            self.state.set_id(id)
        }
        fn label(&self) -> &str {
            "stub"
        }
        fn next_wake(&self) -> Instant {
            self.state.next_wake()
        }
        fn wake_now(&self) {
            self.state.set_next_wake(Instant::ZERO);
        }
        fn run_process_frame(&self) -> Result<EnabledPeers, QueueFault> {
            Ok(EnabledPeers::default())
        }
        fn is_running(&self) -> bool {
            self.state.is_running()
        }
        fn set_running(&self) {
            self.state.set_running();
        }
        fn unset_running(&self) {
            self.state.unset_running();
        }
        fn quiesce(&self) {
            self.state.quiesce();
        }
        fn group_cell(&self) -> &GroupCell {
            self.state.group_cell()
        }
        fn group_ids(&self) -> Vec<FilterId> {
            self.state.group_ids()
        }
    }

    #[test]
    fn id_assignment_is_one_shot() {
        let s = Stub { state: RunState::new() };
        assert!(!s.set_id(UNSET_ID));
        assert!(s.set_id(3));
        assert!(!s.set_id(4));
        assert_eq!(s.id(), 3);
    }

    #[test]
    fn group_stops_together_after_all_members_unset() {
        let a = Stub::new(1);
        let b = Stub::new(2);
        let c = Stub::new(3);
        group_runnables(&a, &b);
        group_runnables(&b, &c);

        let mut ids = a.group_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        a.set_running();
        b.set_running();
        c.set_running();
        assert!(a.is_running() && b.is_running() && c.is_running());

        a.unset_running();
        b.unset_running();
        // counter not yet drained: everyone keeps running
        assert!(a.is_running() && b.is_running() && c.is_running());

        c.unset_running();
        assert!(!a.is_running() && !b.is_running() && !c.is_running());

        // extra unsets after the transition are inert
        c.unset_running();
        assert!(!a.is_running());
    }

    #[test]
    fn meld_is_idempotent_and_transitive() {
        let a = Stub::new(1);
        let b = Stub::new(2);
        let c = Stub::new(3);
        group_runnables(&a, &b);
        group_runnables(&a, &b);
        group_runnables(&c, &a);

        assert_eq!(b.group_ids().len(), 3);
        assert_eq!(c.group_ids().len(), 3);
    }

    #[test]
    fn quiesce_downs_the_whole_group_at_once() {
        let a = Stub::new(1);
        let b = Stub::new(2);
        group_runnables(&a, &b);
        a.set_running();
        b.set_running();

        b.quiesce();
        assert!(!a.is_running() && !b.is_running());
    }

    #[test]
    fn restart_after_stop_rearms_counter() {
        let a = Stub::new(1);
        let b = Stub::new(2);
        group_runnables(&a, &b);
        for _ in 0..2 {
            a.set_running();
            b.set_running();
            a.unset_running();
            b.unset_running();
            assert!(!a.is_running() && !b.is_running());
        }
    }
}
