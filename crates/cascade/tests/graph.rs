//! End-to-end scenarios driving real workers over real queues.

use cascade::{
    config::{QueuePolicy, RuntimeConfig},
    filter::Filter,
    filters::{FrameSink, FrameSource, Merger, PassThrough},
    frame::StreamSpec,
    pipeline::PipelineManager,
    runnable::Runnable,
    timing::Duration,
};

const SRC: u32 = 1;
const MID: u32 = 2;
const SINK: u32 = 3;
const SRC_B: u32 = 4;

fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}

fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep_ms(2);
    }
    cond()
}

#[test]
fn one_to_one_pass_through_preserves_order() {
    // S1: head -> pass-through -> tail, 100 sequenced frames
    let manager = PipelineManager::new(RuntimeConfig::default());

    let source = FrameSource::new(StreamSpec::data(), Duration::from_millis(1)).with_limit(100);
    let sink = FrameSink::new();
    let observed = sink.handle();

    manager.add_filter(SRC, Filter::head(source)).unwrap();
    manager.add_filter(MID, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    manager.add_filter(SINK, Filter::tail(sink)).unwrap();

    manager.create_path(1, SRC, SINK, 1, 1, vec![MID]).unwrap();
    manager.connect_path(1).unwrap();
    manager.assign_default_workers().unwrap();
    manager.start_workers();

    assert!(wait_until(5_000, || observed.count() >= 100), "sink saw {}", observed.count());
    manager.stop_workers();

    let seqs = observed.seqs();
    assert_eq!(seqs, (0..100).collect::<Vec<_>>(), "expected 0..99 in order, no gaps, no dupes");
    assert!(manager.first_fault().is_none());

    // 100 frames from the head plus 100 through the pass-through
    let forwarded: u64 = manager
        .worker_ids()
        .iter()
        .filter_map(|&id| manager.get_worker(id))
        .map(|w| w.stats.frames_forwarded)
        .sum();
    assert_eq!(forwarded, 200);
}

#[test]
fn many_to_one_requires_all_inputs_without_force() {
    // S2: two heads, merger with force=false, 50 frames each
    let manager = PipelineManager::new(RuntimeConfig::default());

    let src_a = FrameSource::new(StreamSpec::data(), Duration::from_millis(1)).with_limit(50);
    let src_b = FrameSource::new(StreamSpec::data(), Duration::from_millis(1)).with_limit(50);
    let sink = FrameSink::new();
    let observed = sink.handle();

    manager.add_filter(SRC, Filter::head(src_a)).unwrap();
    manager.add_filter(SRC_B, Filter::head(src_b)).unwrap();
    manager.add_filter(MID, Filter::many_to_one(Merger::new(StreamSpec::data()))).unwrap();
    manager.add_filter(SINK, Filter::tail(sink)).unwrap();

    manager.create_path(1, SRC, SINK, 1, 1, vec![MID]).unwrap();
    manager.create_path(2, SRC_B, MID, 1, 2, vec![]).unwrap();
    manager.connect_path(1).unwrap();
    manager.connect_path(2).unwrap();
    manager.assign_default_workers().unwrap();
    manager.start_workers();

    assert!(wait_until(5_000, || observed.count() >= 50), "merged {}", observed.count());
    // both inputs exhausted: no further merges can form
    sleep_ms(50);
    manager.stop_workers();

    assert_eq!(observed.count(), 50, "force=false must pair every merge");
    assert!(manager.first_fault().is_none());
}

#[test]
fn many_to_one_with_force_proceeds_on_any_input() {
    // S3: one head stops early; the faster stream continues alone
    let manager = PipelineManager::new(RuntimeConfig::default());

    let src_a = FrameSource::new(StreamSpec::data(), Duration::from_millis(1)).with_limit(50);
    let src_b = FrameSource::new(StreamSpec::data(), Duration::from_millis(1)).with_limit(20);
    let sink = FrameSink::new();
    let observed = sink.handle();

    manager.add_filter(SRC, Filter::head(src_a)).unwrap();
    manager.add_filter(SRC_B, Filter::head(src_b)).unwrap();
    manager
        .add_filter(MID, Filter::many_to_one(Merger::new(StreamSpec::data())).with_force(true))
        .unwrap();
    manager.add_filter(SINK, Filter::tail(sink)).unwrap();

    manager.create_path(1, SRC, SINK, 1, 1, vec![MID]).unwrap();
    manager.create_path(2, SRC_B, MID, 1, 2, vec![]).unwrap();
    manager.connect_path(1).unwrap();
    manager.connect_path(2).unwrap();
    manager.assign_default_workers().unwrap();
    manager.start_workers();

    assert!(wait_until(5_000, || observed.count() >= 50), "merged {}", observed.count());
    manager.stop_workers();

    assert!(observed.count() >= 50);
    assert!(manager.first_fault().is_none());
}

#[test]
fn overflow_turns_into_pacing_not_loss() {
    // S4: fast head into depth-4 queues feeding a slow tail
    let config = RuntimeConfig {
        data: QueuePolicy { depth: 4, max_payload: 1024 },
        ..RuntimeConfig::default()
    };
    let manager = PipelineManager::new(config);

    let source = FrameSource::new(StreamSpec::data(), Duration::from_millis(1));
    let stats = source.stats_handle();
    let sink = FrameSink::new().paced(Duration::from_millis(10));
    let observed = sink.handle();

    manager.add_filter(SRC, Filter::head(source)).unwrap();
    manager.add_filter(MID, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    manager.add_filter(SINK, Filter::tail(sink)).unwrap();

    manager.create_path(1, SRC, SINK, 1, 1, vec![MID]).unwrap();
    manager.connect_path(1).unwrap();
    manager.assign_default_workers().unwrap();
    manager.start_workers();

    sleep_ms(300);
    manager.stop_workers();

    let seqs = observed.seqs();
    assert!(!seqs.is_empty(), "slow sink made no progress");
    // nothing was dropped on the floor: the sink saw a gapless prefix
    assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    // and the head absorbed the pressure as widened wake delays
    assert!(
        stats.stalls.load(std::sync::atomic::Ordering::Relaxed) > 0,
        "head never widened its wake delay"
    );
    assert!(manager.first_fault().is_none());
}

#[test]
fn disconnect_while_streaming_is_clean() {
    // S5: tear the path down mid-stream; workers stay up
    let manager = PipelineManager::new(RuntimeConfig::default());

    let source = FrameSource::new(StreamSpec::data(), Duration::from_millis(1));
    let sink = FrameSink::new();
    let observed = sink.handle();

    let src = manager.add_filter(SRC, Filter::head(source)).unwrap();
    let mid =
        manager.add_filter(MID, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    let tail = manager.add_filter(SINK, Filter::tail(sink)).unwrap();

    manager.create_path(1, SRC, SINK, 1, 1, vec![MID]).unwrap();
    manager.connect_path(1).unwrap();
    manager.assign_default_workers().unwrap();
    manager.start_workers();

    assert!(wait_until(2_000, || observed.count() > 10), "stream never started");
    manager.disconnect_path(1).unwrap();

    assert_eq!(src.connected_writers(), 0);
    assert_eq!(mid.connected_readers(), 0);
    assert_eq!(mid.connected_writers(), 0);
    assert_eq!(tail.connected_readers(), 0);

    // workers keep running over the now-idle filters
    sleep_ms(30);
    for id in manager.worker_ids() {
        assert!(manager.get_worker(id).unwrap().running, "worker {id} died on disconnect");
    }
    assert!(manager.first_fault().is_none());
    manager.stop_workers();
}

#[test]
fn connect_disconnect_round_trip_restores_ports() {
    let manager = PipelineManager::new(RuntimeConfig::default());
    let up =
        manager.add_filter(1, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    let down =
        manager.add_filter(2, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();

    let (w, r) = up.connect_one_to_one(&down, manager.config()).unwrap();
    assert_eq!(up.writer_ids(), vec![w]);
    assert_eq!(down.reader_ids(), vec![r]);

    up.disconnect(w, &down, r).unwrap();
    assert!(up.writer_ids().is_empty());
    assert!(down.reader_ids().is_empty());

    // the pair is reusable afterwards
    let (w2, r2) = up.connect_one_to_one(&down, manager.config()).unwrap();
    assert_eq!((w2, r2), (w, r));
}

#[test]
fn failed_path_connect_rolls_back_every_link() {
    let manager = PipelineManager::new(RuntimeConfig::default());
    let a = manager.add_filter(1, Filter::head(FrameSource::new(
        StreamSpec::data(),
        Duration::from_millis(1),
    ))).unwrap();
    let b =
        manager.add_filter(2, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    let c =
        manager.add_filter(3, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    let d = manager.add_filter(4, Filter::head(FrameSource::new(
        StreamSpec::data(),
        Duration::from_millis(1),
    ))).unwrap();

    // occupy c's single reader so the final link of the path must fail
    d.connect_many_to_one(&c, 1, manager.config()).unwrap();

    manager.create_path(9, 1, 3, 1, 7, vec![2]).unwrap();
    let err = manager.connect_path(9).unwrap_err();
    assert!(matches!(
        err,
        cascade::error::PipelineError::Connect(cascade::error::ConnectError::ReadersExhausted(3, 1))
    ));

    assert_eq!(a.connected_writers(), 0, "rollback left a writer on the origin");
    assert_eq!(b.connected_readers(), 0);
    assert_eq!(b.connected_writers(), 0);
    assert_eq!(c.connected_readers(), 1, "pre-existing link must survive the rollback");
    assert!(!manager.get_path(9).unwrap().is_connected());
}

#[test]
fn worker_stop_quiesces_the_whole_cohort_once() {
    let manager = PipelineManager::new(RuntimeConfig::default());
    let src = manager
        .add_filter(SRC, Filter::head(FrameSource::new(StreamSpec::data(), Duration::from_millis(1))))
        .unwrap();
    let mid =
        manager.add_filter(MID, Filter::one_to_one(PassThrough::new(StreamSpec::data()))).unwrap();
    let tail = manager.add_filter(SINK, Filter::tail(FrameSink::new())).unwrap();

    manager.create_path(1, SRC, SINK, 1, 1, vec![MID]).unwrap();
    manager.connect_path(1).unwrap();
    manager.assign_default_workers().unwrap();

    let mut ids = src.group_ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![SRC, MID, SINK], "default policy must group the chain");

    manager.start_workers();
    assert!(wait_until(1_000, || src.is_running() && mid.is_running() && tail.is_running()));

    manager.stop_workers();
    assert!(!src.is_running() && !mid.is_running() && !tail.is_running());
}
