use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use tracing::{debug, error, info, warn};

use crate::{
    FilterId, PathId, PortId, WorkerId,
    config::RuntimeConfig,
    error::PipelineError,
    filter::Filter,
    path::{Link, Path},
    runnable::{Runnable, group_runnables},
    worker::{Worker, WorkerConfig, WorkerStats},
};

/// Monotonic process-wide filter id source, for callers that don't pick
/// their own.
static NEXT_FILTER_ID: AtomicU32 = AtomicU32::new(1);

static INSTANCE: Lazy<Mutex<Option<Arc<PipelineManager>>>> = Lazy::new(|| Mutex::new(None));

/// Snapshot of one worker for lookups; the worker itself stays owned by the
/// manager.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub name: String,
    pub running: bool,
    pub jobs: Vec<FilterId>,
    pub fault: Option<(FilterId, crate::error::QueueFault)>,
    pub stats: WorkerStats,
}

struct State {
    filters: IndexMap<FilterId, Arc<Filter>>,
    workers: IndexMap<WorkerId, Worker>,
    paths: IndexMap<PathId, Path>,
    assignments: IndexMap<FilterId, WorkerId>,
    next_worker_id: WorkerId,
}

/// Owns the graph: filters, workers, paths. All mutations serialize on one
/// manager lock; none of them may be invoked from inside a kernel's
/// processing hook (the worker would be holding the filter it is asked to
/// mutate).
pub struct PipelineManager {
    config: RuntimeConfig,
    state: Mutex<State>,
}

impl PipelineManager {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                filters: IndexMap::new(),
                workers: IndexMap::new(),
                paths: IndexMap::new(),
                assignments: IndexMap::new(),
                next_worker_id: 1,
            }),
        }
    }

    /// The process-wide instance, created on first access. A convenience
    /// for the control plane; everything else takes the manager explicitly.
    pub fn instance() -> Arc<PipelineManager> {
        let mut slot = INSTANCE.lock();
        slot.get_or_insert_with(|| Arc::new(Self::new(RuntimeConfig::default()))).clone()
    }

    /// Stops and releases the process-wide instance. Other outstanding
    /// handles keep their (stopped) manager alive until dropped.
    pub fn destroy_instance() {
        let taken = INSTANCE.lock().take();
        if let Some(manager) = taken {
            manager.stop_workers();
            info!("pipeline instance destroyed");
        }
    }

    /// A fresh id from the global monotonic counter.
    pub fn reserve_filter_id() -> FilterId {
        NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Registers `filter` under `id`. Fails if the id is taken or the
    /// filter already carries one.
    pub fn add_filter(&self, id: FilterId, filter: Filter) -> Result<Arc<Filter>, PipelineError> {
        let mut state = self.state.lock();
        if state.filters.contains_key(&id) {
            return Err(PipelineError::DuplicateFilter(id));
        }
        if !filter.set_id(id) {
            return Err(PipelineError::FilterIdTaken(id));
        }
        filter.set_backoff(self.config.backoff);
        let filter = Arc::new(filter);
        state.filters.insert(id, Arc::clone(&filter));
        debug!(id, label = filter.label(), "filter added");
        Ok(filter)
    }

    /// Destroys a filter. Refused while it has connected ports or is owned
    /// by a running worker.
    pub fn remove_filter(&self, id: FilterId) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        let filter = state.filters.get(&id).ok_or(PipelineError::UnknownFilter(id))?;
        if filter.connected_readers() > 0 || filter.connected_writers() > 0 {
            return Err(PipelineError::FilterInUse(id));
        }
        if let Some(&worker_id) = state.assignments.get(&id) {
            if state.workers.get(&worker_id).is_some_and(Worker::is_running) {
                return Err(PipelineError::FilterAssigned(id, worker_id));
            }
            if let Some(worker) = state.workers.get(&worker_id) {
                worker.remove_runnable(id);
            }
            state.assignments.shift_remove(&id);
        }
        state.filters.shift_remove(&id);
        debug!(id, "filter removed");
        Ok(())
    }

    pub fn get_filter(&self, id: FilterId) -> Option<Arc<Filter>> {
        self.state.lock().filters.get(&id).cloned()
    }

    pub fn filter_ids(&self) -> Vec<FilterId> {
        self.state.lock().filters.keys().copied().collect()
    }

    /// Records the route; no queues are allocated until `connect_path`.
    pub fn create_path(
        &self,
        id: PathId,
        origin: FilterId,
        destination: FilterId,
        origin_writer: PortId,
        dest_reader: PortId,
        intermediates: Vec<FilterId>,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if state.paths.contains_key(&id) {
            return Err(PipelineError::DuplicatePath(id));
        }
        state
            .paths
            .insert(id, Path::new(origin, destination, origin_writer, dest_reader, intermediates));
        debug!(path = id, origin, destination, "path created");
        Ok(())
    }

    /// Materializes every link of the path in origin-to-destination order.
    /// Any failure rolls back the links already made; the graph is then
    /// exactly as before the call.
    pub fn connect_path(&self, id: PathId) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        let path = state.paths.get(&id).ok_or(PipelineError::UnknownPath(id))?;
        if path.is_connected() {
            return Err(PipelineError::PathConnected(id));
        }

        let chain_ids = path.filter_chain();
        let origin_writer = path.origin_writer();
        let dest_reader = path.dest_reader();

        let mut chain = Vec::with_capacity(chain_ids.len());
        for fid in &chain_ids {
            chain.push(
                state.filters.get(fid).cloned().ok_or(PipelineError::UnknownFilter(*fid))?,
            );
        }

        let mut links: Vec<Link> = Vec::with_capacity(chain.len() - 1);
        for (i, pair) in chain.windows(2).enumerate() {
            let (up, down) = (&pair[0], &pair[1]);
            let first = i == 0;
            let last = i == chain.len() - 2;
            let attempt = match (first, last) {
                (true, true) => up.connect_many_to_many(down, dest_reader, origin_writer, &self.config),
                (true, false) => up.connect_many_to_one(down, origin_writer, &self.config),
                (false, true) => up.connect_one_to_many(down, dest_reader, &self.config),
                (false, false) => up.connect_one_to_one(down, &self.config),
            };
            match attempt {
                Ok((writer, reader)) => {
                    links.push(Link { up: up.id(), writer, down: down.id(), reader });
                }
                Err(e) => {
                    warn!(path = id, step = i, error = %e, "path connect failed, rolling back");
                    for link in links.iter().rev() {
                        let up = &state.filters[&link.up];
                        let down = &state.filters[&link.down];
                        if let Err(rollback) = up.disconnect(link.writer, down, link.reader) {
                            error!(path = id, error = %rollback, "rollback disconnect failed");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        state.paths.get_mut(&id).expect("checked above").set_links(links);
        chain[0].activate_source();
        info!(path = id, "path connected");
        Ok(())
    }

    /// Symmetric teardown, destination-to-origin. In-flight frames are
    /// abandoned with the queues.
    pub fn disconnect_path(&self, id: PathId) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        let path = state.paths.get_mut(&id).ok_or(PipelineError::UnknownPath(id))?;
        if !path.is_connected() {
            return Err(PipelineError::PathNotConnected(id));
        }
        let origin = path.origin();
        let links = path.clear_links();
        if let Some(head) = state.filters.get(&origin) {
            head.deactivate_source();
        }
        for link in links.iter().rev() {
            let (Some(up), Some(down)) =
                (state.filters.get(&link.up), state.filters.get(&link.down))
            else {
                continue;
            };
            if let Err(e) = up.disconnect(link.writer, down, link.reader) {
                warn!(path = id, error = %e, "teardown disconnect failed");
            }
        }
        info!(path = id, "path disconnected");
        Ok(())
    }

    /// Removes the record, disconnecting first when needed.
    pub fn remove_path(&self, id: PathId) -> Result<(), PipelineError> {
        let connected = {
            let state = self.state.lock();
            let path = state.paths.get(&id).ok_or(PipelineError::UnknownPath(id))?;
            path.is_connected()
        };
        if connected {
            self.disconnect_path(id)?;
        }
        self.state.lock().paths.shift_remove(&id);
        debug!(path = id, "path removed");
        Ok(())
    }

    pub fn get_path(&self, id: PathId) -> Option<Path> {
        self.state.lock().paths.get(&id).cloned()
    }

    pub fn get_paths(&self) -> Vec<(PathId, Path)> {
        self.state.lock().paths.iter().map(|(&id, p)| (id, p.clone())).collect()
    }

    /// Registers a worker and returns its id.
    pub fn add_worker(&self, config: WorkerConfig) -> WorkerId {
        let mut state = self.state.lock();
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        let config = if config.name.is_empty() {
            WorkerConfig { name: format!("worker-{id}"), ..config }
        } else {
            config
        };
        state.workers.insert(id, Worker::new(config));
        id
    }

    /// Hands a filter to a worker. Each filter is driven by at most one
    /// worker; reassignment moves it.
    pub fn assign_filter(&self, filter: FilterId, worker: WorkerId) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        let f = state.filters.get(&filter).cloned().ok_or(PipelineError::UnknownFilter(filter))?;
        if !state.workers.contains_key(&worker) {
            return Err(PipelineError::UnknownWorker(worker));
        }
        if let Some(&previous) = state.assignments.get(&filter) {
            if previous == worker {
                return Ok(());
            }
            if let Some(old) = state.workers.get(&previous) {
                old.remove_runnable(filter);
            }
        }
        state.workers.get(&worker).expect("checked above").add_runnable(f);
        state.assignments.insert(filter, worker);
        Ok(())
    }

    /// Default placement: one worker per head filter of each path, with the
    /// whole downstream chain assigned to it and grouped with it, so the
    /// cohort starts and stops as a unit.
    pub fn assign_default_workers(&self) -> Result<(), PipelineError> {
        let paths: Vec<Vec<FilterId>> = {
            let state = self.state.lock();
            state.paths.values().map(Path::filter_chain).collect()
        };
        for chain in paths {
            let unassigned: Vec<FilterId> = {
                let state = self.state.lock();
                chain
                    .iter()
                    .copied()
                    .filter(|fid| !state.assignments.contains_key(fid))
                    .collect()
            };
            if unassigned.is_empty() {
                continue;
            }
            let origin_label = self
                .get_filter(chain[0])
                .map_or_else(|| "head".to_owned(), |f| f.label().to_owned());
            let worker = self.add_worker(WorkerConfig::named(origin_label));
            for fid in &unassigned {
                self.assign_filter(*fid, worker)?;
            }

            let state = self.state.lock();
            let filters: Vec<Arc<Filter>> =
                chain.iter().filter_map(|fid| state.filters.get(fid).cloned()).collect();
            for pair in filters.windows(2) {
                group_runnables(pair[0].as_ref(), pair[1].as_ref());
            }
        }
        Ok(())
    }

    pub fn get_worker(&self, id: WorkerId) -> Option<WorkerInfo> {
        let state = self.state.lock();
        state.workers.get(&id).map(|w| WorkerInfo {
            id,
            name: w.name().to_owned(),
            running: w.is_running(),
            jobs: w.job_ids(),
            fault: w.fault(),
            stats: w.stats(),
        })
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.lock().workers.keys().copied().collect()
    }

    /// Flips every worker's run flag on and spawns the threads.
    pub fn start_workers(&self) {
        let mut state = self.state.lock();
        for (&id, worker) in state.workers.iter_mut() {
            worker.start();
            debug!(worker = id, "worker start requested");
        }
        info!(count = state.workers.len(), "workers started");
    }

    /// Flips the run flags off and joins every worker thread.
    pub fn stop_workers(&self) {
        let mut state = self.state.lock();
        for (&id, worker) in state.workers.iter_mut() {
            worker.stop();
            debug!(worker = id, "worker stopped");
        }
        info!(count = state.workers.len(), "workers stopped");
    }

    /// First invariant fault recorded by any worker.
    pub fn first_fault(&self) -> Option<(FilterId, crate::error::QueueFault)> {
        self.state.lock().workers.values().find_map(Worker::fault)
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PipelineManager")
            .field("filters", &state.filters.len())
            .field("workers", &state.workers.len())
            .field("paths", &state.paths.len())
            .finish()
    }
}

/// Registers SIGINT/SIGTERM/SIGQUIT to stop the manager's workers, the
/// graceful half of shutdown. The first signal only raises the stop flag; a
/// repeated one falls through to the OS default action, so a shutdown hung
/// in `stop_workers` can still be killed from the outside.
pub fn install_signal_stop(manager: Arc<PipelineManager>) {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM, SIGQUIT] {
        // conditional-default first: it sees the flag already set by the
        // plain handler only on the second delivery
        let registered = signal_hook::flag::register_conditional_default(sig, Arc::clone(&flag))
            .and(signal_hook::flag::register(sig, Arc::clone(&flag)));
        if let Err(e) = registered {
            warn!(signal = sig, error = %e, "couldn't register stop signal");
        }
    }
    std::thread::Builder::new()
        .name("signal-stop".to_owned())
        .spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            info!("interruption signal received, stopping workers");
            manager.stop_workers();
        })
        .expect("spawn signal watcher");
}
