//! A bounded pool of worker threads that run shardable units of work for the
//! pipeline. Read only state is primed into per job worker caches once and
//! every unit is matched back to its continuation by sequence number. Jobs
//! that are small, or pools without workers, run the same code inline on the
//! coordinator.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use common::{config::PoolConfig, progress::Progress};
use itertools::Itertools;
use tracing::{debug, trace, warn};

use crate::{Error, Result, Stage};

mod protocol;
mod worker;
pub use protocol::{CacheData, CacheKey, CacheSlot, Command, JobId, Output, Request, Response};
use protocol::{WorkerMessage, WorkerReply};
pub use worker::{execute, WorkerCache};

/// Called on the coordinator with the result of a unit. May submit further
/// units to the pool.
pub type Continuation = Box<dyn FnOnce(&mut DispatchPool, Result<Output>)>;

pub struct DispatchPool {
    workers: Vec<Worker>,
    replies: Receiver<WorkerReply>,
    inline_cache: WorkerCache,

    jobs: HashMap<JobId, Job>,
    units: HashMap<u64, Unit>,
    ready: VecDeque<Response>,
    /// Units of cancelled jobs that are still running somewhere.
    discarded: HashSet<u64>,
    /// Ended jobs and the release acknowledgements still expected for them.
    released: HashMap<JobId, usize>,

    next_job: JobId,
    next_sequence: u64,
}

struct Worker {
    inbox: Sender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
    outstanding: usize,
}

struct Job {
    inline: bool,
    progress: Progress,
    primed: HashSet<CacheSlot>,
    /// Acknowledgements still expected per slot.
    awaiting: HashMap<CacheSlot, usize>,
    /// Units held back until their cache slot is acknowledged everywhere.
    blocked: Vec<(u64, Command)>,
    outstanding: usize,
}

struct Unit {
    job: JobId,
    stage: Stage,
    sent: bool,
    continuation: Continuation,
}

impl DispatchPool {
    /// Spawns `config.workers` worker threads.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let (outbox, replies) = mpsc::channel();

        let workers = (0..config.workers)
            .map(|index| -> Result<Worker> {
                let (inbox, messages) = mpsc::channel();
                let outbox = outbox.clone();
                let thread = thread::Builder::new()
                    .name(format!("toolpath-worker-{index}"))
                    .spawn(move || worker::run(index, messages, outbox))?;
                Ok(Worker {
                    inbox,
                    thread: Some(thread),
                    outstanding: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(workers = workers.len(), "started dispatch pool");
        Ok(Self::with_workers(workers, replies))
    }

    /// A pool that runs everything on the calling thread.
    pub fn inline() -> Self {
        let (_, replies) = mpsc::channel();
        Self::with_workers(Vec::new(), replies)
    }

    fn with_workers(workers: Vec<Worker>, replies: Receiver<WorkerReply>) -> Self {
        Self {
            workers,
            replies,
            inline_cache: WorkerCache::default(),
            jobs: HashMap::new(),
            units: HashMap::new(),
            ready: VecDeque::new(),
            discarded: HashSet::new(),
            released: HashMap::new(),
            next_job: 0,
            next_sequence: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_active(&self, job: JobId) -> bool {
        self.jobs.contains_key(&job)
    }

    /// Starts a job. Inline jobs never touch the workers.
    pub fn begin_job(&mut self, inline: bool, progress: Progress) -> JobId {
        let job = self.next_job;
        self.next_job += 1;

        let inline = inline || self.workers.is_empty();
        self.jobs.insert(
            job,
            Job {
                inline,
                progress,
                primed: HashSet::new(),
                awaiting: HashMap::new(),
                blocked: Vec::new(),
                outstanding: 0,
            },
        );

        debug!(job, inline, "began job");
        job
    }

    /// Sends shared state to every worker cache. Units needing it are held
    /// back until every worker has acknowledged it. Priming a slot again
    /// replaces its data.
    pub fn prime(&mut self, job: JobId, data: CacheData) -> Result<()> {
        let slot = data.slot();
        let key = CacheKey { job, slot };
        let state = self.jobs.get_mut(&job).ok_or(Error::UnknownJob(job))?;
        state.primed.insert(slot);

        if state.inline {
            self.inline_cache.insert(key, data);
            return Ok(());
        }

        *state.awaiting.entry(slot).or_default() += self.workers.len();
        for (index, worker) in self.workers.iter().enumerate() {
            let message = WorkerMessage::Prime {
                key,
                data: data.clone(),
            };
            worker.inbox.send(message).map_err(|_| Error::WorkerLost(index))?;
        }

        trace!(%key, workers = self.workers.len(), "priming cache");
        Ok(())
    }

    /// Drops every cache entry of a running job, inline and on every worker.
    /// Units already sent finish against the old entries, units still held
    /// back run against whatever is primed once they go out. Units needing a
    /// cache are rejected until the job is primed again.
    pub fn clear(&mut self, job: JobId) -> Result<()> {
        let state = self.jobs.get_mut(&job).ok_or(Error::UnknownJob(job))?;
        state.primed.clear();
        let inline = state.inline;

        self.inline_cache.release(job);
        if !inline {
            for (index, worker) in self.workers.iter().enumerate() {
                (worker.inbox.send(WorkerMessage::Clear(job))).map_err(|_| Error::WorkerLost(index))?;
            }
        }

        debug!(job, "cleared cache");
        Ok(())
    }

    /// Queues a unit and returns its sequence number. The continuation fires
    /// from [`DispatchPool::pump`] or [`DispatchPool::wait`] once the unit is
    /// done, never from inside this call.
    pub fn submit(&mut self, job: JobId, command: Command, continuation: Continuation) -> Result<u64> {
        let state = self.jobs.get_mut(&job).ok_or(Error::UnknownJob(job))?;
        if let Some(slot) = command.requires() {
            if !state.primed.contains(&slot) {
                return Err(Error::UnprimedCache(CacheKey { job, slot }));
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        state.outstanding += 1;
        state.progress.add_total(1);

        let awaiting = (command.requires())
            .is_some_and(|slot| state.awaiting.get(&slot).is_some_and(|&x| x > 0));
        self.units.insert(
            sequence,
            Unit {
                job,
                stage: command.stage(),
                sent: !awaiting,
                continuation,
            },
        );

        if state.inline {
            let result = execute(job, &command, &self.inline_cache);
            self.ready.push_back(Response { sequence, result });
        } else if awaiting {
            state.blocked.push((sequence, command));
        } else {
            self.send(job, sequence, command)?;
        }

        Ok(sequence)
    }

    /// Hands a unit to the worker with the fewest units in flight.
    fn send(&mut self, job: JobId, sequence: u64, command: Command) -> Result<()> {
        let index = (self.workers.iter())
            .position_min_by_key(|x| x.outstanding)
            .ok_or(Error::WorkerLost(0))?;

        let worker = &mut self.workers[index];
        let request = Request {
            job,
            sequence,
            command,
        };
        (worker.inbox.send(WorkerMessage::Run(request))).map_err(|_| Error::WorkerLost(index))?;
        worker.outstanding += 1;

        if let Some(unit) = self.units.get_mut(&sequence) {
            unit.sent = true;
        }
        Ok(())
    }

    /// Fires the continuations of every unit that has finished so far without
    /// blocking. Returns whether anything happened.
    pub fn pump(&mut self) -> Result<bool> {
        let mut progressed = false;

        loop {
            if let Some(response) = self.ready.pop_front() {
                self.complete(response)?;
                progressed = true;
                continue;
            }

            match self.replies.try_recv() {
                Ok(reply) => {
                    self.handle(reply)?;
                    progressed = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) if self.workers.is_empty() => break,
                Err(TryRecvError::Disconnected) => return Err(self.lost()),
            }
        }

        Ok(progressed)
    }

    /// Blocks until `job` has no units left, running continuations as they
    /// come in. Returns straight away for jobs that were ended or cancelled.
    pub fn wait(&mut self, job: JobId) -> Result<()> {
        loop {
            while let Some(response) = self.ready.pop_front() {
                self.complete(response)?;
            }

            match self.jobs.get(&job) {
                Some(state) if state.outstanding > 0 => {}
                _ => return Ok(()),
            }

            let reply = self.replies.recv().map_err(|_| self.lost())?;
            self.handle(reply)?;
        }
    }

    /// Ends a job whose units are done and releases its cached state.
    pub fn end_job(&mut self, job: JobId) -> Result<()> {
        let progress = self.jobs.get(&job).map(|x| x.progress.clone());
        let discarded = self.release(job)?;
        if let Some(progress) = progress {
            progress.set_finished();
        }

        debug!(job, discarded, "ended job");
        Ok(())
    }

    /// Tears a job down. Units already running finish but their results are
    /// dropped, units not yet sent are forgotten.
    pub fn cancel(&mut self, job: JobId) -> Result<()> {
        let discarded = self.release(job)?;
        warn!(job, discarded, "cancelled job");
        Ok(())
    }

    fn release(&mut self, job: JobId) -> Result<usize> {
        let Some(state) = self.jobs.remove(&job) else {
            return Ok(0);
        };

        let sequences = (self.units.iter())
            .filter(|(_, unit)| unit.job == job)
            .map(|(&sequence, _)| sequence)
            .collect::<Vec<_>>();
        for sequence in &sequences {
            if self.units.remove(sequence).is_some_and(|x| x.sent) {
                self.discarded.insert(*sequence);
            }
        }

        self.inline_cache.release(job);
        if !state.inline {
            self.released.insert(job, self.workers.len());
            for (index, worker) in self.workers.iter().enumerate() {
                (worker.inbox.send(WorkerMessage::Release(job))).map_err(|_| Error::WorkerLost(index))?;
            }
        }

        Ok(sequences.len())
    }

    fn handle(&mut self, reply: WorkerReply) -> Result<()> {
        match reply {
            WorkerReply::Primed { worker, key } => self.acknowledge(worker, key),
            WorkerReply::Done { worker, response } => {
                if let Some(worker) = self.workers.get_mut(worker) {
                    worker.outstanding = worker.outstanding.saturating_sub(1);
                }
                self.complete(response)
            }
            WorkerReply::Released { worker, job } => self.forget(worker, job),
        }
    }

    /// Once every worker has acknowledged a release nothing more can arrive
    /// for the job, so it no longer needs tracking.
    fn forget(&mut self, worker: usize, job: JobId) -> Result<()> {
        let remaining = self.released.get_mut(&job).ok_or(Error::UnknownJob(job))?;
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.released.remove(&job);
            trace!(worker, job, "release acknowledged by every worker");
        }
        Ok(())
    }

    fn acknowledge(&mut self, worker: usize, key: CacheKey) -> Result<()> {
        if self.released.contains_key(&key.job) {
            return Ok(());
        }

        let state = self.jobs.get_mut(&key.job).ok_or(Error::UnexpectedAck(key))?;
        let remaining = (state.awaiting.get_mut(&key.slot))
            .filter(|x| **x > 0)
            .ok_or(Error::UnexpectedAck(key))?;
        *remaining -= 1;
        trace!(worker, %key, remaining = *remaining, "cache acknowledged");
        if *remaining > 0 {
            return Ok(());
        }

        let awaiting = &state.awaiting;
        let (ready, blocked): (Vec<_>, Vec<_>) = std::mem::take(&mut state.blocked)
            .into_iter()
            .partition(|(_, command)| {
                (command.requires()).map_or(true, |slot| awaiting.get(&slot).map_or(true, |&x| x == 0))
            });
        state.blocked = blocked;

        for (sequence, command) in ready {
            self.send(key.job, sequence, command)?;
        }
        Ok(())
    }

    fn complete(&mut self, response: Response) -> Result<()> {
        let Response { sequence, result } = response;
        if self.discarded.remove(&sequence) {
            return Ok(());
        }

        let unit = self.units.remove(&sequence).ok_or(Error::UnknownSequence(sequence))?;
        if let Some(state) = self.jobs.get_mut(&unit.job) {
            state.outstanding -= 1;
            state.progress.add_complete(1);
        }

        let result = result.map_err(|err| err.in_job(unit.job, unit.stage));
        (unit.continuation)(self, result);
        Ok(())
    }

    fn lost(&self) -> Error {
        let index = (self.workers.iter())
            .position(|x| x.thread.as_ref().map_or(true, |x| x.is_finished()))
            .unwrap_or(0);
        Error::WorkerLost(index)
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.inbox.send(WorkerMessage::Shutdown);
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use common::config::{Axis, SliceConfig};

    use super::*;
    use crate::{
        mesh::Mesh,
        slicer::{partition, sort_slices, stepped_planes, Slice},
        Pos,
    };

    fn pool(workers: usize) -> DispatchPool {
        DispatchPool::new(&PoolConfig {
            workers,
            inline_threshold: 0,
        })
        .unwrap()
    }

    fn mesh() -> Mesh {
        Mesh::cuboid(Pos::zeros(), Pos::new(2.0, 3.0, 4.0))
    }

    /// Slices the test mesh through the pool and returns the sorted slices.
    fn slice_job(pool: &mut DispatchPool, job: JobId) -> Vec<Slice> {
        let config = SliceConfig {
            step: 0.1,
            triangles_per_shard: 1,
            ..SliceConfig::default()
        };
        let planes = stepped_planes(0.0, 4.0, &config);
        let out = Rc::new(RefCell::new(Vec::new()));

        for shard in partition(&planes, 12, &config) {
            let out = out.clone();
            let command = Command::Slice {
                axis: Axis::Z,
                shard,
                epsilon: config.epsilon,
            };
            pool.submit(
                job,
                command,
                Box::new(move |_, result| {
                    let slices = result.and_then(Output::into_slices).unwrap();
                    out.borrow_mut().extend(slices);
                }),
            )
            .unwrap();
        }

        pool.wait(job).unwrap();
        let mut slices = out.take();
        sort_slices(&mut slices);
        slices
    }

    #[test]
    fn workers_match_inline() {
        let mut inline = DispatchPool::inline();
        let job = inline.begin_job(true, Progress::new());
        inline.prime(job, CacheData::Mesh(mesh())).unwrap();
        let expected = slice_job(&mut inline, job);
        assert_eq!(expected.len(), 40);

        let mut pool = pool(3);
        let progress = Progress::new();
        let job = pool.begin_job(false, progress.clone());
        pool.prime(job, CacheData::Mesh(mesh())).unwrap();
        assert_eq!(slice_job(&mut pool, job), expected);

        pool.end_job(job).unwrap();
        assert!(progress.complete());
        assert!(!pool.is_active(job));
    }

    #[test]
    fn reprimed_cache_gives_the_same_output() {
        let mut pool = pool(2);
        let job = pool.begin_job(false, Progress::new());

        pool.prime(job, CacheData::Mesh(mesh())).unwrap();
        let first = slice_job(&mut pool, job);
        pool.prime(job, CacheData::Mesh(mesh())).unwrap();
        let second = slice_job(&mut pool, job);

        assert_eq!(first, second);
    }

    #[test]
    fn cleared_and_reprimed_cache_gives_the_same_output() {
        for mut pool in [DispatchPool::inline(), pool(2)] {
            let inline = pool.worker_count() == 0;
            let job = pool.begin_job(inline, Progress::new());
            pool.prime(job, CacheData::Mesh(mesh())).unwrap();
            let first = slice_job(&mut pool, job);

            pool.clear(job).unwrap();
            assert!(pool.inline_cache.is_empty());
            let config = SliceConfig::default();
            let command = Command::Slice {
                axis: Axis::Z,
                shard: partition(&stepped_planes(0.0, 4.0, &config), 12, &config).remove(0),
                epsilon: config.epsilon,
            };
            let err = pool.submit(job, command, Box::new(|_, _| {})).unwrap_err();
            assert!(matches!(
                err,
                Error::UnprimedCache(CacheKey {
                    slot: CacheSlot::Mesh,
                    ..
                })
            ));

            pool.prime(job, CacheData::Mesh(mesh())).unwrap();
            assert_eq!(slice_job(&mut pool, job), first);
            pool.end_job(job).unwrap();
        }
    }

    #[test]
    fn released_jobs_are_forgotten_once_acknowledged() {
        let mut pool = pool(3);
        for _ in 0..4 {
            let job = pool.begin_job(false, Progress::new());
            pool.prime(job, CacheData::Mesh(mesh())).unwrap();
            slice_job(&mut pool, job);
            pool.end_job(job).unwrap();
        }

        let cancelled = pool.begin_job(false, Progress::new());
        pool.prime(cancelled, CacheData::Mesh(mesh())).unwrap();
        pool.cancel(cancelled).unwrap();
        assert!(pool.released.contains_key(&cancelled));

        while !pool.released.is_empty() {
            let reply = pool.replies.recv().unwrap();
            pool.handle(reply).unwrap();
        }
        assert!(pool.discarded.is_empty());
    }

    #[test]
    fn unprimed_units_are_rejected() {
        let mut pool = pool(1);
        let job = pool.begin_job(false, Progress::new());
        let command = Command::Lathe { steps: 0..4 };

        let err = pool.submit(job, command, Box::new(|_, _| {})).unwrap_err();
        assert!(matches!(
            err,
            Error::UnprimedCache(CacheKey {
                slot: CacheSlot::Lathe,
                ..
            })
        ));
    }

    #[test]
    fn unknown_sequence_is_fatal() {
        let mut pool = DispatchPool::inline();
        pool.ready.push_back(Response {
            sequence: 99,
            result: Ok(Output::Paths(Vec::new())),
        });
        assert!(matches!(pool.pump(), Err(Error::UnknownSequence(99))));
    }

    #[test]
    fn cancelled_results_are_dropped() {
        let mut pool = pool(2);
        let fired = Rc::new(RefCell::new(0));

        let job = pool.begin_job(false, Progress::new());
        pool.prime(job, CacheData::Mesh(mesh())).unwrap();
        let config = SliceConfig::default();
        for shard in partition(&stepped_planes(0.0, 4.0, &config), 12, &config) {
            let fired = fired.clone();
            let command = Command::Slice {
                axis: Axis::Z,
                shard,
                epsilon: config.epsilon,
            };
            let continuation = Box::new(move |_: &mut DispatchPool, _: Result<Output>| *fired.borrow_mut() += 1);
            pool.submit(job, command, continuation).unwrap();
        }

        pool.cancel(job).unwrap();
        pool.wait(job).unwrap();
        assert!(!pool.is_active(job));

        // Late replies of the cancelled job must not confuse the next one.
        let next = pool.begin_job(false, Progress::new());
        pool.prime(next, CacheData::Mesh(mesh())).unwrap();
        assert_eq!(slice_job(&mut pool, next).len(), 40);
        while pool.pump().unwrap() {}
        assert_eq!(*fired.borrow(), 0);
    }

    #[test]
    fn continuations_chain_units() {
        let mut pool = pool(2);
        let job = pool.begin_job(false, Progress::new());
        pool.prime(job, CacheData::Mesh(mesh())).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let config = SliceConfig::default();
        let shard = partition(&stepped_planes(0.0, 4.0, &config), 1, &config).remove(0);
        let command = Command::Slice {
            axis: Axis::Z,
            shard,
            epsilon: config.epsilon,
        };

        let inner = seen.clone();
        pool.submit(
            job,
            command,
            Box::new(move |pool, result| {
                let slices = result.and_then(Output::into_slices).unwrap();
                inner.borrow_mut().push(slices.len());

                let grid = crate::raster::GridSpec {
                    origin: crate::Pos2::new(0.5, 0.5),
                    resolution: 1.0,
                    columns: 2,
                    rows: 3,
                    floor: 0.0,
                };
                let rasterize = Command::Rasterize {
                    grid,
                    columns: 0..2,
                    slices,
                };
                let inner = inner.clone();
                let continuation = Box::new(move |_: &mut DispatchPool, result: Result<Output>| {
                    let strip = result.and_then(Output::into_strip).unwrap();
                    inner.borrow_mut().push(strip.data.len());
                });
                pool.submit(job, rasterize, continuation).unwrap();
            }),
        )
        .unwrap();

        pool.wait(job).unwrap();
        assert_eq!(*seen.borrow(), vec![20, 6]);
    }
}
