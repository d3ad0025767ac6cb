use std::{
    collections::HashMap,
    sync::mpsc::{Receiver, Sender},
};

use tracing::trace;

use super::protocol::{
    CacheData, CacheKey, CacheSlot, Command, JobId, Output, Response, WorkerMessage, WorkerReply,
};
use crate::{
    contour::ContourSetup, lathe, lathe::LatheSetup, mesh::Mesh, raster::HeightStrip,
    slicer::slice_shard, Error, Result,
};

/// Shared state held by one worker (or by the coordinator for inline jobs),
/// keyed by job so units never see another job's data.
#[derive(Default)]
pub struct WorkerCache {
    entries: HashMap<CacheKey, CacheData>,
}

impl WorkerCache {
    pub fn insert(&mut self, key: CacheKey, data: CacheData) {
        self.entries.insert(key, data);
    }

    /// Drops every entry belonging to `job`.
    pub fn release(&mut self, job: JobId) {
        self.entries.retain(|key, _| key.job != job);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, job: JobId, slot: CacheSlot) -> Result<&CacheData> {
        let key = CacheKey { job, slot };
        self.entries.get(&key).ok_or(Error::MissingCache(key))
    }

    fn mesh(&self, job: JobId) -> Result<&Mesh> {
        match self.get(job, CacheSlot::Mesh)? {
            CacheData::Mesh(mesh) => Ok(mesh),
            _ => Err(Error::MissingCache(CacheKey { job, slot: CacheSlot::Mesh })),
        }
    }

    fn contour(&self, job: JobId) -> Result<&ContourSetup> {
        match self.get(job, CacheSlot::Contour)? {
            CacheData::Contour(setup) => Ok(setup),
            _ => Err(Error::MissingCache(CacheKey { job, slot: CacheSlot::Contour })),
        }
    }

    fn lathe(&self, job: JobId) -> Result<&LatheSetup> {
        match self.get(job, CacheSlot::Lathe)? {
            CacheData::Lathe(setup) => Ok(setup),
            _ => Err(Error::MissingCache(CacheKey { job, slot: CacheSlot::Lathe })),
        }
    }
}

/// Runs one command against a cache. Workers and the inline path both go
/// through here so they always agree.
pub fn execute(job: JobId, command: &Command, cache: &WorkerCache) -> Result<Output> {
    Ok(match command {
        Command::Slice {
            axis,
            shard,
            epsilon,
        } => Output::Slices(slice_shard(cache.mesh(job)?, *axis, shard, *epsilon)),
        Command::Rasterize {
            grid,
            columns,
            slices,
        } => Output::Strip(HeightStrip::rasterize(grid, columns.clone(), slices)),
        Command::Contour { direction, lines } => {
            Output::Paths(cache.contour(job)?.extract_lines(*direction, lines.clone()))
        }
        Command::Lathe { steps } => Output::Lathe(lathe::generate(cache.lathe(job)?, steps.clone())),
    })
}

/// Body of a worker thread. Returns once told to shut down or once the
/// coordinator goes away.
pub(super) fn run(index: usize, inbox: Receiver<WorkerMessage>, outbox: Sender<WorkerReply>) {
    let mut cache = WorkerCache::default();

    while let Ok(message) = inbox.recv() {
        let reply = match message {
            WorkerMessage::Prime { key, data } => {
                cache.insert(key, data);
                WorkerReply::Primed { worker: index, key }
            }
            WorkerMessage::Run(request) => {
                let result = execute(request.job, &request.command, &cache);
                WorkerReply::Done {
                    worker: index,
                    response: Response {
                        sequence: request.sequence,
                        result,
                    },
                }
            }
            WorkerMessage::Clear(job) => {
                cache.release(job);
                trace!(worker = index, job, entries = cache.len(), "cleared cache");
                continue;
            }
            WorkerMessage::Release(job) => {
                cache.release(job);
                trace!(worker = index, job, entries = cache.len(), "released cache");
                WorkerReply::Released { worker: index, job }
            }
            WorkerMessage::Shutdown => break,
        };

        if outbox.send(reply).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use common::config::Axis;

    use super::*;
    use crate::{
        dispatch::Request,
        slicer::{Plane, Shard, SliceRange},
        Pos,
    };

    fn slice_command() -> Command {
        Command::Slice {
            axis: Axis::Z,
            shard: Shard {
                range: SliceRange {
                    index: 0,
                    min: f32::NEG_INFINITY,
                    max: f32::INFINITY,
                },
                planes: vec![Plane { index: 0, z: 0.5 }],
            },
            epsilon: 1e-5,
        }
    }

    #[test]
    fn jobs_do_not_share_entries() {
        let mut cache = WorkerCache::default();
        let mesh = Mesh::cuboid(Pos::zeros(), Pos::repeat(1.0));
        cache.insert(
            CacheKey {
                job: 1,
                slot: CacheSlot::Mesh,
            },
            CacheData::Mesh(mesh),
        );

        assert!(execute(1, &slice_command(), &cache).is_ok());
        let err = execute(2, &slice_command(), &cache).err().unwrap();
        assert!(matches!(err, Error::MissingCache(CacheKey { job: 2, .. })));

        cache.release(1);
        assert!(cache.is_empty());
    }

    #[test]
    fn cleared_worker_needs_a_new_prime() {
        let (inbox, messages) = std::sync::mpsc::channel();
        let (outbox, replies) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || run(0, messages, outbox));
        let key = CacheKey {
            job: 7,
            slot: CacheSlot::Mesh,
        };
        let request = |sequence| {
            WorkerMessage::Run(Request {
                job: 7,
                sequence,
                command: slice_command(),
            })
        };

        let mesh = Mesh::cuboid(Pos::zeros(), Pos::repeat(1.0));
        inbox
            .send(WorkerMessage::Prime {
                key,
                data: CacheData::Mesh(mesh),
            })
            .unwrap();
        inbox.send(WorkerMessage::Clear(7)).unwrap();
        inbox.send(request(0)).unwrap();
        inbox.send(WorkerMessage::Release(7)).unwrap();
        inbox.send(WorkerMessage::Shutdown).unwrap();
        handle.join().unwrap();

        let replies = replies.iter().collect::<Vec<_>>();
        assert_eq!(replies.len(), 3);
        assert!(matches!(replies[0], WorkerReply::Primed { worker: 0, .. }));
        match &replies[1] {
            WorkerReply::Done { response, .. } => {
                assert!(matches!(response.result, Err(Error::MissingCache(_))));
            }
            _ => panic!("expected a finished unit"),
        }
        assert!(matches!(replies[2], WorkerReply::Released { worker: 0, job: 7 }));
    }
}
