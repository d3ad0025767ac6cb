//! Messages exchanged between the coordinator and its workers. Payloads are
//! plain in-process values, nothing here is meant to cross a process
//! boundary.

use std::{
    fmt::{self, Display},
    ops::Range,
    sync::Arc,
};

use common::config::Axis;

use crate::{
    contour::{ContourSetup, RasterDirection},
    lathe::{LatheRecord, LatheSetup},
    mesh::Mesh,
    path::Path,
    raster::{GridSpec, HeightStrip},
    slicer::{Shard, Slice},
    Error, Result, Stage,
};

pub type JobId = u64;

/// The kinds of shared state a job can prime into worker caches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheSlot {
    Mesh,
    Contour,
    Lathe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub job: JobId,
    pub slot: CacheSlot,
}

/// Read only state primed once per job and shared by all of its units.
#[derive(Clone)]
pub enum CacheData {
    Mesh(Mesh),
    Contour(Arc<ContourSetup>),
    Lathe(Arc<LatheSetup>),
}

/// One unit of shardable work.
#[derive(Clone, Debug)]
pub enum Command {
    /// Slices one shard of the primed mesh.
    Slice {
        axis: Axis,
        shard: Shard,
        epsilon: f32,
    },
    /// Rasterizes the slices of a column range into a strip.
    Rasterize {
        grid: GridSpec,
        columns: Range<usize>,
        slices: Vec<Slice>,
    },
    /// Extracts a batch of raster lines from the primed contour setup.
    Contour {
        direction: RasterDirection,
        lines: Range<usize>,
    },
    /// Generates a range of angular steps from the primed lathe setup.
    Lathe { steps: Range<usize> },
}

pub enum Output {
    Slices(Vec<Slice>),
    Strip(HeightStrip),
    Paths(Vec<Path>),
    Lathe(Vec<LatheRecord>),
}

pub struct Request {
    pub job: JobId,
    pub sequence: u64,
    pub command: Command,
}

pub struct Response {
    pub sequence: u64,
    pub result: Result<Output>,
}

pub enum WorkerMessage {
    Prime { key: CacheKey, data: CacheData },
    Run(Request),
    /// Drops a job's cache entries while the job goes on.
    Clear(JobId),
    /// Drops a job's cache entries for good. Acknowledged, and always the
    /// last message a worker gets about that job.
    Release(JobId),
    Shutdown,
}

pub enum WorkerReply {
    Primed { worker: usize, key: CacheKey },
    Done { worker: usize, response: Response },
    Released { worker: usize, job: JobId },
}

impl CacheData {
    pub fn slot(&self) -> CacheSlot {
        match self {
            CacheData::Mesh(_) => CacheSlot::Mesh,
            CacheData::Contour(_) => CacheSlot::Contour,
            CacheData::Lathe(_) => CacheSlot::Lathe,
        }
    }
}

impl Command {
    /// The cache slot a command reads, which must be primed before the
    /// command is sent anywhere.
    pub fn requires(&self) -> Option<CacheSlot> {
        match self {
            Command::Slice { .. } => Some(CacheSlot::Mesh),
            Command::Rasterize { .. } => None,
            Command::Contour { .. } => Some(CacheSlot::Contour),
            Command::Lathe { .. } => Some(CacheSlot::Lathe),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Command::Slice { .. } => Stage::Slice,
            Command::Rasterize { .. } => Stage::Rasterize,
            Command::Contour { .. } => Stage::Contour,
            Command::Lathe { .. } => Stage::Lathe,
        }
    }
}

impl Output {
    pub fn kind(&self) -> &'static str {
        match self {
            Output::Slices(_) => "slices",
            Output::Strip(_) => "strip",
            Output::Paths(_) => "paths",
            Output::Lathe(_) => "lathe",
        }
    }

    fn unexpected(self, expected: Stage) -> Error {
        Error::UnexpectedOutput {
            expected,
            got: self.kind(),
        }
    }

    pub fn into_slices(self) -> Result<Vec<Slice>> {
        match self {
            Output::Slices(slices) => Ok(slices),
            other => Err(other.unexpected(Stage::Slice)),
        }
    }

    pub fn into_strip(self) -> Result<HeightStrip> {
        match self {
            Output::Strip(strip) => Ok(strip),
            other => Err(other.unexpected(Stage::Rasterize)),
        }
    }

    pub fn into_paths(self) -> Result<Vec<Path>> {
        match self {
            Output::Paths(paths) => Ok(paths),
            other => Err(other.unexpected(Stage::Contour)),
        }
    }

    pub fn into_lathe(self) -> Result<Vec<LatheRecord>> {
        match self {
            Output::Lathe(records) => Ok(records),
            other => Err(other.unexpected(Stage::Lathe)),
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = match self.slot {
            CacheSlot::Mesh => "mesh",
            CacheSlot::Contour => "contour",
            CacheSlot::Lathe => "lathe",
        };
        write!(f, "{slot}@{}", self.job)
    }
}
