use std::fmt::{self, Display};

use crate::dispatch::{CacheKey, JobId};

pub type Result<T> = std::result::Result<T, Error>;

/// The pipeline stage a unit of work belongs to, reported with job failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Setup,
    Slice,
    Rasterize,
    Contour,
    Lathe,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vertex buffer holds {0} floats, expected a multiple of nine")]
    VertexCount(usize),
    #[error("footprint has no measurable area to derive a resolution from")]
    UnmeasurableFootprint,
    #[error("silhouette does not cover any part of the footprint")]
    SilhouetteOutsideFootprint,
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("heightfield of {cells} cells exceeds the limit of {limit}")]
    GridTooLarge { cells: u64, limit: u64 },
    #[error("sweep of {planes} planes exceeds the limit of {limit}")]
    TooManySlices { planes: u64, limit: u64 },

    #[error("response for unknown sequence {0}")]
    UnknownSequence(u64),
    #[error("unit references cache entry {0} which was never primed")]
    UnprimedCache(CacheKey),
    #[error("acknowledgement for cache entry {0} which is not being primed")]
    UnexpectedAck(CacheKey),
    #[error("cache entry {0} is missing")]
    MissingCache(CacheKey),
    #[error("unit returned {got} output for a {expected} command")]
    UnexpectedOutput {
        expected: Stage,
        got: &'static str,
    },
    #[error("job {0} is not active")]
    UnknownJob(JobId),
    #[error("worker {0} disconnected")]
    WorkerLost(usize),

    #[error("job {job} failed during {stage}: {source}")]
    Job {
        job: JobId,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn in_job(self, job: JobId, stage: Stage) -> Self {
        match self {
            // Never wrap twice, the innermost stage is the one that failed.
            err @ Error::Job { .. } => err,
            err => Error::Job {
                job,
                stage,
                source: Box::new(err),
            },
        }
    }

    pub(crate) fn setting(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Setup => "setup",
            Stage::Slice => "slicing",
            Stage::Rasterize => "rasterizing",
            Stage::Contour => "contouring",
            Stage::Lathe => "lathe",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_errors_are_wrapped_once() {
        let err = Error::UnknownSequence(3)
            .in_job(1, Stage::Slice)
            .in_job(2, Stage::Lathe);

        assert!(matches!(
            err,
            Error::Job {
                job: 1,
                stage: Stage::Slice,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "job 1 failed during slicing: response for unknown sequence 3"
        );
    }
}
