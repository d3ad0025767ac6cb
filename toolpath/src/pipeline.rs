//! Runs a whole job for one manufacturing mode on a [`DispatchPool`]. Every
//! stage is sharded into units whose continuations chain into the next
//! stage, so the coordinator only ever blocks in [`DispatchPool::wait`].

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
    time::Instant,
};

use common::{
    config::{Axis, ContourDirection, JobConfig, Mode, Polygon, RasterConfig, SliceConfig},
    misc::{human_duration, signed_area},
    progress::Progress,
};
use tracing::{debug, info};

use crate::{
    contour::{rectangle, ContourSetup, RasterDirection},
    dispatch::{CacheData, Command, Continuation, DispatchPool, JobId, Output},
    lathe::{self, LatheRecord, LatheSetup},
    mesh::{AxisExt, Mesh},
    path::{sort_paths, Category, Path},
    raster::{GridSpec, HeightStrip, Heightfield},
    slicer::{centered_planes, partition, sort_slices, stepped_planes, Plane, Slice},
    tool::ToolProfile,
    Error, Pos2, Result, Stage,
};

/// Distance under which segment ends are joined into loops.
const JOIN_TOLERANCE: f32 = 1e-4;
/// Raster lines handed to a single contouring unit.
const LINES_PER_UNIT: usize = 16;
/// Angular steps handed to a single lathe unit.
const STEPS_PER_UNIT: usize = 12;

type Failure = Rc<RefCell<Option<Error>>>;

/// Turns a mesh into ordered tool paths. Small meshes, or pools without
/// workers, are processed inline with identical results.
pub fn run(pool: &mut DispatchPool, mesh: &Mesh, config: &JobConfig, progress: &Progress) -> Result<Vec<Path>> {
    if mesh.is_empty() {
        debug!("mesh has no triangles, nothing to do");
        return Ok(Vec::new());
    }

    let inline = mesh.triangle_count() < config.pool.inline_threshold || pool.worker_count() == 0;
    info!(
        mode = ?config.mode,
        triangles = mesh.triangle_count(),
        inline,
        "starting job"
    );

    let started = Instant::now();
    let paths = match config.mode {
        Mode::Layers => layers(pool, mesh, config, inline, progress)?,
        Mode::Contour => contour(pool, mesh, config, inline, progress)?,
        Mode::Lathe => lathe(pool, mesh, config, inline, progress)?,
    };

    info!(
        paths = paths.len(),
        elapsed = human_duration(started.elapsed()),
        "finished job"
    );
    Ok(paths)
}

/// Planar slices joined into closed loops, one group of paths per layer.
pub fn layers(
    pool: &mut DispatchPool,
    mesh: &Mesh,
    config: &JobConfig,
    inline: bool,
    progress: &Progress,
) -> Result<Vec<Path>> {
    let axis = config.slice.axis;
    let slices = drive(pool, inline, progress, |pool, job, failure| {
        let (min, max) = mesh.bounds();
        let (min, max) = (min[axis.index()], max[axis.index()]);
        let slice = SliceConfig {
            step: resolve_step(min, max, &config.slice)?,
            ..config.slice.clone()
        };

        let count = ((max - min) as f64 / slice.step as f64).floor();
        if !(count <= slice.max_planes as f64) {
            return Err(Error::TooManySlices {
                planes: count as u64,
                limit: slice.max_planes,
            });
        }

        let planes = stepped_planes(min, max, &slice);
        let shards = partition(&planes, mesh.triangle_count(), &slice);
        pool.prime(job, CacheData::Mesh(mesh.clone()))?;
        debug!(
            job,
            step = slice.step,
            planes = planes.len(),
            shards = shards.len(),
            "slicing layers"
        );

        let slices = Rc::new(RefCell::new(Vec::new()));
        for shard in shards {
            let out = slices.clone();
            let command = Command::Slice {
                axis,
                shard,
                epsilon: slice.epsilon,
            };
            let then = move |_: &mut DispatchPool, slices: Vec<Slice>| {
                out.borrow_mut().extend(slices);
                Ok(())
            };
            pool.submit(job, command, continuation(failure, job, Stage::Slice, Output::into_slices, then))?;
        }
        Ok(slices)
    })?;

    let mut slices = slices.take();
    sort_slices(&mut slices);
    Ok(slices
        .iter()
        .flat_map(|slice| {
            slice.loops(JOIN_TOLERANCE).into_iter().map(|lp| Path {
                category: Category::Layer,
                index: slice.index,
                closed: lp.closed,
                points: lp.points.into_iter().map(|x| axis.to_world(x)).collect(),
                angles: None,
            })
        })
        .collect())
}

/// Heightfield contouring. The mesh is sliced along X one plane per grid
/// column, each shard of slices is rasterized into a strip, and once every
/// strip is merged the finished field is primed for raster line extraction.
pub fn contour(
    pool: &mut DispatchPool,
    mesh: &Mesh,
    config: &JobConfig,
    inline: bool,
    progress: &Progress,
) -> Result<Vec<Path>> {
    let paths = drive(pool, inline, progress, |pool, job, failure| {
        let (min, max) = mesh.bounds();
        let (min, max) = (min.xy(), max.xy());

        let resolution = resolve_resolution(min, max, &config.raster)?;
        let grid = GridSpec::covering(min, max, resolution, config.raster.floor);
        if grid.cells() > config.raster.max_cells {
            return Err(Error::GridTooLarge {
                cells: grid.cells(),
                limit: config.raster.max_cells,
            });
        }

        let clip = clip_polygons(config.contour.silhouettes.as_deref(), min, max)?;
        let profile = Arc::new(ToolProfile::new(&config.tool, resolution)?);
        let planes = grid.column_planes();
        let shards = partition(&planes, mesh.triangle_count(), &config.slice);

        pool.prime(job, CacheData::Mesh(mesh.clone()))?;
        debug!(
            job,
            columns = grid.columns,
            rows = grid.rows,
            resolution,
            shards = shards.len(),
            "rasterizing heightfield"
        );

        let state = Rc::new(ContourJob {
            job,
            config: config.clone(),
            profile,
            clip,
            field: RefCell::new(Some(Heightfield::new(grid))),
            remaining: Cell::new(shards.len()),
            started: Instant::now(),
            paths: RefCell::new(Vec::new()),
            failure: failure.clone(),
        });

        for shard in shards {
            let columns = match (shard.planes.first(), shard.planes.last()) {
                (Some(first), Some(last)) => first.index..last.index + 1,
                _ => 0..0,
            };
            let command = Command::Slice {
                axis: Axis::X,
                shard,
                epsilon: config.slice.epsilon,
            };

            let this = state.clone();
            let then = move |pool: &mut DispatchPool, slices: Vec<Slice>| -> Result<()> {
                let rasterize = Command::Rasterize {
                    grid,
                    columns,
                    slices,
                };
                let next = this.clone();
                let merge = move |pool: &mut DispatchPool, strip| next.merge(pool, strip);
                let merge = continuation(&this.failure, this.job, Stage::Rasterize, Output::into_strip, merge);
                pool.submit(this.job, rasterize, merge)?;
                Ok(())
            };
            pool.submit(job, command, continuation(failure, job, Stage::Slice, Output::into_slices, then))?;
        }
        Ok(state)
    })?;

    let mut paths = paths.paths.take();
    sort_paths(&mut paths);
    Ok(paths)
}

/// Rotary surfacing. Cross sections along X are gathered first, then the
/// revolution is split into step ranges that rotate and ray cast in parallel.
pub fn lathe(
    pool: &mut DispatchPool,
    mesh: &Mesh,
    config: &JobConfig,
    inline: bool,
    progress: &Progress,
) -> Result<Vec<Path>> {
    let records = drive(pool, inline, progress, |pool, job, failure| {
        let steps = lathe::revolution_steps(config.lathe.angle_step)?;
        let (min, max) = mesh.bounds();
        let resolution = resolve_resolution(min.xy(), max.xy(), &config.raster)?;

        let count = (((max.x - min.x) / resolution).ceil() as usize).max(1);
        let cells = (count as u64).saturating_mul(steps as u64);
        if cells > config.raster.max_cells {
            return Err(Error::GridTooLarge {
                cells,
                limit: config.raster.max_cells,
            });
        }

        let profile = Arc::new(ToolProfile::new(&config.tool, resolution)?);
        let planes = centered_planes(min.x + resolution / 2.0, resolution, count);
        let shards = partition(&planes, mesh.triangle_count(), &config.slice);

        pool.prime(job, CacheData::Mesh(mesh.clone()))?;
        debug!(job, positions = count, steps, "slicing for lathe");

        let state = Rc::new(LatheJob {
            job,
            config: config.clone(),
            profile,
            planes,
            steps,
            remaining: Cell::new(shards.len()),
            slices: RefCell::new(Vec::new()),
            records: RefCell::new(Vec::new()),
            failure: failure.clone(),
        });

        for shard in shards {
            let command = Command::Slice {
                axis: Axis::X,
                shard,
                epsilon: config.slice.epsilon,
            };
            let this = state.clone();
            let then = move |pool: &mut DispatchPool, slices| this.gather(pool, slices);
            pool.submit(job, command, continuation(failure, job, Stage::Slice, Output::into_slices, then))?;
        }
        Ok(state)
    })?;

    let records = records.records.take();
    Ok(lathe::records_to_paths(records, config.lathe.order))
}

struct ContourJob {
    job: JobId,
    config: JobConfig,
    profile: Arc<ToolProfile>,
    clip: Vec<Polygon>,
    /// Taken once the last strip is merged.
    field: RefCell<Option<Heightfield>>,
    remaining: Cell<usize>,
    started: Instant,
    paths: RefCell<Vec<Path>>,
    failure: Failure,
}

impl ContourJob {
    fn merge(self: &Rc<Self>, pool: &mut DispatchPool, strip: HeightStrip) -> Result<()> {
        if let Some(field) = self.field.borrow_mut().as_mut() {
            field.merge(&strip);
        }

        self.remaining.set(self.remaining.get() - 1);
        if self.remaining.get() > 0 {
            return Ok(());
        }

        let Some(field) = self.field.borrow_mut().take() else {
            return Ok(());
        };
        debug!(
            job = self.job,
            elapsed = human_duration(self.started.elapsed()),
            "heightfield complete"
        );
        self.extract(pool, field)
    }

    fn extract(self: &Rc<Self>, pool: &mut DispatchPool, field: Heightfield) -> Result<()> {
        let setup = Arc::new(ContourSetup::new(
            Arc::new(field),
            self.profile.clone(),
            self.clip.clone(),
            &self.config.contour,
            &self.config.tool,
        ));
        pool.prime(self.job, CacheData::Contour(setup.clone()))?;

        let directions: &[RasterDirection] = match self.config.contour.direction {
            ContourDirection::X => &[RasterDirection::X],
            ContourDirection::Y => &[RasterDirection::Y],
            ContourDirection::Both => &[RasterDirection::X, RasterDirection::Y],
        };

        for &direction in directions {
            let lines = setup.line_count(direction);
            debug!(job = self.job, ?direction, lines, "extracting raster lines");

            for start in (0..lines).step_by(LINES_PER_UNIT) {
                let command = Command::Contour {
                    direction,
                    lines: start..(start + LINES_PER_UNIT).min(lines),
                };
                let this = self.clone();
                let then = move |_: &mut DispatchPool, paths: Vec<Path>| {
                    this.paths.borrow_mut().extend(paths);
                    Ok(())
                };
                let then = continuation(&self.failure, self.job, Stage::Contour, Output::into_paths, then);
                pool.submit(self.job, command, then)?;
            }
        }

        Ok(())
    }
}

struct LatheJob {
    job: JobId,
    config: JobConfig,
    profile: Arc<ToolProfile>,
    planes: Vec<Plane>,
    steps: usize,
    remaining: Cell<usize>,
    slices: RefCell<Vec<Slice>>,
    records: RefCell<Vec<LatheRecord>>,
    failure: Failure,
}

impl LatheJob {
    fn gather(self: &Rc<Self>, pool: &mut DispatchPool, slices: Vec<Slice>) -> Result<()> {
        self.slices.borrow_mut().extend(slices);
        self.remaining.set(self.remaining.get() - 1);
        if self.remaining.get() > 0 {
            return Ok(());
        }

        let slices = self.slices.take();
        let setup = LatheSetup::new(&self.planes, &slices, self.profile.clone(), &self.config.lathe)?;
        pool.prime(self.job, CacheData::Lathe(Arc::new(setup)))?;
        debug!(job = self.job, slices = slices.len(), "generating lathe steps");

        for start in (0..self.steps).step_by(STEPS_PER_UNIT) {
            let command = Command::Lathe {
                steps: start..(start + STEPS_PER_UNIT).min(self.steps),
            };
            let this = self.clone();
            let then = move |_: &mut DispatchPool, records: Vec<LatheRecord>| {
                this.records.borrow_mut().extend(records);
                Ok(())
            };
            let then = continuation(&self.failure, self.job, Stage::Lathe, Output::into_lathe, then);
            pool.submit(self.job, command, then)?;
        }

        Ok(())
    }
}

/// Runs a job from start to end. `start` checks the job's settings, submits
/// the first units and returns whatever the continuations collect into. Its
/// errors are reported as setup failures of the job. The first failure anywhere
/// cancels the job and is returned once it has been torn down.
fn drive<T>(
    pool: &mut DispatchPool,
    inline: bool,
    progress: &Progress,
    start: impl FnOnce(&mut DispatchPool, JobId, &Failure) -> Result<T>,
) -> Result<T> {
    let job = pool.begin_job(inline, progress.clone());
    let failure = Failure::default();

    let result = start(pool, job, &failure).and_then(|out| pool.wait(job).map(|_| out));
    let failed = failure.borrow_mut().take();

    match (result, failed) {
        (Ok(out), None) => {
            pool.end_job(job)?;
            Ok(out)
        }
        (_, Some(err)) | (Err(err), None) => {
            if pool.is_active(job) {
                pool.cancel(job)?;
            }
            Err(err.in_job(job, Stage::Setup))
        }
    }
}

/// Builds a continuation that unpacks a unit's output and hands it to
/// `then`. Any error is recorded as the job's failure and cancels the job.
fn continuation<T: 'static>(
    failure: &Failure,
    job: JobId,
    stage: Stage,
    unpack: fn(Output) -> Result<T>,
    then: impl FnOnce(&mut DispatchPool, T) -> Result<()> + 'static,
) -> Continuation {
    let failure = failure.clone();
    Box::new(move |pool: &mut DispatchPool, result: Result<Output>| {
        let Err(err) = result.and_then(unpack).and_then(|x| then(pool, x)) else {
            return;
        };

        let mut failure = failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(err.in_job(job, stage));
        }
        drop(failure);

        if let Err(err) = pool.cancel(job) {
            debug!(job, %err, "failed to cancel job");
        }
    })
}

/// Distance between sweep planes. A configured step is used as is, zero
/// splits the extent `min..max` into the target plane count.
pub fn resolve_step(min: f32, max: f32, config: &SliceConfig) -> Result<f32> {
    if config.step > 0.0 && config.step.is_finite() {
        return Ok(config.step);
    }
    if config.step != 0.0 {
        return Err(Error::setting("slice.step", "must be zero or a finite positive distance"));
    }

    let extent = max - min;
    if !(extent > 0.0 && extent.is_finite()) {
        return Err(Error::UnmeasurableFootprint);
    }
    if config.target_planes == 0 {
        return Err(Error::setting("slice.target_planes", "must be positive"));
    }

    Ok(extent / config.target_planes as f32)
}

/// Cell size for a footprint. A configured resolution is used as is, zero
/// derives it from the target sample count.
pub fn resolve_resolution(min: Pos2, max: Pos2, config: &RasterConfig) -> Result<f32> {
    if config.resolution > 0.0 && config.resolution.is_finite() {
        return Ok(config.resolution);
    }
    if config.resolution != 0.0 {
        return Err(Error::setting("raster.resolution", "must be zero or a finite positive size"));
    }

    let size = max - min;
    let area = size.x * size.y;
    if !(area > 0.0 && area.is_finite()) || config.target_samples == 0 {
        return Err(Error::UnmeasurableFootprint);
    }

    Ok((area / config.target_samples as f32).sqrt())
}

/// Clip outlines for contouring. Without silhouettes the footprint rectangle
/// is used. Silhouettes without area are dropped later and simply produce no
/// paths, but ones that miss the footprint entirely are an input error.
pub fn clip_polygons(silhouettes: Option<&[Polygon]>, min: Pos2, max: Pos2) -> Result<Vec<Polygon>> {
    let Some(silhouettes) = silhouettes else {
        return Ok(vec![rectangle(min, max)]);
    };

    let measurable = (silhouettes.iter())
        .filter(|x| signed_area(x).abs() > f32::EPSILON)
        .collect::<Vec<_>>();
    let overlaps = |polygon: &Polygon| {
        let (lo, hi) = polygon.iter().fold(
            (Pos2::repeat(f32::MAX), Pos2::repeat(f32::MIN)),
            |(lo, hi), x| (lo.inf(x), hi.sup(x)),
        );
        lo.x < max.x && hi.x > min.x && lo.y < max.y && hi.y > min.y
    };

    if !measurable.is_empty() && !measurable.iter().any(|x| overlaps(x)) {
        return Err(Error::SilhouetteOutsideFootprint);
    }

    Ok(silhouettes.to_vec())
}
