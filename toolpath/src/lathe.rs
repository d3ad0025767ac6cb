//! Rotary surfacing around the X axis. The part is sliced along X once, then
//! the cross sections are turned in fixed angular steps and the tool contact
//! height is found by casting rays straight down through the rotated lines.

use std::{ops::Range, sync::Arc};

use common::config::{LatheConfig, LatheOrder};
use nalgebra::Vector2;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    path::{Category, Path},
    slicer::{Plane, Slice},
    tool::ToolProfile,
    Error, Pos, Result,
};

type Point = Vector2<f64>;

/// A cross section line in the YZ plane. Kept in double precision so a full
/// revolution of incremental rotations lands back where it started.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Line {
    pub a: Point,
    pub b: Point,
}

/// Read only state shared by every lathe unit of a job.
pub struct LatheSetup {
    /// Lines of the cross section at each longitudinal position.
    pub lines: Vec<Vec<Line>>,
    /// X coordinate of each longitudinal position.
    pub positions: Vec<f32>,
    pub profile: Arc<ToolProfile>,
    pub angle_step: f64,
    pub stock_floor: f32,
}

/// Tool heights for every longitudinal position at one angle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatheRecord {
    pub step: usize,
    /// Rotary axis position in degrees. Decreases with every step.
    pub angle: f32,
    pub samples: Vec<Pos>,
}

/// Produces one [`LatheRecord`] per angular step, rotating the lines it holds
/// in place between steps.
pub struct LatheGenerator<'a> {
    setup: &'a LatheSetup,
    lines: Vec<Vec<Line>>,
    step: usize,
    fallbacks: usize,
}

impl Line {
    fn rotate(&self, (sin, cos): (f64, f64)) -> Self {
        let turn = |p: Point| Point::new(p.x * cos - p.y * sin, p.x * sin + p.y * cos);
        Self {
            a: turn(self.a),
            b: turn(self.b),
        }
    }

    /// Height where a vertical ray at `y` crosses this line.
    fn hit(&self, y: f64) -> Option<f64> {
        let (lo, hi) = (self.a.x.min(self.b.x), self.a.x.max(self.b.x));
        if y < lo || y > hi {
            return None;
        }

        let run = self.b.x - self.a.x;
        if run == 0.0 {
            return Some(self.a.y.max(self.b.y));
        }

        let t = (y - self.a.x) / run;
        Some(self.a.y + t * (self.b.y - self.a.y))
    }
}

impl LatheSetup {
    /// Groups X sweep slices by their plane. In the local frame of an X sweep
    /// a segment's `x` is world Y and its `y` is world Z.
    pub fn new(
        planes: &[Plane],
        slices: &[Slice],
        profile: Arc<ToolProfile>,
        config: &LatheConfig,
    ) -> Result<Self> {
        revolution_steps(config.angle_step)?;

        let mut lines = vec![Vec::new(); planes.len()];
        for slice in slices.iter().filter(|x| x.index < planes.len()) {
            lines[slice.index].extend(slice.segments.iter().map(|x| Line {
                a: Point::new(x.a.x as f64, x.a.y as f64),
                b: Point::new(x.b.x as f64, x.b.y as f64),
            }));
        }

        Ok(Self {
            lines,
            positions: planes.iter().map(|x| x.z).collect(),
            profile,
            angle_step: config.angle_step as f64,
            stock_floor: config.stock_floor,
        })
    }

    /// Steps in one revolution.
    pub fn step_count(&self) -> usize {
        ((360.0 / self.angle_step).round() as usize).max(1)
    }

    fn rotation(&self, steps: usize) -> (f64, f64) {
        (self.angle_step * steps as f64).to_radians().sin_cos()
    }
}

impl<'a> LatheGenerator<'a> {
    /// Starts at `start_step`. The first rotation is computed directly from
    /// the source lines so shards starting anywhere agree with a generator
    /// that walked there one step at a time.
    pub fn new(setup: &'a LatheSetup, start_step: usize) -> Self {
        let rotation = setup.rotation(start_step);
        let lines = (setup.lines.iter())
            .map(|lines| lines.iter().map(|x| x.rotate(rotation)).collect())
            .collect();

        Self {
            setup,
            lines,
            step: start_step,
            fallbacks: 0,
        }
    }

    /// Rays that missed every line so far and took the stock floor.
    pub fn fallbacks(&self) -> usize {
        self.fallbacks
    }

    fn record(&mut self) -> LatheRecord {
        let setup = self.setup;
        let resolution = setup.profile.resolution() as f64;

        let samples = (setup.positions.iter().enumerate())
            .map(|(k, &x)| {
                let height = (setup.profile.samples().iter())
                    .map(|sample| {
                        let hit = usize::try_from(k as i64 + sample.dx as i64)
                            .ok()
                            .and_then(|idx| self.lines.get(idx))
                            .and_then(|lines| cast(lines, sample.dy as f64 * resolution));
                        let surface = hit.unwrap_or_else(|| {
                            self.fallbacks += 1;
                            setup.stock_floor as f64
                        });
                        surface + sample.dz as f64
                    })
                    .fold(setup.stock_floor as f64, f64::max);
                Pos::new(x, 0.0, height as f32)
            })
            .collect();

        LatheRecord {
            step: self.step,
            angle: -(self.step as f64 * setup.angle_step) as f32,
            samples,
        }
    }
}

impl Iterator for LatheGenerator<'_> {
    type Item = LatheRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.record();

        let rotation = self.setup.rotation(1);
        for lines in &mut self.lines {
            for line in lines.iter_mut() {
                *line = line.rotate(rotation);
            }
        }
        self.step += 1;

        Some(record)
    }
}

/// Number of angular steps in one revolution.
pub fn revolution_steps(angle_step: f32) -> Result<usize> {
    if !(angle_step > 0.0 && angle_step <= 360.0) {
        return Err(Error::setting("lathe.angle_step", "must be in (0, 360]"));
    }

    Ok(((360.0 / angle_step as f64).round() as usize).max(1))
}

/// Highest crossing of a vertical ray at `y` with any of the lines.
fn cast(lines: &[Line], y: f64) -> Option<f64> {
    (lines.iter())
        .filter_map(|x| x.hit(y))
        .max_by_key(|&z| OrderedFloat(z))
}

/// Generates the records for the angular steps in `steps`.
pub fn generate(setup: &LatheSetup, steps: Range<usize>) -> Vec<LatheRecord> {
    let mut generator = LatheGenerator::new(setup, steps.start);
    let records = generator.by_ref().take(steps.len()).collect::<Vec<_>>();

    if generator.fallbacks() > 0 {
        debug!(
            steps = ?steps,
            fallbacks = generator.fallbacks(),
            "rays missed the part, used stock floor"
        );
    }
    records
}

/// Turns per angle records into one open path per longitudinal position. Each
/// path ends with its first point one full negative rotation later.
pub fn records_to_paths(mut records: Vec<LatheRecord>, order: LatheOrder) -> Vec<Path> {
    records.sort_by_key(|x| x.step);
    let Some(first) = records.first() else {
        return Vec::new();
    };

    (0..first.samples.len())
        .map(|k| {
            let mut points = records.iter().map(|x| x.samples[k]).collect::<Vec<_>>();
            let mut angles = records.iter().map(|x| x.angle).collect::<Vec<_>>();
            points.push(points[0]);
            angles.push(angles[0] - 360.0);

            if order == LatheOrder::Alternate && k % 2 == 1 {
                points.reverse();
                angles.reverse();
            }

            Path {
                category: Category::Lathe,
                index: k,
                closed: false,
                points,
                angles: Some(angles),
            }
        })
        .collect()
}
