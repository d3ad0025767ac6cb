//! Tool shapes and the discretized footprint used for gouge free contact
//! height queries.

use common::config::{ToolConfig, ToolShape};
use serde::{Deserialize, Serialize};

use crate::{raster::Heightfield, Error, Result};

/// Offset of one cell of a tool footprint. `dx` and `dy` are in cells, `dz`
/// is how far the cutting surface sits above the tip at that offset, stored
/// negated so it can be added straight onto a surface height.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSample {
    pub dx: i32,
    pub dy: i32,
    pub dz: f32,
}

/// A tool footprint sampled at a fixed resolution. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolProfile {
    samples: Vec<ProfileSample>,
    resolution: f32,
}

/// Height of the cutting surface above the tip at `distance` from the tool
/// axis, or `None` if that is outside the tool.
pub fn surface_height(tool: &ToolConfig, distance: f32) -> Option<f32> {
    let radius = tool.diameter / 2.0;
    if distance > radius {
        return None;
    }

    Some(match tool.shape {
        ToolShape::FlatEnd => 0.0,
        ToolShape::BallEnd => radius - (radius * radius - distance * distance).max(0.0).sqrt(),
        ToolShape::Taper {
            angle,
            tip_diameter,
        } => {
            let tip = tip_diameter / 2.0;
            let slope = (angle.to_radians() / 2.0).tan();
            if distance <= tip || slope <= 0.0 {
                0.0
            } else {
                ((distance - tip) / slope).min(tool.flute_length)
            }
        }
    })
}

impl ToolProfile {
    /// Samples a tool on a grid of cells of size `resolution`.
    pub fn new(tool: &ToolConfig, resolution: f32) -> Result<Self> {
        if !(tool.diameter > 0.0) {
            return Err(Error::setting("tool.diameter", "must be positive"));
        }
        if !(resolution > 0.0) {
            return Err(Error::setting("raster.resolution", "must be positive"));
        }
        if let ToolShape::Taper { angle, .. } = tool.shape {
            if !(angle > 0.0 && angle < 180.0) {
                return Err(Error::setting("tool.angle", "must be between 0 and 180"));
            }
        }

        let reach = (tool.diameter / 2.0 / resolution).floor() as i32;
        let mut samples = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let distance = (dx as f32).hypot(dy as f32) * resolution;
                if let Some(height) = surface_height(tool, distance) {
                    samples.push(ProfileSample {
                        dx,
                        dy,
                        dz: -height,
                    });
                }
            }
        }

        Ok(Self {
            samples,
            resolution,
        })
    }

    /// A profile from samples resolved elsewhere, for tools that are not one
    /// of the built in shapes.
    pub fn from_samples(samples: Vec<ProfileSample>, resolution: f32) -> Self {
        Self {
            samples,
            resolution,
        }
    }

    pub fn samples(&self) -> &[ProfileSample] {
        &self.samples
    }

    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    /// Largest offset of the footprint from the tool axis, in cells.
    pub fn reach(&self) -> i32 {
        (self.samples.iter())
            .map(|x| x.dx.abs().max(x.dy.abs()))
            .max()
            .unwrap_or(0)
    }

    /// Highest tip height at a cell such that the tool does not cut into the
    /// heightfield anywhere under its footprint. Cells outside the field read
    /// as its floor, so an empty neighbourhood returns the floor.
    pub fn contact_height(&self, field: &Heightfield, col: i64, row: i64) -> f32 {
        (self.samples.iter())
            .map(|x| field.get(col + x.dx as i64, row + x.dy as i64) + x.dz)
            .fold(field.grid().floor, f32::max)
    }
}
