//! Raster line contouring over a finished heightfield. Every sample goes
//! through the tool profile so the emitted paths never gouge the part.

use std::{ops::Range, sync::Arc};

use common::{
    config::{ContourConfig, Polygon, Tab, ToolConfig},
    misc::{contains, signed_area},
};

use crate::{
    path::{Category, Flatness, Path, PathBuilder},
    raster::Heightfield,
    tool::ToolProfile,
    Pos, Pos2,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RasterDirection {
    /// Lines run along X, one per selected row.
    X,
    /// Lines run along Y, one per selected column.
    Y,
}

/// Read only state shared by every contouring unit of a job.
pub struct ContourSetup {
    pub field: Arc<Heightfield>,
    pub profile: Arc<ToolProfile>,
    pub clip: Vec<Polygon>,
    pub tabs: Vec<Tab>,
    pub policy: Flatness,
    /// Cells between neighbouring raster lines.
    pub line_step: usize,
}

impl RasterDirection {
    pub fn category(self) -> Category {
        match self {
            RasterDirection::X => Category::ContourX,
            RasterDirection::Y => Category::ContourY,
        }
    }
}

impl ContourSetup {
    /// Clip polygons without area are dropped here, so a job whose only
    /// silhouette is degenerate produces no paths.
    pub fn new(
        field: Arc<Heightfield>,
        profile: Arc<ToolProfile>,
        clip: Vec<Polygon>,
        config: &ContourConfig,
        tool: &ToolConfig,
    ) -> Self {
        let resolution = field.grid().resolution;
        let line_step = ((tool.diameter * config.stepover / resolution).round() as usize).max(1);

        Self {
            field,
            profile,
            clip: (clip.into_iter())
                .filter(|x| signed_area(x).abs() > f32::EPSILON)
                .collect(),
            tabs: config.tabs.clone(),
            policy: Flatness {
                tolerance: config.tolerance,
                curves_only: config.curves_only,
                bridge: config.bridge,
            },
            line_step,
        }
    }

    /// Number of raster lines in `direction`.
    pub fn line_count(&self, direction: RasterDirection) -> usize {
        let grid = self.field.grid();
        let cells = match direction {
            RasterDirection::X => grid.rows,
            RasterDirection::Y => grid.columns,
        };
        cells.div_ceil(self.line_step)
    }

    /// Walks the raster lines `lines` and returns their paths in line order.
    pub fn extract_lines(&self, direction: RasterDirection, lines: Range<usize>) -> Vec<Path> {
        let grid = *self.field.grid();
        let mut paths = Vec::new();

        for line in lines {
            let fixed = line * self.line_step;
            let (cells, bound) = match direction {
                RasterDirection::X => (grid.columns, grid.rows),
                RasterDirection::Y => (grid.rows, grid.columns),
            };
            if fixed >= bound {
                break;
            }

            let mut builder = PathBuilder::new(self.policy);
            for i in 0..cells {
                let (col, row) = match direction {
                    RasterDirection::X => (i, fixed),
                    RasterDirection::Y => (fixed, i),
                };

                let center = grid.cell_center(col, row);
                if !self.clip.iter().any(|x| contains(x, center)) {
                    builder.break_line();
                    continue;
                }

                let contact = self.profile.contact_height(&self.field, col as i64, row as i64);
                let height = self.protected_height(center, contact);
                builder.push(Pos::new(center.x, center.y, height));
            }

            paths.extend(
                (builder.finish().into_iter()).map(|points| Path::open(direction.category(), line, points)),
            );
        }

        paths
    }

    /// Raises a height to the highest tab covering `center`.
    fn protected_height(&self, center: Pos2, height: f32) -> f32 {
        (self.tabs.iter())
            .filter(|tab| tab.height > height && contains(&tab.outline, center))
            .fold(height, |acc, tab| acc.max(tab.height))
    }
}

/// Axis aligned rectangle as a clip polygon.
pub fn rectangle(min: Pos2, max: Pos2) -> Polygon {
    vec![
        min,
        Pos2::new(max.x, min.y),
        max,
        Pos2::new(min.x, max.y),
    ]
}
