//! Heightfields built from cross sections. The mesh is sliced along X with
//! one plane through the middle of every grid column, then each slice is
//! rasterized into its column keeping the highest surface per row.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    slicer::{centered_planes, Plane, Slice},
    Pos2,
};

mod visible;
use visible::{visible_spans, Span};

/// Placement of a heightfield over the XY plane. Cell `(col, row)` is
/// centered on `origin + (col, row) * resolution`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub origin: Pos2,
    pub resolution: f32,
    pub columns: usize,
    pub rows: usize,
    pub floor: f32,
}

/// Inclusive rectangle of cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub min: (usize, usize),
    pub max: (usize, usize),
}

/// Dense grid of the highest reachable height per cell, stored column major.
/// Cells start at the floor and are only ever raised.
#[derive(Clone, Debug, PartialEq)]
pub struct Heightfield {
    grid: GridSpec,
    data: Vec<f32>,
}

/// The rasterized columns `first_column..first_column + columns` of a
/// heightfield, produced by one shard and merged by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct HeightStrip {
    pub first_column: usize,
    pub data: Vec<f32>,
    pub touched: Option<Rect>,
}

impl GridSpec {
    /// Smallest grid with cells of size `resolution` covering `min..max`.
    pub fn covering(min: Pos2, max: Pos2, resolution: f32, floor: f32) -> Self {
        let cells = |extent: f32| ((extent / resolution).ceil() as usize).max(1);
        Self {
            origin: min + Pos2::repeat(resolution / 2.0),
            resolution,
            columns: cells(max.x - min.x),
            rows: cells(max.y - min.y),
            floor,
        }
    }

    pub fn cells(&self) -> u64 {
        (self.columns as u64).saturating_mul(self.rows as u64)
    }

    pub fn cell_center(&self, col: usize, row: usize) -> Pos2 {
        self.origin + Pos2::new(col as f32, row as f32) * self.resolution
    }

    /// Corners of the area covered by the grid.
    pub fn extent(&self) -> (Pos2, Pos2) {
        let half = Pos2::repeat(self.resolution / 2.0);
        let min = self.origin - half;
        let size = Pos2::new(self.columns as f32, self.rows as f32) * self.resolution;
        (min, min + size)
    }

    /// One X sweep plane through the center of every column.
    pub fn column_planes(&self) -> Vec<Plane> {
        centered_planes(self.origin.x, self.resolution, self.columns)
    }

    /// Rows whose centers lie within `u0..=u1` along Y.
    fn row_span(&self, u0: f32, u1: f32) -> Option<(usize, usize)> {
        let first = ((u0 - self.origin.y) / self.resolution).ceil().max(0.0);
        let last = ((u1 - self.origin.y) / self.resolution).floor();
        if last < 0.0 || first > last || first as usize >= self.rows {
            return None;
        }

        Some((first as usize, (last as usize).min(self.rows - 1)))
    }
}

impl Rect {
    fn point(col: usize, row: usize) -> Self {
        Self {
            min: (col, row),
            max: (col, row),
        }
    }

    pub fn union(self, other: Rect) -> Self {
        Self {
            min: (self.min.0.min(other.min.0), self.min.1.min(other.min.1)),
            max: (self.max.0.max(other.max.0), self.max.1.max(other.max.1)),
        }
    }
}

fn union(a: Option<Rect>, b: Option<Rect>) -> Option<Rect> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union(b)),
        (a, b) => a.or(b),
    }
}

impl Heightfield {
    pub fn new(grid: GridSpec) -> Self {
        Self {
            data: vec![grid.floor; grid.columns * grid.rows],
            grid,
        }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Height of a cell, or the floor for anything outside the grid.
    pub fn get(&self, col: i64, row: i64) -> f32 {
        if col < 0 || row < 0 || col as usize >= self.grid.columns || row as usize >= self.grid.rows {
            return self.grid.floor;
        }

        self.data[col as usize * self.grid.rows + row as usize]
    }

    /// Raises a cell to `height` if that is higher than what it holds.
    pub fn raise(&mut self, col: usize, row: usize, height: f32) {
        let cell = &mut self.data[col * self.grid.rows + row];
        *cell = cell.max(height);
    }

    pub fn column(&self, col: usize) -> &[f32] {
        &self.data[col * self.grid.rows..(col + 1) * self.grid.rows]
    }

    /// Rasterizes slices whose index is a column of this grid, returning the
    /// rectangle of cells covered.
    pub fn rasterize(&mut self, slices: &[Slice]) -> Option<Rect> {
        let rows = self.grid.rows;
        let mut touched = None;
        for slice in slices.iter().filter(|x| x.index < self.grid.columns) {
            let column = &mut self.data[slice.index * rows..(slice.index + 1) * rows];
            let covered = rasterize_column(&self.grid, slice, column)
                .map(|(first, last)| Rect::point(slice.index, first).union(Rect::point(slice.index, last)));
            touched = union(touched, covered);
        }
        touched
    }

    /// Merges a strip, keeping the higher value of every cell.
    pub fn merge(&mut self, strip: &HeightStrip) {
        let start = strip.first_column * self.grid.rows;
        let end = (start + strip.data.len()).min(self.data.len());
        for (cell, &height) in self.data[start..end].iter_mut().zip(&strip.data) {
            *cell = cell.max(height);
        }
    }
}

impl HeightStrip {
    /// Rasterizes the slices belonging to `columns` into a new strip.
    pub fn rasterize(grid: &GridSpec, columns: Range<usize>, slices: &[Slice]) -> Self {
        let columns = columns.start..columns.end.min(grid.columns);
        let mut data = vec![grid.floor; columns.len() * grid.rows];
        let mut touched = None;

        for slice in slices.iter().filter(|x| columns.contains(&x.index)) {
            let offset = (slice.index - columns.start) * grid.rows;
            let column = &mut data[offset..offset + grid.rows];
            let covered = rasterize_column(grid, slice, column)
                .map(|(first, last)| Rect::point(slice.index, first).union(Rect::point(slice.index, last)));
            touched = union(touched, covered);
        }

        Self {
            first_column: columns.start,
            data,
            touched,
        }
    }
}

/// Raises every row of `column` covered by a visible segment of the slice.
/// Returns the first and last covered row.
fn rasterize_column(grid: &GridSpec, slice: &Slice, column: &mut [f32]) -> Option<(usize, usize)> {
    let spans = slice.segments.iter().map(Span::from_segment).collect::<Vec<_>>();
    let mut covered: Option<(usize, usize)> = None;

    for span in visible_spans(&spans) {
        let Some((first, last)) = grid.row_span(span.u0, span.u1) else {
            continue;
        };

        for (row, cell) in column.iter_mut().enumerate().take(last + 1).skip(first) {
            let u = grid.origin.y + row as f32 * grid.resolution;
            let height = span.height_at(u);
            if height > *cell {
                *cell = height;
            }
        }

        covered = Some(match covered {
            Some((a, b)) => (a.min(first), b.max(last)),
            None => (first, last),
        });
    }

    covered
}
