//! Planar cross sections of triangle soup. Planes are swept along the `z`
//! axis of a local frame (see [`crate::mesh::AxisExt`]) so the same code
//! serves every sweep direction.

use common::config::{Axis, SliceConfig};
use ordered_float::OrderedFloat;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{mesh::Mesh, Pos};

mod buckets;
mod loops;
pub use buckets::PlaneBuckets;
pub use loops::Loop;

/// Number of buckets a shard splits its band into, at most one per plane.
const SHARD_BUCKETS: usize = 100;

/// A line segment where a triangle crosses a sweep plane, in the local frame
/// of the sweep axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub a: Pos,
    pub b: Pos,
}

/// All the segments where the mesh crosses one sweep plane. Segments are not
/// ordered into loops, see [`Slice::loops`] for that.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub z: f32,
    pub index: usize,
    pub segments: Vec<Segment>,
}

/// Position of a sweep plane along with its global index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub index: usize,
    pub z: f32,
}

/// A contiguous band `[min, max)` of the sweep axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SliceRange {
    pub index: usize,
    pub min: f32,
    pub max: f32,
}

/// An independently sliceable band along with the planes inside it.
#[derive(Clone, Debug, PartialEq)]
pub struct Shard {
    pub range: SliceRange,
    pub planes: Vec<Plane>,
}

impl Segment {
    pub fn length(&self) -> f32 {
        (self.b - self.a).magnitude()
    }
}

impl Slice {
    /// Joins the segments of this slice into loops, dropping vertices that
    /// lie on a straight line between their neighbours.
    pub fn loops(&self, tolerance: f32) -> Vec<Loop> {
        loops::join_segments(&self.segments, tolerance)
    }
}

/// Planes from `min + step` up to `max`. A plane that lands on `max` would
/// only touch the top faces of the part, so it is lowered by `top_offset`,
/// but never to or below the plane before it.
pub fn stepped_planes(min: f32, max: f32, config: &SliceConfig) -> Vec<Plane> {
    let count = ((max - min) / config.step + 1e-4).floor().max(0.0) as usize;
    (1..=count)
        .map(|i| {
            let mut z = min + i as f32 * config.step;
            if i == count && (max - z).abs() <= config.epsilon.max(config.step * 1e-4) {
                let below = min + (i - 1) as f32 * config.step;
                z = (max - config.top_offset).max((below + max) / 2.0);
            }
            Plane { index: i - 1, z }
        })
        .filter(|plane| plane.z > min)
        .collect()
}

/// `count` planes placed in the middle of cells of size `step`, the first one
/// centered on `start`.
pub fn centered_planes(start: f32, step: f32, count: usize) -> Vec<Plane> {
    (0..count)
        .map(|index| Plane {
            index,
            z: start + index as f32 * step,
        })
        .collect()
}

/// Splits the planes into contiguous shards. The shard count grows with the
/// triangle count and is capped by `config.max_shards`. The bands of the
/// returned shards tile the sweep axis without gaps.
pub fn partition(planes: &[Plane], triangles: usize, config: &SliceConfig) -> Vec<Shard> {
    if planes.is_empty() {
        return Vec::new();
    }

    let wanted = triangles.div_ceil(config.triangles_per_shard.max(1));
    let count = wanted.clamp(1, config.max_shards.max(1)).min(planes.len());
    let per_shard = planes.len().div_ceil(count);

    let chunks = planes.chunks(per_shard).collect::<Vec<_>>();
    (chunks.iter().enumerate())
        .map(|(index, chunk)| {
            let min = if index == 0 { f32::NEG_INFINITY } else { chunk[0].z };
            let max = chunks.get(index + 1).map_or(f32::INFINITY, |next| next[0].z);
            Shard {
                range: SliceRange { index, min, max },
                planes: chunk.to_vec(),
            }
        })
        .collect()
}

/// Slices one shard, returning a [`Slice`] for every plane that crosses the
/// mesh.
pub fn slice_shard(mesh: &Mesh, axis: Axis, shard: &Shard, epsilon: f32) -> Vec<Slice> {
    let (Some(first), Some(last)) = (shard.planes.first(), shard.planes.last()) else {
        return Vec::new();
    };

    let buckets = PlaneBuckets::new(
        mesh.triangles(axis),
        &shard.range,
        (first.z, last.z),
        shard.planes.len().min(SHARD_BUCKETS),
    );

    let mut misses = 0;
    let slices = (shard.planes.iter())
        .filter(|plane| shard.range.min <= plane.z && plane.z < shard.range.max)
        .filter_map(|plane| {
            let segments = (buckets.candidates(plane.z).iter())
                .filter_map(|&idx| {
                    let segment = intersect_triangle(&mesh.triangle(idx, axis), plane.z, epsilon);
                    misses += segment.is_none() as usize;
                    segment
                })
                .collect::<Vec<_>>();

            (!segments.is_empty()).then_some(Slice {
                z: plane.z,
                index: plane.index,
                segments,
            })
        })
        .collect::<Vec<_>>();

    trace!(
        shard = shard.range.index,
        slices = slices.len(),
        misses,
        "sliced shard"
    );
    slices
}

/// Slices every shard on the rayon pool and returns the slices ordered by
/// plane position.
pub fn slice_shards(mesh: &Mesh, axis: Axis, shards: &[Shard], epsilon: f32) -> Vec<Slice> {
    let mut slices = shards
        .par_iter()
        .flat_map_iter(|shard| slice_shard(mesh, axis, shard, epsilon))
        .collect::<Vec<_>>();
    sort_slices(&mut slices);
    slices
}

/// Shards may finish in any order, this restores plane order.
pub fn sort_slices(slices: &mut [Slice]) {
    slices.sort_by_key(|slice| (OrderedFloat(slice.z), slice.index));
}

/// Intersects a plane with every triangle of the mesh with linear time
/// complexity. Only useful as a reference, [`slice_shard`] visits far fewer
/// triangles.
pub fn intersect_plane_linear(mesh: &Mesh, axis: Axis, height: f32, epsilon: f32) -> Vec<Segment> {
    mesh.triangles(axis)
        .filter_map(|tri| intersect_triangle(&tri, height, epsilon))
        .collect()
}

/// Intersects a plane with a triangle. Returns `None` if the triangle does
/// not cross the plane or if the crossing is degenerate.
pub fn intersect_triangle([v0, v1, v2]: &[Pos; 3], height: f32, epsilon: f32) -> Option<Segment> {
    // Zero area triangles have no meaningful crossing.
    if (v1 - v0).cross(&(v2 - v0)).magnitude() <= epsilon * epsilon {
        return None;
    }

    // By subtracting the height from each vertex z coord, we can now check if
    // each edge is crossing the plane if one end is above and one is below. A
    // vertex on the plane counts as below, so an edge lying in the plane is
    // only produced by the triangle above it and never twice.
    let (a, b, c) = (v0.z - height, v1.z - height, v2.z - height);
    let (a_pos, b_pos, c_pos) = (a > 0.0, b > 0.0, c > 0.0);

    let mut out = [Pos::zeros(); 2];
    let mut n = 0;

    let mut push_intersection = |a: f32, b: f32, v0: &Pos, v1: &Pos| {
        let t = a / (a - b);
        let mut intersection = v0 + t * (v1 - v0);
        intersection.z = height;
        out[n] = intersection;
        n += 1;
    };

    (a_pos ^ b_pos).then(|| push_intersection(a, b, v0, v1));
    (b_pos ^ c_pos).then(|| push_intersection(b, c, v1, v2));
    (c_pos ^ a_pos).then(|| push_intersection(c, a, v2, v0));

    let segment = Segment {
        a: out[0],
        b: out[1],
    };
    (n == 2 && segment.length() > epsilon).then_some(segment)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn unit_cube() -> Mesh {
        Mesh::cuboid(Pos::zeros(), Pos::repeat(1.0))
    }

    fn config(step: f32) -> SliceConfig {
        SliceConfig {
            step,
            ..SliceConfig::default()
        }
    }

    #[test]
    fn unit_cube_two_slices() {
        let mesh = unit_cube();
        let config = config(0.5);
        let planes = stepped_planes(0.0, 1.0, &config);
        let shards = partition(&planes, mesh.triangle_count(), &config);
        let slices = slice_shards(&mesh, Axis::Z, &shards, config.epsilon);

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].z, 0.5);
        assert!((slices[1].z - 0.999).abs() < 1e-6);

        for slice in &slices {
            let loops = slice.loops(1e-4);
            assert_eq!(loops.len(), 1);
            assert!(loops[0].closed);
            assert_eq!(loops[0].points.len(), 4);
        }
    }

    #[test]
    fn lowered_top_plane_stays_above_its_neighbour() {
        let config = SliceConfig {
            step: 0.0005,
            top_offset: 0.001,
            ..SliceConfig::default()
        };
        let planes = stepped_planes(0.0, 0.002, &config);

        assert_eq!(planes.len(), 4);
        assert!(planes.windows(2).all(|x| x[0].z < x[1].z));
        assert!(planes[3].z < 0.002);

        let mesh = Mesh::cuboid(Pos::zeros(), Pos::repeat(0.002));
        let shards = partition(&planes, mesh.triangle_count(), &config);
        let slices = slice_shards(&mesh, Axis::Z, &shards, 1e-7);
        assert_eq!(slices.len(), 4);
    }

    #[test]
    fn plane_through_edge_yields_one_segment() {
        // Two triangles sharing the edge (0,0,0)-(1,0,0), one rising above
        // the plane and one falling below it.
        let mesh = Mesh::from_triangles([
            [Pos::new(0.0, 0.0, 0.0), Pos::new(1.0, 0.0, 0.0), Pos::new(0.5, 1.0, 1.0)],
            [Pos::new(1.0, 0.0, 0.0), Pos::new(0.0, 0.0, 0.0), Pos::new(0.5, -1.0, -1.0)],
        ]);
        let segments = intersect_plane_linear(&mesh, Axis::Z, 0.0, 1e-5);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flat_and_degenerate_triangles_are_skipped() {
        let flat = [Pos::new(0.0, 0.0, 1.0), Pos::new(1.0, 0.0, 1.0), Pos::new(0.0, 1.0, 1.0)];
        let sliver = [Pos::new(0.0, 0.0, 0.0), Pos::new(1.0, 0.0, 1.0), Pos::new(2.0, 0.0, 2.0)];
        assert_eq!(intersect_triangle(&flat, 1.0, 1e-5), None);
        assert_eq!(intersect_triangle(&sliver, 0.5, 1e-5), None);
    }

    #[test]
    fn slicing_other_axes() {
        let mesh = Mesh::cuboid(Pos::zeros(), Pos::new(4.0, 2.0, 1.0));
        let config = config(1.0);
        for axis in [Axis::X, Axis::Y] {
            let (min, max) = mesh.bounds();
            let planes = stepped_planes(min[axis.index()], max[axis.index()], &config);
            let shards = partition(&planes, mesh.triangle_count(), &config);
            let slices = slice_shards(&mesh, axis, &shards, config.epsilon);
            assert_eq!(slices.len(), planes.len());
            for slice in slices {
                assert!(slice.segments.iter().all(|s| s.a.z == slice.z && s.b.z == slice.z));
            }
        }
    }

    #[test]
    fn shards_tile_without_gaps() {
        let planes = centered_planes(0.05, 0.1, 95);
        let config = SliceConfig {
            max_shards: 25,
            triangles_per_shard: 10,
            ..SliceConfig::default()
        };
        let shards = partition(&planes, 1_000, &config);

        assert_eq!(shards.len(), 24);
        assert_eq!(shards[0].range.min, f32::NEG_INFINITY);
        assert_eq!(shards.last().unwrap().range.max, f32::INFINITY);
        for pair in shards.windows(2) {
            assert_eq!(pair[0].range.max, pair[1].range.min);
        }
        let total = shards.iter().map(|x| x.planes.len()).sum::<usize>();
        assert_eq!(total, planes.len());
    }

    fn sphere(subdivisions: usize) -> Mesh {
        let point = |i: usize, j: usize| {
            let theta = std::f32::consts::PI * i as f32 / subdivisions as f32;
            let phi = std::f32::consts::TAU * j as f32 / subdivisions as f32;
            Pos::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos())
        };

        Mesh::from_triangles((0..subdivisions).flat_map(|i| {
            (0..subdivisions).flat_map(move |j| {
                [
                    [point(i, j), point(i + 1, j), point(i + 1, j + 1)],
                    [point(i, j), point(i + 1, j + 1), point(i, j + 1)],
                ]
            })
        }))
    }

    proptest! {
        #[test]
        fn sharding_does_not_change_slices(shards in 1_usize..30, step in 0.01_f32..0.3) {
            let mesh = sphere(24);
            let config = SliceConfig { step, ..SliceConfig::default() };
            let planes = stepped_planes(-1.0, 1.0, &config);

            let single = slice_shards(&mesh, Axis::Z, &partition(&planes, 1, &config), config.epsilon);
            let sharded = SliceConfig { max_shards: shards, triangles_per_shard: 1, ..config };
            let many = slice_shards(&mesh, Axis::Z, &partition(&planes, mesh.triangle_count(), &sharded), config.epsilon);

            prop_assert_eq!(single, many);
        }

        #[test]
        fn bucketed_matches_linear(height in -0.99_f32..0.99) {
            let mesh = sphere(16);
            let plane = Plane { index: 0, z: height };
            let shard = Shard {
                range: SliceRange { index: 0, min: f32::NEG_INFINITY, max: f32::INFINITY },
                planes: vec![plane],
            };

            let bucketed = slice_shard(&mesh, Axis::Z, &shard, 1e-5);
            let linear = intersect_plane_linear(&mesh, Axis::Z, height, 1e-5);
            prop_assert_eq!(bucketed.first().map(|x| x.segments.clone()).unwrap_or_default(), linear);
        }
    }
}
