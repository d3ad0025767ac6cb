use std::{
    io::{Read, Seek},
    sync::Arc,
};

use common::config::Axis;

use crate::{Error, Pos, Result};

/// Triangle soup stored as a flat list of floats, nine per triangle. Cloning
/// only bumps a reference count so the same buffer can be handed to every
/// worker of a job.
#[derive(Debug, Clone)]
pub struct Mesh {
    vertices: Arc<[f32]>,
}

/// Maps points between world space and the local frame of a sweep axis. In
/// the local frame the sweep axis is always `z`, which lets a single planar
/// slicer serve every direction. Both mappings are cyclic permutations so
/// handedness (and with it triangle winding) is preserved.
pub trait AxisExt {
    fn to_local(self, pos: Pos) -> Pos;
    fn to_world(self, pos: Pos) -> Pos;
}

impl AxisExt for Axis {
    fn to_local(self, pos: Pos) -> Pos {
        match self {
            Axis::X => Pos::new(pos.y, pos.z, pos.x),
            Axis::Y => Pos::new(pos.z, pos.x, pos.y),
            Axis::Z => pos,
        }
    }

    fn to_world(self, pos: Pos) -> Pos {
        match self {
            Axis::X => Pos::new(pos.z, pos.x, pos.y),
            Axis::Y => Pos::new(pos.y, pos.z, pos.x),
            Axis::Z => pos,
        }
    }
}

impl Mesh {
    /// Creates a mesh from a flat vertex buffer. Every three consecutive
    /// `[x, y, z]` triples make up one triangle.
    pub fn new(vertices: Vec<f32>) -> Result<Self> {
        if vertices.len() % 9 != 0 {
            return Err(Error::VertexCount(vertices.len()));
        }

        Ok(Self {
            vertices: vertices.into(),
        })
    }

    pub fn from_triangles(triangles: impl IntoIterator<Item = [Pos; 3]>) -> Self {
        let vertices = triangles
            .into_iter()
            .flat_map(|tri| tri.into_iter().flat_map(|v| [v.x, v.y, v.z]))
            .collect::<Vec<_>>();
        Self {
            vertices: vertices.into(),
        }
    }

    /// An axis aligned box with outward facing triangles.
    pub fn cuboid(min: Pos, max: Pos) -> Self {
        let corner = |i: usize| {
            Pos::new(
                if i & 1 == 0 { min.x } else { max.x },
                if i & 2 == 0 { min.y } else { max.y },
                if i & 4 == 0 { min.z } else { max.z },
            )
        };

        const FACES: [[usize; 4]; 6] = [
            [0, 2, 3, 1], // bottom
            [4, 5, 7, 6], // top
            [0, 1, 5, 4], // front
            [2, 6, 7, 3], // back
            [0, 4, 6, 2], // left
            [1, 3, 7, 5], // right
        ];

        Self::from_triangles(FACES.iter().flat_map(|&[a, b, c, d]| {
            [
                [corner(a), corner(b), corner(c)],
                [corner(a), corner(c), corner(d)],
            ]
        }))
    }

    pub fn raw(&self) -> &[f32] {
        &self.vertices
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 9
    }

    /// Gets a vertex in the local frame of `axis`.
    pub fn vertex(&self, index: usize, axis: Axis) -> Pos {
        let v = &self.vertices[index * 3..index * 3 + 3];
        axis.to_local(Pos::new(v[0], v[1], v[2]))
    }

    pub fn triangle(&self, index: usize, axis: Axis) -> [Pos; 3] {
        let first = index * 3;
        [
            self.vertex(first, axis),
            self.vertex(first + 1, axis),
            self.vertex(first + 2, axis),
        ]
    }

    pub fn triangles(&self, axis: Axis) -> impl Iterator<Item = [Pos; 3]> + '_ {
        (0..self.triangle_count()).map(move |idx| self.triangle(idx, axis))
    }

    /// Get the minimum and maximum of each world component of every vertex.
    /// These points define the bounding box of the model.
    pub fn bounds(&self) -> (Pos, Pos) {
        self.vertices.chunks_exact(3).fold(
            (Pos::repeat(f32::MAX), Pos::repeat(f32::MIN)),
            |(min, max), v| {
                let v = Pos::new(v[0], v[1], v[2]);
                (min.inf(&v), max.sup(&v))
            },
        )
    }
}

/// Loads an ascii or binary STL file into triangle soup.
pub fn load_stl<T: Read + Seek>(reader: &mut T) -> Result<Mesh> {
    let stl = stl_io::read_stl(reader)?;
    let vertex = |idx: usize| {
        let v = &stl.vertices[idx];
        Pos::new(v[0], v[1], v[2])
    };

    Ok(Mesh::from_triangles(stl.faces.iter().map(|face| {
        [
            vertex(face.vertices[0]),
            vertex(face.vertices[1]),
            vertex(face.vertices[2]),
        ]
    })))
}
