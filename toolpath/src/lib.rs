//! Turns triangle meshes into ordered tool paths. Covers planar cross
//! sections, heightfield contouring for three axis machining and rotary
//! (lathe) surfacing, all sharing a worker pool defined in [`dispatch`].

use nalgebra::{Vector2, Vector3};

pub mod contour;
pub mod dispatch;
pub mod error;
pub mod lathe;
pub mod mesh;
pub mod path;
pub mod pipeline;
pub mod raster;
pub mod slicer;
pub mod tool;

pub use error::{Error, Result, Stage};

pub type Pos = Vector3<f32>;
pub type Pos2 = Vector2<f32>;
