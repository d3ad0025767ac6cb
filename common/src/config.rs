use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// A closed 2D outline in world XY, without a repeated closing vertex.
pub type Polygon = Vec<Vector2<f32>>;

/// Everything needed to turn one mesh into an ordered set of tool paths.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub mode: Mode,
    pub pool: PoolConfig,
    pub slice: SliceConfig,
    pub raster: RasterConfig,
    pub tool: ToolConfig,
    pub contour: ContourConfig,
    pub lathe: LatheConfig,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Planar cross sections joined into closed loops. Serves deposition, vat
    /// photopolymerization and sheet cutting exports.
    #[default]
    Layers,
    /// Three axis surface contouring over a heightfield.
    Contour,
    /// Rotary (4th axis) surfacing around the X axis.
    Lathe,
}

/// The logical axis a slicer sweeps its planes along.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
    #[default]
    Z,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads. Zero runs every unit inline on the
    /// coordinator.
    pub workers: usize,
    /// Meshes with fewer triangles than this are processed inline even when
    /// workers are available.
    pub inline_threshold: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SliceConfig {
    pub axis: Axis,
    /// Distance between sweep planes in mm. Zero derives it from
    /// `target_planes`.
    pub step: f32,
    /// Number of planes the sweep axis extent is split into when the step is
    /// derived.
    pub target_planes: usize,
    /// Upper bound on sweep planes, checked before any work starts.
    pub max_planes: u64,
    /// A plane landing exactly on the top of the part is lowered by this much
    /// so it still cuts the side walls.
    pub top_offset: f32,
    /// Segments shorter than this are dropped as degenerate.
    pub epsilon: f32,
    pub max_shards: usize,
    /// Rough number of triangles a single shard is expected to handle.
    pub triangles_per_shard: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RasterConfig {
    /// Heightfield cell size in mm. Zero derives it from `target_samples`.
    pub resolution: f32,
    /// Number of cells the footprint should be split into when the
    /// resolution is derived.
    pub target_samples: u64,
    /// Upper bound on heightfield cells, checked before any work starts.
    pub max_cells: u64,
    /// Height of every cell not covered by the part.
    pub floor: f32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ToolShape {
    FlatEnd,
    BallEnd,
    Taper {
        /// Included angle of the cone in degrees.
        angle: f32,
        tip_diameter: f32,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ToolConfig {
    pub shape: ToolShape,
    pub diameter: f32,
    pub flute_length: f32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContourDirection {
    #[default]
    X,
    Y,
    Both,
}

/// Region held at a minimum height so the part stays attached to the stock.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Tab {
    pub outline: Polygon,
    pub height: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ContourConfig {
    pub direction: ContourDirection,
    /// Fraction of the tool diameter between neighbouring raster lines.
    pub stepover: f32,
    /// Height changes smaller than this are treated as flat.
    pub tolerance: f32,
    /// Only emit the parts of a raster line where the surface is changing.
    pub curves_only: bool,
    /// Longest distance a flat run may cover before a point is forced out.
    /// Zero disables bridging.
    pub bridge: f32,
    /// Clip outlines. `None` uses the footprint of the mesh.
    pub silhouettes: Option<Vec<Polygon>>,
    pub tabs: Vec<Tab>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LatheOrder {
    #[default]
    Sequential,
    /// Every other longitudinal pass runs backwards.
    Alternate,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LatheConfig {
    /// Angular increment in degrees.
    pub angle_step: f32,
    /// Height used when a ray misses every cross section.
    pub stock_floor: f32,
    pub order: LatheOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |x| x.get());
        Self {
            workers: cores.saturating_sub(1),
            inline_threshold: 2_000,
        }
    }
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            axis: Axis::Z,
            step: 0.2,
            target_planes: 200,
            max_planes: 1_000_000,
            top_offset: 0.001,
            epsilon: 1e-5,
            max_shards: 25,
            triangles_per_shard: 20_000,
        }
    }
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            target_samples: 1_000_000,
            max_cells: 64_000_000,
            floor: 0.0,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            shape: ToolShape::BallEnd,
            diameter: 3.175,
            flute_length: 15.0,
        }
    }
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            direction: ContourDirection::X,
            stepover: 0.25,
            tolerance: 0.01,
            curves_only: false,
            bridge: 0.0,
            silhouettes: None,
            tabs: Vec::new(),
        }
    }
}

impl Default for LatheConfig {
    fn default() -> Self {
        Self {
            angle_step: 1.0,
            stock_floor: 0.0,
            order: LatheOrder::Sequential,
        }
    }
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index of this axis into an `[x, y, z]` triple.
    pub const fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: JobConfig = toml::from_str(
            r#"
            mode = "lathe"

            [lathe]
            angle_step = 90.0

            [tool]
            shape = { shape = "taper", angle = 60.0, tip_diameter = 0.2 }
            diameter = 6.0
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Lathe);
        assert_eq!(config.lathe.angle_step, 90.0);
        assert_eq!(config.lathe.order, LatheOrder::Sequential);
        assert_eq!(config.slice, SliceConfig::default());
        assert!(matches!(config.tool.shape, ToolShape::Taper { .. }));
        assert_eq!(config.tool.flute_length, 15.0);
    }

    #[test]
    fn silhouettes_round_trip() {
        let mut config = JobConfig::default();
        config.contour.silhouettes = Some(vec![vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(1.0, 1.0),
        ]]);

        let text = toml::to_string(&config).unwrap();
        let back: JobConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
