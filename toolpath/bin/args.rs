use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::config::{Axis, JobConfig, Mode};

#[derive(Debug, Parser)]
/// Generates machining toolpaths from a triangle mesh.
pub struct Args {
    /// Path to a binary or ascii .stl file.
    pub mesh: PathBuf,
    /// File to write the generated paths to, as JSON.
    pub output: PathBuf,

    #[arg(long)]
    /// TOML file with the full job configuration. Flags below override it.
    pub config: Option<PathBuf>,

    #[arg(long, value_parser = mode_value_parser)]
    /// Toolpath strategy, one of `layers`, `contour` or `lathe`.
    pub mode: Option<Mode>,
    #[arg(long, value_parser = axis_value_parser)]
    /// Sweep axis for layer slicing.
    pub axis: Option<Axis>,
    #[arg(long)]
    /// Distance between slicing planes in mm. Zero derives it from the part.
    pub step: Option<f32>,
    #[arg(long)]
    /// Heightfield cell size in mm. Zero derives it from the part.
    pub resolution: Option<f32>,
    #[arg(long)]
    /// Number of worker threads. Zero runs every job on the calling thread.
    pub workers: Option<usize>,
    #[arg(long)]
    /// Tool diameter in mm.
    pub tool_diameter: Option<f32>,
    #[arg(long)]
    /// Distance between raster lines as a fraction of the tool diameter.
    pub stepover: Option<f32>,
    #[arg(long)]
    /// Rotary increment in degrees for lathe jobs.
    pub angle_step: Option<f32>,
}

impl Args {
    pub fn job_config(&self) -> Result<JobConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read `{}`", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Invalid job config in `{}`", path.display()))?
            }
            None => JobConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(axis) = self.axis {
            config.slice.axis = axis;
        }
        if let Some(step) = self.step {
            config.slice.step = step;
        }
        if let Some(resolution) = self.resolution {
            config.raster.resolution = resolution;
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(diameter) = self.tool_diameter {
            config.tool.diameter = diameter;
        }
        if let Some(stepover) = self.stepover {
            config.contour.stepover = stepover;
        }
        if let Some(angle_step) = self.angle_step {
            config.lathe.angle_step = angle_step;
        }

        Ok(config)
    }
}

fn mode_value_parser(raw: &str) -> Result<Mode> {
    Ok(match raw.trim().to_ascii_lowercase().as_str() {
        "layers" => Mode::Layers,
        "contour" => Mode::Contour,
        "lathe" => Mode::Lathe,
        other => bail!("Unknown mode `{other}`"),
    })
}

fn axis_value_parser(raw: &str) -> Result<Axis> {
    Ok(match raw.trim().to_ascii_lowercase().as_str() {
        "x" => Axis::X,
        "y" => Axis::Y,
        "z" => Axis::Z,
        other => bail!("Unknown axis `{other}`"),
    })
}
