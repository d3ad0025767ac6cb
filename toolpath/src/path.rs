//! Output records handed to an exporter, and the builder that decides which
//! samples of a raster line become path points.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::Pos;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Layer,
    ContourX,
    ContourY,
    Lathe,
}

/// One tool path pass. `index` is the layer, raster line or longitudinal
/// sample the path came from. Rotary paths carry one angle in degrees per
/// point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub category: Category,
    pub index: usize,
    pub closed: bool,
    pub points: Vec<Pos>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub angles: Option<Vec<f32>>,
}

/// Which samples survive when building a path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Flatness {
    /// Height changes below this are flat.
    pub tolerance: f32,
    /// Drop flat stretches entirely instead of bridging them.
    pub curves_only: bool,
    /// Longest horizontal run between two points of a flat stretch. Zero
    /// leaves flat stretches as a single move.
    pub bridge: f32,
}

/// Collects samples of a raster line into paths. Flat runs are coalesced:
/// the last flat sample is held back as a latent point and only committed
/// once the height changes, the bridge distance is exceeded or the path ends.
pub struct PathBuilder {
    policy: Flatness,
    points: Vec<Pos>,
    latent: Option<Pos>,
    previous: Option<Pos>,
    finished: Vec<Vec<Pos>>,
}

impl Path {
    pub fn open(category: Category, index: usize, points: Vec<Pos>) -> Self {
        Self {
            category,
            index,
            closed: false,
            points,
            angles: None,
        }
    }

    /// Ordering used to put paths from out of order shards back in place.
    pub fn sort_key(&self) -> (Category, usize, OrderedFloat<f32>, OrderedFloat<f32>) {
        let first = self.points.first().copied().unwrap_or_else(Pos::zeros);
        (
            self.category,
            self.index,
            OrderedFloat(first.x),
            OrderedFloat(first.y),
        )
    }
}

pub fn sort_paths(paths: &mut [Path]) {
    paths.sort_by_key(Path::sort_key);
}

impl PathBuilder {
    pub fn new(policy: Flatness) -> Self {
        Self {
            policy,
            points: Vec::new(),
            latent: None,
            previous: None,
            finished: Vec::new(),
        }
    }

    pub fn push(&mut self, point: Pos) {
        if self.policy.curves_only {
            self.push_curve(point);
        } else {
            self.push_coalesced(point);
        }
        self.previous = Some(point);
    }

    fn push_coalesced(&mut self, point: Pos) {
        let Some(&last) = self.points.last() else {
            self.points.push(point);
            return;
        };

        if (point.z - last.z).abs() < self.policy.tolerance {
            let far = self.policy.bridge > 0.0 && (point.xy() - last.xy()).magnitude() > self.policy.bridge;
            if let (true, Some(latent)) = (far, self.latent) {
                self.points.push(latent);
            }
            self.latent = Some(point);
            return;
        }

        if let Some(latent) = self.latent.take() {
            self.points.push(latent);
        }
        self.points.push(point);
    }

    fn push_curve(&mut self, point: Pos) {
        let Some(previous) = self.previous else {
            return;
        };

        if (point.z - previous.z).abs() < self.policy.tolerance {
            self.end();
            return;
        }

        if self.points.is_empty() {
            self.points.push(previous);
        }
        self.points.push(point);
    }

    /// Ends the current path, for example when the line leaves the clip
    /// region. Paths with fewer than two points are dropped.
    pub fn end(&mut self) {
        if let Some(latent) = self.latent.take() {
            self.points.push(latent);
        }

        let points = std::mem::take(&mut self.points);
        if points.len() >= 2 {
            self.finished.push(points);
        }
    }

    /// Ends the line. The next sample starts from scratch.
    pub fn break_line(&mut self) {
        self.end();
        self.previous = None;
    }

    pub fn finish(mut self) -> Vec<Vec<Pos>> {
        self.end();
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(curves_only: bool, bridge: f32) -> Flatness {
        Flatness {
            tolerance: 0.01,
            curves_only,
            bridge,
        }
    }

    fn build(policy: Flatness, heights: &[f32]) -> Vec<Vec<Pos>> {
        let mut builder = PathBuilder::new(policy);
        for (x, &z) in heights.iter().enumerate() {
            builder.push(Pos::new(x as f32, 0.0, z));
        }
        builder.finish()
    }

    #[test]
    fn flat_run_is_entry_and_exit() {
        let paths = build(policy(false, 0.0), &[1.0; 50]);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], vec![Pos::new(0.0, 0.0, 1.0), Pos::new(49.0, 0.0, 1.0)]);
    }

    #[test]
    fn step_keeps_both_corners() {
        let paths = build(policy(false, 0.0), &[0.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
        let xs = paths[0].iter().map(|p| p.x).collect::<Vec<_>>();
        assert_eq!(xs, vec![0.0, 2.0, 3.0, 5.0]);
    }

    #[test]
    fn bridge_limits_flat_moves() {
        let paths = build(policy(false, 4.0), &[1.0; 13]);
        let xs = paths[0].iter().map(|p| p.x).collect::<Vec<_>>();
        assert_eq!(xs, vec![0.0, 4.0, 8.0, 12.0]);
    }

    #[test]
    fn curves_only_skips_plateaus() {
        let heights = [0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 3.0, 3.0, 2.0, 1.0];
        let paths = build(policy(true, 0.0), &heights);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].iter().map(|p| p.x).collect::<Vec<_>>(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(paths[1].iter().map(|p| p.x).collect::<Vec<_>>(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn single_points_are_dropped() {
        let mut builder = PathBuilder::new(policy(false, 0.0));
        builder.push(Pos::new(0.0, 0.0, 1.0));
        builder.break_line();
        builder.push(Pos::new(5.0, 0.0, 1.0));
        builder.push(Pos::new(6.0, 0.0, 1.0));
        assert_eq!(builder.finish().len(), 1);
    }
}
