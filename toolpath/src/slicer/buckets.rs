use crate::{slicer::SliceRange, Pos};

/// Acceleration structure for slicing a band of planes. By splitting the band
/// into buckets along the sweep axis and adding references to all the
/// triangles that overlap each bucket, slicing a plane only has to visit the
/// triangles of a single bucket instead of every triangle in the mesh.
pub struct PlaneBuckets {
    start: f32,
    bucket_height: f32,

    buckets: Vec<Vec<usize>>,
}

impl PlaneBuckets {
    /// Buckets every triangle that overlaps `range`. The buckets cover the
    /// planes `first..=last` of the band. Triangles wholly outside the band
    /// are never referenced.
    pub fn new(
        triangles: impl Iterator<Item = [Pos; 3]>,
        range: &SliceRange,
        (first, last): (f32, f32),
        bucket_count: usize,
    ) -> Self {
        let bucket_count = bucket_count.max(1);
        let extent = last - first;
        let bucket_height = if extent > 0.0 {
            extent / bucket_count as f32
        } else {
            0.0
        };

        let mut this = Self {
            start: first,
            bucket_height,
            buckets: vec![Vec::new(); bucket_count],
        };

        for (idx, [a, b, c]) in triangles.enumerate() {
            let min = a.z.min(b.z).min(c.z);
            let max = a.z.max(b.z).max(c.z);
            if max < range.min || min >= range.max || max < first || min > last {
                continue;
            }

            let (lo, hi) = (this.bucket(min), this.bucket(max));
            for bucket in &mut this.buckets[lo..=hi] {
                bucket.push(idx);
            }
        }

        this
    }

    /// Triangles that may cross the plane at `height`, in ascending index
    /// order.
    pub fn candidates(&self, height: f32) -> &[usize] {
        &self.buckets[self.bucket(height)]
    }

    pub fn referenced(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    fn bucket(&self, height: f32) -> usize {
        if self.bucket_height <= 0.0 {
            return 0;
        }

        let idx = ((height - self.start) / self.bucket_height).floor();
        (idx.max(0.0) as usize).min(self.buckets.len() - 1)
    }
}
