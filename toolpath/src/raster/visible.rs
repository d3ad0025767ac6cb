use crate::slicer::Segment;

/// A segment seen from above: `u` runs along the row axis and `h` is the
/// height. Always ordered so `u0 <= u1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) struct Span {
    pub u0: f32,
    pub h0: f32,
    pub u1: f32,
    pub h1: f32,
}

impl Span {
    pub fn from_segment(segment: &Segment) -> Self {
        let (a, b) = (segment.a, segment.b);
        if a.x <= b.x {
            Self {
                u0: a.x,
                h0: a.y,
                u1: b.x,
                h1: b.y,
            }
        } else {
            Self {
                u0: b.x,
                h0: b.y,
                u1: a.x,
                h1: a.y,
            }
        }
    }

    fn width(&self) -> f32 {
        self.u1 - self.u0
    }

    /// Height at `u`, vertical spans report their top.
    pub fn height_at(&self, u: f32) -> f32 {
        if self.width() <= f32::EPSILON {
            return self.h0.max(self.h1);
        }

        let t = (u - self.u0) / self.width();
        self.h0 + t * (self.h1 - self.h0)
    }

    fn shares_endpoint(&self, other: &Span) -> bool {
        let ends = [(self.u0, self.h0), (self.u1, self.h1)];
        let other = [(other.u0, other.h0), (other.u1, other.h1)];
        ends.iter().any(|x| other.contains(x))
    }

    /// True if `self` covers the whole row range of `other` and is strictly
    /// above it at both of its ends, so `other` can never be the highest
    /// surface of any row.
    fn hides(&self, other: &Span) -> bool {
        self.width() > f32::EPSILON
            && self.u0 <= other.u0
            && self.u1 >= other.u1
            && !self.shares_endpoint(other)
            && self.height_at(other.u0) > other.h0
            && self.height_at(other.u1) > other.h1
    }
}

// This is quadratic in the segment count of a column. Columns of typical
// parts hold a few dozen segments, so the filter is cheaper than the
// rasterizing it saves.
/// Drops spans hidden beneath another span. Which spans survive depends only
/// on the set of spans, never on their order.
pub(super) fn visible_spans(spans: &[Span]) -> impl Iterator<Item = &Span> {
    spans.iter().enumerate().filter_map(move |(i, span)| {
        let hidden = (spans.iter().enumerate()).any(|(j, other)| i != j && other.hides(span));
        (!hidden).then_some(span)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(u0: f32, h0: f32, u1: f32, h1: f32) -> Span {
        Span { u0, h0, u1, h1 }
    }

    #[test]
    fn covered_span_is_hidden() {
        let spans = [span(0.0, 10.0, 10.0, 10.0), span(2.0, 1.0, 3.0, 9.0)];
        assert_eq!(visible_spans(&spans).count(), 1);
    }

    #[test]
    fn connected_spans_stay_visible() {
        // A peak: both flanks share the apex and neither hides the other.
        let spans = [span(0.0, 0.0, 5.0, 5.0), span(5.0, 5.0, 10.0, 0.0)];
        assert_eq!(visible_spans(&spans).count(), 2);
    }

    #[test]
    fn partial_overlap_stays_visible() {
        let spans = [span(0.0, 10.0, 4.0, 10.0), span(2.0, 1.0, 6.0, 1.0)];
        assert_eq!(visible_spans(&spans).count(), 2);
    }

    #[test]
    fn crossing_span_stays_visible() {
        let spans = [span(0.0, 5.0, 10.0, 5.0), span(2.0, 1.0, 4.0, 8.0)];
        assert_eq!(visible_spans(&spans).count(), 2);
    }
}
