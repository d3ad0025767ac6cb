use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::{slicer::Segment, Pos};

/// A chain of joined segments. Closed loops do not repeat their first point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    pub points: Vec<Pos>,
    pub closed: bool,
}

// Nearest endpoint search makes this n², fine for the segment counts of a
// single slice.
pub(super) fn join_segments(segments: &[Segment], tolerance: f32) -> Vec<Loop> {
    let mut remaining = segments.to_vec();
    let mut loops = Vec::new();

    while let Some(start) = remaining.pop() {
        let mut points = vec![start.a, start.b];
        let mut closed = false;
        let mut reversed = false;

        loop {
            let last = points[points.len() - 1];
            if points.len() > 2 && (last - points[0]).magnitude() <= tolerance {
                points.pop();
                closed = true;
                break;
            }

            let nearest = (remaining.iter().enumerate())
                .map(|(idx, segment)| {
                    let (a, b) = ((segment.a - last).magnitude(), (segment.b - last).magnitude());
                    if a <= b {
                        (idx, segment.b, a)
                    } else {
                        (idx, segment.a, b)
                    }
                })
                .min_by_key(|&(_, _, dist)| OrderedFloat(dist));

            match nearest {
                Some((idx, next, dist)) if dist <= tolerance => {
                    remaining.swap_remove(idx);
                    points.push(next);
                }
                // An open chain may have started in the middle, so walk the
                // other direction once before giving up.
                _ if !reversed => {
                    points.reverse();
                    reversed = true;
                }
                _ => break,
            }
        }

        remove_collinear(&mut points, closed, tolerance);
        loops.push(Loop { points, closed });
    }

    loops
}

fn remove_collinear(points: &mut Vec<Pos>, closed: bool, tolerance: f32) {
    let end_skip = !closed as usize;
    let mut i = end_skip;
    while points.len() > 2 && i + end_skip < points.len() {
        let n = points.len();
        let (prev, cur, next) = (points[(i + n - 1) % n], points[i], points[(i + 1) % n]);

        let base = (next - prev).xy();
        let length = base.magnitude();
        let offset = (cur - prev).xy().perp(&base).abs();

        if length > 0.0 && offset / length <= tolerance {
            points.remove(i);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(a: (f32, f32), b: (f32, f32)) -> Segment {
        Segment {
            a: Pos::new(a.0, a.1, 0.0),
            b: Pos::new(b.0, b.1, 0.0),
        }
    }

    #[test]
    fn joins_shuffled_square() {
        let segments = [
            segment((1.0, 0.0), (2.0, 0.0)),
            segment((2.0, 2.0), (0.0, 2.0)),
            segment((0.0, 0.0), (1.0, 0.0)),
            segment((2.0, 0.0), (2.0, 2.0)),
            segment((0.0, 2.0), (0.0, 0.0)),
        ];

        let loops = join_segments(&segments, 1e-4);
        assert_eq!(loops.len(), 1);
        assert!(loops[0].closed);
        assert_eq!(loops[0].points.len(), 4);
    }

    #[test]
    fn open_chain_started_in_the_middle() {
        let segments = [
            segment((0.0, 0.0), (1.0, 0.0)),
            segment((2.0, 1.0), (3.0, 1.0)),
            segment((1.0, 0.0), (2.0, 1.0)),
        ];

        let loops = join_segments(&segments, 1e-4);
        assert_eq!(loops.len(), 1);
        assert!(!loops[0].closed);
        assert_eq!(loops[0].points.len(), 4);
    }

    #[test]
    fn separate_loops_stay_separate() {
        let square = |o: f32| {
            [
                segment((o, 0.0), (o + 1.0, 0.0)),
                segment((o + 1.0, 0.0), (o + 1.0, 1.0)),
                segment((o + 1.0, 1.0), (o, 1.0)),
                segment((o, 1.0), (o, 0.0)),
            ]
        };
        let segments = [square(0.0), square(5.0)].concat();

        let loops = join_segments(&segments, 1e-4);
        assert_eq!(loops.len(), 2);
        assert!(loops.iter().all(|x| x.closed && x.points.len() == 4));
    }
}
