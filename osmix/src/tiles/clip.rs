//! Clipping in geographic space before tile projection.

use geo::line_intersection::{line_intersection, LineIntersection};
use geo::{coord, Contains, Coord, Line, LineString, Rect};

const LEFT: i8 = 1;
const RIGHT: i8 = 2;
const BOTTOM: i8 = 4;
const TOP: i8 = 8;

fn side_code(c: &Coord, rect: &Rect) -> i8 {
    let mut code = 0;
    if c.x < rect.min().x {
        code |= LEFT;
    } else if c.x > rect.max().x {
        code |= RIGHT;
    }
    if c.y < rect.min().y {
        code |= BOTTOM;
    } else if c.y > rect.max().y {
        code |= TOP;
    }
    code
}

fn edge_intersection(a: &Coord, b: &Coord, edge: i8, rect: &Rect) -> Coord {
    if edge & TOP != 0 {
        let x = a.x + (b.x - a.x) * (rect.max().y - a.y) / (b.y - a.y);
        return coord! { x: x, y: rect.max().y };
    }
    if edge & BOTTOM != 0 {
        let x = a.x + (b.x - a.x) * (rect.min().y - a.y) / (b.y - a.y);
        return coord! { x: x, y: rect.min().y };
    }
    if edge & RIGHT != 0 {
        let y = a.y + (b.y - a.y) * (rect.max().x - a.x) / (b.x - a.x);
        return coord! { x: rect.max().x, y: y };
    }
    let y = a.y + (b.y - a.y) * (rect.min().x - a.x) / (b.x - a.x);
    coord! { x: rect.min().x, y: y }
}

/// Sutherland–Hodgman ring clip against an axis-aligned rect. `None` when
/// nothing of the ring survives.
pub fn clip_ring(ring: &LineString, rect: &Rect) -> Option<LineString> {
    let mut points = ring.0.clone();
    let mut edge = LEFT;
    while edge <= TOP && !points.is_empty() {
        let mut survivors = Vec::with_capacity(points.len() + 4);
        let mut prev = *points.last().unwrap();
        let mut prev_inside = side_code(&prev, rect) & edge == 0;
        for p in points {
            let inside = side_code(&p, rect) & edge == 0;
            if inside != prev_inside {
                survivors.push(edge_intersection(&prev, &p, edge, rect));
            }
            if inside {
                survivors.push(p);
            }
            prev = p;
            prev_inside = inside;
        }
        points = survivors;
        edge <<= 1;
    }

    (points.len() >= 3).then(|| LineString(points))
}

/// Splits a polyline into the runs that touch `rect`; coordinates are kept
/// as-is, so geometry inside the clip margin survives untouched.
pub fn clip_line(line: &LineString, rect: &Rect) -> Vec<LineString> {
    let mut parts = Vec::new();
    let mut run: Vec<Coord> = Vec::new();
    for (index, &c) in line.0.iter().enumerate() {
        if index > 0 {
            let segment = Line::new(line.0[index - 1], c);
            let touches = rect.contains(&segment.start)
                || rect.contains(&segment.end)
                || crosses_boundary(rect, &segment);
            if !touches {
                if run.len() > 1 {
                    parts.push(LineString(std::mem::take(&mut run)));
                } else {
                    run.clear();
                }
            }
        }
        run.push(c);
    }
    if run.len() > 1 {
        parts.push(LineString(run));
    }
    parts
}

fn crosses_boundary(rect: &Rect, segment: &Line) -> bool {
    rect.to_lines().iter().any(|edge| {
        matches!(
            line_intersection(*edge, *segment),
            Some(LineIntersection::SinglePoint { .. })
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::bbox_rect;

    #[test]
    fn test_ring_fully_inside_is_unchanged() {
        let rect = bbox_rect(0.0, 0.0, 10.0, 10.0);
        let ring = LineString(vec![
            coord! { x: 1.0, y: 1.0 },
            coord! { x: 4.0, y: 1.0 },
            coord! { x: 4.0, y: 4.0 },
            coord! { x: 1.0, y: 1.0 },
        ]);
        let clipped = clip_ring(&ring, &rect).unwrap();
        assert_eq!(clipped.0.len(), ring.0.len());
    }

    #[test]
    fn test_ring_clipped_to_rect() {
        let rect = bbox_rect(0.0, 0.0, 10.0, 10.0);
        // square poking out to the left
        let ring = LineString(vec![
            coord! { x: -5.0, y: 2.0 },
            coord! { x: 5.0, y: 2.0 },
            coord! { x: 5.0, y: 8.0 },
            coord! { x: -5.0, y: 8.0 },
        ]);
        let clipped = clip_ring(&ring, &rect).unwrap();
        assert!(clipped.0.iter().all(|c| c.x >= 0.0));
        assert!(clipped.0.iter().any(|c| c.x == 0.0));
    }

    #[test]
    fn test_ring_outside_is_dropped() {
        let rect = bbox_rect(0.0, 0.0, 1.0, 1.0);
        let ring = LineString(vec![
            coord! { x: 5.0, y: 5.0 },
            coord! { x: 6.0, y: 5.0 },
            coord! { x: 6.0, y: 6.0 },
        ]);
        assert!(clip_ring(&ring, &rect).is_none());
    }

    #[test]
    fn test_line_split_into_touching_runs() {
        let rect = bbox_rect(0.0, 0.0, 10.0, 10.0);
        // inside, far outside detour, inside again
        let line = LineString(vec![
            coord! { x: 1.0, y: 5.0 },
            coord! { x: 2.0, y: 5.0 },
            coord! { x: 50.0, y: 5.0 },
            coord! { x: 50.0, y: 50.0 },
            coord! { x: 5.0, y: 50.0 },
            coord! { x: 5.0, y: 5.0 },
            coord! { x: 6.0, y: 5.0 },
        ]);
        let parts = clip_line(&line, &rect);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0[0].x, 1.0);
    }
}
