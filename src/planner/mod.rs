//! Grid and route planning: boustrophedon coverage over the boundary polygon
//! and A* point-to-point routes over the occupancy grid.

pub mod astar;
pub mod coverage;

use crate::types::Pose;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    /// Desired heading at the waypoint, when it matters (dock approach).
    pub heading: Option<f64>,
    pub tolerance: f64,
}

impl Waypoint {
    pub fn new(x: f64, y: f64, tolerance: f64) -> Self {
        Waypoint {
            x,
            y,
            heading: None,
            tolerance,
        }
    }
}

/// Ordered waypoint sequence with a monotonically increasing cursor.
/// Consumed linearly; a waypoint is popped when the pose is within its
/// tolerance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Path {
    waypoints: Vec<Waypoint>,
    cursor: usize,
}

impl Path {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Path {
            waypoints,
            cursor: 0,
        }
    }

    pub fn current(&self) -> Option<&Waypoint> {
        self.waypoints.get(self.cursor)
    }

    /// Advance the cursor past every waypoint the pose has reached. Returns
    /// true when at least one waypoint was consumed.
    pub fn advance(&mut self, pose: &Pose) -> bool {
        let mut advanced = false;
        while let Some(wp) = self.waypoints.get(self.cursor) {
            if pose.distance_to(wp.x, wp.y) <= wp.tolerance {
                self.cursor += 1;
                advanced = true;
            } else {
                break;
            }
        }
        advanced
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.waypoints.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Restore a persisted cursor, clamped to the path length.
    pub fn seek(&mut self, cursor: usize) {
        self.cursor = cursor.min(self.waypoints.len());
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    /// Path length from the cursor to the end [m].
    pub fn remaining_distance(&self, pose: &Pose) -> f64 {
        let mut total = 0.0;
        let mut prev: Option<(f64, f64)> = None;
        for wp in &self.waypoints[self.cursor.min(self.waypoints.len())..] {
            match prev {
                None => total += pose.distance_to(wp.x, wp.y),
                Some((px, py)) => {
                    total += ((wp.x - px).powi(2) + (wp.y - py).powi(2)).sqrt();
                }
            }
            prev = Some((wp.x, wp.y));
        }
        total
    }

    /// Total polyline length [m].
    pub fn total_length(&self) -> f64 {
        self.waypoints
            .windows(2)
            .map(|w| ((w[1].x - w[0].x).powi(2) + (w[1].y - w[0].y).powi(2)).sqrt())
            .sum()
    }
}

/// Insert intermediate waypoints so consecutive waypoints are never farther
/// apart than `max_step`.
pub fn densify(points: &[(f64, f64)], max_step: f64, tolerance: f64) -> Vec<Waypoint> {
    let mut out = Vec::new();
    if points.is_empty() {
        return out;
    }
    out.push(Waypoint::new(points[0].0, points[0].1, tolerance));
    for pair in points.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        let dist = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
        let segments = (dist / max_step).ceil().max(1.0) as usize;
        for s in 1..=segments {
            let t = s as f64 / segments as f64;
            out.push(Waypoint::new(
                x0 + (x1 - x0) * t,
                y0 + (y1 - y0) * t,
                tolerance,
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_at(x: f64, y: f64) -> Pose {
        let mut p = Pose::origin();
        p.x = x;
        p.y = y;
        p
    }

    #[test]
    fn test_cursor_advances_within_tolerance() {
        let mut path = Path::new(vec![
            Waypoint::new(0.0, 0.0, 0.2),
            Waypoint::new(1.0, 0.0, 0.2),
            Waypoint::new(2.0, 0.0, 0.2),
        ]);
        assert!(path.advance(&pose_at(0.05, 0.0)));
        assert_eq!(path.cursor(), 1);
        // Not yet at the second waypoint.
        assert!(!path.advance(&pose_at(0.5, 0.0)));
        assert_eq!(path.cursor(), 1);
        // Reaching the second also consumes the third if close enough.
        assert!(path.advance(&pose_at(1.05, 0.0)));
        assert_eq!(path.cursor(), 2);
    }

    #[test]
    fn test_densify_respects_max_step() {
        let wps = densify(&[(0.0, 0.0), (3.0, 0.0)], 0.5, 0.1);
        for pair in wps.windows(2) {
            let d = ((pair[1].x - pair[0].x).powi(2) + (pair[1].y - pair[0].y).powi(2)).sqrt();
            assert!(d <= 0.5 + 1e-9);
        }
        assert!((wps.last().unwrap().x - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_remaining_distance() {
        let path = Path::new(vec![
            Waypoint::new(1.0, 0.0, 0.1),
            Waypoint::new(2.0, 0.0, 0.1),
        ]);
        let d = path.remaining_distance(&pose_at(0.0, 0.0));
        assert!((d - 2.0).abs() < 1e-9);
    }
}
