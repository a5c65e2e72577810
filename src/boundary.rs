//! Boundary safety monitor: periodic check that the estimated pose stays
//! inside the work-area polygon with the configured buffer. Escalates from a
//! warning band to a hard safety event on deviation.

use crate::config::BoundarySafetyConfig;
use crate::errors::PlanError;
use crate::types::Pose;
use geo::{Contains, EuclideanDistance, LineString, Point, Polygon};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoundaryStatus {
    Inside,
    /// Close to the buffered boundary; slow down.
    Warning { margin_m: f64 },
    /// Outside the legal area beyond the tolerated deviation; brake.
    Deviation { distance_m: f64 },
}

pub struct BoundaryMonitor {
    polygon: Polygon<f64>,
    buffer_distance: f64,
    warning_distance: f64,
    max_deviation: f64,
    period: f64,
    last_check: f64,
}

impl BoundaryMonitor {
    /// `vertices` is the boundary polygon in local-frame meters.
    pub fn new(
        vertices: &[(f64, f64)],
        config: &BoundarySafetyConfig,
    ) -> Result<BoundaryMonitor, PlanError> {
        if vertices.len() < 3 {
            return Err(PlanError::EmptyPolygon);
        }
        let exterior: LineString<f64> = vertices.iter().copied().collect();
        Ok(BoundaryMonitor {
            polygon: Polygon::new(exterior, vec![]),
            buffer_distance: config.buffer_distance,
            warning_distance: config.warning_distance,
            max_deviation: config.max_deviation,
            period: config.check_frequency.max(1e-3),
            last_check: f64::NEG_INFINITY,
        })
    }

    /// Rate-limited check; returns None between check periods.
    pub fn check(&mut self, pose: &Pose, now: f64) -> Option<BoundaryStatus> {
        if now - self.last_check < self.period {
            return None;
        }
        self.last_check = now;
        Some(self.classify(pose))
    }

    pub fn classify(&self, pose: &Pose) -> BoundaryStatus {
        let point = Point::new(pose.x, pose.y);
        let boundary_distance = point.euclidean_distance(self.polygon.exterior());

        if self.polygon.contains(&point) {
            let margin = boundary_distance - self.buffer_distance;
            if margin < -self.max_deviation {
                BoundaryStatus::Deviation {
                    distance_m: -margin,
                }
            } else if margin < self.warning_distance {
                BoundaryStatus::Warning { margin_m: margin }
            } else {
                BoundaryStatus::Inside
            }
        } else {
            // Outside the polygon entirely: deviation is the buffer plus the
            // overshoot.
            BoundaryStatus::Deviation {
                distance_m: boundary_distance + self.buffer_distance,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BoundaryMonitor {
        // 20 x 20 square, 0.3 m buffer, 0.5 m warning, 0.5 m max deviation.
        BoundaryMonitor::new(
            &[(0.0, 0.0), (20.0, 0.0), (20.0, 20.0), (0.0, 20.0)],
            &BoundarySafetyConfig::default(),
        )
        .unwrap()
    }

    fn pose_at(x: f64, y: f64) -> Pose {
        let mut p = Pose::origin();
        p.x = x;
        p.y = y;
        p
    }

    #[test]
    fn test_center_is_inside() {
        let m = monitor();
        assert_eq!(m.classify(&pose_at(10.0, 10.0)), BoundaryStatus::Inside);
    }

    #[test]
    fn test_near_edge_warns() {
        let m = monitor();
        match m.classify(&pose_at(0.5, 10.0)) {
            BoundaryStatus::Warning { margin_m } => assert!(margin_m < 0.5),
            other => panic!("expected warning, got {other:?}"),
        }
    }

    #[test]
    fn test_outside_is_deviation() {
        let m = monitor();
        match m.classify(&pose_at(-1.0, 10.0)) {
            BoundaryStatus::Deviation { distance_m } => assert!(distance_m > 1.0),
            other => panic!("expected deviation, got {other:?}"),
        }
    }

    #[test]
    fn test_check_is_rate_limited() {
        let mut m = monitor();
        assert!(m.check(&pose_at(10.0, 10.0), 0.0).is_some());
        assert!(m.check(&pose_at(10.0, 10.0), 0.2).is_none());
        assert!(m.check(&pose_at(10.0, 10.0), 1.1).is_some());
    }

    #[test]
    fn test_needs_polygon() {
        assert!(matches!(
            BoundaryMonitor::new(&[(0.0, 0.0)], &BoundarySafetyConfig::default()),
            Err(PlanError::EmptyPolygon)
        ));
    }
}
