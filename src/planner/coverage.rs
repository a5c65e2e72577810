//! Boustrophedon coverage generation. Strips run along the polygon's major
//! axis (PCA over the boundary vertices), spaced at brush width minus
//! overlap, clipped to the polygon interior and joined with short connector
//! segments.

use crate::errors::PlanError;
use crate::planner::{densify, Path, Waypoint};

#[derive(Clone, Copy, Debug)]
pub struct CoverageParams {
    pub brush_width: f64,
    pub overlap: f64,
    pub max_waypoint_step: f64,
    pub waypoint_tolerance: f64,
}

#[derive(Clone, Debug)]
pub struct CoveragePlan {
    pub path: Path,
    pub strip_count: usize,
}

/// Principal axis angle of a point set, from the 2x2 covariance eigenvector.
pub fn major_axis_angle(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mut cxx = 0.0;
    let mut cxy = 0.0;
    let mut cyy = 0.0;
    for &(x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cxx += dx * dx;
        cxy += dx * dy;
        cyy += dy * dy;
    }
    0.5 * (2.0 * cxy).atan2(cxx - cyy)
}

/// Generate the coverage path for a polygon given in local-frame meters.
pub fn plan_coverage(
    polygon: &[(f64, f64)],
    params: &CoverageParams,
) -> Result<CoveragePlan, PlanError> {
    if polygon.len() < 3 {
        return Err(PlanError::EmptyPolygon);
    }
    let pitch = params.brush_width - params.overlap;
    debug_assert!(pitch > 0.0);

    // Rotate into the strip frame: strips run along +x'.
    let phi = major_axis_angle(polygon);
    let (sin_phi, cos_phi) = phi.sin_cos();
    let rotated: Vec<(f64, f64)> = polygon
        .iter()
        .map(|&(x, y)| (x * cos_phi + y * sin_phi, -x * sin_phi + y * cos_phi))
        .collect();

    let min_y = rotated.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = rotated.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let rows = ((max_y - min_y) / pitch).ceil() as usize;

    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut strip_count = 0usize;
    let mut leftward = false;

    for row in 0..rows {
        let y = min_y + pitch * (row as f64 + 0.5);
        let mut intervals = scanline_intervals(&rotated, y);
        if intervals.is_empty() {
            continue;
        }
        strip_count += intervals.len();
        if leftward {
            intervals.reverse();
        }
        for (a, b) in intervals {
            let (start, end) = if leftward { (b, a) } else { (a, b) };
            points.push((start, y));
            points.push((end, y));
        }
        leftward = !leftward;
    }

    if points.is_empty() {
        return Err(PlanError::EmptyPolygon);
    }

    // Rotate back to the local frame and densify.
    let world: Vec<(f64, f64)> = points
        .iter()
        .map(|&(x, y)| (x * cos_phi - y * sin_phi, x * sin_phi + y * cos_phi))
        .collect();
    let waypoints: Vec<Waypoint> = densify(
        &world,
        params.max_waypoint_step,
        params.waypoint_tolerance,
    );

    Ok(CoveragePlan {
        path: Path::new(waypoints),
        strip_count,
    })
}

/// Interior x-intervals of a horizontal scanline through the polygon,
/// even-odd paired and sorted.
fn scanline_intervals(polygon: &[(f64, f64)], y: f64) -> Vec<(f64, f64)> {
    let mut crossings = Vec::new();
    let n = polygon.len();
    for i in 0..n {
        let (x0, y0) = polygon[i];
        let (x1, y1) = polygon[(i + 1) % n];
        if (y0 > y) != (y1 > y) {
            crossings.push(x0 + (x1 - x0) * (y - y0) / (y1 - y0));
        }
    }
    crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    crossings
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .filter(|(a, b)| b - a > 1e-9)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rectangle(w: f64, h: f64) -> Vec<(f64, f64)> {
        vec![(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)]
    }

    fn params() -> CoverageParams {
        CoverageParams {
            brush_width: 0.25,
            overlap: 0.1,
            max_waypoint_step: 0.5,
            waypoint_tolerance: 0.15,
        }
    }

    #[test]
    fn test_major_axis_of_wide_rectangle() {
        let angle = major_axis_angle(&rectangle(10.0, 6.0));
        // Long side along x.
        assert!(angle.abs() < 1e-6 || (angle.abs() - std::f64::consts::PI).abs() < 1e-6);
    }

    #[test]
    fn test_rectangle_strip_count_and_length() {
        // 10 m x 6 m, pitch 0.15: ceil(6 / 0.15) = 40 strips, ~400 m of
        // strip distance plus connectors.
        let plan = plan_coverage(&rectangle(10.0, 6.0), &params()).unwrap();
        assert_eq!(plan.strip_count, 40);
        let length = plan.path.total_length();
        assert!(length > 399.0 && length < 412.0, "length {length}");
    }

    #[test]
    fn test_waypoint_spacing_bounded() {
        let plan = plan_coverage(&rectangle(10.0, 6.0), &params()).unwrap();
        for pair in plan.path.waypoints().windows(2) {
            let d = ((pair[1].x - pair[0].x).powi(2) + (pair[1].y - pair[0].y).powi(2)).sqrt();
            assert!(d <= 0.5 + 1e-9);
        }
    }

    #[test]
    fn test_interior_fully_covered() {
        // Every interior sample is within brush_width/2 of the path.
        let plan = plan_coverage(&rectangle(10.0, 6.0), &params()).unwrap();
        let wps = plan.path.waypoints();
        let mut worst: f64 = 0.0;
        let mut y = 0.2;
        while y < 5.8 {
            let mut x = 0.2;
            while x < 9.8 {
                let mut best = f64::INFINITY;
                for pair in wps.windows(2) {
                    best = best.min(point_segment_distance(
                        (x, y),
                        (pair[0].x, pair[0].y),
                        (pair[1].x, pair[1].y),
                    ));
                }
                worst = worst.max(best);
                x += 0.4;
            }
            y += 0.4;
        }
        assert!(worst <= 0.125 + 1e-6, "worst gap {worst}");
    }

    #[test]
    fn test_rotated_rectangle_strips_follow_major_axis() {
        // Same rectangle rotated 30 degrees: strip count is unchanged.
        let angle: f64 = 30.0_f64.to_radians();
        let poly: Vec<(f64, f64)> = rectangle(10.0, 6.0)
            .into_iter()
            .map(|(x, y)| {
                (
                    x * angle.cos() - y * angle.sin(),
                    x * angle.sin() + y * angle.cos(),
                )
            })
            .collect();
        let plan = plan_coverage(&poly, &params()).unwrap();
        assert_eq!(plan.strip_count, 40);
    }

    #[test]
    fn test_l_shape_produces_split_strips() {
        // Concave polygon: some scanlines cross four edges.
        let poly = vec![
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 2.0),
            (6.0, 2.0),
            (6.0, 6.0),
            (4.0, 6.0),
            (4.0, 2.0),
            (0.0, 2.0),
        ];
        let plan = plan_coverage(&poly, &params()).unwrap();
        assert!(plan.strip_count > 13);
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        assert!(matches!(
            plan_coverage(&[(0.0, 0.0), (1.0, 1.0)], &params()),
            Err(PlanError::EmptyPolygon)
        ));
    }

    fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
        let (px, py) = p;
        let (ax, ay) = a;
        let (bx, by) = b;
        let (dx, dy) = (bx - ax, by - ay);
        let len2 = dx * dx + dy * dy;
        let t = if len2 > 0.0 {
            (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (cx, cy) = (ax + t * dx, ay + t * dy);
        ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
    }
}
