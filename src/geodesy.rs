//! Geodetic helpers: equirectangular local projection anchored at the mission
//! origin, Haversine range and initial bearing. All trigonometry in f64.

use crate::types::GeodeticPoint;

const EARTH_RADIUS: f64 = 6_371_000.0;

/// Local Cartesian frame anchored at a geodetic origin (the first accepted
/// GNSS fix). X is east, Y is north.
#[derive(Clone, Copy, Debug)]
pub struct LocalFrame {
    origin: GeodeticPoint,
    cos_lat: f64,
}

impl LocalFrame {
    pub fn new(origin: GeodeticPoint) -> Self {
        LocalFrame {
            origin,
            cos_lat: origin.latitude.to_radians().cos(),
        }
    }

    pub fn origin(&self) -> GeodeticPoint {
        self.origin
    }

    /// Equirectangular projection to local (x, y) meters.
    pub fn to_local(&self, p: GeodeticPoint) -> (f64, f64) {
        let d_lat = (p.latitude - self.origin.latitude).to_radians();
        let d_lon = (p.longitude - self.origin.longitude).to_radians();
        (EARTH_RADIUS * d_lon * self.cos_lat, EARTH_RADIUS * d_lat)
    }

    /// Inverse of [`LocalFrame::to_local`].
    pub fn to_geodetic(&self, x: f64, y: f64) -> GeodeticPoint {
        let d_lat = y / EARTH_RADIUS;
        let d_lon = x / (EARTH_RADIUS * self.cos_lat);
        GeodeticPoint {
            latitude: self.origin.latitude + d_lat.to_degrees(),
            longitude: self.origin.longitude + d_lon.to_degrees(),
        }
    }
}

/// Great-circle distance in meters.
pub fn haversine_distance(a: GeodeticPoint, b: GeodeticPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos()
            * b.latitude.to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS * c
}

/// Initial bearing from `a` to `b` in radians, clockwise from north.
pub fn initial_bearing(a: GeodeticPoint, b: GeodeticPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let numerator = d_lon.sin() * lat_b.cos();
    let denominator = lat_a.cos() * lat_b.sin() - lat_a.sin() * lat_b.cos() * d_lon.cos();
    numerator.atan2(denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_local_round_trip_within_1km() {
        let frame = LocalFrame::new(GeodeticPoint::new(41.015, 28.979));
        // Grid of points within a 1 km square of the anchor.
        for dx in [-500.0, -100.0, 0.0, 250.0, 500.0] {
            for dy in [-500.0, -100.0, 0.0, 250.0, 500.0] {
                let p = frame.to_geodetic(dx, dy);
                let (x, y) = frame.to_local(p);
                assert_relative_eq!(x, dx, epsilon = 1e-6);
                assert_relative_eq!(y, dy, epsilon = 1e-6);
                // Geodetic round-trip within 1e-6 degrees.
                let q = frame.to_geodetic(x, y);
                assert!((q.latitude - p.latitude).abs() < 1e-6);
                assert!((q.longitude - p.longitude).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let a = GeodeticPoint::new(40.0, 29.0);
        let b = GeodeticPoint::new(41.0, 29.0);
        let d = haversine_distance(a, b);
        // One degree of latitude is ~111.2 km.
        assert!((d - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn test_haversine_matches_local_frame_near_anchor() {
        let frame = LocalFrame::new(GeodeticPoint::new(41.0, 29.0));
        let p = frame.to_geodetic(300.0, 400.0);
        let d = haversine_distance(frame.origin(), p);
        assert_relative_eq!(d, 500.0, epsilon = 0.5);
    }

    #[test]
    fn test_initial_bearing_cardinal() {
        let a = GeodeticPoint::new(41.0, 29.0);
        let north = GeodeticPoint::new(41.01, 29.0);
        let east = GeodeticPoint::new(41.0, 29.01);
        assert!(initial_bearing(a, north).abs() < 1e-9);
        assert_relative_eq!(
            initial_bearing(a, east),
            std::f64::consts::FRAC_PI_2,
            epsilon = 1e-3
        );
    }
}
