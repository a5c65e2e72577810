//! Fiducial engine: per-frame marker detection and relative-pose estimation
//! with temporal smoothing. Consumes monochrome frames from the camera port
//! and publishes [`FiducialDetection`] batches.

pub mod detector;

use crate::config::AprilTagConfig;
use crate::types::{CameraFrame, FiducialDetection};
use detector::{QuadDetector, TagFamily};
use std::collections::HashMap;
use std::collections::VecDeque;

pub struct FiducialEngine {
    detector: QuadDetector,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    distortion: [f64; 5],
    tag_size: f64,
    camera_yaw_offset: f64,
    min_confidence: f64,
    max_detection_distance: f64,
    min_perimeter_rate: f64,
    max_perimeter_rate: f64,
    tracking_history: usize,
    stale_timeout: f64,
    history: HashMap<u32, VecDeque<FiducialDetection>>,
}

impl FiducialEngine {
    pub fn new(config: &AprilTagConfig, camera_yaw_offset_rad: f64) -> Self {
        let k = &config.camera_matrix;
        FiducialEngine {
            detector: QuadDetector::new(TagFamily::tag16h5()),
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
            distortion: config.distortion_coeffs,
            tag_size: config.tag_size,
            camera_yaw_offset: camera_yaw_offset_rad,
            min_confidence: config.detection.min_confidence,
            max_detection_distance: config.detection.max_detection_distance,
            min_perimeter_rate: config.detection.min_marker_perimeter_rate,
            max_perimeter_rate: config.detection.max_marker_perimeter_rate,
            tracking_history: config.detection.tracking_history.max(1),
            stale_timeout: config.detection.obstacle_timeout,
            history: HashMap::new(),
        }
    }

    /// Process one frame. Returns the detections for this frame, temporally
    /// smoothed where the history allows it; may be empty.
    pub fn process_frame(&mut self, frame: &CameraFrame) -> Vec<FiducialDetection> {
        self.evict_stale(frame.timestamp);

        let frame_dim = frame.width.max(frame.height) as f64;
        let mut seen = Vec::new();

        for quad in self.detector.detect(frame) {
            let rate = quad.perimeter_px / frame_dim;
            if rate < self.min_perimeter_rate || rate > self.max_perimeter_rate {
                continue;
            }
            if quad.confidence < self.min_confidence {
                continue;
            }
            let Some(raw) = self.estimate_pose(&quad, frame.timestamp) else {
                continue;
            };
            if raw.range_m > self.max_detection_distance {
                continue;
            }
            let entry = self
                .history
                .entry(raw.marker_id)
                .or_insert_with(VecDeque::new);
            entry.push_back(raw);
            while entry.len() > self.tracking_history {
                entry.pop_front();
            }
            seen.push(raw.marker_id);
        }

        seen.into_iter()
            .filter_map(|id| self.smoothed(id))
            .collect()
    }

    /// Median-smoothed report for a marker: when at least two recent
    /// detections agree within tolerance the median is reported, otherwise
    /// the latest raw sample flagged unsmoothed.
    fn smoothed(&self, marker_id: u32) -> Option<FiducialDetection> {
        let ring = self.history.get(&marker_id)?;
        let latest = *ring.back()?;

        let agreeing: Vec<&FiducialDetection> = ring
            .iter()
            .filter(|d| {
                (d.range_m - latest.range_m).abs() < 0.3
                    && (d.bearing_rad - latest.bearing_rad).abs() < 0.15
            })
            .collect();

        if agreeing.len() >= 2 {
            Some(FiducialDetection {
                marker_id,
                range_m: median(agreeing.iter().map(|d| d.range_m)),
                bearing_rad: median(agreeing.iter().map(|d| d.bearing_rad)),
                yaw_offset_rad: median(agreeing.iter().map(|d| d.yaw_offset_rad)),
                confidence: latest.confidence,
                frame_timestamp: latest.frame_timestamp,
                smoothed: true,
            })
        } else {
            Some(FiducialDetection {
                smoothed: false,
                ..latest
            })
        }
    }

    fn evict_stale(&mut self, now: f64) {
        for ring in self.history.values_mut() {
            while let Some(front) = ring.front() {
                if now - front.frame_timestamp > self.stale_timeout {
                    ring.pop_front();
                } else {
                    break;
                }
            }
        }
        self.history.retain(|_, ring| !ring.is_empty());
    }

    /// Relative pose from a decoded quad using the known marker side length.
    fn estimate_pose(
        &self,
        quad: &detector::QuadDetection,
        timestamp: f64,
    ) -> Option<FiducialDetection> {
        // Undistorted normalized coordinates for each corner.
        let norm: Vec<(f64, f64)> = quad
            .corners
            .iter()
            .map(|&(u, v)| self.undistort_normalized(u, v))
            .collect();

        // Split into left/right pairs by normalized x.
        let mut by_x = norm.clone();
        by_x.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let h_left = (by_x[0].1 - by_x[1].1).abs();
        let h_right = (by_x[2].1 - by_x[3].1).abs();
        if h_left <= 1e-9 || h_right <= 1e-9 {
            return None;
        }

        // Normalized height h = s / Z for a pinhole camera.
        let h_mean = 0.5 * (h_left + h_right);
        let z = self.tag_size / h_mean;

        let center_x = norm.iter().map(|p| p.0).sum::<f64>() / 4.0;
        // Positive bearing is counter-clockwise (marker to the left).
        let bearing = -center_x.atan() + self.camera_yaw_offset;
        let range = z / bearing.cos().max(0.2);

        // Perspective asymmetry of the edge heights gives the marker yaw:
        // sin(yaw) = (2 Z / s) * (h_r - h_l) / (h_r + h_l).
        let asym = (h_right - h_left) / (h_left + h_right);
        let yaw_offset = (2.0 * z / self.tag_size * asym).clamp(-1.0, 1.0).asin();

        Some(FiducialDetection {
            marker_id: quad.id,
            range_m: range,
            bearing_rad: bearing,
            yaw_offset_rad: yaw_offset,
            confidence: quad.confidence,
            frame_timestamp: timestamp,
            smoothed: false,
        })
    }

    /// Pixel to undistorted normalized camera coordinates, inverting the
    /// 5-term Brown model iteratively.
    fn undistort_normalized(&self, u: f64, v: f64) -> (f64, f64) {
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let [k1, k2, p1, p2, k3] = self.distortion;

        let mut x = xd;
        let mut y = yd;
        for _ in 0..5 {
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x, y)
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<f64> = values.collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    v[v.len() / 2]
}
