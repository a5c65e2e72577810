//! Sensor-fusion localizer. Pure computation layer: encoder, IMU and GNSS
//! samples in, pose snapshots and events out. No channels, no I/O, so the
//! whole thing is unit-testable with recorded data.

use crate::config::Config;
use crate::filters::ekf::{DifferentialEkf, GnssUpdateOutcome};
use crate::geodesy::LocalFrame;
use crate::types::{
    EncoderSample, FixQuality, GnssFix, ImuSample, Pose,
};

#[derive(Clone, Debug)]
pub struct LocalizerConfig {
    pub meters_per_tick: f64,
    pub wheel_base: f64,
    pub imu_yaw_weight: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub outlier_gate_sigma: f64,
    pub max_hdop: f64,
    /// IMU samples older than this fall back to wheel-only yaw [s].
    pub imu_staleness_secs: f64,
    /// Quality decay time constant during GNSS dropout [s].
    pub quality_decay_tau: f64,
    pub degraded_quality_threshold: f64,
    pub degraded_hold_secs: f64,
    /// No encoder movement under commanded motion for this long raises the
    /// stuck signal [s].
    pub stall_window_secs: f64,
    /// Commanded speed below this is treated as intentional standstill [m/s].
    pub stall_min_command: f64,
}

impl LocalizerConfig {
    pub fn from_config(config: &Config) -> Self {
        let kalman = &config.navigation.kalman;
        LocalizerConfig {
            meters_per_tick: config.meters_per_tick(),
            wheel_base: config.navigation.wheel_base,
            imu_yaw_weight: kalman.imu_yaw_weight,
            process_noise: kalman.process_noise,
            measurement_noise: kalman.measurement_noise,
            outlier_gate_sigma: kalman.outlier_gate_sigma,
            max_hdop: kalman.max_hdop,
            imu_staleness_secs: 0.2,
            quality_decay_tau: 20.0,
            degraded_quality_threshold: kalman.degraded_quality_threshold,
            degraded_hold_secs: kalman.degraded_hold_secs,
            stall_window_secs: 1.5,
            stall_min_command: 0.05,
        }
    }
}

#[derive(Clone, Debug)]
pub enum LocalizerEvent {
    /// First accepted fix anchored the local frame.
    FrameAnchored { latitude: f64, longitude: f64 },
    GnssDiscarded { reason: GnssDiscardReason },
    /// odometry_quality stayed below threshold long enough that long-range
    /// missions should be refused.
    Degraded { quality: f64 },
    DegradedCleared,
    /// No encoder movement under commanded motion. Exported to the safety
    /// supervisor.
    EncoderStall,
    /// IMU went silent; yaw is wheel-only with widened covariance.
    ImuSilent { gap_secs: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GnssDiscardReason {
    NoFix,
    HdopTooHigh { hdop: f64 },
    Outlier { mahalanobis: f64 },
    StaleTimestamp,
}

/// Published localizer output. Timestamps are monotonic: a later snapshot
/// never carries an older timestamp.
#[derive(Clone, Debug)]
pub struct LocalizerSnapshot {
    pub pose: Pose,
    pub odometry_quality: f64,
    pub degraded: bool,
    pub frame: Option<LocalFrame>,
    pub gnss_accepts: u64,
    pub gnss_rejects: u64,
}

pub struct Localizer {
    config: LocalizerConfig,
    ekf: DifferentialEkf,
    frame: Option<LocalFrame>,

    last_encoder: Option<EncoderSample>,
    last_movement_ts: f64,
    commanded_speed: f64,
    stall_raised: bool,

    last_imu: Option<ImuSample>,
    imu_silent_reported: bool,

    last_fix_ts: f64,
    odometry_quality: f64,
    degraded_since: Option<f64>,
    degraded: bool,

    published_ts: f64,
}

impl Localizer {
    pub fn new(config: LocalizerConfig) -> Self {
        let ekf = DifferentialEkf::new(
            config.wheel_base,
            config.imu_yaw_weight,
            config.process_noise,
            config.measurement_noise,
            config.outlier_gate_sigma,
        );
        Localizer {
            config,
            ekf,
            frame: None,
            last_encoder: None,
            last_movement_ts: 0.0,
            commanded_speed: 0.0,
            stall_raised: false,
            last_imu: None,
            imu_silent_reported: false,
            last_fix_ts: f64::NEG_INFINITY,
            odometry_quality: 0.0,
            degraded_since: None,
            degraded: false,
            published_ts: 0.0,
        }
    }

    /// The currently commanded linear speed; used for encoder-stall
    /// detection only.
    pub fn set_commanded_speed(&mut self, v: f64) {
        self.commanded_speed = v;
    }

    // ── Sensor feeds ─────────────────────────────────────────────────────

    /// Feed an encoder sample (cumulative tick counts). Runs the EKF
    /// prediction step.
    pub fn feed_encoders(&mut self, sample: &EncoderSample) -> Vec<LocalizerEvent> {
        let mut events = Vec::new();
        let Some(prev) = self.last_encoder else {
            self.last_encoder = Some(*sample);
            self.last_movement_ts = sample.timestamp;
            return events;
        };

        let dt = sample.timestamp - prev.timestamp;
        if dt <= 0.0 || dt > 1.0 {
            self.last_encoder = Some(*sample);
            return events;
        }

        let d_left = (sample.left_ticks - prev.left_ticks) as f64 * self.config.meters_per_tick;
        let d_right = (sample.right_ticks - prev.right_ticks) as f64 * self.config.meters_per_tick;
        self.last_encoder = Some(*sample);

        let yaw_rate = self.fresh_imu_yaw(sample.timestamp);
        if yaw_rate.is_none() {
            if let Some(imu) = &self.last_imu {
                if !self.imu_silent_reported {
                    self.imu_silent_reported = true;
                    events.push(LocalizerEvent::ImuSilent {
                        gap_secs: sample.timestamp - imu.timestamp,
                    });
                }
            }
        }

        self.ekf.predict(d_left, d_right, dt, yaw_rate);
        self.published_ts = self.published_ts.max(sample.timestamp);

        // Stall: commanded motion but the wheels are not turning.
        if d_left.abs() > 0.0 || d_right.abs() > 0.0 {
            self.last_movement_ts = sample.timestamp;
            self.stall_raised = false;
        } else if self.commanded_speed.abs() > self.config.stall_min_command
            && sample.timestamp - self.last_movement_ts > self.config.stall_window_secs
            && !self.stall_raised
        {
            self.stall_raised = true;
            events.push(LocalizerEvent::EncoderStall);
        }

        events
    }

    pub fn feed_imu(&mut self, sample: &ImuSample) {
        self.imu_silent_reported = false;
        self.last_imu = Some(*sample);
    }

    /// Feed a GNSS fix (~1 Hz measurement update).
    pub fn feed_gnss(&mut self, fix: &GnssFix) -> Vec<LocalizerEvent> {
        let mut events = Vec::new();

        if fix.timestamp <= self.last_fix_ts {
            events.push(LocalizerEvent::GnssDiscarded {
                reason: GnssDiscardReason::StaleTimestamp,
            });
            return events;
        }
        if fix.quality < FixQuality::Fix2d {
            events.push(LocalizerEvent::GnssDiscarded {
                reason: GnssDiscardReason::NoFix,
            });
            return events;
        }
        if fix.hdop > self.config.max_hdop {
            events.push(LocalizerEvent::GnssDiscarded {
                reason: GnssDiscardReason::HdopTooHigh { hdop: fix.hdop },
            });
            return events;
        }

        match self.frame {
            None => {
                // First accepted fix anchors the local frame and collapses
                // the position covariance.
                let frame = LocalFrame::new(fix.point);
                self.ekf.anchor(0.0, 0.0, fix.hdop);
                self.frame = Some(frame);
                self.last_fix_ts = fix.timestamp;
                self.odometry_quality = 1.0;
                events.push(LocalizerEvent::FrameAnchored {
                    latitude: fix.point.latitude,
                    longitude: fix.point.longitude,
                });
            }
            Some(frame) => {
                let (x, y) = frame.to_local(fix.point);
                match self.ekf.update_gnss(x, y, fix.hdop) {
                    GnssUpdateOutcome::Accepted { innovation_m } => {
                        self.last_fix_ts = fix.timestamp;
                        // Small innovations pull quality toward 1.
                        let target = (1.0 - innovation_m / 5.0).clamp(0.3, 1.0);
                        self.odometry_quality =
                            0.7 * self.odometry_quality + 0.3 * target;
                    }
                    GnssUpdateOutcome::RejectedOutlier { mahalanobis, .. } => {
                        events.push(LocalizerEvent::GnssDiscarded {
                            reason: GnssDiscardReason::Outlier { mahalanobis },
                        });
                    }
                }
            }
        }
        self.published_ts = self.published_ts.max(fix.timestamp);
        events
    }

    // ── Per-tick (fusion rate) ───────────────────────────────────────────

    pub fn tick(&mut self, now: f64) -> Vec<LocalizerEvent> {
        let mut events = Vec::new();

        // Quality decays exponentially while no fix is being accepted.
        if self.frame.is_some() && now > self.last_fix_ts {
            let gap = now - self.last_fix_ts;
            if gap > 2.0 {
                let decayed = (-(gap - 2.0) / self.config.quality_decay_tau).exp();
                self.odometry_quality = self.odometry_quality.min(decayed.max(0.0));
            }
        }

        let below = self.odometry_quality < self.config.degraded_quality_threshold;
        match (below, self.degraded_since) {
            (true, None) => self.degraded_since = Some(now),
            (true, Some(since)) => {
                if !self.degraded && now - since > self.config.degraded_hold_secs {
                    self.degraded = true;
                    events.push(LocalizerEvent::Degraded {
                        quality: self.odometry_quality,
                    });
                }
            }
            (false, _) => {
                self.degraded_since = None;
                if self.degraded {
                    self.degraded = false;
                    events.push(LocalizerEvent::DegradedCleared);
                }
            }
        }
        self.published_ts = self.published_ts.max(now);
        events
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> LocalizerSnapshot {
        let st = self.ekf.get_state();
        let (_, accepts, rejects) = self.ekf.counters();
        LocalizerSnapshot {
            pose: Pose {
                x: st.x,
                y: st.y,
                theta: st.theta,
                linear_velocity: st.linear_velocity,
                angular_velocity: st.angular_velocity,
                covariance: st.pose_covariance,
                timestamp: self.published_ts,
            },
            odometry_quality: self.odometry_quality,
            degraded: self.degraded,
            frame: self.frame,
            gnss_accepts: accepts,
            gnss_rejects: rejects,
        }
    }

    pub fn frame(&self) -> Option<LocalFrame> {
        self.frame
    }

    fn fresh_imu_yaw(&self, now: f64) -> Option<f64> {
        self.last_imu.as_ref().and_then(|imu| {
            if now - imu.timestamp <= self.config.imu_staleness_secs {
                Some(imu.gyro.2)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeodeticPoint;

    fn localizer() -> Localizer {
        Localizer::new(LocalizerConfig::from_config(&Config::default()))
    }

    fn fix(ts: f64, lat: f64, lon: f64, hdop: f64) -> GnssFix {
        GnssFix {
            timestamp: ts,
            point: GeodeticPoint::new(lat, lon),
            quality: FixQuality::Fix3d,
            hdop,
        }
    }

    fn imu_still(ts: f64) -> ImuSample {
        ImuSample {
            timestamp: ts,
            gyro: (0.0, 0.0, 0.0),
            accel: (0.0, 0.0, 9.81),
            roll: 0.0,
            pitch: 0.0,
        }
    }

    #[test]
    fn test_first_fix_anchors_frame() {
        let mut loc = localizer();
        assert!(loc.frame().is_none());
        let events = loc.feed_gnss(&fix(1.0, 41.0, 29.0, 1.0));
        assert!(events
            .iter()
            .any(|e| matches!(e, LocalizerEvent::FrameAnchored { .. })));
        assert!(loc.frame().is_some());
        assert!((loc.snapshot().odometry_quality - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_hdop_fix_ignored() {
        let mut loc = localizer();
        loc.feed_gnss(&fix(1.0, 41.0, 29.0, 1.0));
        let before = loc.snapshot();
        let events = loc.feed_gnss(&fix(2.0, 41.0001, 29.0001, 9.0));
        assert!(events.iter().any(|e| matches!(
            e,
            LocalizerEvent::GnssDiscarded {
                reason: GnssDiscardReason::HdopTooHigh { .. }
            }
        )));
        let after = loc.snapshot();
        // Estimator state unchanged by the discarded fix.
        assert_eq!(before.pose.x, after.pose.x);
        assert_eq!(before.pose.y, after.pose.y);
        assert_eq!(before.gnss_accepts, after.gnss_accepts);
    }

    #[test]
    fn test_straight_line_scenario() {
        // Both encoders issue 1000 ticks over 5 s, zero IMU yaw: x = 0.204 m.
        let mut loc = localizer();
        let mut ticks = 0i64;
        let steps = 500;
        for i in 0..=steps {
            let ts = i as f64 * 0.01;
            loc.feed_imu(&imu_still(ts));
            loc.feed_encoders(&EncoderSample {
                timestamp: ts,
                left_ticks: ticks,
                right_ticks: ticks,
            });
            ticks += 2;
        }
        let pose = loc.snapshot().pose;
        assert!((pose.x - 0.204).abs() < 2e-3);
        assert!(pose.y.abs() < 2e-3);
        assert!(pose.theta.abs() < 1e-9);
    }

    #[test]
    fn test_quality_decays_during_dropout() {
        let mut loc = localizer();
        loc.feed_gnss(&fix(0.0, 41.0, 29.0, 1.0));
        loc.tick(1.0);
        let q1 = loc.snapshot().odometry_quality;
        loc.tick(60.0);
        let q2 = loc.snapshot().odometry_quality;
        assert!(q2 < q1);
        assert!(q2 < 0.3);
    }

    #[test]
    fn test_degraded_after_hold_time() {
        let mut loc = localizer();
        loc.feed_gnss(&fix(0.0, 41.0, 29.0, 1.0));
        // Long dropout: quality collapses, degraded raised only after hold.
        let mut degraded_events = 0;
        for i in 1..200 {
            let events = loc.tick(i as f64);
            degraded_events += events
                .iter()
                .filter(|e| matches!(e, LocalizerEvent::Degraded { .. }))
                .count();
        }
        assert_eq!(degraded_events, 1);
        assert!(loc.snapshot().degraded);
    }

    #[test]
    fn test_encoder_stall_raised_once() {
        let mut loc = localizer();
        loc.set_commanded_speed(0.3);
        let mut stalls = 0;
        for i in 0..400 {
            let ts = i as f64 * 0.01;
            loc.feed_imu(&imu_still(ts));
            let events = loc.feed_encoders(&EncoderSample {
                timestamp: ts,
                left_ticks: 100,
                right_ticks: 100,
            });
            stalls += events
                .iter()
                .filter(|e| matches!(e, LocalizerEvent::EncoderStall))
                .count();
        }
        assert_eq!(stalls, 1);
    }

    #[test]
    fn test_snapshot_timestamp_monotonic() {
        let mut loc = localizer();
        loc.feed_gnss(&fix(5.0, 41.0, 29.0, 1.0));
        let t1 = loc.snapshot().pose.timestamp;
        // An older encoder sample must not move the published time backwards.
        loc.feed_encoders(&EncoderSample {
            timestamp: 1.0,
            left_ticks: 0,
            right_ticks: 0,
        });
        let t2 = loc.snapshot().pose.timestamp;
        assert!(t2 >= t1);
    }
}
