use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic seconds since process start. Every deadline and sensor
/// timestamp in the stack shares this epoch; wall-clock appears only in
/// logs.
pub fn monotonic_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Wrap an angle into `(-pi, pi]`.
pub fn wrap_angle(theta: f64) -> f64 {
    let mut a = theta % (2.0 * std::f64::consts::PI);
    if a <= -std::f64::consts::PI {
        a += 2.0 * std::f64::consts::PI;
    } else if a > std::f64::consts::PI {
        a -= 2.0 * std::f64::consts::PI;
    }
    a
}

/// Planar pose in the local Cartesian frame anchored at the first accepted
/// GNSS fix. `theta` is always in `(-pi, pi]`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    /// Row-major 3x3 covariance over (x, y, theta).
    pub covariance: [f64; 9],
    /// Monotonic seconds at which this estimate was produced.
    pub timestamp: f64,
}

impl Pose {
    pub fn origin() -> Self {
        Pose {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            covariance: [
                100.0, 0.0, 0.0, //
                0.0, 100.0, 0.0, //
                0.0, 0.0, 1.0,
            ],
            timestamp: 0.0,
        }
    }

    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }

    /// Bearing to a point, relative to the current heading.
    pub fn bearing_to(&self, x: f64, y: f64) -> f64 {
        wrap_angle((y - self.y).atan2(x - self.x) - self.theta)
    }
}

/// Latitude/longitude in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeodeticPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeodeticPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeodeticPoint { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude)
            && self.longitude > -180.0
            && self.longitude <= 180.0
    }
}

// ─── Sensor samples ──────────────────────────────────────────────────────────

/// Cumulative encoder tick counts, one per wheel. Counts are signed so reverse
/// motion decrements.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EncoderSample {
    pub timestamp: f64,
    pub left_ticks: i64,
    pub right_ticks: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: f64,
    /// Angular rates [rad/s], body frame.
    pub gyro: (f64, f64, f64),
    /// Linear accelerations [m/s^2], body frame.
    pub accel: (f64, f64, f64),
    /// Roll/pitch [rad], forwarded to the safety supervisor.
    pub roll: f64,
    pub pitch: f64,
}

/// GNSS fix quality as reported by the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FixQuality {
    NoFix,
    Fix2d,
    Fix3d,
    Dgps,
    Rtk,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GnssFix {
    pub timestamp: f64,
    pub point: GeodeticPoint,
    pub quality: FixQuality,
    pub hdop: f64,
}

/// Monochrome camera frame. Row-major, one byte per pixel.
#[derive(Clone, Debug)]
pub struct CameraFrame {
    pub timestamp: f64,
    pub width: usize,
    pub height: usize,
    pub data: std::sync::Arc<Vec<u8>>,
}

impl CameraFrame {
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }
}

/// One reading from a current-sense channel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Discrete safety inputs, sampled together.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DiscreteInputs {
    pub timestamp: f64,
    pub estop: bool,
    pub bumper_front: bool,
    pub bumper_rear: bool,
}

// ─── Motion ──────────────────────────────────────────────────────────────────

/// A single velocity command. `deadline_monotonic` is the monotonic time after
/// which the command must not be applied.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionCommand {
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub deadline_monotonic: f64,
}

impl MotionCommand {
    pub fn stop(deadline: f64) -> Self {
        MotionCommand {
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            deadline_monotonic: deadline,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.linear_velocity == 0.0 && self.angular_velocity == 0.0
    }
}

/// Velocity profile for the local planner. `Emergency` is only ever selected
/// by the safety supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavMode {
    Normal,
    Conservative,
    Aggressive,
    Emergency,
}

// ─── Vision ──────────────────────────────────────────────────────────────────

/// Relative pose of one decoded fiducial marker.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FiducialDetection {
    pub marker_id: u32,
    pub range_m: f64,
    pub bearing_rad: f64,
    pub yaw_offset_rad: f64,
    pub confidence: f64,
    pub frame_timestamp: f64,
    /// False when temporal smoothing had fewer than two agreeing samples.
    pub smoothed: bool,
}

// ─── Power ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BatteryState {
    pub voltage: f64,
    pub current: f64,
    pub state_of_charge: f64,
    pub charging: bool,
    pub dock_bus_voltage: f64,
    pub dock_bus_current: f64,
}

// ─── Safety ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BumperSide {
    Front,
    Rear,
}

/// Immutable safety event, totally ordered by arrival at the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SafetyEvent {
    EStopPressed,
    BumperHit(BumperSide),
    TiltExceeded { angle_rad: f64 },
    WatchdogStarved,
    BatteryCritical,
    CollisionImminent { distance_m: f64 },
    BoundaryDeviation { distance_m: f64 },
}

// ─── Mission ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    PlanningFailed,
    DockingFailed,
    LocalizationDegraded,
    Safety,
    Timeout,
}

/// Phase of the return-to-dock sequence, mirrored from the docking state
/// machine for status reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnPhase {
    GnssTraverse,
    Search,
    CoarseApproach,
    Precision,
    Contact,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MissionState {
    Idle,
    Mowing { cursor: usize },
    PointGoto { target_x: f64, target_y: f64 },
    Returning { phase: ReturnPhase },
    Charging,
    Error { kind: FaultKind },
    /// Cooperative-shutdown terminal state; every task drains and exits.
    Halting,
}

impl MissionState {
    pub fn name(&self) -> &'static str {
        match self {
            MissionState::Idle => "idle",
            MissionState::Mowing { .. } => "mowing",
            MissionState::PointGoto { .. } => "point_goto",
            MissionState::Returning { .. } => "returning",
            MissionState::Charging => "charging",
            MissionState::Error { .. } => "error",
            MissionState::Halting => "halting",
        }
    }
}
