//! Startup configuration. A base YAML file plus an optional environment
//! override file are deep-merged, deserialized, and validated once; the
//! resulting [`Config`] is immutable and shared by reference.
//!
//! Angles in the file are degrees, distances meters, speeds m/s. Accessors
//! convert degrees to radians so the rest of the stack never sees degrees.

use crate::errors::ConfigError;
use crate::types::GeodeticPoint;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub robot: RobotInfo,
    pub simulation: SimulationConfig,
    pub navigation: NavigationConfig,
    pub charging: ChargingConfig,
    pub safety: SafetyConfig,
    pub dynamic_obstacle_avoidance: AvoidanceConfig,
    pub motors: MotorsConfig,
    pub sensors: SensorsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotInfo {
    pub name: String,
    pub version: String,
}

impl Default for RobotInfo {
    fn default() -> Self {
        RobotInfo {
            name: "mower".into(),
            version: "0".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
}

// ─── Navigation ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Wheel diameter [m]. Must be positive.
    pub wheel_diameter: f64,
    /// Distance between wheel contact points [m]. Must be positive.
    pub wheel_base: f64,
    /// Encoder pulses per wheel revolution. Hardware-specific.
    pub encoder_ppr: u32,
    pub kalman: KalmanConfig,
    pub path_planning: PathPlanningConfig,
    pub missions: MissionsConfig,
    /// Closed work-area polygon; the closing edge is implicit.
    pub boundary_coordinates: Vec<GeodeticPoint>,
    pub boundary_safety: BoundarySafetyConfig,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        NavigationConfig {
            wheel_diameter: 0.065,
            wheel_base: 0.235,
            encoder_ppr: 1000,
            kalman: KalmanConfig::default(),
            path_planning: PathPlanningConfig::default(),
            missions: MissionsConfig::default(),
            boundary_coordinates: Vec::new(),
            boundary_safety: BoundarySafetyConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Scalar multiplier on the model covariance.
    pub process_noise: f64,
    /// Scalar multiplier on the GNSS measurement covariance.
    pub measurement_noise: f64,
    /// Innovation gate: reject fixes beyond `k * sqrt(S)`.
    pub outlier_gate_sigma: f64,
    /// Maximum HDOP for a fix to be ingested.
    pub max_hdop: f64,
    /// Complementary blend weight for IMU yaw rate vs wheel odometry yaw,
    /// in [0, 1]; 1 trusts the gyro completely.
    pub imu_yaw_weight: f64,
    /// odometry_quality below this for longer than `degraded_hold_secs`
    /// raises the degraded signal.
    pub degraded_quality_threshold: f64,
    pub degraded_hold_secs: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        KalmanConfig {
            process_noise: 1.0,
            measurement_noise: 1.0,
            outlier_gate_sigma: 5.0,
            max_hdop: 2.5,
            imu_yaw_weight: 0.98,
            degraded_quality_threshold: 0.3,
            degraded_hold_secs: 10.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InflationMetric {
    Chebyshev,
    Euclidean,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathPlanningConfig {
    /// Grid cell size [m].
    pub grid_resolution: f64,
    /// Inflation padding added to the robot radius [m].
    pub obstacle_padding: f64,
    pub inflation_metric: InflationMetric,
    /// Extra grid margin around the boundary AABB [m].
    pub grid_margin: f64,
    /// Maximum spacing between consecutive path waypoints [m].
    pub max_waypoint_step: f64,
    /// Cost multiplier applied to Inflated cells during A*.
    pub inflated_cell_penalty: f64,
}

impl Default for PathPlanningConfig {
    fn default() -> Self {
        PathPlanningConfig {
            grid_resolution: 0.25,
            obstacle_padding: 0.15,
            inflation_metric: InflationMetric::Euclidean,
            grid_margin: 1.0,
            max_waypoint_step: 0.5,
            inflated_cell_penalty: 3.0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionsConfig {
    pub mowing: MowingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MowingConfig {
    /// Overlap between adjacent strips [m].
    pub overlap: f64,
    /// Coverage cruise speed [m/s].
    pub speed: f64,
    /// Cutting width of the brush/tool [m].
    pub brush_width: f64,
}

impl Default for MowingConfig {
    fn default() -> Self {
        MowingConfig {
            overlap: 0.1,
            speed: 0.4,
            brush_width: 0.25,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundarySafetyConfig {
    /// Shrink the legal area by this much [m].
    pub buffer_distance: f64,
    /// Warn when closer than this to the buffered boundary [m].
    pub warning_distance: f64,
    /// Deviation outside the buffered boundary that raises a safety event [m].
    pub max_deviation: f64,
    /// Check period [s].
    pub check_frequency: f64,
}

impl Default for BoundarySafetyConfig {
    fn default() -> Self {
        BoundarySafetyConfig {
            buffer_distance: 0.3,
            warning_distance: 0.5,
            max_deviation: 0.5,
            check_frequency: 1.0,
        }
    }
}

// ─── Charging / docking ──────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargingConfig {
    pub gps_dock: GpsDockConfig,
    pub apriltag: AprilTagConfig,
    pub power_sensor: PowerSensorConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsDockConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// GNSS accuracy radius around the dock [m].
    pub accuracy_radius: f64,
    /// Remaining distance below which GNSS traverse hands over [m].
    pub precise_approach_distance: f64,
    /// Distance at which approach slows to the medium profile [m].
    pub medium_distance_threshold: f64,
    /// Marker sightings beyond this range are ignored during traverse [m].
    pub apriltag_detection_range: f64,
    pub approach_speeds: ApproachSpeeds,
    /// In-place search rotation speed [rad/s].
    pub rotation_speed: f64,
    /// Give up the fiducial search after this long [s].
    pub search_timeout_secs: f64,
    /// Marker silence that sends coarse approach back to search [s].
    pub marker_lost_timeout_secs: f64,
    /// Contact phase budget [s].
    pub contact_timeout_secs: f64,
    /// Whole-sequence retry budget.
    pub retry_budget: u32,
    /// Tolerated per-step range regression before reverting to search [m].
    pub range_regression_epsilon: f64,
}

impl Default for GpsDockConfig {
    fn default() -> Self {
        GpsDockConfig {
            latitude: 0.0,
            longitude: 0.0,
            accuracy_radius: 2.0,
            precise_approach_distance: 0.5,
            medium_distance_threshold: 10.0,
            apriltag_detection_range: 5.0,
            approach_speeds: ApproachSpeeds::default(),
            rotation_speed: 0.4,
            search_timeout_secs: 45.0,
            marker_lost_timeout_secs: 2.0,
            contact_timeout_secs: 20.0,
            retry_budget: 3,
            range_regression_epsilon: 0.05,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproachSpeeds {
    pub normal: f64,
    pub slow: f64,
    pub very_slow: f64,
    pub ultra_slow: f64,
    pub precise: f64,
}

impl Default for ApproachSpeeds {
    fn default() -> Self {
        ApproachSpeeds {
            normal: 0.3,
            slow: 0.2,
            very_slow: 0.1,
            ultra_slow: 0.05,
            precise: 0.08,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AprilTagConfig {
    /// Marker id mounted on the charge station.
    #[serde(rename = "sarj_istasyonu_tag_id")]
    pub station_tag_id: u32,
    /// Marker side length [m].
    #[serde(rename = "tag_boyutu")]
    pub tag_size: f64,
    /// 3x3 camera intrinsic matrix, row-major.
    #[serde(rename = "kamera_matrix")]
    pub camera_matrix: [[f64; 3]; 3],
    /// 5-term radial/tangential distortion.
    pub distortion_coeffs: [f64; 5],
    /// Camera mounting yaw relative to the robot forward axis [deg].
    pub camera_yaw_offset_deg: f64,
    pub detection: DetectionConfig,
    pub tolerances: DockTolerances,
}

impl Default for AprilTagConfig {
    fn default() -> Self {
        AprilTagConfig {
            station_tag_id: 7,
            tag_size: 0.16,
            camera_matrix: [[600.0, 0.0, 320.0], [0.0, 600.0, 240.0], [0.0, 0.0, 1.0]],
            distortion_coeffs: [0.0; 5],
            camera_yaw_offset_deg: 0.0,
            detection: DetectionConfig::default(),
            tolerances: DockTolerances::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_confidence: f64,
    pub max_detection_distance: f64,
    /// Accepted quad perimeter as a fraction of the frame dimension.
    pub min_marker_perimeter_rate: f64,
    pub max_marker_perimeter_rate: f64,
    /// Ring-buffer depth for temporal smoothing.
    pub tracking_history: usize,
    /// Detections older than this are evicted [s].
    pub obstacle_timeout: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            min_confidence: 0.5,
            max_detection_distance: 6.0,
            min_marker_perimeter_rate: 0.03,
            max_marker_perimeter_rate: 4.0,
            tracking_history: 5,
            obstacle_timeout: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DockTolerances {
    /// Hand over from coarse approach below this range [m].
    #[serde(rename = "hedef_mesafe")]
    pub target_distance: f64,
    /// Contact creep starts below this range [m].
    #[serde(rename = "hassas_mesafe")]
    pub precise_distance: f64,
    /// Bearing corridor during precision alignment [deg].
    #[serde(rename = "aci_toleransi")]
    pub angle_tolerance_deg: f64,
    /// Lateral position tolerance [m].
    #[serde(rename = "pozisyon_toleransi")]
    pub position_tolerance: f64,
    /// Marker yaw-offset corridor for contact entry [deg].
    pub yaw_tolerance_deg: f64,
}

impl Default for DockTolerances {
    fn default() -> Self {
        DockTolerances {
            target_distance: 1.0,
            precise_distance: 0.25,
            angle_tolerance_deg: 8.0,
            position_tolerance: 0.05,
            yaw_tolerance_deg: 10.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSensorConfig {
    /// Dock-bus current above this counts toward charge confirmation [A].
    #[serde(rename = "sarj_akimi_esigi")]
    pub charge_current_threshold: f64,
    /// Dock-bus voltage above this counts toward charge confirmation [V].
    #[serde(rename = "baglanti_voltaj_esigi")]
    pub contact_voltage_threshold: f64,
    /// Consecutive samples required before `charging` is latched.
    pub confirm_samples: u32,
}

impl Default for PowerSensorConfig {
    fn default() -> Self {
        PowerSensorConfig {
            charge_current_threshold: 0.2,
            contact_voltage_threshold: 13.0,
            confirm_samples: 5,
        }
    }
}

// ─── Safety ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub tilt_control: TiltConfig,
    pub watchdog: WatchdogConfig,
    pub collision_detection: CollisionConfig,
    pub battery_safety: BatterySafetyConfig,
    pub bumper: BumperConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TiltConfig {
    /// Hard tilt limit [deg].
    pub max_tilt_angle: f64,
    /// Release below `max_tilt_angle * warning_threshold`.
    pub warning_threshold: f64,
    /// Sustained time under the release level before the brake clears [s].
    pub tilt_debounce: f64,
}

impl Default for TiltConfig {
    fn default() -> Self {
        TiltConfig {
            max_tilt_angle: 25.0,
            warning_threshold: 0.8,
            tilt_debounce: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Missed-heartbeat budget [s].
    pub timeout: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig { timeout: 0.5 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Hard clearance floor owned by the supervisor [m]. Must not exceed the
    /// local planner's soft brake distance.
    pub distance_threshold: f64,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        CollisionConfig {
            distance_threshold: 0.25,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatterySafetyConfig {
    pub min_battery_voltage: f64,
    /// Voltage drop rate that flags a failing pack [V/min].
    pub rapid_drain_threshold: f64,
    pub max_current_draw: f64,
}

impl Default for BatterySafetyConfig {
    fn default() -> Self {
        BatterySafetyConfig {
            min_battery_voltage: 10.5,
            rapid_drain_threshold: 0.5,
            max_current_draw: 12.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BumperConfig {
    /// Hold time after a bumper clears before motion resumes [s].
    pub bumper_hold_time: f64,
}

impl Default for BumperConfig {
    fn default() -> Self {
        BumperConfig {
            bumper_hold_time: 1.5,
        }
    }
}

// ─── Dynamic window avoidance ────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvoidanceConfig {
    pub dwa: DwaConfig,
    pub robot_physics: RobotPhysics,
    pub navigation_modes: NavigationModes,
    pub performance: PerformanceConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DwaConfig {
    /// Linear velocity sampling step [m/s].
    pub velocity_resolution: f64,
    /// Angular velocity sampling step [rad/s].
    pub angular_resolution: f64,
    /// Forward-simulation horizon [s].
    pub time_horizon: f64,
    /// Simulation and control step [s].
    pub dt: f64,
    /// Soft brake setpoint of the local planner [m].
    pub emergency_brake_distance: f64,
    /// Clearance cap when scoring obstacle distance [m].
    pub clearance_cap: f64,
    pub weights: DwaWeights,
}

impl Default for DwaConfig {
    fn default() -> Self {
        DwaConfig {
            velocity_resolution: 0.05,
            angular_resolution: 0.1,
            time_horizon: 2.0,
            dt: 0.1,
            emergency_brake_distance: 0.35,
            clearance_cap: 2.0,
            weights: DwaWeights::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DwaWeights {
    pub heading: f64,
    pub obstacle: f64,
    pub velocity: f64,
    pub smoothness: f64,
}

impl Default for DwaWeights {
    fn default() -> Self {
        // Obstacle avoidance outweighs heading progress.
        DwaWeights {
            heading: 0.8,
            obstacle: 1.5,
            velocity: 0.4,
            smoothness: 0.2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotPhysics {
    pub radius: f64,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub max_linear_accel: f64,
    pub max_angular_accel: f64,
}

impl Default for RobotPhysics {
    fn default() -> Self {
        RobotPhysics {
            radius: 0.2,
            max_linear_speed: 0.6,
            max_angular_speed: 1.2,
            max_linear_accel: 0.5,
            max_angular_accel: 1.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationModes {
    pub normal: ModeProfile,
    pub conservative: ModeProfile,
    pub aggressive: ModeProfile,
    pub emergency: ModeProfile,
}

impl Default for NavigationModes {
    fn default() -> Self {
        NavigationModes {
            normal: ModeProfile {
                speed_factor: 1.0,
                safety_factor: 1.0,
            },
            conservative: ModeProfile {
                speed_factor: 0.6,
                safety_factor: 1.5,
            },
            aggressive: ModeProfile {
                speed_factor: 1.2,
                safety_factor: 0.8,
            },
            emergency: ModeProfile {
                speed_factor: 0.0,
                safety_factor: 2.0,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModeProfile {
    pub speed_factor: f64,
    pub safety_factor: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Upper bound on replan requests [Hz].
    pub max_replanning_frequency: f64,
    /// Consecutive no-sample ticks before a replan is requested.
    pub stuck_detection_limit: u32,
    /// Waypoint acceptance radius [m].
    pub waypoint_tolerance: f64,
    /// Local planner tick rate [Hz]; raised during docking.
    pub control_rate_hz: f64,
    pub docking_control_rate_hz: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            max_replanning_frequency: 0.5,
            stuck_detection_limit: 20,
            waypoint_tolerance: 0.15,
            control_rate_hz: 10.0,
            docking_control_rate_hz: 25.0,
        }
    }
}

// ─── Pin ownership (legacy sections) ─────────────────────────────────────────

/// The motor section is authoritative for encoder pin ownership. A conflicting
/// `sensors.enkoder` entry is a hard configuration error.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorsConfig {
    pub wheels: WheelsConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelsConfig {
    pub encoder_pins: Option<(u8, u8)>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    #[serde(alias = "enkoder")]
    pub encoder: EncoderPinsConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderPinsConfig {
    pub pins: Option<(u8, u8)>,
}

// ─── Loading & validation ────────────────────────────────────────────────────

impl Config {
    /// Load a base file, optionally deep-merged with an override file, then
    /// validate.
    pub fn load(base: &Path, overlay: Option<&Path>) -> Result<Config, ConfigError> {
        let mut value = read_yaml(base)?;
        if let Some(path) = overlay {
            let over = read_yaml(path)?;
            merge_yaml(&mut value, over);
        }
        let config: Config = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nav = &self.navigation;
        if nav.wheel_diameter <= 0.0 {
            return Err(ConfigError::invalid(
                "navigation.wheel_diameter",
                "must be positive",
            ));
        }
        if nav.wheel_base <= 0.0 {
            return Err(ConfigError::invalid(
                "navigation.wheel_base",
                "must be positive",
            ));
        }
        if nav.encoder_ppr == 0 {
            return Err(ConfigError::invalid(
                "navigation.encoder_ppr",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&nav.kalman.imu_yaw_weight) {
            return Err(ConfigError::invalid(
                "navigation.kalman.imu_yaw_weight",
                "must be in [0, 1]",
            ));
        }
        if nav.path_planning.grid_resolution <= 0.0 {
            return Err(ConfigError::invalid(
                "navigation.path_planning.grid_resolution",
                "must be positive",
            ));
        }
        if !nav.boundary_coordinates.is_empty() && nav.boundary_coordinates.len() < 3 {
            return Err(ConfigError::invalid(
                "navigation.boundary_coordinates",
                "a polygon needs at least 3 vertices",
            ));
        }
        for (i, p) in nav.boundary_coordinates.iter().enumerate() {
            if !p.is_valid() {
                return Err(ConfigError::invalid(
                    "navigation.boundary_coordinates",
                    format!("vertex {i} out of range: ({}, {})", p.latitude, p.longitude),
                ));
            }
        }
        let mow = &nav.missions.mowing;
        if mow.brush_width <= mow.overlap {
            return Err(ConfigError::invalid(
                "navigation.missions.mowing",
                "brush_width must exceed overlap",
            ));
        }

        let dock = GeodeticPoint::new(self.charging.gps_dock.latitude, self.charging.gps_dock.longitude);
        if !dock.is_valid() {
            return Err(ConfigError::invalid(
                "charging.gps_dock",
                "dock coordinates out of range",
            ));
        }
        if self.charging.apriltag.tag_size <= 0.0 {
            return Err(ConfigError::invalid(
                "charging.apriltag.tag_boyutu",
                "must be positive",
            ));
        }
        let det = &self.charging.apriltag.detection;
        if det.min_marker_perimeter_rate >= det.max_marker_perimeter_rate {
            return Err(ConfigError::invalid(
                "charging.apriltag.detection",
                "min_marker_perimeter_rate must be below max_marker_perimeter_rate",
            ));
        }

        let dwa = &self.dynamic_obstacle_avoidance.dwa;
        if dwa.velocity_resolution <= 0.0 || dwa.angular_resolution <= 0.0 {
            return Err(ConfigError::invalid(
                "dynamic_obstacle_avoidance.dwa",
                "sampling resolutions must be positive",
            ));
        }
        if dwa.dt <= 0.0 || dwa.time_horizon < dwa.dt {
            return Err(ConfigError::invalid(
                "dynamic_obstacle_avoidance.dwa",
                "time_horizon must cover at least one dt",
            ));
        }
        // The supervisor's clearance floor is hard; the DWA brake distance is
        // the planner's soft setpoint above it.
        if self.safety.collision_detection.distance_threshold > dwa.emergency_brake_distance {
            return Err(ConfigError::Conflict(format!(
                "safety.collision_detection.distance_threshold ({}) must not exceed \
                 dynamic_obstacle_avoidance.dwa.emergency_brake_distance ({})",
                self.safety.collision_detection.distance_threshold, dwa.emergency_brake_distance
            )));
        }

        let physics = &self.dynamic_obstacle_avoidance.robot_physics;
        if physics.radius <= 0.0 || physics.max_linear_speed <= 0.0 {
            return Err(ConfigError::invalid(
                "dynamic_obstacle_avoidance.robot_physics",
                "radius and max_linear_speed must be positive",
            ));
        }

        // Encoder pins may appear under both the motor and the legacy sensor
        // section; the motor section owns them and a disagreement is fatal.
        if let (Some(motor_pins), Some(sensor_pins)) =
            (self.motors.wheels.encoder_pins, self.sensors.encoder.pins)
        {
            if motor_pins != sensor_pins {
                return Err(ConfigError::Conflict(format!(
                    "encoder pins disagree: motors.wheels.encoder_pins={motor_pins:?}, \
                     sensors.enkoder.pins={sensor_pins:?} (motor section is authoritative)"
                )));
            }
        }

        Ok(())
    }

    /// Meters advanced per encoder tick.
    pub fn meters_per_tick(&self) -> f64 {
        std::f64::consts::PI * self.navigation.wheel_diameter / self.navigation.encoder_ppr as f64
    }

    pub fn dock_point(&self) -> GeodeticPoint {
        GeodeticPoint::new(self.charging.gps_dock.latitude, self.charging.gps_dock.longitude)
    }

    pub fn max_tilt_angle_rad(&self) -> f64 {
        self.safety.tilt_control.max_tilt_angle.to_radians()
    }

    pub fn dock_angle_tolerance_rad(&self) -> f64 {
        self.charging.apriltag.tolerances.angle_tolerance_deg.to_radians()
    }

    pub fn dock_yaw_tolerance_rad(&self) -> f64 {
        self.charging.apriltag.tolerances.yaw_tolerance_deg.to_radians()
    }

    pub fn camera_yaw_offset_rad(&self) -> f64 {
        self.charging.apriltag.camera_yaw_offset_deg.to_radians()
    }

    pub fn mode_profile(&self, mode: crate::types::NavMode) -> ModeProfile {
        let modes = &self.dynamic_obstacle_avoidance.navigation_modes;
        match mode {
            crate::types::NavMode::Normal => modes.normal,
            crate::types::NavMode::Conservative => modes.conservative,
            crate::types::NavMode::Aggressive => modes.aggressive,
            crate::types::NavMode::Emergency => modes.emergency,
        }
    }
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Recursive mapping merge; override scalars and sequences win wholesale.
fn merge_yaml(base: &mut serde_yaml::Value, over: serde_yaml::Value) {
    match (base, over) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(over_map)) => {
            for (k, v) in over_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_yaml(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_wheel_base_must_be_positive() {
        let mut config = Config::default();
        config.navigation.wheel_base = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wheel_base"));
    }

    #[test]
    fn test_supervisor_threshold_must_not_exceed_dwa() {
        let mut config = Config::default();
        config.safety.collision_detection.distance_threshold = 1.0;
        config.dynamic_obstacle_avoidance.dwa.emergency_brake_distance = 0.5;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Conflict(_)
        ));
    }

    #[test]
    fn test_encoder_pin_conflict() {
        let mut config = Config::default();
        config.motors.wheels.encoder_pins = Some((17, 18));
        config.sensors.encoder.pins = Some((22, 23));
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Conflict(_)
        ));
        // Agreement is fine.
        config.sensors.encoder.pins = Some((17, 18));
        config.validate().unwrap();
    }

    #[test]
    fn test_meters_per_tick() {
        let config = Config::default();
        // pi * 0.065 / 1000
        assert!((config.meters_per_tick() - 2.0420352e-4).abs() < 1e-9);
    }

    #[test]
    fn test_yaml_parse_with_turkish_keys() {
        let yaml = r#"
charging:
  apriltag:
    sarj_istasyonu_tag_id: 12
    tag_boyutu: 0.2
    tolerances:
      hedef_mesafe: 1.2
      hassas_mesafe: 0.3
      aci_toleransi: 6.0
  power_sensor:
    sarj_akimi_esigi: 0.4
    baglanti_voltaj_esigi: 12.6
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.charging.apriltag.station_tag_id, 12);
        assert!((config.charging.apriltag.tag_size - 0.2).abs() < 1e-12);
        assert!((config.charging.apriltag.tolerances.precise_distance - 0.3).abs() < 1e-12);
        assert!((config.charging.power_sensor.charge_current_threshold - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_merge_override_wins() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "navigation:\n  wheel_base: 0.235\n  encoder_ppr: 1000\n",
        )
        .unwrap();
        let over: serde_yaml::Value =
            serde_yaml::from_str("navigation:\n  encoder_ppr: 360\n").unwrap();
        merge_yaml(&mut base, over);
        let config: Config = serde_yaml::from_value(base).unwrap();
        assert_eq!(config.navigation.encoder_ppr, 360);
        assert!((config.navigation.wheel_base - 0.235).abs() < 1e-12);
    }

    #[test]
    fn test_polygon_needs_three_vertices() {
        let mut config = Config::default();
        config.navigation.boundary_coordinates = vec![
            GeodeticPoint::new(41.0, 29.0),
            GeodeticPoint::new(41.001, 29.0),
        ];
        assert!(config.validate().is_err());
    }
}
