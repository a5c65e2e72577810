//! Dynamic-window local planner. Each control tick samples admissible
//! (v, omega) pairs inside the intersection of the static limits, the
//! reachable window, and the safety window, forward-simulates each candidate
//! and scores it for heading progress, obstacle clearance, velocity and
//! smoothness.

use crate::config::{Config, ModeProfile};
use crate::planner::Path;
use crate::types::{MotionCommand, NavMode, Pose};
use rstar::RTree;

#[derive(Clone, Debug)]
pub struct DwaParams {
    pub velocity_resolution: f64,
    pub angular_resolution: f64,
    pub time_horizon: f64,
    pub dt: f64,
    /// Soft brake setpoint; the admissibility test keeps at least this much
    /// clearance beyond the stopping distance.
    pub emergency_brake_distance: f64,
    pub clearance_cap: f64,
    pub w_heading: f64,
    pub w_obstacle: f64,
    pub w_velocity: f64,
    pub w_smoothness: f64,
    pub robot_radius: f64,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub max_linear_accel: f64,
    pub max_angular_accel: f64,
    pub waypoint_tolerance: f64,
    pub stuck_limit: u32,
    /// Issued commands expire this long after the tick [s].
    pub command_ttl: f64,
}

impl DwaParams {
    pub fn from_config(config: &Config) -> Self {
        let avoidance = &config.dynamic_obstacle_avoidance;
        let dwa = &avoidance.dwa;
        let physics = &avoidance.robot_physics;
        DwaParams {
            velocity_resolution: dwa.velocity_resolution,
            angular_resolution: dwa.angular_resolution,
            time_horizon: dwa.time_horizon,
            dt: dwa.dt,
            emergency_brake_distance: dwa.emergency_brake_distance,
            clearance_cap: dwa.clearance_cap,
            w_heading: dwa.weights.heading,
            w_obstacle: dwa.weights.obstacle,
            w_velocity: dwa.weights.velocity,
            w_smoothness: dwa.weights.smoothness,
            robot_radius: physics.radius,
            max_linear_speed: physics.max_linear_speed,
            max_angular_speed: physics.max_angular_speed,
            max_linear_accel: physics.max_linear_accel,
            max_angular_accel: physics.max_angular_accel,
            waypoint_tolerance: avoidance.performance.waypoint_tolerance,
            stuck_limit: avoidance.performance.stuck_detection_limit,
            command_ttl: 2.0 / avoidance.performance.control_rate_hz,
        }
    }
}

/// Result of one planner tick.
#[derive(Clone, Debug)]
pub enum DwaOutcome {
    Command(MotionCommand),
    /// Path cursor ran off the end; the command is zero.
    GoalReached(MotionCommand),
    /// No admissible sample this tick. `replan` is set once the stuck
    /// counter passes its limit.
    Stuck { command: MotionCommand, replan: bool },
}

impl DwaOutcome {
    pub fn command(&self) -> MotionCommand {
        match self {
            DwaOutcome::Command(c) => *c,
            DwaOutcome::GoalReached(c) => *c,
            DwaOutcome::Stuck { command, .. } => *command,
        }
    }
}

pub struct LocalPlanner {
    params: DwaParams,
    mode: NavMode,
    profile: ModeProfile,
    path: Option<Path>,
    obstacles: RTree<[f64; 2]>,
    last_v: f64,
    last_w: f64,
    stuck_count: u32,
}

impl LocalPlanner {
    pub fn new(params: DwaParams, profile: ModeProfile) -> Self {
        LocalPlanner {
            params,
            mode: NavMode::Normal,
            profile,
            path: None,
            obstacles: RTree::new(),
            last_v: 0.0,
            last_w: 0.0,
            stuck_count: 0,
        }
    }

    pub fn set_path(&mut self, path: Path) {
        self.path = Some(path);
        self.stuck_count = 0;
    }

    pub fn clear_path(&mut self) {
        self.path = None;
    }

    pub fn has_path(&self) -> bool {
        self.path.is_some()
    }

    pub fn path_cursor(&self) -> Option<usize> {
        self.path.as_ref().map(|p| p.cursor())
    }

    /// Select a velocity profile. The emergency profile belongs to the
    /// safety supervisor and is refused here.
    pub fn set_mode(&mut self, mode: NavMode, profile: ModeProfile) {
        if mode == NavMode::Emergency {
            log::warn!("emergency profile is supervisor-owned; ignoring mode request");
            return;
        }
        self.mode = mode;
        self.profile = profile;
    }

    pub fn mode(&self) -> NavMode {
        self.mode
    }

    /// Replace the obstacle set (grid obstacles plus live detections).
    pub fn set_obstacles(&mut self, points: &[(f64, f64)]) {
        self.obstacles = RTree::bulk_load(points.iter().map(|&(x, y)| [x, y]).collect());
    }

    /// Clearance at a point for the supervisor's collision channel; None
    /// when no obstacles are known.
    pub fn clearance_to_nearest(&self, x: f64, y: f64) -> Option<f64> {
        self.obstacles.nearest_neighbor(&[x, y]).map(|ob| {
            let d = ((ob[0] - x).powi(2) + (ob[1] - y).powi(2)).sqrt();
            (d - self.params.robot_radius).max(0.0)
        })
    }

    /// Clearance from a point to the nearest obstacle, minus the robot
    /// radius.
    fn clearance_at(&self, x: f64, y: f64) -> f64 {
        match self.obstacles.nearest_neighbor(&[x, y]) {
            Some(ob) => {
                let d = ((ob[0] - x).powi(2) + (ob[1] - y).powi(2)).sqrt();
                (d - self.params.robot_radius).max(0.0)
            }
            None => self.params.clearance_cap,
        }
    }

    /// One control tick: returns the motion command for the current pose.
    pub fn tick(&mut self, pose: &Pose, now: f64) -> DwaOutcome {
        let deadline = now + self.params.command_ttl;
        let Some(path) = self.path.as_mut() else {
            return DwaOutcome::Command(MotionCommand::stop(deadline));
        };

        path.advance(pose);
        let Some(waypoint) = path.current().copied() else {
            self.last_v = 0.0;
            self.last_w = 0.0;
            return DwaOutcome::GoalReached(MotionCommand::stop(deadline));
        };

        let p = &self.params;
        let v_max = p.max_linear_speed * self.profile.speed_factor;
        let w_max = p.max_angular_speed;

        // Dynamic window reachable from the last command.
        let v_hi = (self.last_v + p.max_linear_accel * p.dt).min(v_max);
        let v_lo = (self.last_v - p.max_linear_accel * p.dt).clamp(0.0, v_hi.max(0.0));
        let w_lo = (self.last_w - p.max_angular_accel * p.dt).max(-w_max);
        let w_hi = (self.last_w + p.max_angular_accel * p.dt).min(w_max);

        let brake_floor = p.emergency_brake_distance * self.profile.safety_factor;

        let mut best: Option<(f64, f64, f64, f64)> = None; // score, v, w, continuity
        let mut v = v_lo;
        while v <= v_hi + 1e-9 {
            let mut w = w_lo;
            while w <= w_hi + 1e-9 {
                if let Some(score) = self.score_sample(pose, &waypoint, v, w, v_max, brake_floor) {
                    let continuity =
                        -((v - self.last_v).abs() / p.max_linear_speed
                            + (w - self.last_w).abs() / (2.0 * p.max_angular_speed));
                    let better = match best {
                        None => true,
                        Some((bs, _, _, bc)) => {
                            score > bs || (score == bs && continuity > bc)
                        }
                    };
                    if better {
                        best = Some((score, v, w, continuity));
                    }
                }
                w += p.angular_resolution;
            }
            v += p.velocity_resolution;
        }

        match best {
            Some((_, v, w, _)) => {
                self.stuck_count = 0;
                self.last_v = v;
                self.last_w = w;
                DwaOutcome::Command(MotionCommand {
                    linear_velocity: v,
                    angular_velocity: w,
                    deadline_monotonic: deadline,
                })
            }
            None => {
                self.stuck_count += 1;
                self.last_v = 0.0;
                self.last_w = 0.0;
                let replan = self.stuck_count >= p.stuck_limit;
                if replan {
                    self.stuck_count = 0;
                }
                DwaOutcome::Stuck {
                    command: MotionCommand::stop(deadline),
                    replan,
                }
            }
        }
    }

    /// Forward-simulate one sample. Returns its score, or None when the
    /// trajectory violates the safety window.
    fn score_sample(
        &self,
        pose: &Pose,
        waypoint: &crate::planner::Waypoint,
        v: f64,
        w: f64,
        v_max: f64,
        brake_floor: f64,
    ) -> Option<f64> {
        let p = &self.params;
        let steps = (p.time_horizon / p.dt).ceil() as usize;

        let mut x = pose.x;
        let mut y = pose.y;
        let mut theta = pose.theta;
        let mut min_clearance = self.clearance_at(x, y);

        for _ in 0..steps {
            theta += w * p.dt;
            x += v * theta.cos() * p.dt;
            y += v * theta.sin() * p.dt;
            min_clearance = min_clearance.min(self.clearance_at(x, y));
        }

        // Safety window: enough clearance to brake from v plus the floor.
        let stop_distance = v * v / (2.0 * p.max_linear_accel);
        if min_clearance < stop_distance + brake_floor {
            return None;
        }

        let bearing_err = {
            let end_bearing = (waypoint.y - y).atan2(waypoint.x - x);
            crate::types::wrap_angle(end_bearing - theta).abs()
        };
        let h = 1.0 - bearing_err / std::f64::consts::PI;
        let o = min_clearance.min(p.clearance_cap) / p.clearance_cap;
        let vel = if v_max > 0.0 { v / v_max } else { 0.0 };
        let s = -((v - self.last_v).abs() / p.max_linear_speed
            + (w - self.last_w).abs() / (2.0 * p.max_angular_speed));

        Some(p.w_heading * h + p.w_obstacle * o + p.w_velocity * vel + p.w_smoothness * s)
    }

    pub fn last_command(&self) -> (f64, f64) {
        (self.last_v, self.last_w)
    }

    pub fn stuck_count(&self) -> u32 {
        self.stuck_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Waypoint;

    fn planner() -> LocalPlanner {
        let config = Config::default();
        LocalPlanner::new(
            DwaParams::from_config(&config),
            config.mode_profile(NavMode::Normal),
        )
    }

    fn straight_path(x: f64) -> Path {
        Path::new(vec![Waypoint::new(x, 0.0, 0.15)])
    }

    #[test]
    fn test_no_path_means_zero_command() {
        let mut lp = planner();
        let out = lp.tick(&Pose::origin(), 0.0);
        assert!(out.command().is_zero());
    }

    #[test]
    fn test_progress_toward_waypoint() {
        let mut lp = planner();
        lp.set_path(straight_path(5.0));
        let mut pose = Pose::origin();
        // After a few ticks the planner is driving forward.
        let mut cmd = MotionCommand::stop(0.0);
        for i in 0..20 {
            cmd = lp.tick(&pose, i as f64 * 0.1).command();
            pose.x += cmd.linear_velocity * 0.1 * pose.theta.cos();
            pose.theta = crate::types::wrap_angle(pose.theta + cmd.angular_velocity * 0.1);
        }
        assert!(cmd.linear_velocity > 0.1);
        assert!(pose.x > 0.1);
    }

    #[test]
    fn test_commands_respect_mode_limits() {
        let config = Config::default();
        let mut lp = planner();
        lp.set_mode(
            NavMode::Conservative,
            config.mode_profile(NavMode::Conservative),
        );
        lp.set_path(straight_path(5.0));
        let mut pose = Pose::origin();
        let cap = config.dynamic_obstacle_avoidance.robot_physics.max_linear_speed
            * config
                .dynamic_obstacle_avoidance
                .navigation_modes
                .conservative
                .speed_factor;
        for i in 0..50 {
            let cmd = lp.tick(&pose, i as f64 * 0.1).command();
            assert!(cmd.linear_velocity <= cap + 1e-9);
            pose.x += cmd.linear_velocity * 0.1;
        }
    }

    #[test]
    fn test_emergency_mode_refused() {
        let config = Config::default();
        let mut lp = planner();
        lp.set_mode(NavMode::Emergency, config.mode_profile(NavMode::Emergency));
        assert_eq!(lp.mode(), NavMode::Normal);
    }

    #[test]
    fn test_obstacle_ahead_steers_or_slows() {
        let mut lp = planner();
        lp.set_path(straight_path(6.0));
        // Wall of points straight ahead at x = 1.0.
        let wall: Vec<(f64, f64)> = (-5..=5).map(|i| (1.0, i as f64 * 0.1)).collect();
        lp.set_obstacles(&wall);
        let mut pose = Pose::origin();
        for i in 0..60 {
            let cmd = lp.tick(&pose, i as f64 * 0.1).command();
            pose.theta = crate::types::wrap_angle(pose.theta + cmd.angular_velocity * 0.1);
            pose.x += cmd.linear_velocity * 0.1 * pose.theta.cos();
            pose.y += cmd.linear_velocity * 0.1 * pose.theta.sin();
            let nearest = wall
                .iter()
                .map(|&(wx, wy)| ((wx - pose.x).powi(2) + (wy - pose.y).powi(2)).sqrt())
                .fold(f64::INFINITY, f64::min);
            assert!(nearest > 0.25, "tick {i}: drove into the wall");
        }
    }

    #[test]
    fn test_boxed_in_raises_stuck_then_replan() {
        let config = Config::default();
        let limit = config
            .dynamic_obstacle_avoidance
            .performance
            .stuck_detection_limit;
        let mut lp = planner();
        lp.set_path(straight_path(5.0));
        // Tight ring of obstacles around the robot: no admissible sample.
        let ring: Vec<(f64, f64)> = (0..36)
            .map(|i| {
                let a = i as f64 * 10.0_f64.to_radians();
                (0.25 * a.cos(), 0.25 * a.sin())
            })
            .collect();
        lp.set_obstacles(&ring);
        let pose = Pose::origin();
        let mut saw_replan = false;
        for i in 0..(limit + 5) {
            match lp.tick(&pose, i as f64 * 0.1) {
                DwaOutcome::Stuck { command, replan } => {
                    assert!(command.is_zero());
                    if replan {
                        saw_replan = true;
                        break;
                    }
                }
                other => panic!("expected stuck, got {other:?}"),
            }
        }
        assert!(saw_replan);
    }

    #[test]
    fn test_goal_reached_on_exhausted_path() {
        let mut lp = planner();
        lp.set_path(straight_path(0.05));
        let out = lp.tick(&Pose::origin(), 0.0);
        assert!(matches!(out, DwaOutcome::GoalReached(_)));
        assert!(out.command().is_zero());
    }
}
