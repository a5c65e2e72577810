//! Two-phase return-to-dock state machine: coarse GNSS waypoint traversal,
//! fiducial search and approach, precision alignment, then contact verified
//! by the dock-bus current sense. Pure computation layer; the runtime feeds
//! it snapshots and routes its directives to the planner and local planner.

use crate::config::Config;
use crate::planner::{Path, Waypoint};
use crate::types::{BatteryState, FiducialDetection, Pose, ReturnPhase};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DockPhase {
    GnssTraverse,
    Search,
    CoarseApproach,
    Precision,
    Contact,
    Docked,
    Failed,
}

impl DockPhase {
    pub fn as_return_phase(&self) -> Option<ReturnPhase> {
        match self {
            DockPhase::GnssTraverse => Some(ReturnPhase::GnssTraverse),
            DockPhase::Search => Some(ReturnPhase::Search),
            DockPhase::CoarseApproach => Some(ReturnPhase::CoarseApproach),
            DockPhase::Precision => Some(ReturnPhase::Precision),
            DockPhase::Contact => Some(ReturnPhase::Contact),
            DockPhase::Docked | DockPhase::Failed => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DockFailure {
    SearchTimeout,
    ContactTimeout,
    RetriesExhausted,
    Aborted,
}

/// What the docking task wants executed this tick.
#[derive(Clone, Debug)]
pub enum DockDirective {
    /// Request an A* path to the dock and follow it at the normal profile.
    PlanTraverse { x: f64, y: f64 },
    /// Keep following the already-requested traverse path.
    FollowTraverse,
    /// Short micro-goal for the local planner, capped at `speed_cap`.
    Drive { path: Path, speed_cap: f64 },
    /// Rotate in place (search / bearing correction).
    Spin { angular_velocity: f64 },
    /// Straight-line creep (contact).
    Creep { linear_velocity: f64 },
    Hold,
    Docked,
    Failed { reason: DockFailure },
}

#[derive(Clone, Debug)]
pub enum DockEvent {
    PhaseChanged { from: DockPhase, to: DockPhase },
    RangeRegression { seen_min: f64, now: f64 },
    MarkerLost { gap_secs: f64 },
    RetryConsumed { remaining: u32 },
}

/// Per-tick input assembled by the runtime.
#[derive(Clone, Debug)]
pub struct DockInput {
    pub now: f64,
    pub pose: Pose,
    /// Dock location in the local frame.
    pub dock_local: (f64, f64),
    /// Latest station-marker detection, if the vision engine has one.
    pub marker: Option<FiducialDetection>,
    pub battery: BatteryState,
}

#[derive(Clone, Debug)]
pub struct DockingParams {
    pub station_tag_id: u32,
    pub precise_approach_distance: f64,
    pub detection_range: f64,
    pub min_confidence: f64,
    pub target_distance: f64,
    pub precise_distance: f64,
    pub angle_tolerance: f64,
    pub yaw_tolerance: f64,
    pub rotation_speed: f64,
    pub approach_speed_normal: f64,
    pub approach_speed_precise: f64,
    pub approach_speed_ultra_slow: f64,
    pub search_timeout: f64,
    pub marker_lost_timeout: f64,
    pub contact_timeout: f64,
    pub retry_budget: u32,
    pub range_regression_epsilon: f64,
    pub waypoint_tolerance: f64,
}

impl DockingParams {
    pub fn from_config(config: &Config) -> Self {
        let dock = &config.charging.gps_dock;
        let tag = &config.charging.apriltag;
        DockingParams {
            station_tag_id: tag.station_tag_id,
            precise_approach_distance: dock.precise_approach_distance,
            detection_range: dock.apriltag_detection_range,
            min_confidence: tag.detection.min_confidence,
            target_distance: tag.tolerances.target_distance,
            precise_distance: tag.tolerances.precise_distance,
            angle_tolerance: config.dock_angle_tolerance_rad(),
            yaw_tolerance: config.dock_yaw_tolerance_rad(),
            rotation_speed: dock.rotation_speed,
            approach_speed_normal: dock.approach_speeds.normal,
            approach_speed_precise: dock.approach_speeds.precise,
            approach_speed_ultra_slow: dock.approach_speeds.ultra_slow,
            search_timeout: dock.search_timeout_secs,
            marker_lost_timeout: dock.marker_lost_timeout_secs,
            contact_timeout: dock.contact_timeout_secs,
            retry_budget: dock.retry_budget,
            range_regression_epsilon: dock.range_regression_epsilon,
            waypoint_tolerance: config
                .dynamic_obstacle_avoidance
                .performance
                .waypoint_tolerance,
        }
    }
}

pub struct DockingStateMachine {
    params: DockingParams,
    phase: DockPhase,
    phase_entered_at: f64,
    traverse_requested: bool,
    /// Search rotation direction, flipped after each half turn.
    search_direction: f64,
    last_marker_ts: f64,
    /// Minimum range seen within the current approach segment.
    segment_min_range: f64,
    retries_left: u32,
}

impl DockingStateMachine {
    pub fn new(params: DockingParams) -> Self {
        let retries = params.retry_budget;
        DockingStateMachine {
            params,
            phase: DockPhase::GnssTraverse,
            phase_entered_at: f64::NEG_INFINITY,
            traverse_requested: false,
            search_direction: 1.0,
            last_marker_ts: f64::NEG_INFINITY,
            segment_min_range: f64::INFINITY,
            retries_left: retries,
        }
    }

    pub fn phase(&self) -> DockPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, DockPhase::Docked | DockPhase::Failed)
    }

    /// Safety abort: the supervisor event wins, motion authority returns to
    /// idle and the sequence reports failure.
    pub fn abort(&mut self) {
        self.phase = DockPhase::Failed;
    }

    pub fn tick(&mut self, input: &DockInput) -> (DockDirective, Vec<DockEvent>) {
        let mut events = Vec::new();
        if self.phase_entered_at == f64::NEG_INFINITY {
            self.phase_entered_at = input.now;
        }

        let marker = input.marker.filter(|m| {
            m.marker_id == self.params.station_tag_id
                && m.confidence >= self.params.min_confidence
        });
        if marker.is_some() {
            self.last_marker_ts = input.now;
        }

        let directive = match self.phase {
            DockPhase::GnssTraverse => self.tick_traverse(input, marker, &mut events),
            DockPhase::Search => self.tick_search(input, marker, &mut events),
            DockPhase::CoarseApproach => self.tick_coarse(input, marker, &mut events),
            DockPhase::Precision => self.tick_precision(input, marker, &mut events),
            DockPhase::Contact => self.tick_contact(input, &mut events),
            DockPhase::Docked => DockDirective::Docked,
            DockPhase::Failed => DockDirective::Failed {
                reason: DockFailure::Aborted,
            },
        };
        (directive, events)
    }

    fn tick_traverse(
        &mut self,
        input: &DockInput,
        marker: Option<FiducialDetection>,
        events: &mut Vec<DockEvent>,
    ) -> DockDirective {
        let remaining = input.pose.distance_to(input.dock_local.0, input.dock_local.1);

        let marker_in_range = marker
            .map(|m| m.range_m <= self.params.detection_range)
            .unwrap_or(false);
        if remaining < self.params.precise_approach_distance || marker_in_range {
            self.enter(DockPhase::Search, input.now, events);
            return DockDirective::Hold;
        }

        if !self.traverse_requested {
            self.traverse_requested = true;
            DockDirective::PlanTraverse {
                x: input.dock_local.0,
                y: input.dock_local.1,
            }
        } else {
            DockDirective::FollowTraverse
        }
    }

    fn tick_search(
        &mut self,
        input: &DockInput,
        marker: Option<FiducialDetection>,
        events: &mut Vec<DockEvent>,
    ) -> DockDirective {
        if marker.is_some() {
            self.segment_min_range = f64::INFINITY;
            self.enter(DockPhase::CoarseApproach, input.now, events);
            return DockDirective::Hold;
        }

        let elapsed = input.now - self.phase_entered_at;
        if elapsed > self.params.search_timeout {
            self.enter(DockPhase::Failed, input.now, events);
            return DockDirective::Failed {
                reason: DockFailure::SearchTimeout,
            };
        }

        // Alternate direction after each half turn.
        let half_turn_secs = std::f64::consts::PI / self.params.rotation_speed;
        let half_turns = (elapsed / half_turn_secs) as u64;
        self.search_direction = if half_turns % 2 == 0 { 1.0 } else { -1.0 };
        DockDirective::Spin {
            angular_velocity: self.search_direction * self.params.rotation_speed,
        }
    }

    fn tick_coarse(
        &mut self,
        input: &DockInput,
        marker: Option<FiducialDetection>,
        events: &mut Vec<DockEvent>,
    ) -> DockDirective {
        let Some(m) = marker else {
            let gap = input.now - self.last_marker_ts;
            if gap > self.params.marker_lost_timeout {
                events.push(DockEvent::MarkerLost { gap_secs: gap });
                self.enter(DockPhase::Search, input.now, events);
            }
            return DockDirective::Hold;
        };

        if let Some(regressed) = self.check_regression(m.range_m, input.now, events) {
            return regressed;
        }

        if m.range_m <= self.params.target_distance {
            self.segment_min_range = f64::INFINITY;
            self.enter(DockPhase::Precision, input.now, events);
            return DockDirective::Hold;
        }

        // Micro-goal along the marker line of sight, holding back a little
        // so the goal stays in front of the dock face.
        let hold_back = self.params.target_distance * 0.5;
        let goal_range = (m.range_m - hold_back).max(0.0);
        let heading = input.pose.theta + m.bearing_rad;
        let goal = Waypoint::new(
            input.pose.x + goal_range * heading.cos(),
            input.pose.y + goal_range * heading.sin(),
            self.params.waypoint_tolerance,
        );
        DockDirective::Drive {
            path: Path::new(vec![goal]),
            speed_cap: self.params.approach_speed_normal,
        }
    }

    fn tick_precision(
        &mut self,
        input: &DockInput,
        marker: Option<FiducialDetection>,
        events: &mut Vec<DockEvent>,
    ) -> DockDirective {
        let Some(m) = marker else {
            let gap = input.now - self.last_marker_ts;
            if gap > self.params.marker_lost_timeout {
                events.push(DockEvent::MarkerLost { gap_secs: gap });
                self.enter(DockPhase::Search, input.now, events);
            }
            return DockDirective::Hold;
        };

        if let Some(regressed) = self.check_regression(m.range_m, input.now, events) {
            return regressed;
        }

        if m.range_m <= self.params.precise_distance
            && m.yaw_offset_rad.abs() <= self.params.yaw_tolerance
        {
            self.enter(DockPhase::Contact, input.now, events);
            return DockDirective::Hold;
        }

        // Bearing outside the corridor: halt forward motion and rotate.
        if m.bearing_rad.abs() > self.params.angle_tolerance {
            return DockDirective::Spin {
                angular_velocity: m.bearing_rad.signum() * self.params.rotation_speed * 0.5,
            };
        }

        // Aligned: decrement range in small steps.
        let step = (m.range_m - self.params.precise_distance * 0.8).clamp(0.05, 0.3);
        let heading = input.pose.theta + m.bearing_rad;
        let goal = Waypoint::new(
            input.pose.x + step * heading.cos(),
            input.pose.y + step * heading.sin(),
            self.params.waypoint_tolerance * 0.5,
        );
        DockDirective::Drive {
            path: Path::new(vec![goal]),
            speed_cap: self.params.approach_speed_precise,
        }
    }

    fn tick_contact(&mut self, input: &DockInput, events: &mut Vec<DockEvent>) -> DockDirective {
        // The battery monitor latches `charging` only after the dock-bus
        // current and voltage have held their thresholds for N samples.
        if input.battery.charging {
            self.enter(DockPhase::Docked, input.now, events);
            return DockDirective::Docked;
        }

        if input.now - self.phase_entered_at > self.params.contact_timeout {
            if self.retries_left > 0 {
                self.retries_left -= 1;
                events.push(DockEvent::RetryConsumed {
                    remaining: self.retries_left,
                });
                self.segment_min_range = f64::INFINITY;
                self.enter(DockPhase::Search, input.now, events);
                return DockDirective::Hold;
            }
            self.enter(DockPhase::Failed, input.now, events);
            let reason = if self.params.retry_budget > 0 {
                DockFailure::RetriesExhausted
            } else {
                DockFailure::ContactTimeout
            };
            return DockDirective::Failed { reason };
        }

        DockDirective::Creep {
            linear_velocity: self.params.approach_speed_ultra_slow,
        }
    }

    /// Range must be monotonically non-increasing within a segment; a
    /// regression beyond epsilon sends the machine back to search.
    fn check_regression(
        &mut self,
        range: f64,
        now: f64,
        events: &mut Vec<DockEvent>,
    ) -> Option<DockDirective> {
        if range > self.segment_min_range + self.params.range_regression_epsilon {
            events.push(DockEvent::RangeRegression {
                seen_min: self.segment_min_range,
                now: range,
            });
            self.segment_min_range = f64::INFINITY;
            self.enter(DockPhase::Search, now, events);
            return Some(DockDirective::Hold);
        }
        self.segment_min_range = self.segment_min_range.min(range);
        None
    }

    fn enter(&mut self, phase: DockPhase, now: f64, events: &mut Vec<DockEvent>) {
        if self.phase != phase {
            events.push(DockEvent::PhaseChanged {
                from: self.phase,
                to: phase,
            });
            self.phase = phase;
            self.phase_entered_at = now;
            if phase == DockPhase::GnssTraverse {
                self.traverse_requested = false;
            }
        }
    }
}
