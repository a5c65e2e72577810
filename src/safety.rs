//! Safety supervisor: every motion command passes through `decide`, which
//! applies the interlock ladder in fixed order and stamps the result with a
//! fresh authority token. The supervisor never suspends on I/O; it reads
//! snapshot values handed in by the caller.

use crate::config::{Config, ModeProfile};
use crate::types::{BatteryState, BumperSide, MotionCommand, SafetyEvent};

/// Periodic tasks under watchdog supervision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogSource {
    Fusion,
    LocalPlanner,
    Vision,
    Docking,
}

const WATCHDOG_SOURCES: usize = 4;

impl WatchdogSource {
    fn index(self) -> usize {
        match self {
            WatchdogSource::Fusion => 0,
            WatchdogSource::LocalPlanner => 1,
            WatchdogSource::Vision => 2,
            WatchdogSource::Docking => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WatchdogSource::Fusion => "fusion",
            WatchdogSource::LocalPlanner => "local_planner",
            WatchdogSource::Vision => "vision",
            WatchdogSource::Docking => "docking",
        }
    }
}

/// Snapshot inputs for one arbitration step.
#[derive(Clone, Debug, Default)]
pub struct SafetyInputs {
    pub estop: bool,
    pub bumper_front: bool,
    pub bumper_rear: bool,
    /// Roll/pitch magnitude [rad].
    pub roll: f64,
    pub pitch: f64,
    pub battery: BatteryState,
    /// Closest obstacle clearance reported by any channel, when known [m].
    pub min_clearance: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Normal,
    BumperHold,
    TiltBrake,
    Emergency,
}

/// Result of one decision step. Actuators accept only commands carrying the
/// current token.
#[derive(Clone, Debug)]
pub struct Arbitration {
    pub command: MotionCommand,
    pub token: u64,
    pub state: SupervisorState,
    /// First interlock that fired, for diagnostics.
    pub triggered: Option<&'static str>,
    /// Battery-critical dock request; motion toward the dock stays allowed.
    pub dock_requested: bool,
    pub events: Vec<SafetyEvent>,
}

#[derive(Clone, Debug)]
pub struct SafetyParams {
    pub max_tilt_angle: f64,
    pub tilt_release_fraction: f64,
    pub tilt_debounce: f64,
    pub watchdog_timeout: f64,
    pub collision_distance: f64,
    pub min_battery_voltage: f64,
    pub max_current_draw: f64,
    pub bumper_hold_time: f64,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
}

impl SafetyParams {
    pub fn from_config(config: &Config) -> Self {
        let safety = &config.safety;
        let physics = &config.dynamic_obstacle_avoidance.robot_physics;
        SafetyParams {
            max_tilt_angle: config.max_tilt_angle_rad(),
            tilt_release_fraction: safety.tilt_control.warning_threshold,
            tilt_debounce: safety.tilt_control.tilt_debounce,
            watchdog_timeout: safety.watchdog.timeout,
            collision_distance: safety.collision_detection.distance_threshold,
            min_battery_voltage: safety.battery_safety.min_battery_voltage,
            max_current_draw: safety.battery_safety.max_current_draw,
            bumper_hold_time: safety.bumper.bumper_hold_time,
            max_linear_speed: physics.max_linear_speed,
            max_angular_speed: physics.max_angular_speed,
        }
    }
}

pub struct SafetySupervisor {
    params: SafetyParams,
    token: u64,
    emergency_latched: bool,
    emergency_cause: Option<&'static str>,
    /// Monotonic time until which the bumper hold persists after clearing.
    bumper_hold_until: f64,
    bumper_reported: bool,
    tilt_braking: bool,
    tilt_ok_since: Option<f64>,
    collision_reported: bool,
    dock_requested: bool,
    heartbeats: [Option<f64>; WATCHDOG_SOURCES],
    starved: Option<WatchdogSource>,
}

impl SafetySupervisor {
    pub fn new(params: SafetyParams) -> Self {
        SafetySupervisor {
            params,
            token: 0,
            emergency_latched: false,
            emergency_cause: None,
            bumper_hold_until: f64::NEG_INFINITY,
            bumper_reported: false,
            tilt_braking: false,
            tilt_ok_since: None,
            collision_reported: false,
            dock_requested: false,
            heartbeats: [None; WATCHDOG_SOURCES],
            starved: None,
        }
    }

    /// Record a heartbeat from a supervised task.
    pub fn heartbeat(&mut self, source: WatchdogSource, now: f64) {
        self.heartbeats[source.index()] = Some(now);
    }

    /// Stop supervising a task that has deliberately gone away (the docking
    /// task between return sequences).
    pub fn clear_heartbeat(&mut self, source: WatchdogSource) {
        self.heartbeats[source.index()] = None;
    }

    /// The token most recently issued; actuators compare against it.
    pub fn current_token(&self) -> u64 {
        self.token
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency_latched
    }

    /// Manual reset after an e-stop or watchdog latch. Ignored while the
    /// e-stop input is still asserted.
    pub fn reset_emergency(&mut self, inputs: &SafetyInputs) -> bool {
        if inputs.estop {
            return false;
        }
        self.emergency_latched = false;
        self.emergency_cause = None;
        self.starved = None;
        true
    }

    fn starved_source(&self, now: f64) -> Option<WatchdogSource> {
        const ALL: [WatchdogSource; 4] = [
            WatchdogSource::Fusion,
            WatchdogSource::LocalPlanner,
            WatchdogSource::Vision,
            WatchdogSource::Docking,
        ];
        for source in ALL {
            if let Some(beat) = self.heartbeats[source.index()] {
                if now - beat > self.params.watchdog_timeout {
                    return Some(source);
                }
            }
        }
        None
    }

    /// The arbitration step. Check order is fixed; the first trigger that is
    /// active at decision time wins.
    pub fn decide(
        &mut self,
        now: f64,
        inputs: &SafetyInputs,
        proposed: MotionCommand,
        profile: ModeProfile,
    ) -> Arbitration {
        self.token = self.token.wrapping_add(1);
        let mut events = Vec::new();
        let p = &self.params;
        let zero = MotionCommand::stop(proposed.deadline_monotonic);

        // 1. E-stop / watchdog starvation: latch, manual reset required.
        if inputs.estop {
            if !self.emergency_latched {
                events.push(SafetyEvent::EStopPressed);
            }
            self.emergency_latched = true;
            self.emergency_cause = Some("estop");
        } else if let Some(source) = self.starved_source(now) {
            if !self.emergency_latched {
                log::error!("watchdog starved by task `{}`", source.name());
                events.push(SafetyEvent::WatchdogStarved);
            }
            self.emergency_latched = true;
            self.emergency_cause = Some("watchdog");
            self.starved = Some(source);
        }
        if self.emergency_latched {
            return self.finish(
                zero,
                SupervisorState::Emergency,
                self.emergency_cause,
                events,
            );
        }

        // 2. Bumper: brake within one tick, hold after clearing.
        let bumper_hit = inputs.bumper_front || inputs.bumper_rear;
        if bumper_hit {
            let side = if inputs.bumper_front {
                BumperSide::Front
            } else {
                BumperSide::Rear
            };
            // Hold runs from the moment the bumper clears.
            self.bumper_hold_until = now + p.bumper_hold_time;
            if !self.bumper_reported {
                self.bumper_reported = true;
                events.push(SafetyEvent::BumperHit(side));
            }
            return self.finish(zero, SupervisorState::BumperHold, Some("bumper"), events);
        }
        self.bumper_reported = false;
        if now < self.bumper_hold_until {
            return self.finish(
                zero,
                SupervisorState::BumperHold,
                Some("bumper_hold"),
                events,
            );
        }

        // 3. Tilt with debounced release.
        let tilt = inputs.roll.abs().max(inputs.pitch.abs());
        if tilt > p.max_tilt_angle {
            if !self.tilt_braking {
                events.push(SafetyEvent::TiltExceeded { angle_rad: tilt });
            }
            self.tilt_braking = true;
            self.tilt_ok_since = None;
        } else if self.tilt_braking {
            let release_level = p.max_tilt_angle * p.tilt_release_fraction;
            if tilt < release_level {
                match self.tilt_ok_since {
                    None => self.tilt_ok_since = Some(now),
                    Some(since) if now - since >= p.tilt_debounce => {
                        self.tilt_braking = false;
                        self.tilt_ok_since = None;
                    }
                    Some(_) => {}
                }
            } else {
                self.tilt_ok_since = None;
            }
        }
        if self.tilt_braking {
            return self.finish(zero, SupervisorState::TiltBrake, Some("tilt"), events);
        }

        // 4. Battery critical: request the dock, keep allowing controlled
        // motion toward it.
        let battery_critical = inputs.battery.voltage <= p.min_battery_voltage
            || inputs.battery.current > p.max_current_draw;
        if battery_critical && !self.dock_requested {
            self.dock_requested = true;
            events.push(SafetyEvent::BatteryCritical);
        } else if !battery_critical && inputs.battery.charging {
            self.dock_requested = false;
        }

        // 5. Collision imminent: emergency profile, zero linear with bounded
        // angular.
        if let Some(clearance) = inputs.min_clearance {
            if clearance < p.collision_distance {
                if !self.collision_reported {
                    self.collision_reported = true;
                    events.push(SafetyEvent::CollisionImminent {
                        distance_m: clearance,
                    });
                }
                let command = MotionCommand {
                    linear_velocity: 0.0,
                    angular_velocity: proposed
                        .angular_velocity
                        .clamp(-p.max_angular_speed, p.max_angular_speed),
                    deadline_monotonic: proposed.deadline_monotonic,
                };
                return self.finish(
                    command,
                    SupervisorState::Normal,
                    Some("collision_imminent"),
                    events,
                );
            }
        }
        self.collision_reported = false;

        // 6. Pass-through, clamped to the active mode's limits.
        let v_cap = p.max_linear_speed * profile.speed_factor;
        let command = MotionCommand {
            linear_velocity: proposed.linear_velocity.clamp(-v_cap, v_cap),
            angular_velocity: proposed
                .angular_velocity
                .clamp(-p.max_angular_speed, p.max_angular_speed),
            deadline_monotonic: proposed.deadline_monotonic,
        };
        self.finish(command, SupervisorState::Normal, None, events)
    }

    fn finish(
        &mut self,
        command: MotionCommand,
        state: SupervisorState,
        triggered: Option<&'static str>,
        events: Vec<SafetyEvent>,
    ) -> Arbitration {
        Arbitration {
            command,
            token: self.token,
            state,
            triggered,
            dock_requested: self.dock_requested,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NavMode;

    fn supervisor() -> (SafetySupervisor, ModeProfile) {
        let config = Config::default();
        (
            SafetySupervisor::new(SafetyParams::from_config(&config)),
            config.mode_profile(NavMode::Normal),
        )
    }

    fn forward(v: f64) -> MotionCommand {
        MotionCommand {
            linear_velocity: v,
            angular_velocity: 0.0,
            deadline_monotonic: 10.0,
        }
    }

    fn healthy_inputs() -> SafetyInputs {
        SafetyInputs {
            battery: BatteryState {
                voltage: 12.5,
                ..BatteryState::default()
            },
            ..SafetyInputs::default()
        }
    }

    #[test]
    fn test_pass_through_when_healthy() {
        let (mut sup, profile) = supervisor();
        let out = sup.decide(0.0, &healthy_inputs(), forward(0.4), profile);
        assert_eq!(out.command.linear_velocity, 0.4);
        assert_eq!(out.state, SupervisorState::Normal);
        assert!(out.triggered.is_none());
    }

    #[test]
    fn test_bumper_brakes_within_one_tick_and_holds() {
        // Scenario: proposed (0.4, 0), bumper_front true -> (0, 0) now;
        // after the bumper clears and the hold elapses the next proposed
        // command passes unchanged.
        let (mut sup, profile) = supervisor();
        let mut inputs = healthy_inputs();
        inputs.bumper_front = true;
        let out = sup.decide(0.0, &inputs, forward(0.4), profile);
        assert!(out.command.is_zero());
        assert_eq!(out.state, SupervisorState::BumperHold);
        assert!(out.events.contains(&SafetyEvent::BumperHit(BumperSide::Front)));

        // Cleared, but still inside the hold window.
        inputs.bumper_front = false;
        let out = sup.decide(0.5, &inputs, forward(0.4), profile);
        assert!(out.command.is_zero());
        assert_eq!(out.state, SupervisorState::BumperHold);

        // Hold elapsed: passes unchanged.
        let out = sup.decide(2.0, &inputs, forward(0.4), profile);
        assert_eq!(out.command.linear_velocity, 0.4);
        assert_eq!(out.state, SupervisorState::Normal);
    }

    #[test]
    fn test_estop_latches_until_reset() {
        let (mut sup, profile) = supervisor();
        let mut inputs = healthy_inputs();
        inputs.estop = true;
        let out = sup.decide(0.0, &inputs, forward(0.3), profile);
        assert!(out.command.is_zero());
        assert_eq!(out.state, SupervisorState::Emergency);
        assert!(out.events.contains(&SafetyEvent::EStopPressed));

        // Input released, but the latch persists.
        inputs.estop = false;
        let out = sup.decide(1.0, &inputs, forward(0.3), profile);
        assert!(out.command.is_zero());

        // Reset fails while pressed, succeeds after release.
        let mut pressed = healthy_inputs();
        pressed.estop = true;
        assert!(!sup.reset_emergency(&pressed));
        assert!(sup.reset_emergency(&inputs));
        let out = sup.decide(2.0, &inputs, forward(0.3), profile);
        assert_eq!(out.command.linear_velocity, 0.3);
    }

    #[test]
    fn test_watchdog_starvation_latches() {
        let (mut sup, profile) = supervisor();
        sup.heartbeat(WatchdogSource::Fusion, 0.0);
        // Fresh heartbeat: fine.
        let out = sup.decide(0.1, &healthy_inputs(), forward(0.2), profile);
        assert_eq!(out.state, SupervisorState::Normal);
        // Stale beyond the timeout: emergency.
        let out = sup.decide(1.0, &healthy_inputs(), forward(0.2), profile);
        assert_eq!(out.state, SupervisorState::Emergency);
        assert!(out.events.contains(&SafetyEvent::WatchdogStarved));
        assert!(out.command.is_zero());
    }

    #[test]
    fn test_tilt_brake_with_debounced_release() {
        let (mut sup, profile) = supervisor();
        let mut inputs = healthy_inputs();
        inputs.pitch = 0.6; // beyond 25 degrees
        let out = sup.decide(0.0, &inputs, forward(0.3), profile);
        assert_eq!(out.state, SupervisorState::TiltBrake);

        // Back under the release level, but not yet debounced.
        inputs.pitch = 0.1;
        let out = sup.decide(0.2, &inputs, forward(0.3), profile);
        assert_eq!(out.state, SupervisorState::TiltBrake);
        // Sustained long enough: released.
        let out = sup.decide(0.2 + 1.1, &inputs, forward(0.3), profile);
        assert_eq!(out.state, SupervisorState::Normal);
        assert_eq!(out.command.linear_velocity, 0.3);
    }

    #[test]
    fn test_battery_threshold_is_inclusive() {
        let (mut sup, profile) = supervisor();
        // Exactly at the critical threshold: dock requested.
        let mut inputs = healthy_inputs();
        inputs.battery.voltage = 10.5;
        let out = sup.decide(0.0, &inputs, forward(0.3), profile);
        assert!(out.dock_requested);
        assert!(out.events.contains(&SafetyEvent::BatteryCritical));
        // Motion still allowed toward the dock.
        assert_eq!(out.command.linear_velocity, 0.3);

        // 0.01 V above: no request.
        let (mut sup, profile) = supervisor();
        let mut inputs = healthy_inputs();
        inputs.battery.voltage = 10.51;
        let out = sup.decide(0.0, &inputs, forward(0.3), profile);
        assert!(!out.dock_requested);
    }

    #[test]
    fn test_collision_imminent_zeroes_linear_keeps_bounded_angular() {
        let (mut sup, profile) = supervisor();
        let mut inputs = healthy_inputs();
        inputs.min_clearance = Some(0.1);
        let proposed = MotionCommand {
            linear_velocity: 0.5,
            angular_velocity: 5.0,
            deadline_monotonic: 10.0,
        };
        let out = sup.decide(0.0, &inputs, proposed, profile);
        assert_eq!(out.command.linear_velocity, 0.0);
        assert!(out.command.angular_velocity <= 1.2);
        assert_eq!(out.triggered, Some("collision_imminent"));
    }

    #[test]
    fn test_clamping_to_mode_limits() {
        let config = Config::default();
        let mut sup = SafetySupervisor::new(SafetyParams::from_config(&config));
        let conservative = config.mode_profile(NavMode::Conservative);
        let out = sup.decide(0.0, &healthy_inputs(), forward(5.0), conservative);
        let cap = 0.6 * 0.6;
        assert!((out.command.linear_velocity - cap).abs() < 1e-9);
    }

    #[test]
    fn test_token_rotates_every_decision() {
        let (mut sup, profile) = supervisor();
        let a = sup.decide(0.0, &healthy_inputs(), forward(0.1), profile);
        let b = sup.decide(0.1, &healthy_inputs(), forward(0.1), profile);
        assert_ne!(a.token, b.token);
        assert_eq!(sup.current_token(), b.token);
    }

    #[test]
    fn test_estop_wins_over_bumper() {
        let (mut sup, profile) = supervisor();
        let mut inputs = healthy_inputs();
        inputs.estop = true;
        inputs.bumper_front = true;
        let out = sup.decide(0.0, &inputs, forward(0.3), profile);
        // First trigger in the ladder wins.
        assert_eq!(out.state, SupervisorState::Emergency);
        assert!(out.events.contains(&SafetyEvent::EStopPressed));
        assert!(!out
            .events
            .iter()
            .any(|e| matches!(e, SafetyEvent::BumperHit(_))));
    }
}
