//! Mission orchestrator: the single writer of [`MissionState`]. Operator
//! commands and subsystem signals drive the top-level state machine; every
//! transition is serialized through this struct and published as a snapshot.

use crate::docking::DockFailure;
use crate::errors::PlanError;
use crate::types::{FaultKind, MissionState, ReturnPhase, SafetyEvent};

#[derive(Clone, Debug, PartialEq)]
pub enum OperatorCommand {
    StartMowing,
    StartPointGoto { x: f64, y: f64 },
    ReturnToDock,
    EmergencyStop,
    ResetEmergency,
    Halt,
}

/// Signals from the other subsystems, routed by the runtime.
#[derive(Clone, Debug)]
pub enum MissionSignal {
    /// Local planner exhausted the active path.
    GoalReached,
    PlanFailed(PlanError),
    DockPhase(ReturnPhase),
    DockDocked,
    DockFailed(DockFailure),
    Safety(SafetyEvent),
    /// Supervisor requests the dock on battery grounds.
    BatteryDockRequest,
    LocalizationDegraded(bool),
    /// Coverage progress bookkeeping from the local planner.
    CoverageCursor(usize),
    /// External deadline expired (plan, search, phase).
    Timeout,
}

/// Side effects the runtime must execute after a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum MissionAction {
    StartCoverage,
    PlanPointTo { x: f64, y: f64 },
    BeginDocking,
    StopMotion,
    /// Retry the failed plan after a delay [s].
    RetryPlan { delay_secs: f64 },
}

#[derive(Clone, Debug)]
pub enum MissionEvent {
    StateChanged {
        from: &'static str,
        to: &'static str,
    },
    CommandRejected {
        reason: &'static str,
    },
    Fault {
        kind: FaultKind,
        detail: String,
    },
}

pub struct MissionOrchestrator {
    state: MissionState,
    degraded: bool,
    plan_retries_left: u32,
    plan_retry_budget: u32,
    plan_retry_delay: f64,
}

impl MissionOrchestrator {
    pub fn new(max_replanning_frequency: f64) -> Self {
        let delay = if max_replanning_frequency > 0.0 {
            1.0 / max_replanning_frequency
        } else {
            2.0
        };
        MissionOrchestrator {
            state: MissionState::Idle,
            degraded: false,
            plan_retries_left: 3,
            plan_retry_budget: 3,
            plan_retry_delay: delay,
        }
    }

    pub fn state(&self) -> &MissionState {
        &self.state
    }

    /// Coverage cursor bookkeeping while mowing; persisted across runs.
    pub fn note_coverage_cursor(&mut self, cursor: usize) {
        if let MissionState::Mowing { cursor: c } = &mut self.state {
            *c = cursor;
        }
    }

    pub fn handle_command(
        &mut self,
        command: OperatorCommand,
    ) -> (Vec<MissionEvent>, Vec<MissionAction>) {
        let mut events = Vec::new();
        let mut actions = Vec::new();

        match (&self.state, command) {
            (MissionState::Halting, _) => {
                events.push(MissionEvent::CommandRejected { reason: "halting" });
            }

            (_, OperatorCommand::EmergencyStop) => {
                self.transition(
                    MissionState::Error {
                        kind: FaultKind::Safety,
                    },
                    &mut events,
                );
                actions.push(MissionAction::StopMotion);
            }

            (MissionState::Error { .. }, OperatorCommand::ResetEmergency) => {
                self.transition(MissionState::Idle, &mut events);
            }
            (_, OperatorCommand::ResetEmergency) => {
                events.push(MissionEvent::CommandRejected {
                    reason: "not_in_error",
                });
            }

            (_, OperatorCommand::Halt) => {
                self.transition(MissionState::Halting, &mut events);
                actions.push(MissionAction::StopMotion);
            }

            (MissionState::Error { .. }, _) => {
                events.push(MissionEvent::CommandRejected {
                    reason: "error_latched",
                });
            }

            (MissionState::Idle, OperatorCommand::StartMowing) => {
                if self.degraded {
                    events.push(MissionEvent::CommandRejected {
                        reason: "localization_degraded",
                    });
                } else {
                    self.plan_retries_left = self.plan_retry_budget;
                    self.transition(MissionState::Mowing { cursor: 0 }, &mut events);
                    actions.push(MissionAction::StartCoverage);
                }
            }
            (_, OperatorCommand::StartMowing) => {
                events.push(MissionEvent::CommandRejected { reason: "busy" });
            }

            (MissionState::Idle, OperatorCommand::StartPointGoto { x, y }) => {
                self.plan_retries_left = self.plan_retry_budget;
                self.transition(
                    MissionState::PointGoto {
                        target_x: x,
                        target_y: y,
                    },
                    &mut events,
                );
                actions.push(MissionAction::PlanPointTo { x, y });
            }
            (_, OperatorCommand::StartPointGoto { .. }) => {
                events.push(MissionEvent::CommandRejected { reason: "busy" });
            }

            (MissionState::Returning { .. } | MissionState::Charging, OperatorCommand::ReturnToDock) => {
                events.push(MissionEvent::CommandRejected {
                    reason: "already_returning",
                });
            }
            (_, OperatorCommand::ReturnToDock) => {
                self.transition(
                    MissionState::Returning {
                        phase: ReturnPhase::GnssTraverse,
                    },
                    &mut events,
                );
                actions.push(MissionAction::BeginDocking);
            }
        }

        (events, actions)
    }

    pub fn handle_signal(
        &mut self,
        signal: MissionSignal,
    ) -> (Vec<MissionEvent>, Vec<MissionAction>) {
        let mut events = Vec::new();
        let mut actions = Vec::new();

        match signal {
            MissionSignal::GoalReached => match self.state {
                MissionState::Mowing { .. } | MissionState::PointGoto { .. } => {
                    self.transition(MissionState::Idle, &mut events);
                    actions.push(MissionAction::StopMotion);
                }
                _ => {}
            },

            MissionSignal::PlanFailed(err) => {
                let retrying = self.plan_retries_left > 0
                    && matches!(
                        self.state,
                        MissionState::Mowing { .. } | MissionState::PointGoto { .. }
                    );
                events.push(MissionEvent::Fault {
                    kind: FaultKind::PlanningFailed,
                    detail: err.to_string(),
                });
                if retrying {
                    self.plan_retries_left -= 1;
                    actions.push(MissionAction::RetryPlan {
                        delay_secs: self.plan_retry_delay,
                    });
                } else {
                    self.transition(
                        MissionState::Error {
                            kind: FaultKind::PlanningFailed,
                        },
                        &mut events,
                    );
                    actions.push(MissionAction::StopMotion);
                }
            }

            MissionSignal::DockPhase(phase) => {
                if matches!(self.state, MissionState::Returning { .. }) {
                    self.transition(MissionState::Returning { phase }, &mut events);
                }
            }

            MissionSignal::DockDocked => {
                self.transition(MissionState::Charging, &mut events);
                actions.push(MissionAction::StopMotion);
            }

            MissionSignal::DockFailed(reason) => {
                events.push(MissionEvent::Fault {
                    kind: FaultKind::DockingFailed,
                    detail: format!("{reason:?}"),
                });
                self.transition(
                    MissionState::Error {
                        kind: FaultKind::DockingFailed,
                    },
                    &mut events,
                );
                actions.push(MissionAction::StopMotion);
            }

            MissionSignal::Safety(event) => match event {
                SafetyEvent::EStopPressed | SafetyEvent::WatchdogStarved => {
                    self.transition(
                        MissionState::Error {
                            kind: FaultKind::Safety,
                        },
                        &mut events,
                    );
                    actions.push(MissionAction::StopMotion);
                }
                // The supervisor keeps override authority during docking: a
                // contact-level event aborts the sequence.
                SafetyEvent::BumperHit(_) | SafetyEvent::TiltExceeded { .. }
                    if matches!(self.state, MissionState::Returning { .. }) =>
                {
                    events.push(MissionEvent::Fault {
                        kind: FaultKind::DockingFailed,
                        detail: "docking aborted by safety event".into(),
                    });
                    self.transition(
                        MissionState::Error {
                            kind: FaultKind::DockingFailed,
                        },
                        &mut events,
                    );
                    actions.push(MissionAction::StopMotion);
                }
                // Otherwise bumper, tilt, collision and boundary events are
                // braked by the supervisor without changing the mission.
                _ => {}
            },

            MissionSignal::BatteryDockRequest => match self.state {
                MissionState::Returning { .. }
                | MissionState::Charging
                | MissionState::Halting
                | MissionState::Error { .. } => {}
                _ => {
                    self.transition(
                        MissionState::Returning {
                            phase: ReturnPhase::GnssTraverse,
                        },
                        &mut events,
                    );
                    actions.push(MissionAction::BeginDocking);
                }
            },

            MissionSignal::LocalizationDegraded(degraded) => {
                self.degraded = degraded;
            }

            MissionSignal::CoverageCursor(cursor) => {
                self.note_coverage_cursor(cursor);
            }

            MissionSignal::Timeout => {
                events.push(MissionEvent::Fault {
                    kind: FaultKind::Timeout,
                    detail: "operation deadline expired".into(),
                });
                self.transition(
                    MissionState::Error {
                        kind: FaultKind::Timeout,
                    },
                    &mut events,
                );
                actions.push(MissionAction::StopMotion);
            }
        }

        (events, actions)
    }

    fn transition(&mut self, to: MissionState, events: &mut Vec<MissionEvent>) {
        if self.state != to {
            events.push(MissionEvent::StateChanged {
                from: self.state.name(),
                to: to.name(),
            });
            log::info!("mission: {} -> {}", self.state.name(), to.name());
            self.state = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> MissionOrchestrator {
        MissionOrchestrator::new(0.5)
    }

    #[test]
    fn test_idle_to_mowing() {
        let mut m = orchestrator();
        let (events, actions) = m.handle_command(OperatorCommand::StartMowing);
        assert!(matches!(m.state(), MissionState::Mowing { cursor: 0 }));
        assert!(actions.contains(&MissionAction::StartCoverage));
        assert!(events
            .iter()
            .any(|e| matches!(e, MissionEvent::StateChanged { .. })));
    }

    #[test]
    fn test_mowing_refused_while_degraded() {
        let mut m = orchestrator();
        m.handle_signal(MissionSignal::LocalizationDegraded(true));
        let (events, actions) = m.handle_command(OperatorCommand::StartMowing);
        assert_eq!(*m.state(), MissionState::Idle);
        assert!(actions.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, MissionEvent::CommandRejected { .. })));
        // Recovery clears the refusal.
        m.handle_signal(MissionSignal::LocalizationDegraded(false));
        m.handle_command(OperatorCommand::StartMowing);
        assert!(matches!(m.state(), MissionState::Mowing { .. }));
    }

    #[test]
    fn test_second_mission_rejected_while_busy() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartMowing);
        let (events, _) = m.handle_command(OperatorCommand::StartPointGoto { x: 1.0, y: 2.0 });
        assert!(matches!(m.state(), MissionState::Mowing { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, MissionEvent::CommandRejected { .. })));
    }

    #[test]
    fn test_goal_reached_returns_to_idle() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartPointGoto { x: 3.0, y: 0.0 });
        let (_, actions) = m.handle_signal(MissionSignal::GoalReached);
        assert_eq!(*m.state(), MissionState::Idle);
        assert!(actions.contains(&MissionAction::StopMotion));
    }

    #[test]
    fn test_return_to_dock_interrupts_mowing() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartMowing);
        let (_, actions) = m.handle_command(OperatorCommand::ReturnToDock);
        assert!(matches!(m.state(), MissionState::Returning { .. }));
        assert!(actions.contains(&MissionAction::BeginDocking));
    }

    #[test]
    fn test_docked_transitions_to_charging() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::ReturnToDock);
        m.handle_signal(MissionSignal::DockPhase(ReturnPhase::Contact));
        assert!(matches!(
            m.state(),
            MissionState::Returning {
                phase: ReturnPhase::Contact
            }
        ));
        m.handle_signal(MissionSignal::DockDocked);
        assert_eq!(*m.state(), MissionState::Charging);
    }

    #[test]
    fn test_plan_failure_retries_then_errors() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartPointGoto { x: 1.0, y: 1.0 });
        for _ in 0..3 {
            let (_, actions) = m.handle_signal(MissionSignal::PlanFailed(PlanError::PathNotFound {
                from_x: 0.0,
                from_y: 0.0,
                to_x: 1.0,
                to_y: 1.0,
            }));
            assert!(actions
                .iter()
                .any(|a| matches!(a, MissionAction::RetryPlan { .. })));
        }
        // Budget exhausted.
        let (_, actions) = m.handle_signal(MissionSignal::PlanFailed(PlanError::EmptyPolygon));
        assert!(matches!(
            m.state(),
            MissionState::Error {
                kind: FaultKind::PlanningFailed
            }
        ));
        assert!(actions.contains(&MissionAction::StopMotion));
    }

    #[test]
    fn test_battery_dock_request_preempts_mowing_once() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartMowing);
        let (_, actions) = m.handle_signal(MissionSignal::BatteryDockRequest);
        assert!(matches!(m.state(), MissionState::Returning { .. }));
        assert!(actions.contains(&MissionAction::BeginDocking));
        // Repeated requests while returning are no-ops.
        let (_, actions) = m.handle_signal(MissionSignal::BatteryDockRequest);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_estop_latches_error_until_reset() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartMowing);
        m.handle_command(OperatorCommand::EmergencyStop);
        assert!(matches!(m.state(), MissionState::Error { .. }));
        // Commands rejected while latched.
        let (events, _) = m.handle_command(OperatorCommand::StartMowing);
        assert!(events
            .iter()
            .any(|e| matches!(e, MissionEvent::CommandRejected { .. })));
        m.handle_command(OperatorCommand::ResetEmergency);
        assert_eq!(*m.state(), MissionState::Idle);
    }

    #[test]
    fn test_bumper_during_docking_aborts() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::ReturnToDock);
        let (_, actions) = m.handle_signal(MissionSignal::Safety(SafetyEvent::BumperHit(
            crate::types::BumperSide::Front,
        )));
        assert!(matches!(
            m.state(),
            MissionState::Error {
                kind: FaultKind::DockingFailed
            }
        ));
        assert!(actions.contains(&MissionAction::StopMotion));
    }

    #[test]
    fn test_bumper_while_mowing_keeps_mission() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartMowing);
        let (_, actions) = m.handle_signal(MissionSignal::Safety(SafetyEvent::BumperHit(
            crate::types::BumperSide::Front,
        )));
        assert!(matches!(m.state(), MissionState::Mowing { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_halting_is_terminal() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::Halt);
        assert_eq!(*m.state(), MissionState::Halting);
        let (events, actions) = m.handle_command(OperatorCommand::StartMowing);
        assert!(actions.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, MissionEvent::CommandRejected { .. })));
    }

    #[test]
    fn test_cursor_bookkeeping() {
        let mut m = orchestrator();
        m.handle_command(OperatorCommand::StartMowing);
        m.note_coverage_cursor(17);
        assert!(matches!(m.state(), MissionState::Mowing { cursor: 17 }));
    }
}
