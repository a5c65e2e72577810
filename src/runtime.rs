//! Task fabric. Spawns the cooperating periodic tasks, wires the bounded
//! queues and snapshot cells between them, and owns cooperative shutdown:
//! the orchestrator publishes `MissionState::Halting`, each task drains,
//! the supervisor drives the actuator to zero, and everything joins.
//!
//! Ownership is strict: each task owns its state, everything published
//! crosses a `watch` cell (atomically swapped snapshot) or a bounded
//! `mpsc` queue. The supervisor never suspends on I/O.

use crate::boundary::{BoundaryMonitor, BoundaryStatus};
use crate::config::Config;
use crate::docking::{DockDirective, DockEvent, DockInput, DockingParams, DockingStateMachine};
use crate::dwa::{DwaOutcome, DwaParams, LocalPlanner};
use crate::grid::OccupancyGrid;
use crate::localizer::{Localizer, LocalizerConfig, LocalizerEvent, LocalizerSnapshot};
use crate::mission::{MissionAction, MissionEvent, MissionOrchestrator, MissionSignal, OperatorCommand};
use crate::planner::{astar, coverage};
use crate::ports::{CommandEnvelope, PortSet};
use crate::power::{BatteryMonitor, PowerEvent};
use crate::safety::{SafetyInputs, SafetyParams, SafetySupervisor, WatchdogSource};
use crate::status::{EventStream, StatusEvent, StatusEventKind, StatusReport};
use crate::types::{
    monotonic_seconds, BatteryState, DiscreteInputs, EncoderSample, FiducialDetection, GnssFix,
    ImuSample, MissionState, MotionCommand, NavMode, Pose, SafetyEvent,
};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Lock-free heartbeat slots; tasks store the monotonic time of their last
/// beat, the supervisor copies them each tick.
pub struct HeartbeatBoard {
    slots: [AtomicU64; 4],
}

const HEARTBEAT_CLEARED: u64 = u64::MAX;

impl HeartbeatBoard {
    pub fn new() -> Arc<HeartbeatBoard> {
        Arc::new(HeartbeatBoard {
            slots: [
                AtomicU64::new(HEARTBEAT_CLEARED),
                AtomicU64::new(HEARTBEAT_CLEARED),
                AtomicU64::new(HEARTBEAT_CLEARED),
                AtomicU64::new(HEARTBEAT_CLEARED),
            ],
        })
    }

    pub fn beat(&self, source: WatchdogSource, now: f64) {
        self.slots[slot_index(source)].store(now.to_bits(), Ordering::Relaxed);
    }

    pub fn clear(&self, source: WatchdogSource) {
        self.slots[slot_index(source)].store(HEARTBEAT_CLEARED, Ordering::Relaxed);
    }

    pub fn read(&self, source: WatchdogSource) -> Option<f64> {
        let bits = self.slots[slot_index(source)].load(Ordering::Relaxed);
        if bits == HEARTBEAT_CLEARED {
            None
        } else {
            Some(f64::from_bits(bits))
        }
    }
}

fn slot_index(source: WatchdogSource) -> usize {
    match source {
        WatchdogSource::Fusion => 0,
        WatchdogSource::LocalPlanner => 1,
        WatchdogSource::Vision => 2,
        WatchdogSource::Docking => 3,
    }
}

enum SensorMsg {
    Encoder(EncoderSample),
    Imu(ImuSample),
    Gnss(GnssFix),
}

/// Operator-side handle: the boundary surface of the core.
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<OperatorCommand>,
    obstacles: mpsc::Sender<(f64, f64, f64)>,
    status_rx: watch::Receiver<StatusReport>,
    events: Arc<EventStream>,
}

impl RuntimeHandle {
    pub fn get_status(&self) -> StatusReport {
        self.status_rx.borrow().clone()
    }

    pub async fn start_mowing(&self) {
        let _ = self.commands.send(OperatorCommand::StartMowing).await;
    }

    pub async fn start_point_goto(&self, x: f64, y: f64) {
        let _ = self
            .commands
            .send(OperatorCommand::StartPointGoto { x, y })
            .await;
    }

    pub async fn return_to_dock(&self) {
        let _ = self.commands.send(OperatorCommand::ReturnToDock).await;
    }

    pub async fn emergency_stop(&self) {
        let _ = self.commands.send(OperatorCommand::EmergencyStop).await;
    }

    pub async fn reset_emergency(&self) {
        let _ = self.commands.send(OperatorCommand::ResetEmergency).await;
    }

    pub async fn halt(&self) {
        let _ = self.commands.send(OperatorCommand::Halt).await;
    }

    pub fn stream_events(&self) -> tokio::sync::broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Teach the planner a newly observed obstacle at a local-frame
    /// position; the grid writer applies it and republishes.
    pub async fn report_obstacle(&self, x: f64, y: f64, radius: f64) {
        let _ = self.obstacles.send((x, y, radius)).await;
    }
}

pub struct RuntimeOptions {
    /// Optional path for the persisted grid + coverage cursor.
    pub state_path: Option<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions { state_path: None }
    }
}

pub struct Runtime {
    pub handle: RuntimeHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Wire and spawn the whole control plane. Returns once every task has
    /// been launched; `join` waits for cooperative shutdown.
    pub fn spawn(config: Arc<Config>, ports: PortSet, options: RuntimeOptions) -> Result<Runtime> {
        let PortSet {
            drive,
            encoders,
            imu,
            gnss,
            camera,
            power,
            inputs,
            outputs,
        } = ports;

        // Snapshot cells, one per published datum.
        let (pose_tx, pose_rx) = watch::channel(LocalizerSnapshot {
            pose: Pose::origin(),
            odometry_quality: 0.0,
            degraded: false,
            frame: None,
            gnss_accepts: 0,
            gnss_rejects: 0,
        });
        let (detections_tx, detections_rx) = watch::channel(Vec::<FiducialDetection>::new());
        let (battery_tx, battery_rx) = watch::channel(BatteryState::default());
        let (attitude_tx, attitude_rx) = watch::channel((0.0f64, 0.0f64));
        let (discrete_tx, discrete_rx) = watch::channel(DiscreteInputs::default());
        let (clearance_tx, clearance_rx) = watch::channel(Option::<f64>::None);
        let (boundary_hold_tx, boundary_hold_rx) = watch::channel(false);
        let (mode_tx, mode_rx) = watch::channel(NavMode::Normal);
        let (gated_tx, gated_rx) = watch::channel(MotionCommand::stop(0.0));
        let (mission_tx, mission_rx) = watch::channel(MissionState::Idle);
        let (status_tx, status_rx) = watch::channel(StatusReport {
            mission_state: "idle".into(),
            pose: Pose::origin(),
            battery: BatteryState::default(),
            localization_quality: 0.0,
            last_fault: None,
        });

        // Bounded queues.
        let (sensor_tx, sensor_rx) = mpsc::channel::<SensorMsg>(256);
        let (proposal_tx, proposal_rx) = mpsc::channel::<MotionCommand>(4);
        let (command_tx, command_rx) = mpsc::channel::<OperatorCommand>(8);
        let (signal_tx, signal_rx) = mpsc::channel::<MissionSignal>(64);
        let (action_tx, action_rx) = mpsc::channel::<MissionAction>(16);
        let (obstacle_tx, obstacle_rx) = mpsc::channel::<(f64, f64, f64)>(16);

        let events = Arc::new(EventStream::new(256));
        let board = HeartbeatBoard::new();

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(sensor_task(
            config.clone(),
            encoders,
            imu,
            gnss,
            inputs,
            power,
            sensor_tx,
            attitude_tx,
            discrete_tx,
            battery_tx,
            events.clone(),
            mission_rx.clone(),
        )));

        tasks.push(tokio::spawn(fusion_task(
            config.clone(),
            sensor_rx,
            pose_tx,
            gated_rx,
            board.clone(),
            signal_tx.clone(),
            events.clone(),
            mission_rx.clone(),
        )));

        tasks.push(tokio::spawn(vision_task(
            config.clone(),
            camera,
            detections_tx,
            board.clone(),
            mission_rx.clone(),
        )));

        tasks.push(tokio::spawn(control_task(
            config.clone(),
            options.state_path.clone(),
            pose_rx.clone(),
            detections_rx.clone(),
            battery_rx.clone(),
            action_rx,
            obstacle_rx,
            proposal_tx,
            clearance_tx,
            mode_tx,
            board.clone(),
            signal_tx.clone(),
            mission_rx.clone(),
        )));

        tasks.push(tokio::spawn(supervisor_task(
            config.clone(),
            drive,
            outputs,
            proposal_rx,
            discrete_rx,
            attitude_rx,
            battery_rx.clone(),
            clearance_rx,
            boundary_hold_rx,
            mode_rx,
            gated_tx,
            board.clone(),
            signal_tx.clone(),
            events.clone(),
            mission_rx.clone(),
        )));

        tasks.push(tokio::spawn(mission_task(
            config.clone(),
            command_rx,
            signal_rx,
            action_tx,
            mission_tx,
            status_tx,
            boundary_hold_tx,
            pose_rx,
            battery_rx,
            events.clone(),
        )));

        Ok(Runtime {
            handle: RuntimeHandle {
                commands: command_tx,
                obstacles: obstacle_tx,
                status_rx,
                events,
            },
            tasks,
        })
    }

    /// Wait for cooperative shutdown of every task.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn halting(mission_rx: &watch::Receiver<MissionState>) -> bool {
    *mission_rx.borrow() == MissionState::Halting
}

// ─── Sensor ingest (encoders, IMU, GNSS, discretes, power) ──────────────────

#[allow(clippy::too_many_arguments)]
async fn sensor_task(
    config: Arc<Config>,
    mut encoders: Box<dyn crate::ports::Encoders>,
    mut imu: Box<dyn crate::ports::Imu>,
    mut gnss: Box<dyn crate::ports::Gnss>,
    mut inputs: Box<dyn crate::ports::DigitalInputs>,
    mut power: Box<dyn crate::ports::PowerSensor>,
    sensor_tx: mpsc::Sender<SensorMsg>,
    attitude_tx: watch::Sender<(f64, f64)>,
    discrete_tx: watch::Sender<DiscreteInputs>,
    battery_tx: watch::Sender<BatteryState>,
    events: Arc<EventStream>,
    mission_rx: watch::Receiver<MissionState>,
) {
    let mut monitor = BatteryMonitor::new(
        &config.charging.power_sensor,
        &config.safety.battery_safety,
    );
    let mut tick = interval(Duration::from_millis(10));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut slow = 0u32;

    loop {
        tick.tick().await;
        if halting(&mission_rx) {
            break;
        }

        if let Ok(sample) = encoders.read() {
            let _ = sensor_tx.try_send(SensorMsg::Encoder(sample));
        }
        if let Ok(sample) = imu.read() {
            let _ = attitude_tx.send_replace((sample.roll, sample.pitch));
            let _ = sensor_tx.try_send(SensorMsg::Imu(sample));
        }

        // Slow lane: GNSS, discretes and power at 10 Hz.
        slow += 1;
        if slow % 10 != 0 {
            continue;
        }
        if let Ok(Some(fix)) = gnss.poll() {
            let _ = sensor_tx.try_send(SensorMsg::Gnss(fix));
        }
        if let Ok(sample) = inputs.read() {
            let _ = discrete_tx.send_replace(sample);
        }
        for (name, health) in [
            ("encoders", encoders.health()),
            ("imu", imu.health()),
            ("gnss", gnss.health()),
            ("power", power.health()),
        ] {
            if !health.ok {
                log::warn!("port `{name}` unhealthy since {:.1}", health.last_update_monotonic);
            }
        }
        if let Ok(sample) = power.read_battery_bus() {
            for event in monitor.feed_battery_bus(&sample) {
                if let PowerEvent::RapidDrain { volts_per_min } = event {
                    log::warn!("battery draining at {volts_per_min:.2} V/min");
                    events.publish(StatusEvent {
                        timestamp: monotonic_seconds(),
                        kind: StatusEventKind::Fault,
                        detail: format!("rapid battery drain: {volts_per_min:.2} V/min"),
                    });
                }
            }
        }
        if let Ok(sample) = power.read_dock_bus() {
            for event in monitor.feed_dock_bus(&sample) {
                log::info!("dock contact: {event:?}");
            }
        }
        let _ = battery_tx.send_replace(monitor.state());
    }
    log::debug!("sensor task drained");
}

// ─── Fusion (50 Hz) ─────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn fusion_task(
    config: Arc<Config>,
    mut sensor_rx: mpsc::Receiver<SensorMsg>,
    pose_tx: watch::Sender<LocalizerSnapshot>,
    gated_rx: watch::Receiver<MotionCommand>,
    board: Arc<HeartbeatBoard>,
    signal_tx: mpsc::Sender<MissionSignal>,
    events: Arc<EventStream>,
    mission_rx: watch::Receiver<MissionState>,
) {
    let mut localizer = Localizer::new(LocalizerConfig::from_config(&config));
    let mut tick = interval(Duration::from_millis(20));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if halting(&mission_rx) {
                    break;
                }
                let now = monotonic_seconds();
                localizer.set_commanded_speed(gated_rx.borrow().linear_velocity);
                let tick_events = localizer.tick(now);
                publish_localizer_events(&tick_events, &signal_tx, &events).await;
                let _ = pose_tx.send_replace(localizer.snapshot());
                board.beat(WatchdogSource::Fusion, now);
            }
            msg = sensor_rx.recv() => {
                let Some(msg) = msg else { break };
                let fed = match msg {
                    SensorMsg::Encoder(s) => localizer.feed_encoders(&s),
                    SensorMsg::Imu(s) => {
                        localizer.feed_imu(&s);
                        Vec::new()
                    }
                    SensorMsg::Gnss(fix) => localizer.feed_gnss(&fix),
                };
                publish_localizer_events(&fed, &signal_tx, &events).await;
            }
        }
    }
    log::debug!("fusion task drained");
}

async fn publish_localizer_events(
    batch: &[LocalizerEvent],
    signal_tx: &mpsc::Sender<MissionSignal>,
    events: &EventStream,
) {
    for event in batch {
        match event {
            LocalizerEvent::FrameAnchored { latitude, longitude } => {
                log::info!("local frame anchored at ({latitude:.6}, {longitude:.6})");
                events.publish(StatusEvent {
                    timestamp: monotonic_seconds(),
                    kind: StatusEventKind::Localization,
                    detail: "frame anchored".into(),
                });
            }
            LocalizerEvent::Degraded { quality } => {
                log::warn!("localization degraded (quality {quality:.2})");
                let _ = signal_tx
                    .send(MissionSignal::LocalizationDegraded(true))
                    .await;
                events.publish(StatusEvent {
                    timestamp: monotonic_seconds(),
                    kind: StatusEventKind::Localization,
                    detail: "degraded".into(),
                });
            }
            LocalizerEvent::DegradedCleared => {
                let _ = signal_tx
                    .send(MissionSignal::LocalizationDegraded(false))
                    .await;
            }
            LocalizerEvent::EncoderStall => {
                log::warn!("encoder stall under commanded motion");
                events.publish(StatusEvent {
                    timestamp: monotonic_seconds(),
                    kind: StatusEventKind::Safety,
                    detail: "encoder stall".into(),
                });
            }
            LocalizerEvent::ImuSilent { gap_secs } => {
                log::warn!("IMU silent for {gap_secs:.2}s; wheel-only yaw");
            }
            LocalizerEvent::GnssDiscarded { reason } => {
                log::debug!("GNSS fix discarded: {reason:?}");
            }
        }
    }
}

// ─── Vision (frame-driven, up to 15 Hz) ─────────────────────────────────────

async fn vision_task(
    config: Arc<Config>,
    mut camera: Box<dyn crate::ports::CameraSource>,
    detections_tx: watch::Sender<Vec<FiducialDetection>>,
    board: Arc<HeartbeatBoard>,
    mission_rx: watch::Receiver<MissionState>,
) {
    let mut engine = crate::vision::FiducialEngine::new(
        &config.charging.apriltag,
        config.camera_yaw_offset_rad(),
    );
    let mut tick = interval(Duration::from_millis(66));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        if halting(&mission_rx) {
            break;
        }
        match camera.poll_frame() {
            Ok(Some(frame)) => {
                let detections = engine.process_frame(&frame);
                let _ = detections_tx.send_replace(detections);
            }
            Ok(None) => {}
            Err(err) => log::debug!("camera poll failed: {err}"),
        }
        board.beat(WatchdogSource::Vision, monotonic_seconds());
    }
    log::debug!("vision task drained");
}

// ─── Control (local planner + docking, 10–25 Hz) ────────────────────────────

struct ControlState {
    grid: Option<Arc<OccupancyGrid>>,
    planner: LocalPlanner,
    docking: Option<DockingStateMachine>,
    /// The goal to re-plan toward when the planner reports stuck.
    active_goal: Option<(f64, f64)>,
    coverage_active: bool,
    retry_at: Option<(f64, MissionAction)>,
    /// Set while docking waits for a localization frame; a stalled wait
    /// expires the sequence.
    dock_unanchored_since: Option<f64>,
    last_persist: f64,
}

#[allow(clippy::too_many_arguments)]
async fn control_task(
    config: Arc<Config>,
    state_path: Option<PathBuf>,
    pose_rx: watch::Receiver<LocalizerSnapshot>,
    detections_rx: watch::Receiver<Vec<FiducialDetection>>,
    battery_rx: watch::Receiver<BatteryState>,
    mut action_rx: mpsc::Receiver<MissionAction>,
    mut obstacle_rx: mpsc::Receiver<(f64, f64, f64)>,
    proposal_tx: mpsc::Sender<MotionCommand>,
    clearance_tx: watch::Sender<Option<f64>>,
    mode_tx: watch::Sender<NavMode>,
    board: Arc<HeartbeatBoard>,
    signal_tx: mpsc::Sender<MissionSignal>,
    mission_rx: watch::Receiver<MissionState>,
) {
    let normal_period = Duration::from_secs_f64(
        1.0 / config.dynamic_obstacle_avoidance.performance.control_rate_hz,
    );
    let docking_period = Duration::from_secs_f64(
        1.0 / config
            .dynamic_obstacle_avoidance
            .performance
            .docking_control_rate_hz,
    );

    let mut state = ControlState {
        grid: None,
        planner: LocalPlanner::new(
            DwaParams::from_config(&config),
            config.mode_profile(NavMode::Normal),
        ),
        docking: None,
        active_goal: None,
        coverage_active: false,
        retry_at: None,
        dock_unanchored_since: None,
        last_persist: 0.0,
    };

    // Restore persisted grid and coverage cursor if present.
    let mut restored_cursor = None;
    if let Some(path) = &state_path {
        match crate::persist::load(path) {
            Ok(persisted) => {
                log::info!(
                    "restored grid {}x{} and coverage cursor {}",
                    persisted.grid.width,
                    persisted.grid.height,
                    persisted.coverage_cursor
                );
                state.grid = Some(Arc::new(persisted.grid));
                restored_cursor = Some(persisted.coverage_cursor);
            }
            Err(err) => log::debug!("no persisted state: {err}"),
        }
    }

    loop {
        let period = if state.docking.is_some() {
            docking_period
        } else {
            normal_period
        };
        tokio::time::sleep(period).await;
        if halting(&mission_rx) {
            break;
        }
        let now = monotonic_seconds();
        // Beat before planning: a heavy grid build or A* run must not read
        // as starvation.
        board.beat(WatchdogSource::LocalPlanner, now);
        let snapshot = pose_rx.borrow().clone();

        // Scheduled plan retry.
        if let Some((at, action)) = state.retry_at.clone() {
            if now >= at {
                state.retry_at = None;
                handle_action(
                    &config,
                    &mut state,
                    action,
                    &snapshot,
                    restored_cursor.take(),
                    &signal_tx,
                    &board,
                )
                .await;
            }
        }

        while let Ok(action) = action_rx.try_recv() {
            handle_action(
                &config,
                &mut state,
                action,
                &snapshot,
                restored_cursor.take(),
                &signal_tx,
                &board,
            )
            .await;
        }
        let _ = mode_tx.send_replace(state.planner.mode());

        // Obstacle-learning upserts: the grid writer applies them and the
        // planner's spatial index follows.
        let mut grid_changed = false;
        while let Ok((ox, oy, radius)) = obstacle_rx.try_recv() {
            if let Some(grid_arc) = state.grid.as_mut() {
                Arc::make_mut(grid_arc).upsert_obstacle(ox, oy, radius);
                grid_changed = true;
            }
        }
        if grid_changed {
            if let Some(grid) = &state.grid {
                state.planner.set_obstacles(&grid.obstacle_points());
            }
        }

        // Clearance snapshot for the supervisor.
        let _ = clearance_tx.send_replace(state.planner.clearance_to_nearest(
            snapshot.pose.x,
            snapshot.pose.y,
        ));

        let proposal = if state.docking.is_some() {
            docking_tick(&config, &mut state, &snapshot, &detections_rx, &battery_rx, now, &signal_tx)
                .await
        } else {
            follow_tick(&mut state, &snapshot, now, &signal_tx).await
        };

        let _ = proposal_tx.try_send(proposal);
        board.beat(WatchdogSource::LocalPlanner, monotonic_seconds());
        if state.docking.is_some() {
            board.beat(WatchdogSource::Docking, monotonic_seconds());
        } else {
            board.clear(WatchdogSource::Docking);
        }

        // Periodic persistence of the grid and coverage cursor.
        if let (Some(path), Some(grid)) = (&state_path, &state.grid) {
            if now - state.last_persist > 30.0 {
                state.last_persist = now;
                let cursor = state.planner.path_cursor().unwrap_or(0);
                if let Err(err) = crate::persist::save(path, grid, cursor) {
                    log::warn!("persist failed: {err}");
                }
            }
        }
    }
    log::debug!("control task drained");
}

#[allow(clippy::too_many_arguments)]
async fn handle_action(
    config: &Config,
    state: &mut ControlState,
    action: MissionAction,
    snapshot: &LocalizerSnapshot,
    restored_cursor: Option<usize>,
    signal_tx: &mpsc::Sender<MissionSignal>,
    board: &HeartbeatBoard,
) {
    match action {
        MissionAction::StartCoverage => {
            // Remember the intent before attempting: a failed build is
            // still retryable.
            state.coverage_active = true;
            state.active_goal = None;
            if let Err(err) = build_coverage(config, state, snapshot, restored_cursor) {
                let _ = signal_tx.send(MissionSignal::PlanFailed(err)).await;
            }
        }
        MissionAction::PlanPointTo { x, y } => {
            state.coverage_active = false;
            state.active_goal = Some((x, y));
            if let Err(err) = plan_point(config, state, snapshot, x, y) {
                let _ = signal_tx.send(MissionSignal::PlanFailed(err)).await;
            }
        }
        MissionAction::BeginDocking => {
            state.docking = Some(DockingStateMachine::new(DockingParams::from_config(config)));
            state.planner.clear_path();
            state.coverage_active = false;
            board.beat(WatchdogSource::Docking, monotonic_seconds());
        }
        MissionAction::StopMotion => {
            state.planner.clear_path();
            state.docking = None;
            state.coverage_active = false;
            state.active_goal = None;
            board.clear(WatchdogSource::Docking);
        }
        MissionAction::RetryPlan { delay_secs } => {
            // Re-run whichever plan was last active.
            let action = if state.coverage_active {
                MissionAction::StartCoverage
            } else if let Some((x, y)) = state.active_goal {
                MissionAction::PlanPointTo { x, y }
            } else {
                return;
            };
            state.retry_at = Some((monotonic_seconds() + delay_secs, action));
        }
    }
}

/// Project the boundary polygon and build the occupancy grid, once.
fn ensure_grid(
    config: &Config,
    state: &mut ControlState,
    snapshot: &LocalizerSnapshot,
) -> Result<Arc<OccupancyGrid>, crate::errors::PlanError> {
    if let Some(grid) = &state.grid {
        return Ok(grid.clone());
    }
    let frame = snapshot
        .frame
        .ok_or(crate::errors::PlanError::EmptyPolygon)?;
    let polygon: Vec<(f64, f64)> = config
        .navigation
        .boundary_coordinates
        .iter()
        .map(|p| frame.to_local(*p))
        .collect();
    let planning = &config.navigation.path_planning;
    let inflation = config.dynamic_obstacle_avoidance.robot_physics.radius
        + planning.obstacle_padding;
    let grid = Arc::new(OccupancyGrid::from_boundary(
        &polygon,
        planning.grid_resolution,
        planning.grid_margin,
        inflation,
        planning.inflation_metric,
    )?);
    state.grid = Some(grid.clone());
    Ok(grid)
}

fn build_coverage(
    config: &Config,
    state: &mut ControlState,
    snapshot: &LocalizerSnapshot,
    restored_cursor: Option<usize>,
) -> Result<(), crate::errors::PlanError> {
    let grid = ensure_grid(config, state, snapshot)?;
    let frame = snapshot
        .frame
        .ok_or(crate::errors::PlanError::EmptyPolygon)?;
    let polygon: Vec<(f64, f64)> = config
        .navigation
        .boundary_coordinates
        .iter()
        .map(|p| frame.to_local(*p))
        .collect();
    let mowing = &config.navigation.missions.mowing;
    let plan = coverage::plan_coverage(
        &polygon,
        &coverage::CoverageParams {
            brush_width: mowing.brush_width,
            overlap: mowing.overlap,
            max_waypoint_step: config.navigation.path_planning.max_waypoint_step,
            waypoint_tolerance: config
                .dynamic_obstacle_avoidance
                .performance
                .waypoint_tolerance,
        },
    )?;
    log::info!(
        "coverage plan: {} strips, {:.0} m",
        plan.strip_count,
        plan.path.total_length()
    );
    let mut path = plan.path;
    if let Some(cursor) = restored_cursor {
        path.seek(cursor);
    }
    state.planner.set_obstacles(&grid.obstacle_points());
    state.planner.set_path(path);
    Ok(())
}

fn plan_point(
    config: &Config,
    state: &mut ControlState,
    snapshot: &LocalizerSnapshot,
    x: f64,
    y: f64,
) -> Result<(), crate::errors::PlanError> {
    let grid = ensure_grid(config, state, snapshot)?;
    let planning = &config.navigation.path_planning;
    let cells = astar::plan(
        &grid,
        (snapshot.pose.x, snapshot.pose.y),
        (x, y),
        planning.inflated_cell_penalty,
    )?;
    let smoothed = astar::smooth(&grid, &cells);
    let path = astar::to_path(
        &grid,
        &smoothed,
        planning.max_waypoint_step,
        config
            .dynamic_obstacle_avoidance
            .performance
            .waypoint_tolerance,
    );
    state.planner.set_obstacles(&grid.obstacle_points());
    state.planner.set_path(path);
    Ok(())
}

async fn follow_tick(
    state: &mut ControlState,
    snapshot: &LocalizerSnapshot,
    now: f64,
    signal_tx: &mpsc::Sender<MissionSignal>,
) -> MotionCommand {
    if !state.planner.has_path() {
        return MotionCommand::stop(now + 0.5);
    }
    let outcome = state.planner.tick(&snapshot.pose, now);
    if state.coverage_active {
        if let Some(cursor) = state.planner.path_cursor() {
            let _ = signal_tx.try_send(MissionSignal::CoverageCursor(cursor));
        }
    }
    match outcome {
        DwaOutcome::Command(cmd) => cmd,
        DwaOutcome::GoalReached(cmd) => {
            state.planner.clear_path();
            state.coverage_active = false;
            state.active_goal = None;
            let _ = signal_tx.send(MissionSignal::GoalReached).await;
            cmd
        }
        DwaOutcome::Stuck { command, replan } => {
            if replan {
                log::warn!("local planner stuck; requesting replan");
                let _ = signal_tx
                    .send(MissionSignal::PlanFailed(
                        crate::errors::PlanError::PathNotFound {
                            from_x: snapshot.pose.x,
                            from_y: snapshot.pose.y,
                            to_x: state.active_goal.map(|g| g.0).unwrap_or(snapshot.pose.x),
                            to_y: state.active_goal.map(|g| g.1).unwrap_or(snapshot.pose.y),
                        },
                    ))
                    .await;
            }
            command
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn docking_tick(
    config: &Config,
    state: &mut ControlState,
    snapshot: &LocalizerSnapshot,
    detections_rx: &watch::Receiver<Vec<FiducialDetection>>,
    battery_rx: &watch::Receiver<BatteryState>,
    now: f64,
    signal_tx: &mpsc::Sender<MissionSignal>,
) -> MotionCommand {
    let Some(frame) = snapshot.frame else {
        // No anchor yet: hold, and expire the sequence if the frame never
        // arrives.
        let since = *state.dock_unanchored_since.get_or_insert(now);
        if now - since > 10.0 {
            state.dock_unanchored_since = None;
            state.docking = None;
            let _ = signal_tx.send(MissionSignal::Timeout).await;
        }
        return MotionCommand::stop(now + 0.5);
    };
    state.dock_unanchored_since = None;
    let dock_local = frame.to_local(config.dock_point());
    let station_id = config.charging.apriltag.station_tag_id;
    let marker = detections_rx
        .borrow()
        .iter()
        .find(|d| d.marker_id == station_id)
        .copied();

    let input = DockInput {
        now,
        pose: snapshot.pose,
        dock_local,
        marker,
        battery: *battery_rx.borrow(),
    };

    let Some(docking) = state.docking.as_mut() else {
        return MotionCommand::stop(now + 0.5);
    };
    let (directive, events) = docking.tick(&input);
    for event in events {
        match event {
            DockEvent::PhaseChanged { from, to } => {
                log::info!("docking: {from:?} -> {to:?}");
                if let Some(phase) = to.as_return_phase() {
                    let _ = signal_tx.try_send(MissionSignal::DockPhase(phase));
                }
            }
            DockEvent::RangeRegression { seen_min, now } => {
                log::warn!("dock range regressed: {seen_min:.2} -> {now:.2} m");
            }
            DockEvent::MarkerLost { gap_secs } => {
                log::warn!("dock marker lost for {gap_secs:.1}s");
            }
            DockEvent::RetryConsumed { remaining } => {
                log::warn!("dock retry consumed, {remaining} left");
            }
        }
    }

    let ttl = now + 0.5;
    match directive {
        DockDirective::PlanTraverse { x, y } => {
            if let Err(err) = plan_point(config, state, snapshot, x, y) {
                let _ = signal_tx.send(MissionSignal::PlanFailed(err)).await;
                return MotionCommand::stop(ttl);
            }
            MotionCommand::stop(ttl)
        }
        DockDirective::FollowTraverse => match state.planner.tick(&snapshot.pose, now) {
            DwaOutcome::Command(cmd) => cmd,
            DwaOutcome::GoalReached(cmd) => cmd,
            DwaOutcome::Stuck { command, .. } => command,
        },
        DockDirective::Drive { path, speed_cap } => {
            state.planner.set_path(path);
            let mut cmd = state.planner.tick(&snapshot.pose, now).command();
            cmd.linear_velocity = cmd.linear_velocity.min(speed_cap);
            cmd
        }
        DockDirective::Spin { angular_velocity } => MotionCommand {
            linear_velocity: 0.0,
            angular_velocity,
            deadline_monotonic: ttl,
        },
        DockDirective::Creep { linear_velocity } => MotionCommand {
            linear_velocity,
            angular_velocity: 0.0,
            deadline_monotonic: ttl,
        },
        DockDirective::Hold => MotionCommand::stop(ttl),
        DockDirective::Docked => {
            state.docking = None;
            state.planner.clear_path();
            let _ = signal_tx.send(MissionSignal::DockDocked).await;
            MotionCommand::stop(ttl)
        }
        DockDirective::Failed { reason } => {
            state.docking = None;
            state.planner.clear_path();
            let _ = signal_tx.send(MissionSignal::DockFailed(reason)).await;
            MotionCommand::stop(ttl)
        }
    }
}

// ─── Safety supervisor (100 Hz + every proposal) ────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn supervisor_task(
    config: Arc<Config>,
    mut drive: Box<dyn crate::ports::DifferentialDrive>,
    mut outputs: Box<dyn crate::ports::Outputs>,
    mut proposal_rx: mpsc::Receiver<MotionCommand>,
    discrete_rx: watch::Receiver<DiscreteInputs>,
    attitude_rx: watch::Receiver<(f64, f64)>,
    battery_rx: watch::Receiver<BatteryState>,
    clearance_rx: watch::Receiver<Option<f64>>,
    boundary_hold_rx: watch::Receiver<bool>,
    mode_rx: watch::Receiver<NavMode>,
    gated_tx: watch::Sender<MotionCommand>,
    board: Arc<HeartbeatBoard>,
    signal_tx: mpsc::Sender<MissionSignal>,
    events: Arc<EventStream>,
    mission_rx: watch::Receiver<MissionState>,
) {
    let mut supervisor = SafetySupervisor::new(SafetyParams::from_config(&config));
    let mut tick = interval(Duration::from_millis(10));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut proposal = MotionCommand::stop(0.0);
    let mut dock_request_sent = false;
    let mut proposals_open = true;
    let mut buzzing = false;

    loop {
        // Decide on every actuator write boundary and on the 100 Hz tick,
        // whichever comes sooner.
        tokio::select! {
            _ = tick.tick() => {}
            incoming = proposal_rx.recv(), if proposals_open => {
                match incoming {
                    Some(cmd) => proposal = cmd,
                    None => proposals_open = false,
                }
            }
        }
        let now = monotonic_seconds();

        // Copy heartbeat slots; the supervisor itself never blocks on the
        // producing tasks.
        for source in [
            WatchdogSource::Fusion,
            WatchdogSource::LocalPlanner,
            WatchdogSource::Vision,
            WatchdogSource::Docking,
        ] {
            match board.read(source) {
                Some(beat) => supervisor.heartbeat(source, beat),
                None => supervisor.clear_heartbeat(source),
            }
        }

        // An expired proposal is treated as zero.
        let proposed = if now > proposal.deadline_monotonic {
            MotionCommand::stop(now + 0.1)
        } else {
            proposal
        };

        let (roll, pitch) = *attitude_rx.borrow();
        let discrete = *discrete_rx.borrow();
        let mut min_clearance = *clearance_rx.borrow();
        if *boundary_hold_rx.borrow() {
            // Boundary deviation is enforced like an imminent collision:
            // zero linear, bounded angular, until the pose recovers.
            min_clearance = Some(0.0);
        }
        let inputs = SafetyInputs {
            estop: discrete.estop,
            bumper_front: discrete.bumper_front,
            bumper_rear: discrete.bumper_rear,
            roll,
            pitch,
            battery: *battery_rx.borrow(),
            min_clearance,
        };
        let profile = config.mode_profile(*mode_rx.borrow());
        let arbitration = supervisor.decide(now, &inputs, proposed, profile);

        for event in &arbitration.events {
            log::warn!("safety event: {event:?}");
            events.publish(StatusEvent {
                timestamp: now,
                kind: StatusEventKind::Safety,
                detail: format!("{event:?}"),
            });
            let _ = signal_tx.try_send(MissionSignal::Safety(*event));
        }
        match (arbitration.dock_requested, dock_request_sent) {
            (true, false) => {
                dock_request_sent = true;
                let _ = signal_tx.try_send(MissionSignal::BatteryDockRequest);
            }
            (false, true) => dock_request_sent = false,
            _ => {}
        }

        let envelope = CommandEnvelope {
            command: arbitration.command,
            token: arbitration.token,
        };
        if let Err(err) = drive.apply(&envelope, supervisor.current_token()) {
            log::error!("drive write failed: {err}");
        }
        let _ = gated_tx.send_replace(arbitration.command);

        let emergency = arbitration.state == crate::safety::SupervisorState::Emergency;
        if emergency != buzzing {
            buzzing = emergency;
            if let Err(err) = outputs.buzzer(emergency) {
                log::debug!("buzzer write failed: {err}");
            }
        }

        if halting(&mission_rx) {
            // Final zero through the supervisor before exit.
            let stop = supervisor.decide(
                monotonic_seconds(),
                &inputs,
                MotionCommand::stop(now + 1.0),
                config.mode_profile(NavMode::Emergency),
            );
            let _ = drive.apply(
                &CommandEnvelope {
                    command: MotionCommand::stop(now + 1.0),
                    token: stop.token,
                },
                supervisor.current_token(),
            );
            break;
        }
    }
    log::debug!("supervisor task drained");
}

// ─── Mission orchestrator (event-driven + 1 Hz heartbeat) ───────────────────

#[allow(clippy::too_many_arguments)]
async fn mission_task(
    config: Arc<Config>,
    mut command_rx: mpsc::Receiver<OperatorCommand>,
    mut signal_rx: mpsc::Receiver<MissionSignal>,
    action_tx: mpsc::Sender<MissionAction>,
    mission_tx: watch::Sender<MissionState>,
    status_tx: watch::Sender<StatusReport>,
    boundary_hold_tx: watch::Sender<bool>,
    pose_rx: watch::Receiver<LocalizerSnapshot>,
    battery_rx: watch::Receiver<BatteryState>,
    events: Arc<EventStream>,
) {
    let mut orchestrator = MissionOrchestrator::new(
        config
            .dynamic_obstacle_avoidance
            .performance
            .max_replanning_frequency,
    );
    let mut boundary: Option<BoundaryMonitor> = None;
    let mut last_fault: Option<String> = None;
    let mut heartbeat = interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut boundary_tick = interval(Duration::from_millis(100));
    boundary_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let (mission_events, actions) = tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                orchestrator.handle_command(command)
            }
            signal = signal_rx.recv() => {
                let Some(signal) = signal else { break };
                orchestrator.handle_signal(signal)
            }
            _ = heartbeat.tick() => {
                let snapshot = pose_rx.borrow().clone();
                let _ = status_tx.send_replace(StatusReport {
                    mission_state: orchestrator.state().name().into(),
                    pose: snapshot.pose,
                    battery: *battery_rx.borrow(),
                    localization_quality: snapshot.odometry_quality,
                    last_fault: last_fault.clone(),
                });
                (Vec::new(), Vec::new())
            }
            _ = boundary_tick.tick() => {
                check_boundary(&config, &mut boundary, &pose_rx, &boundary_hold_tx, &events);
                (Vec::new(), Vec::new())
            }
        };

        for event in mission_events {
            match event {
                MissionEvent::StateChanged { from, to } => {
                    events.publish(StatusEvent {
                        timestamp: monotonic_seconds(),
                        kind: StatusEventKind::StateTransition,
                        detail: format!("{from} -> {to}"),
                    });
                }
                MissionEvent::CommandRejected { reason } => {
                    log::warn!("operator command rejected: {reason}");
                    events.publish(StatusEvent {
                        timestamp: monotonic_seconds(),
                        kind: StatusEventKind::Fault,
                        detail: format!("command rejected: {reason}"),
                    });
                }
                MissionEvent::Fault { kind, detail } => {
                    last_fault = Some(detail.clone());
                    events.publish(StatusEvent {
                        timestamp: monotonic_seconds(),
                        kind: StatusEventKind::Fault,
                        detail,
                    });
                    log::warn!("mission fault: {kind:?}");
                }
            }
        }
        for action in actions {
            let _ = action_tx.send(action).await;
        }

        let state = orchestrator.state().clone();
        let is_halt = state == MissionState::Halting;
        let _ = mission_tx.send_replace(state);
        if is_halt {
            log::info!("mission halting; tasks draining");
            break;
        }
    }
    log::debug!("mission task drained");
}

fn check_boundary(
    config: &Config,
    boundary: &mut Option<BoundaryMonitor>,
    pose_rx: &watch::Receiver<LocalizerSnapshot>,
    boundary_hold_tx: &watch::Sender<bool>,
    events: &EventStream,
) {
    let snapshot = pose_rx.borrow().clone();
    if boundary.is_none() {
        let Some(frame) = snapshot.frame else { return };
        if config.navigation.boundary_coordinates.len() < 3 {
            return;
        }
        let polygon: Vec<(f64, f64)> = config
            .navigation
            .boundary_coordinates
            .iter()
            .map(|p| frame.to_local(*p))
            .collect();
        match BoundaryMonitor::new(&polygon, &config.navigation.boundary_safety) {
            Ok(monitor) => *boundary = Some(monitor),
            Err(err) => {
                log::warn!("boundary monitor unavailable: {err}");
                return;
            }
        }
    }
    let Some(monitor) = boundary.as_mut() else {
        return;
    };
    match monitor.check(&snapshot.pose, monotonic_seconds()) {
        Some(BoundaryStatus::Deviation { distance_m }) => {
            if !*boundary_hold_tx.borrow() {
                log::error!("boundary deviation: {distance_m:.2} m");
                events.publish(StatusEvent {
                    timestamp: monotonic_seconds(),
                    kind: StatusEventKind::Safety,
                    detail: format!("{:?}", SafetyEvent::BoundaryDeviation { distance_m }),
                });
            }
            let _ = boundary_hold_tx.send_replace(true);
        }
        Some(BoundaryStatus::Warning { margin_m }) => {
            log::debug!("boundary warning: {margin_m:.2} m of margin");
            let _ = boundary_hold_tx.send_replace(false);
        }
        Some(BoundaryStatus::Inside) => {
            let _ = boundary_hold_tx.send_replace(false);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWorld;

    fn sim_config() -> Arc<Config> {
        let mut config = Config::default();
        config.simulation.enabled = true;
        // Small square boundary around the sim anchor; keeps the grid tiny.
        config.navigation.boundary_coordinates = vec![
            crate::types::GeodeticPoint::new(40.9999, 28.9999),
            crate::types::GeodeticPoint::new(40.9999, 29.0001),
            crate::types::GeodeticPoint::new(41.0001, 29.0001),
            crate::types::GeodeticPoint::new(41.0001, 28.9999),
        ];
        config.charging.gps_dock.latitude = 41.00005;
        config.charging.gps_dock.longitude = 29.00005;
        Arc::new(config)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runtime_starts_and_halts_cleanly() {
        let config = sim_config();
        let world = SimWorld::new(&config);
        let runtime =
            Runtime::spawn(config, world.ports(), RuntimeOptions::default()).unwrap();
        let handle = runtime.handle.clone();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = handle.get_status();
        assert_eq!(status.mission_state, "idle");

        handle.halt().await;
        tokio::time::timeout(Duration::from_secs(5), runtime.join())
            .await
            .expect("runtime joined within timeout");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_point_goto_drives_the_robot() {
        let config = sim_config();
        let world = SimWorld::new(&config);
        let runtime =
            Runtime::spawn(config, world.ports(), RuntimeOptions::default()).unwrap();
        let handle = runtime.handle.clone();
        let mut events = handle.stream_events();

        // Let the first GNSS fix anchor the frame.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        handle.start_point_goto(3.0, 0.0).await;

        // The mission transitions and the pose starts moving.
        let mut saw_transition = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            if let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(200), events.recv()).await
            {
                if event.detail.contains("point_goto") {
                    saw_transition = true;
                    break;
                }
            }
        }
        assert!(saw_transition, "expected a state transition event");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = handle.get_status();
        assert!(
            status.pose.x > 0.05,
            "robot should have moved, pose {:?}",
            status.pose
        );

        handle.halt().await;
        tokio::time::timeout(Duration::from_secs(5), runtime.join())
            .await
            .expect("runtime joined");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_emergency_stop_latches_error_state() {
        let config = sim_config();
        let world = SimWorld::new(&config);
        let runtime =
            Runtime::spawn(config, world.ports(), RuntimeOptions::default()).unwrap();
        let handle = runtime.handle.clone();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.emergency_stop().await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(handle.get_status().mission_state, "error");

        handle.reset_emergency().await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(handle.get_status().mission_state, "idle");

        handle.halt().await;
        tokio::time::timeout(Duration::from_secs(5), runtime.join())
            .await
            .expect("runtime joined");
    }
}
