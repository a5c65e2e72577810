//! Synthetic port generators for simulation mode. A shared kinematic world
//! integrates the commanded velocities; every port reads its slice of that
//! world. Deterministic apart from wall time, good enough for end-to-end
//! smoke runs without hardware.

use crate::config::Config;
use crate::errors::PortError;
use crate::geodesy::LocalFrame;
use crate::ports::{
    CameraSource, CommandEnvelope, DifferentialDrive, DigitalInputs as DigitalInputsPort,
    Encoders, Gnss, Imu, Outputs, PortHealth, PortSet, PowerSensor,
};
use crate::types::{
    CameraFrame, DiscreteInputs, EncoderSample, FixQuality, GeodeticPoint, GnssFix, ImuSample,
    PowerSample,
};
use std::sync::{Arc, Mutex};

struct WorldState {
    x: f64,
    y: f64,
    theta: f64,
    v: f64,
    w: f64,
    left_ticks: f64,
    right_ticks: f64,
    last_step: f64,
    last_gnss: f64,
}

pub struct SimWorld {
    state: Arc<Mutex<WorldState>>,
    meters_per_tick: f64,
    wheel_base: f64,
    frame: LocalFrame,
    dock_local: (f64, f64),
    battery_voltage: f64,
}

impl SimWorld {
    pub fn new(config: &Config) -> Arc<SimWorld> {
        // Start at the centroid of the work area so the first fix lands
        // well inside the boundary.
        let boundary = &config.navigation.boundary_coordinates;
        let anchor = if boundary.is_empty() {
            GeodeticPoint::new(41.0, 29.0)
        } else {
            let n = boundary.len() as f64;
            GeodeticPoint::new(
                boundary.iter().map(|p| p.latitude).sum::<f64>() / n,
                boundary.iter().map(|p| p.longitude).sum::<f64>() / n,
            )
        };
        let frame = LocalFrame::new(anchor);
        let dock_local = frame.to_local(config.dock_point());
        Arc::new(SimWorld {
            state: Arc::new(Mutex::new(WorldState {
                x: 0.0,
                y: 0.0,
                theta: 0.0,
                v: 0.0,
                w: 0.0,
                left_ticks: 0.0,
                right_ticks: 0.0,
                last_step: 0.0,
                last_gnss: f64::NEG_INFINITY,
            })),
            meters_per_tick: config.meters_per_tick(),
            wheel_base: config.navigation.wheel_base,
            frame,
            dock_local,
            battery_voltage: 12.6,
        })
    }

    pub fn ports(self: &Arc<SimWorld>) -> PortSet {
        PortSet {
            drive: Box::new(SimDrive {
                world: self.clone(),
            }),
            encoders: Box::new(SimEncoders {
                world: self.clone(),
            }),
            imu: Box::new(SimImu {
                world: self.clone(),
            }),
            gnss: Box::new(SimGnss {
                world: self.clone(),
            }),
            camera: Box::new(SimCamera {
                world: self.clone(),
            }),
            power: Box::new(SimPower {
                world: self.clone(),
            }),
            inputs: Box::new(SimInputs {
                world: self.clone(),
            }),
            outputs: Box::new(SimOutputs {
                world: self.clone(),
            }),
        }
    }

    fn now(&self) -> f64 {
        crate::types::monotonic_seconds()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Integrate the kinematics up to the current instant.
    fn step(&self, state: &mut WorldState) {
        let now = self.now();
        let dt = (now - state.last_step).clamp(0.0, 0.5);
        state.last_step = now;
        if dt == 0.0 {
            return;
        }
        state.theta = crate::types::wrap_angle(state.theta + state.w * dt);
        state.x += state.v * state.theta.cos() * dt;
        state.y += state.v * state.theta.sin() * dt;

        let ds = state.v * dt;
        let d_theta = state.w * dt;
        let d_left = ds - d_theta * self.wheel_base / 2.0;
        let d_right = ds + d_theta * self.wheel_base / 2.0;
        state.left_ticks += d_left / self.meters_per_tick;
        state.right_ticks += d_right / self.meters_per_tick;
    }

    fn health(&self) -> PortHealth {
        PortHealth::healthy(self.now())
    }
}

struct SimDrive {
    world: Arc<SimWorld>,
}

impl DifferentialDrive for SimDrive {
    fn apply(&mut self, envelope: &CommandEnvelope, current_token: u64) -> Result<(), PortError> {
        crate::ports::validate_token(envelope, current_token)?;
        let mut state = self.world.lock();
        self.world.step(&mut state);
        if self.world.now() <= envelope.command.deadline_monotonic {
            state.v = envelope.command.linear_velocity;
            state.w = envelope.command.angular_velocity;
        } else {
            state.v = 0.0;
            state.w = 0.0;
        }
        Ok(())
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimEncoders {
    world: Arc<SimWorld>,
}

impl Encoders for SimEncoders {
    fn read(&mut self) -> Result<EncoderSample, PortError> {
        let mut state = self.world.lock();
        self.world.step(&mut state);
        Ok(EncoderSample {
            timestamp: self.world.now(),
            left_ticks: state.left_ticks as i64,
            right_ticks: state.right_ticks as i64,
        })
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimImu {
    world: Arc<SimWorld>,
}

impl Imu for SimImu {
    fn read(&mut self) -> Result<ImuSample, PortError> {
        let state = self.world.lock();
        Ok(ImuSample {
            timestamp: self.world.now(),
            gyro: (0.0, 0.0, state.w),
            accel: (0.0, 0.0, 9.81),
            roll: 0.0,
            pitch: 0.0,
        })
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimGnss {
    world: Arc<SimWorld>,
}

impl Gnss for SimGnss {
    fn poll(&mut self) -> Result<Option<GnssFix>, PortError> {
        let mut state = self.world.lock();
        let now = self.world.now();
        if now - state.last_gnss < 1.0 {
            return Ok(None);
        }
        state.last_gnss = now;
        self.world.step(&mut state);
        let point = self.world.frame.to_geodetic(state.x, state.y);
        Ok(Some(GnssFix {
            timestamp: now,
            point,
            quality: FixQuality::Fix3d,
            hdop: 0.8,
        }))
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimCamera {
    world: Arc<SimWorld>,
}

impl CameraSource for SimCamera {
    fn poll_frame(&mut self) -> Result<Option<CameraFrame>, PortError> {
        // No synthetic imagery; the vision task simply sees no markers.
        Ok(None)
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimPower {
    world: Arc<SimWorld>,
}

impl PowerSensor for SimPower {
    fn read_battery_bus(&mut self) -> Result<PowerSample, PortError> {
        Ok(PowerSample {
            timestamp: self.world.now(),
            voltage: self.world.battery_voltage,
            current: 1.2,
        })
    }

    fn read_dock_bus(&mut self) -> Result<PowerSample, PortError> {
        let state = self.world.lock();
        let (dx, dy) = self.world.dock_local;
        let near_dock = ((state.x - dx).powi(2) + (state.y - dy).powi(2)).sqrt() < 0.3;
        Ok(if near_dock {
            PowerSample {
                timestamp: self.world.now(),
                voltage: 13.6,
                current: 0.8,
            }
        } else {
            PowerSample {
                timestamp: self.world.now(),
                voltage: 0.0,
                current: 0.0,
            }
        })
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimInputs {
    world: Arc<SimWorld>,
}

impl DigitalInputsPort for SimInputs {
    fn read(&mut self) -> Result<DiscreteInputs, PortError> {
        Ok(DiscreteInputs {
            timestamp: self.world.now(),
            estop: false,
            bumper_front: false,
            bumper_rear: false,
        })
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

struct SimOutputs {
    world: Arc<SimWorld>,
}

impl Outputs for SimOutputs {
    fn buzzer(&mut self, _on: bool) -> Result<(), PortError> {
        Ok(())
    }

    fn brush_motor(&mut self, _on: bool) -> Result<(), PortError> {
        Ok(())
    }

    fn health(&self) -> PortHealth {
        self.world.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MotionCommand;

    #[test]
    fn test_drive_rejects_stale_token() {
        let world = SimWorld::new(&Config::default());
        let mut ports = world.ports();
        let envelope = CommandEnvelope {
            command: MotionCommand::stop(f64::INFINITY),
            token: 1,
        };
        assert!(ports.drive.apply(&envelope, 2).is_err());
        assert!(ports.drive.apply(&envelope, 1).is_ok());
    }

    #[test]
    fn test_forward_motion_accumulates_ticks() {
        let world = SimWorld::new(&Config::default());
        let mut ports = world.ports();
        let envelope = CommandEnvelope {
            command: MotionCommand {
                linear_velocity: 0.5,
                angular_velocity: 0.0,
                deadline_monotonic: f64::INFINITY,
            },
            token: 1,
        };
        ports.drive.apply(&envelope, 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(80));
        let sample = ports.encoders.read().unwrap();
        assert!(sample.left_ticks > 0);
        assert!((sample.left_ticks - sample.right_ticks).abs() < 5);
    }

    #[test]
    fn test_gnss_rate_limited() {
        let world = SimWorld::new(&Config::default());
        let mut ports = world.ports();
        assert!(ports.gnss.poll().unwrap().is_some());
        assert!(ports.gnss.poll().unwrap().is_none());
    }
}
