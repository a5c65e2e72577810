//! Hardware abstraction ports. Capability traits only; real drivers live
//! outside this crate, synthetic generators bind here in simulation mode.
//! Every port exposes a health probe consumed by the supervisor watchdog.

use crate::errors::PortError;
use crate::types::{
    CameraFrame, DiscreteInputs, EncoderSample, GnssFix, ImuSample, MotionCommand, PowerSample,
};

/// Health probe shared by all ports.
#[derive(Clone, Copy, Debug)]
pub struct PortHealth {
    pub last_update_monotonic: f64,
    pub ok: bool,
}

impl PortHealth {
    pub fn healthy(now: f64) -> Self {
        PortHealth {
            last_update_monotonic: now,
            ok: true,
        }
    }
}

/// A motion command stamped with the supervisor's authority token. Drives
/// refuse envelopes whose token is not the supervisor's current one, which
/// makes stale producers structurally unable to actuate.
#[derive(Clone, Copy, Debug)]
pub struct CommandEnvelope {
    pub command: MotionCommand,
    pub token: u64,
}

/// Token check used by every drive implementation.
pub fn validate_token(envelope: &CommandEnvelope, current: u64) -> Result<(), PortError> {
    if envelope.token != current {
        return Err(PortError::StaleToken {
            got: envelope.token,
            current,
        });
    }
    Ok(())
}

pub trait DifferentialDrive: Send {
    /// Apply a supervisor-tokened command. `current_token` is the
    /// supervisor's token at write time.
    fn apply(&mut self, envelope: &CommandEnvelope, current_token: u64) -> Result<(), PortError>;
    fn health(&self) -> PortHealth;
}

pub trait Encoders: Send {
    /// Cumulative signed tick counts for both wheels.
    fn read(&mut self) -> Result<EncoderSample, PortError>;
    fn health(&self) -> PortHealth;
}

pub trait Imu: Send {
    fn read(&mut self) -> Result<ImuSample, PortError>;
    fn health(&self) -> PortHealth;
}

pub trait Gnss: Send {
    /// Non-blocking: the next fix if one arrived since the last poll.
    fn poll(&mut self) -> Result<Option<GnssFix>, PortError>;
    fn health(&self) -> PortHealth;
}

pub trait CameraSource: Send {
    /// Non-blocking: the most recent frame not yet consumed.
    fn poll_frame(&mut self) -> Result<Option<CameraFrame>, PortError>;
    fn health(&self) -> PortHealth;
}

pub trait PowerSensor: Send {
    fn read_battery_bus(&mut self) -> Result<PowerSample, PortError>;
    fn read_dock_bus(&mut self) -> Result<PowerSample, PortError>;
    fn health(&self) -> PortHealth;
}

pub trait DigitalInputs: Send {
    fn read(&mut self) -> Result<DiscreteInputs, PortError>;
    fn health(&self) -> PortHealth;
}

pub trait Outputs: Send {
    fn buzzer(&mut self, on: bool) -> Result<(), PortError>;
    fn brush_motor(&mut self, on: bool) -> Result<(), PortError>;
    fn health(&self) -> PortHealth;
}

/// Everything the runtime needs to run one robot.
pub struct PortSet {
    pub drive: Box<dyn DifferentialDrive>,
    pub encoders: Box<dyn Encoders>,
    pub imu: Box<dyn Imu>,
    pub gnss: Box<dyn Gnss>,
    pub camera: Box<dyn CameraSource>,
    pub power: Box<dyn PowerSensor>,
    pub inputs: Box<dyn DigitalInputs>,
    pub outputs: Box<dyn Outputs>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation() {
        let envelope = CommandEnvelope {
            command: MotionCommand::stop(1.0),
            token: 41,
        };
        assert!(validate_token(&envelope, 41).is_ok());
        let err = validate_token(&envelope, 42).unwrap_err();
        assert!(matches!(err, PortError::StaleToken { got: 41, current: 42 }));
    }
}
