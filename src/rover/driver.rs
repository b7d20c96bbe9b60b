// High-level rover session
//
// Combines the register bus with the identified profile to provide
// identification, snapshot refresh, motor enable and speed commands.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::bus::{ReadError, RegisterBus, WriteError};
use super::codec::CodecError;
use super::commands::{Command, CommandMode, RegisterValue};
use super::link::Transport;
use super::memmap::{FULL_MAP_LEN, RegisterMap};
use super::profile::{
    Identity, MOTORS_OFF, MOTORS_ON, PRIMARY_CONTROLLER, REG_SYSTEM_NAME, RoverProfile,
    identify_map,
};
use crate::config::REGISTER_WRITE_SETTLE;
use crate::control::Actuator;
use crate::messages::{Axis, MotionCommand, RoverStatus, RuntimeHealth};

/// Bytes read by the startup probe: system name and firmware revision
const PROBE_LENGTH: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum RoverError {
    #[error("Register read failed: {0}")]
    Read(#[from] ReadError),

    #[error("Register write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Snapshot decode failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Incomplete snapshot of controller 0x{controller:02X}: {len} of {expected} bytes")]
    IncompleteMap {
        controller: u8,
        len: usize,
        expected: usize,
    },

    #[error("{axis} is not supported by {model}")]
    Unsupported { axis: Axis, model: &'static str },
}

impl RoverError {
    /// Errors that mean the link can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        match self {
            RoverError::Read(e) => !e.is_retryable(),
            RoverError::Write(e) => e.is_fatal(),
            RoverError::Codec(_) => true,
            RoverError::IncompleteMap { .. } | RoverError::Unsupported { .. } => false,
        }
    }
}

pub struct Rover<T: Transport> {
    bus: RegisterBus<T>,
    mode: CommandMode,
    identity: Option<Identity>,
    primary_map: RegisterMap,
    secondary_map: RegisterMap,
    motors_enabled: bool,
}

impl<T: Transport> Rover<T> {
    pub fn new(transport: T, mode: CommandMode) -> Self {
        Self {
            bus: RegisterBus::new(transport),
            mode,
            identity: None,
            primary_map: RegisterMap::new(),
            secondary_map: RegisterMap::new(),
            motors_enabled: false,
        }
    }

    /// Bound profile; Unknown until identified
    pub fn profile(&self) -> RoverProfile {
        self.identity
            .map(|id| id.profile)
            .unwrap_or(RoverProfile::Unknown)
    }

    pub fn primary_map(&self) -> &RegisterMap {
        &self.primary_map
    }

    pub fn secondary_map(&self) -> &RegisterMap {
        &self.secondary_map
    }

    pub fn motors_enabled(&self) -> bool {
        self.motors_enabled
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &RegisterBus<T> {
        &self.bus
    }

    /// Check that the primary controller answers, retrying once after `retry_delay`
    pub async fn probe(&mut self, retry_delay: Duration) -> Result<(), RoverError> {
        let mut scratch = RegisterMap::new();
        match self
            .bus
            .read_register(PRIMARY_CONTROLLER, REG_SYSTEM_NAME, PROBE_LENGTH, &mut scratch)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                warn!("Controller did not answer probe ({}), retrying", e);
                tokio::time::sleep(retry_delay).await;
                self.bus
                    .read_register(PRIMARY_CONTROLLER, REG_SYSTEM_NAME, PROBE_LENGTH, &mut scratch)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the primary controller's snapshot and bind the matching profile
    pub fn identify(&mut self) -> Result<Identity, RoverError> {
        let mut map = RegisterMap::new();
        self.read_complete(PRIMARY_CONTROLLER, &mut map)?;
        self.identify_from(map)
    }

    /// Identify from a pre-populated snapshot instead of the device
    pub fn identify_from(&mut self, map: RegisterMap) -> Result<Identity, RoverError> {
        let identity = identify_map(&map)?;
        if identity.profile.is_known() {
            info!(
                "Rover type: {} (0x{:02X}), firmware 0x{:04X}",
                identity.profile.name(),
                identity.system_name,
                identity.firmware
            );
        } else {
            warn!(
                "Unrecognized rover system name 0x{:04X}, firmware 0x{:04X}",
                identity.system_name, identity.firmware
            );
        }
        self.identity = Some(identity);
        self.primary_map = map;
        Ok(identity)
    }

    /// Refresh both snapshots. Nothing is committed unless every read is complete.
    pub fn refresh(&mut self) -> Result<(), RoverError> {
        let profile = self.profile();

        let mut primary = RegisterMap::new();
        self.read_complete(profile.primary_controller(), &mut primary)?;

        let secondary = match profile.secondary_controller() {
            Some(controller) => {
                let mut map = RegisterMap::new();
                self.read_complete(controller, &mut map)?;
                Some(map)
            }
            None => None,
        };

        self.primary_map = primary;
        if let Some(map) = secondary {
            self.secondary_map = map;
        }
        Ok(())
    }

    fn read_complete(&mut self, controller: u8, map: &mut RegisterMap) -> Result<(), RoverError> {
        let len = self.bus.read_full_map(controller, map)?;
        if len < FULL_MAP_LEN {
            return Err(RoverError::IncompleteMap {
                controller,
                len,
                expected: FULL_MAP_LEN,
            });
        }
        Ok(())
    }

    pub fn enable_motors(&mut self) -> Result<(), RoverError> {
        self.write_motor_enable(MOTORS_ON)?;
        self.motors_enabled = true;
        Ok(())
    }

    pub fn disable_motors(&mut self) -> Result<(), RoverError> {
        self.write_motor_enable(MOTORS_OFF)?;
        self.motors_enabled = false;
        Ok(())
    }

    fn write_motor_enable(&mut self, code: u8) -> Result<(), RoverError> {
        let profile = self.profile();
        let Some(register) = profile.layout().enable_motors else {
            debug!("{} has no motor enable register", profile.name());
            return Ok(());
        };
        for controller in profile.controllers() {
            info!("Motor enable 0x{:02X} <- {}", controller, code);
            self.bus
                .write(controller, register, RegisterValue::U8(code))?;
        }
        Ok(())
    }

    /// Single-register speed write for one axis
    pub fn set_axis_speed(&mut self, axis: Axis, value: i32) -> Result<(), RoverError> {
        let profile = self.profile();
        let register = profile
            .layout()
            .axis(axis)
            .ok_or(RoverError::Unsupported {
                axis,
                model: profile.name(),
            })?;
        let value = axis.clamp(value) as i16;

        self.bus.write(
            profile.primary_controller(),
            register,
            RegisterValue::I16(value),
        )?;
        std::thread::sleep(REGISTER_WRITE_SETTLE);
        Ok(())
    }

    pub fn send_triple_motion(&mut self, motion: MotionCommand) -> Result<(), RoverError> {
        self.bus.send_triple(Command::TripleMotion(motion))?;
        Ok(())
    }

    /// Stop in whichever encoding this session uses
    pub fn stop_motion(&mut self) -> Result<(), RoverError> {
        info!("Stopping rover");
        match self.mode {
            CommandMode::SingleRegister => {
                let profile = self.profile();
                let register = profile.layout().speed_x.ok_or(RoverError::Unsupported {
                    axis: Axis::X,
                    model: profile.name(),
                })?;
                // speed X, Y and rotation sit in three adjacent words
                self.bus
                    .write_zero_triple(profile.primary_controller(), register)?;
            }
            CommandMode::TripleRedundant => {
                self.bus.send_triple(Command::TripleStop)?;
            }
        }
        Ok(())
    }

    /// Disable the motors at the end of a session
    pub fn release(&mut self) -> Result<(), RoverError> {
        if self.motors_enabled {
            self.disable_motors()?;
        }
        Ok(())
    }

    pub fn status(&self, command: MotionCommand, health: RuntimeHealth) -> RoverStatus {
        let profile = self.profile();
        let layout = profile.layout();
        let mut controllers = vec![layout.readings(&self.primary_map, profile.primary_controller())];
        if let Some(controller) = profile.secondary_controller() {
            controllers.push(layout.readings(&self.secondary_map, controller));
        }

        RoverStatus {
            model: profile.name().to_string(),
            system_name: self.identity.map(|id| id.system_name).unwrap_or_default(),
            firmware: self.identity.map(|id| id.firmware).unwrap_or_default(),
            controllers,
            comm_errors: self.bus.counters(),
            command,
            health,
        }
    }
}

impl<T: Transport> Actuator for Rover<T> {
    fn supports(&self, axis: Axis) -> bool {
        self.profile().layout().axis(axis).is_some()
    }

    fn send_axis(&mut self, axis: Axis, value: i32) -> Result<(), RoverError> {
        self.set_axis_speed(axis, value)
    }

    fn send_motion(&mut self, motion: MotionCommand) -> Result<(), RoverError> {
        self.send_triple_motion(motion)
    }

    fn stop(&mut self) -> Result<(), RoverError> {
        self.stop_motion()
    }
}

impl<T: Transport> Drop for Rover<T> {
    fn drop(&mut self) {
        // Leave the rover stopped with motors off if the session ends abruptly
        if !self.motors_enabled {
            return;
        }
        if let Err(e) = self.stop_motion() {
            warn!("Failed to stop rover on drop: {}", e);
        }
        if let Err(e) = self.disable_motors() {
            warn!("Failed to disable motors on drop: {}", e);
        }
    }
}
