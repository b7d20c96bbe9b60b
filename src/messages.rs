// Message and state types shared by the control loop and telemetry

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{LIMIT_ROTATION, LIMIT_SPEED_X, LIMIT_SPEED_Y};

/// One commandable motion axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
    Rotation,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Rotation];

    /// Symmetric limit applied to this axis
    pub fn limit(self) -> i32 {
        match self {
            Axis::X => LIMIT_SPEED_X,
            Axis::Y => LIMIT_SPEED_Y,
            Axis::Rotation => LIMIT_ROTATION,
        }
    }

    pub fn clamp(self, value: i32) -> i32 {
        value.clamp(-self.limit(), self.limit())
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "speed X",
            Axis::Y => "speed Y",
            Axis::Rotation => "rotation",
        };
        f.write_str(name)
    }
}

// Commanded motion in device units (mm/s, mm/s, mrad/s)
// Every constructor and mutator clamps, so a MotionCommand is always in range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "MotionFields")]
pub struct MotionCommand {
    speed_x: i32,
    speed_y: i32,
    rotation: i32,
}

// Unchecked wire form, clamped on the way in
#[derive(Deserialize)]
struct MotionFields {
    speed_x: i32,
    speed_y: i32,
    rotation: i32,
}

impl From<MotionFields> for MotionCommand {
    fn from(fields: MotionFields) -> Self {
        Self::new(fields.speed_x, fields.speed_y, fields.rotation)
    }
}

impl MotionCommand {
    pub fn new(speed_x: i32, speed_y: i32, rotation: i32) -> Self {
        Self {
            speed_x: Axis::X.clamp(speed_x),
            speed_y: Axis::Y.clamp(speed_y),
            rotation: Axis::Rotation.clamp(rotation),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, axis: Axis) -> i32 {
        match axis {
            Axis::X => self.speed_x,
            Axis::Y => self.speed_y,
            Axis::Rotation => self.rotation,
        }
    }

    /// Set one axis, clamped to its limit. Returns the stored value.
    pub fn set(&mut self, axis: Axis, value: i32) -> i32 {
        let value = axis.clamp(value);
        match axis {
            Axis::X => self.speed_x = value,
            Axis::Y => self.speed_y = value,
            Axis::Rotation => self.rotation = value,
        }
        value
    }

    /// Add a delta to one axis, clamped to its limit
    pub fn nudge(&mut self, axis: Axis, delta: i32) -> i32 {
        self.set(axis, self.get(axis).saturating_add(delta))
    }

    pub fn speed_x(&self) -> i32 {
        self.speed_x
    }

    pub fn speed_y(&self) -> i32 {
        self.speed_y
    }

    pub fn rotation(&self) -> i32 {
        self.rotation
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

/// RS485 error notices stripped from replies, per bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommErrorCounters {
    pub primary: u64,
    pub secondary: u64,
}

// Decoded readings from one controller's register snapshot
// A field is None when the profile has no such register or its bytes are not valid hex
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerReadings {
    pub address: u8,
    pub uptime_s: Option<f64>,
    pub battery_v: Option<f64>,
    pub motors_enabled: Option<u8>,
    pub wheel_speed: [Option<i16>; 2],
    pub encoder: [Option<u32>; 2],
    pub current_a: [Option<f64>; 2],
    pub motor_output_pct: [Option<f64>; 2],
    pub speed_x: Option<i16>,
    pub speed_y: Option<i16>,
    pub rotation: Option<i16>,
}

/// Snapshot published on the status topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoverStatus {
    pub model: String,
    pub system_name: u16,
    pub firmware: u16,
    pub controllers: Vec<ControllerReadings>,
    pub comm_errors: CommErrorCounters,
    pub command: MotionCommand,
    pub health: RuntimeHealth,
}
