// Known rover variants and their register layouts

use serde::{Deserialize, Serialize};

use super::codec::{self, RegisterWidth};
use super::memmap::RegisterMap;
use crate::messages::{Axis, ControllerReadings};

/// Controller addresses on the RS485 bus
pub const PRIMARY_CONTROLLER: u8 = 0x10;
pub const SECONDARY_CONTROLLER: u8 = 0x1F;

/// Registers common to every variant
pub const REG_SYSTEM_NAME: u8 = 0x00; // 2 bytes
pub const REG_FIRMWARE: u8 = 0x02; // 2 bytes
pub const REG_UPTIME: u8 = 0x04; // 4 bytes, milliseconds

/// System-name codes of the known variants
pub const SYSTEM_MECANUM_ROVER_21: u16 = 0x21;
pub const SYSTEM_MEGA_ROVER_3: u16 = 0x30;

/// Motor enable register values (both motors of a controller)
pub const MOTORS_ON: u8 = 3;
pub const MOTORS_OFF: u8 = 0;

// Raw-to-physical conversion factors
const BATTERY_FULL_SCALE_V: f64 = 29.7;
const BATTERY_COUNTS: f64 = 4095.0;
const CURRENT_FULL_SCALE_A: f64 = 11.58;
const CURRENT_COUNTS: f64 = 4096.0;
const OUTPUT_COUNTS: f64 = 4096.0;

/// Register addresses of one variant, None where the controller has no such register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    pub enable_motors: Option<u8>,
    pub output_offset: [Option<u8>; 2],
    pub max_current: [Option<u8>; 2],
    pub current_limit: [Option<u8>; 2],
    pub measured_position: [Option<u8>; 2],
    pub wheel_speed: [Option<u8>; 2],
    pub motor_output_calc: [Option<u8>; 2],
    pub battery: Option<u8>,
    pub encoder: [Option<u8>; 2],
    pub measured_current: [Option<u8>; 2],
    pub speed_x: Option<u8>,
    pub speed_y: Option<u8>,
    pub rotation: Option<u8>,
}

static MECANUM_ROVER_21_LAYOUT: RegisterLayout = RegisterLayout {
    enable_motors: Some(0x10),
    output_offset: [Some(0x50), Some(0x52)],
    max_current: [Some(0x58), Some(0x5A)],
    current_limit: [Some(0x5C), Some(0x5E)],
    measured_position: [Some(0x60), Some(0x64)],
    wheel_speed: [Some(0x68), Some(0x6A)],
    motor_output_calc: [Some(0x6C), Some(0x6E)],
    battery: Some(0x90),
    encoder: [Some(0x98), Some(0x9C)],
    measured_current: [Some(0xA0), Some(0xA2)],
    speed_x: Some(0xC0),
    speed_y: Some(0xC2),
    rotation: Some(0xC4),
};

static MEGA_ROVER_3_LAYOUT: RegisterLayout = RegisterLayout {
    enable_motors: Some(0x10),
    output_offset: [None, None],
    max_current: [None, None],
    current_limit: [None, None],
    measured_position: [None, None],
    wheel_speed: [None, None],
    motor_output_calc: [None, None],
    battery: Some(0x82),
    encoder: [Some(0x50), Some(0x54)],
    measured_current: [None, None],
    speed_x: Some(0x90),
    speed_y: None,
    rotation: Some(0x94),
};

static UNKNOWN_LAYOUT: RegisterLayout = RegisterLayout {
    enable_motors: None,
    output_offset: [None, None],
    max_current: [None, None],
    current_limit: [None, None],
    measured_position: [None, None],
    wheel_speed: [None, None],
    motor_output_calc: [None, None],
    battery: None,
    encoder: [None, None],
    measured_current: [None, None],
    speed_x: None,
    speed_y: None,
    rotation: None,
};

impl RegisterLayout {
    /// Speed register for a motion axis
    pub fn axis(&self, axis: Axis) -> Option<u8> {
        match axis {
            Axis::X => self.speed_x,
            Axis::Y => self.speed_y,
            Axis::Rotation => self.rotation,
        }
    }

    /// Decode the physical readings of one controller's snapshot
    pub fn readings(&self, map: &RegisterMap, address: u8) -> ControllerReadings {
        let word = |reg: Option<u8>| reg.and_then(|r| map.register(r, RegisterWidth::Word).ok());
        let signed = |reg: Option<u8>| reg.and_then(|r| map.register_i16(r).ok());
        let long = |reg: Option<u8>| reg.and_then(|r| map.register(r, RegisterWidth::Long).ok());
        let current = |reg: Option<u8>| {
            word(reg).map(|raw| raw as f64 / CURRENT_COUNTS * CURRENT_FULL_SCALE_A)
        };
        let output = |reg: Option<u8>| signed(reg).map(|raw| raw as f64 / OUTPUT_COUNTS * 100.0);

        ControllerReadings {
            address,
            uptime_s: long(Some(REG_UPTIME)).map(|ms| ms as f64 / 1000.0),
            battery_v: word(self.battery)
                .map(|raw| raw as f64 / BATTERY_COUNTS * BATTERY_FULL_SCALE_V),
            motors_enabled: self
                .enable_motors
                .and_then(|r| map.register(r, RegisterWidth::Byte).ok())
                .map(|raw| raw as u8),
            wheel_speed: self.wheel_speed.map(signed),
            encoder: self.encoder.map(long),
            current_a: self.measured_current.map(current),
            motor_output_pct: self.motor_output_calc.map(output),
            speed_x: signed(self.speed_x),
            speed_y: signed(self.speed_y),
            rotation: signed(self.rotation),
        }
    }
}

/// What a variant can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub has_second_controller: bool,
    pub has_y_speed: bool,
    pub motor_count: u8,
}

// Rover variant, selected once at identification and fixed for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoverProfile {
    MecanumRover21,
    MegaRover3,
    Unknown,
}

impl RoverProfile {
    pub fn from_system_name(code: u16) -> Self {
        match code {
            SYSTEM_MECANUM_ROVER_21 => RoverProfile::MecanumRover21,
            SYSTEM_MEGA_ROVER_3 => RoverProfile::MegaRover3,
            _ => RoverProfile::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RoverProfile::MecanumRover21 => "MecanumRover V2.1",
            RoverProfile::MegaRover3 => "MegaRover V3",
            RoverProfile::Unknown => "UNKNOWN",
        }
    }

    pub fn layout(self) -> &'static RegisterLayout {
        match self {
            RoverProfile::MecanumRover21 => &MECANUM_ROVER_21_LAYOUT,
            RoverProfile::MegaRover3 => &MEGA_ROVER_3_LAYOUT,
            RoverProfile::Unknown => &UNKNOWN_LAYOUT,
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            RoverProfile::MecanumRover21 => Capabilities {
                has_second_controller: true,
                has_y_speed: true,
                motor_count: 4,
            },
            RoverProfile::MegaRover3 | RoverProfile::Unknown => Capabilities {
                has_second_controller: false,
                has_y_speed: false,
                motor_count: 2,
            },
        }
    }

    pub fn primary_controller(self) -> u8 {
        PRIMARY_CONTROLLER
    }

    pub fn secondary_controller(self) -> Option<u8> {
        self.capabilities()
            .has_second_controller
            .then_some(SECONDARY_CONTROLLER)
    }

    /// All controllers of this variant, primary first
    pub fn controllers(self) -> impl Iterator<Item = u8> {
        std::iter::once(self.primary_controller()).chain(self.secondary_controller())
    }

    pub fn is_known(self) -> bool {
        self != RoverProfile::Unknown
    }
}

/// Result of identifying the attached rover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub profile: RoverProfile,
    pub system_name: u16,
    pub firmware: u16,
}

/// Identify a rover from the primary controller's snapshot
pub fn identify_map(map: &RegisterMap) -> codec::Result<Identity> {
    let system_name = map.register(REG_SYSTEM_NAME, RegisterWidth::Word)? as u16;
    let firmware = map.register(REG_FIRMWARE, RegisterWidth::Word)? as u16;
    Ok(Identity {
        profile: RoverProfile::from_system_name(system_name),
        system_name,
        firmware,
    })
}
