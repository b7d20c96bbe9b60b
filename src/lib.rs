// Rover commander: RS485 register protocol, motion dispatcher and remote control

pub mod config;
pub mod control;
pub mod messages;
pub mod remote;
pub mod rover;
pub mod runtime;
pub mod telemetry;
