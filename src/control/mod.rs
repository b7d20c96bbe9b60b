// Motion control: dispatcher with watchdog and local keyboard input

mod dispatcher;
pub mod keyboard;

pub use dispatcher::{Ack, Actuator, DispatchPolicy, Dispatcher, TickReport, WatchdogState};
pub use keyboard::{KeyAction, Keyboard, map_key};
