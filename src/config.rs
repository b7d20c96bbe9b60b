// Serial link, timing, remote control and telemetry configuration
use std::time::Duration;

// Serial device the motor controllers hang off (RS485 adapter)
pub const SERIAL_PORT: &str = "/dev/ttyUSB0";
pub const SERIAL_BAUDRATE: u32 = 115_200;

// Idle time between reply bytes before a reply is considered complete
pub const REPLY_IDLE_TIMEOUT: Duration = Duration::from_millis(50);

// Largest reply we accept from one exchange
pub const REPLY_BUFFER_SIZE: usize = 1024;

// Pause after each single register write (controller turnaround)
pub const REGISTER_WRITE_SETTLE: Duration = Duration::from_micros(100);

// Symmetric motion limits in device units (mm/s, mm/s, mrad/s)
pub const LIMIT_SPEED_X: i32 = 2100;
pub const LIMIT_SPEED_Y: i32 = 2100;
pub const LIMIT_ROTATION: i32 = 8000;

// Control loop timing
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MAP_REFRESH_INTERVAL: Duration = Duration::from_millis(400);
pub const WRITE_INTERVAL: Duration = Duration::from_millis(400);
pub const TRIPLE_WRITE_INTERVAL: Duration = Duration::from_millis(400);

// Watchdog: stop the rover when remote commands go quiet for this long
pub const REMOTE_CMD_TIMEOUT: Duration = Duration::from_millis(500);

// Startup probe retry delay
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);

// Remote control
pub const REMOTE_PORT: u16 = 3475;
pub const REMOTE_PASSWORD: &str = "PASSWORD";
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const REMOTE_VALUE_LIMIT: i32 = 10_000;
pub const REMOTE_LINE_BUFFER: usize = 1024;

// Keyboard steps (small, large)
pub const STEP_SPEED_SMALL: i32 = 25;
pub const STEP_SPEED_LARGE: i32 = 100;
pub const STEP_ROTATION_SMALL: i32 = 250;
pub const STEP_ROTATION_LARGE: i32 = 500;

// Zenoh topics
pub const TOPIC_STATUS: &str = "rover/state/status"; // register snapshot
pub const TOPIC_HEALTH: &str = "rover/state/health"; // watchdog status

/// Which remote control channel to open, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RemoteMode {
    #[default]
    Off,
    Tcp,
    Udp,
}

/// Per-run settings, built from the command line
#[derive(Debug, Clone)]
pub struct Settings {
    pub serial_port: String,
    pub baudrate: u32,
    pub remote: RemoteMode,
    pub remote_port: u16,
    pub password: String,
    pub triple_redundant: bool,
    pub repeat_commands: bool,
    pub telemetry: bool,
    pub allow_unknown_rover: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial_port: SERIAL_PORT.to_string(),
            baudrate: SERIAL_BAUDRATE,
            remote: RemoteMode::Off,
            remote_port: REMOTE_PORT,
            password: REMOTE_PASSWORD.to_string(),
            triple_redundant: false,
            repeat_commands: true,
            telemetry: false,
            allow_unknown_rover: false,
        }
    }
}
