use clap::Parser;
use tracing_subscriber::EnvFilter;

use rover_commander::config::{REMOTE_PASSWORD, REMOTE_PORT, RemoteMode, SERIAL_BAUDRATE, SERIAL_PORT, Settings};

/// Keyboard and network motion control for RS485 rovers
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial device of the RS485 adapter
    #[arg(long, default_value = SERIAL_PORT)]
    port: String,

    #[arg(long, default_value_t = SERIAL_BAUDRATE)]
    baudrate: u32,

    /// Remote control channel
    #[arg(long, value_enum, default_value_t = RemoteMode::Off)]
    remote: RemoteMode,

    #[arg(long, default_value_t = REMOTE_PORT)]
    remote_port: u16,

    /// Shared secret for TCP peers
    #[arg(long, default_value = REMOTE_PASSWORD)]
    password: String,

    /// Use triple-redundant (kkk) speed commands; needs matching controller firmware
    #[arg(long)]
    triple: bool,

    /// Only send speed registers when they change
    #[arg(long)]
    no_repeat: bool,

    /// Publish status and health over Zenoh
    #[arg(long)]
    telemetry: bool,

    /// Continue with a rover that could not be identified
    #[arg(long)]
    allow_unknown: bool,
}

impl From<Args> for Settings {
    fn from(args: Args) -> Self {
        Self {
            serial_port: args.port,
            baudrate: args.baudrate,
            remote: args.remote,
            remote_port: args.remote_port,
            password: args.password,
            triple_redundant: args.triple,
            repeat_commands: !args.no_repeat,
            telemetry: args.telemetry,
            allow_unknown_rover: args.allow_unknown,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr so they do not fight the raw-mode terminal (RUST_LOG=debug for more)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = rover_commander::runtime::run(args.into()).await {
        tracing::error!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
