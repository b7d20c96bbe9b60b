// Single-threaded control loop
//
// Each iteration: snapshot refresh when due, one bounded wait over
// interrupt / keyboard / remote channel, input processing (including every
// remote command already buffered), then the dispatcher tick (watchdog
// before transmission) and remote replies.
// Every exit path stops the rover and disables the motors.

use std::fmt;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::{POLL_INTERVAL, PROBE_RETRY_DELAY, RemoteMode, Settings};
use crate::control::{DispatchPolicy, Dispatcher, KeyAction, Keyboard};
use crate::remote::tcp::banner;
use crate::remote::{RemoteChannel, RemoteCommand, RemoteError, RemoteEvent, Reply, TcpSession, UdpSession};
use crate::rover::{CommandMode, Rover, SerialTransport, Transport};
use crate::telemetry::Telemetry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Quit,
    Interrupted,
    PeerLost,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ExitReason::Quit => "quit requested",
            ExitReason::Interrupted => "interrupted",
            ExitReason::PeerLost => "remote peer lost",
        };
        f.write_str(reason)
    }
}

enum Input {
    Interrupt,
    Key(KeyAction),
    Remote(Result<RemoteEvent, RemoteError>),
    Idle,
}

pub async fn run(settings: Settings) -> Result<(), BoxError> {
    let mode = if settings.triple_redundant {
        CommandMode::TripleRedundant
    } else {
        CommandMode::SingleRegister
    };

    info!(
        "Opening rover link on {} at {} baud ({:?} commands)",
        settings.serial_port, settings.baudrate, mode
    );
    let transport = SerialTransport::new(&settings.serial_port, settings.baudrate);
    let mut rover = Rover::new(transport, mode);

    rover.probe(PROBE_RETRY_DELAY).await?;
    let identity = rover.identify()?;
    if !identity.profile.is_known() && !settings.allow_unknown_rover {
        return Err(format!(
            "Unrecognized rover (system name 0x{:04X}); use --allow-unknown to continue",
            identity.system_name
        )
        .into());
    }

    let telemetry = if settings.telemetry {
        Some(Telemetry::open().await?)
    } else {
        None
    };

    let mut remote = match settings.remote {
        RemoteMode::Off => None,
        RemoteMode::Tcp => {
            let banner = banner(identity.system_name, identity.firmware);
            let session = TcpSession::accept(settings.remote_port, &settings.password, &banner).await?;
            Some(RemoteChannel::Tcp(session))
        }
        RemoteMode::Udp => Some(RemoteChannel::Udp(UdpSession::bind(settings.remote_port).await?)),
    };

    rover.enable_motors()?;
    let mut keyboard = Keyboard::open()?;
    let mut dispatcher = Dispatcher::new(DispatchPolicy::new(
        mode,
        settings.repeat_commands,
        remote.is_some(),
    ));

    info!(
        "Control loop started: {}ms poll, keyboard {}, remote {:?}",
        POLL_INTERVAL.as_millis(),
        if keyboard.is_active() { "on" } else { "off" },
        settings.remote
    );

    let outcome = control_loop(
        &mut rover,
        &mut dispatcher,
        &mut keyboard,
        &mut remote,
        telemetry.as_ref(),
    )
    .await;

    shut_down(&mut dispatcher, &mut rover, keyboard, remote).await;

    let reason = outcome?;
    info!("Exiting: {}", reason);
    Ok(())
}

/// Stop first, then motors off, then release the terminal and the peer
async fn shut_down<T: Transport>(
    dispatcher: &mut Dispatcher,
    rover: &mut Rover<T>,
    keyboard: Keyboard,
    remote: Option<RemoteChannel>,
) {
    if let Err(e) = dispatcher.halt(rover) {
        error!("Final stop failed: {}", e);
    }
    if let Err(e) = rover.release() {
        error!("Failed to disable motors: {}", e);
    }
    drop(keyboard);
    if let Some(channel) = remote {
        if let Err(e) = channel.close().await {
            warn!("Could not say goodbye to remote peer: {}", e);
        }
    }
}

async fn control_loop<T: Transport>(
    rover: &mut Rover<T>,
    dispatcher: &mut Dispatcher,
    keyboard: &mut Keyboard,
    remote: &mut Option<RemoteChannel>,
    telemetry: Option<&Telemetry>,
) -> Result<ExitReason, BoxError> {
    let mut interrupt = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        // 1. Periodic snapshot refresh
        let now = Instant::now();
        if dispatcher.map_refresh_due(now) {
            dispatcher.mark_map_refreshed(now);
            match rover.refresh() {
                Ok(()) => {
                    if let Some(telemetry) = telemetry {
                        let status = rover.status(dispatcher.command(), dispatcher.health());
                        if let Err(e) = telemetry.publish_status(&status).await {
                            warn!("Failed to publish status: {}", e);
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Snapshot refresh failed: {}", e),
            }
        }

        // 2. Bounded wait for input
        let input = tokio::select! {
            _ = &mut interrupt => Input::Interrupt,
            action = keyboard.next_action() => Input::Key(action),
            event = recv_remote(remote) => Input::Remote(event),
            _ = tokio::time::sleep(POLL_INTERVAL) => Input::Idle,
        };

        // 3. Apply input, then whatever the peer has already delivered
        if let Some(reason) = apply_input(input, dispatcher, rover, remote).await? {
            return Ok(reason);
        }
        while let Some(event) = buffered_remote(remote) {
            if let Some(reason) = apply_input(Input::Remote(event), dispatcher, rover, remote).await? {
                return Ok(reason);
            }
        }

        // 4. Watchdog and transmission
        let report = dispatcher.tick(Instant::now(), rover)?;
        if report.watchdog_tripped && !send_reply(remote, Reply::NoCommand).await {
            return Ok(ExitReason::PeerLost);
        }
        for ack in report.acks {
            if !send_reply(remote, Reply::ack(ack.axis, ack.delivered)).await {
                return Ok(ExitReason::PeerLost);
            }
        }

        if let Some(telemetry) = telemetry {
            if let Err(e) = telemetry.publish_health(dispatcher.health()).await {
                warn!("Failed to publish health: {}", e);
            }
        }
    }
}

/// Apply one input. Returns the exit reason when the loop must end.
async fn apply_input<T: Transport>(
    input: Input,
    dispatcher: &mut Dispatcher,
    rover: &mut Rover<T>,
    remote: &mut Option<RemoteChannel>,
) -> Result<Option<ExitReason>, BoxError> {
    match input {
        Input::Interrupt => return Ok(Some(ExitReason::Interrupted)),
        Input::Key(KeyAction::Quit) => return Ok(Some(ExitReason::Quit)),
        Input::Key(KeyAction::AllStop) => dispatcher.all_stop(rover)?,
        Input::Key(KeyAction::Nudge { axis, delta }) => dispatcher.nudge(axis, delta),
        Input::Remote(Ok(RemoteEvent::Command(command))) => {
            dispatcher.apply_remote(command, Instant::now(), rover)?;
            if command == RemoteCommand::StopZero && !send_reply(remote, Reply::OkZero).await {
                return Ok(Some(ExitReason::PeerLost));
            }
        }
        Input::Remote(Ok(RemoteEvent::Rejected(e))) => {
            info!("Rejected remote command: {}", e);
            if !send_reply(remote, e.reply()).await {
                return Ok(Some(ExitReason::PeerLost));
            }
        }
        Input::Remote(Ok(RemoteEvent::Disconnected)) => {
            warn!("Remote channel closed, watchdog stays active");
            *remote = None;
        }
        Input::Remote(Err(e)) => {
            warn!("Dropping remote channel: {}", e);
            *remote = None;
        }
        Input::Idle => {}
    }
    Ok(None)
}

async fn recv_remote(remote: &mut Option<RemoteChannel>) -> Result<RemoteEvent, RemoteError> {
    match remote {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

fn buffered_remote(remote: &mut Option<RemoteChannel>) -> Option<Result<RemoteEvent, RemoteError>> {
    remote.as_mut()?.try_recv().transpose()
}

/// Send a reply to the remote peer. Returns false when the peer is gone.
async fn send_reply(remote: &mut Option<RemoteChannel>, reply: Reply) -> bool {
    let Some(channel) = remote else {
        return true;
    };
    let sent = channel.reply(reply).await;
    match sent {
        Ok(()) => true,
        Err(e) => {
            error!("Cannot send reply to remote peer: {}", e);
            *remote = None;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::control::WatchdogState;
    use crate::messages::RuntimeHealth;
    use crate::remote::tcp::GOODBYE;
    use crate::rover::RegisterMap;
    use crate::rover::codec::RegisterWidth;
    use crate::rover::mock::{ScriptedTransport, snapshot};
    use crate::rover::profile::REG_SYSTEM_NAME;

    fn mecanum_rover(transport: &mut ScriptedTransport) -> Rover<&mut ScriptedTransport> {
        let mut rover = Rover::new(transport, CommandMode::SingleRegister);
        rover
            .identify_from(RegisterMap::from_bytes(&snapshot(&[(
                REG_SYSTEM_NAME,
                RegisterWidth::Word,
                0x21,
            )])))
            .unwrap();
        rover
    }

    fn remote_dispatcher() -> Dispatcher {
        Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, true))
    }

    /// Authenticated session and the client end of its connection
    async fn tcp_session() -> (TcpSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        client.write_all(b"PASSWORD\r\n").await.unwrap();
        let session = TcpSession::handshake(server, peer, "PASSWORD", "READY\r\n")
            .await
            .unwrap();
        (session, client)
    }

    /// Run the loop until it exits or `duration` passes (None)
    async fn run_for<T: Transport>(
        duration: Duration,
        rover: &mut Rover<T>,
        dispatcher: &mut Dispatcher,
        remote: &mut Option<RemoteChannel>,
    ) -> Option<Result<ExitReason, BoxError>> {
        let mut keyboard = Keyboard::inert();
        tokio::time::timeout(duration, control_loop(rover, dispatcher, &mut keyboard, remote, None))
            .await
            .ok()
    }

    fn writes(transport: &ScriptedTransport) -> Vec<String> {
        transport
            .sent_text()
            .into_iter()
            .filter(|command| command.starts_with('w'))
            .collect()
    }

    /// Everything the client received, after the server side is closed
    async fn received(remote: Option<RemoteChannel>, mut client: TcpStream) -> String {
        drop(remote);
        let mut bytes = Vec::new();
        client.read_to_end(&mut bytes).await.unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_buffered_lines_share_one_transmit() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (session, mut client) = tcp_session().await;
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"SPX00100\r\nROT00200\r\n").await.unwrap();
        let outcome = run_for(Duration::from_millis(300), &mut rover, &mut dispatcher, &mut remote).await;
        assert!(outcome.is_none());
        drop(rover);

        assert_eq!(
            writes(&transport),
            vec!["w10 C0 6400\n", "w10 C2 0000\n", "w10 C4 C800\n"]
        );
        let text = received(remote, client).await;
        assert!(text.ends_with("READY\r\nOKSPX\r\nOKROT\r\n"));
    }

    #[tokio::test]
    async fn test_speed_command_is_written_and_acknowledged() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (session, mut client) = tcp_session().await;
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"SPX00123\r\n").await.unwrap();
        run_for(Duration::from_millis(300), &mut rover, &mut dispatcher, &mut remote).await;
        drop(rover);

        assert!(writes(&transport).contains(&"w10 C0 7B00\n".to_string()));
        let text = received(remote, client).await;
        assert_eq!(text.matches("OKSPX\r\n").count(), 1);
    }

    #[tokio::test]
    async fn test_stopzero_stops_and_replies() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (session, mut client) = tcp_session().await;
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"STOPZERO\r\n").await.unwrap();
        run_for(Duration::from_millis(300), &mut rover, &mut dispatcher, &mut remote).await;
        drop(rover);

        assert_eq!(writes(&transport)[0], "w10 C0 000000000000\n");
        let text = received(remote, client).await;
        assert!(text.ends_with("READY\r\nOKZERO\r\n"));
    }

    #[tokio::test]
    async fn test_rejected_command_gets_negative_reply() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (session, mut client) = tcp_session().await;
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"ROT99999\r\nHELLO\r\n").await.unwrap();
        run_for(Duration::from_millis(300), &mut rover, &mut dispatcher, &mut remote).await;
        drop(rover);

        let text = received(remote, client).await;
        assert!(text.ends_with("READY\r\n!BADROT!\r\n!BADCMD!\r\n"));
    }

    #[tokio::test]
    async fn test_watchdog_reports_stale_commands_once() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (session, mut client) = tcp_session().await;
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"SPX00100\r\n").await.unwrap();
        let outcome = run_for(Duration::from_millis(1300), &mut rover, &mut dispatcher, &mut remote).await;
        assert!(outcome.is_none());
        assert_eq!(dispatcher.watchdog(), WatchdogState::Tripped);
        assert_eq!(dispatcher.health(), RuntimeHealth::CmdStale);
        drop(rover);

        let sent = writes(&transport);
        let started = sent.iter().position(|w| w == "w10 C0 6400\n").unwrap();
        assert!(sent[started..].contains(&"w10 C0 000000000000\n".to_string()));

        let text = received(remote, client).await;
        assert_eq!(text.matches("!NOCMST!\r\n").count(), 1);
    }

    #[tokio::test]
    async fn test_closed_peer_leaves_watchdog_in_charge() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (session, mut client) = tcp_session().await;
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"SPX00100\r\n").await.unwrap();
        client.shutdown().await.unwrap();
        let outcome = run_for(Duration::from_millis(1000), &mut rover, &mut dispatcher, &mut remote).await;
        assert!(outcome.is_none());
        assert!(remote.is_none());
        drop(rover);

        let sent = writes(&transport);
        let started = sent.iter().position(|w| w == "w10 C0 6400\n").unwrap();
        assert!(sent[started..].contains(&"w10 C0 000000000000\n".to_string()));

        let text = received(remote, client).await;
        assert!(text.ends_with("READY\r\nOKSPX\r\n"));
    }

    #[tokio::test]
    async fn test_failed_reply_ends_session() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        let mut dispatcher = remote_dispatcher();
        let (mut session, mut client) = tcp_session().await;
        session.shutdown_write().await.unwrap();
        let mut remote = Some(RemoteChannel::Tcp(session));

        client.write_all(b"STOPZERO\r\n").await.unwrap();
        let outcome = run_for(Duration::from_millis(1000), &mut rover, &mut dispatcher, &mut remote).await;
        assert!(matches!(outcome, Some(Ok(ExitReason::PeerLost))));
        assert!(remote.is_none());
    }

    #[tokio::test]
    async fn test_shut_down_stops_before_releasing_motors() {
        let mut transport = ScriptedTransport::new();
        let mut rover = mecanum_rover(&mut transport);
        rover.enable_motors().unwrap();
        let mut dispatcher = remote_dispatcher();
        let (session, client) = tcp_session().await;

        shut_down(
            &mut dispatcher,
            &mut rover,
            Keyboard::inert(),
            Some(RemoteChannel::Tcp(session)),
        )
        .await;
        assert!(!rover.motors_enabled());
        drop(rover);

        assert_eq!(
            writes(&transport),
            vec![
                "w10 10 03\n",
                "w1F 10 03\n",
                "w10 C0 000000000000\n",
                "w10 10 00\n",
                "w1F 10 00\n",
            ]
        );
        let text = received(None, client).await;
        assert!(text.ends_with(GOODBYE));
    }
}
