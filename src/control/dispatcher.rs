// Motion dispatcher with remote-command watchdog
//
// Keyboard deltas and remote commands update one MotionCommand. Each tick
// checks the watchdog first, then (re)transmits according to the command
// mode and repeat policy. Fresh remote values are acknowledged per axis.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{MAP_REFRESH_INTERVAL, REMOTE_CMD_TIMEOUT, TRIPLE_WRITE_INTERVAL, WRITE_INTERVAL};
use crate::messages::{Axis, MotionCommand, RuntimeHealth};
use crate::remote::RemoteCommand;
use crate::rover::{CommandMode, RoverError};

/// Something that can move the rover
pub trait Actuator {
    /// Whether the axis has a speed register on this rover
    fn supports(&self, axis: Axis) -> bool;

    /// Single-register write of one axis
    fn send_axis(&mut self, axis: Axis, value: i32) -> Result<(), RoverError>;

    /// Triple-redundant frame carrying all axes
    fn send_motion(&mut self, motion: MotionCommand) -> Result<(), RoverError>;

    fn stop(&mut self) -> Result<(), RoverError>;
}

/// Transmit and watchdog settings for a session
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub mode: CommandMode,
    /// Resend every axis each write cycle so the controller's own timeout never trips
    pub repeat: bool,
    pub remote_active: bool,
    pub write_interval: Duration,
    pub triple_interval: Duration,
    pub map_refresh_interval: Duration,
    pub remote_timeout: Duration,
}

impl DispatchPolicy {
    pub fn new(mode: CommandMode, repeat: bool, remote_active: bool) -> Self {
        Self {
            mode,
            repeat,
            remote_active,
            write_interval: WRITE_INTERVAL,
            triple_interval: TRIPLE_WRITE_INTERVAL,
            map_refresh_interval: MAP_REFRESH_INTERVAL,
            remote_timeout: REMOTE_CMD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Armed,
    Tripped,
}

/// Outcome of transmitting an axis a remote peer just set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub axis: Axis,
    pub delivered: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The watchdog stopped the rover during this tick
    pub watchdog_tripped: bool,
    pub acks: Vec<Ack>,
    pub transmitted: bool,
}

pub struct Dispatcher {
    policy: DispatchPolicy,
    command: MotionCommand,
    last_sent: [Option<i32>; 3],
    fresh: [bool; 3],
    watchdog: WatchdogState,
    map_read_at: Option<Instant>,
    write_at: Option<Instant>,
    triple_at: Option<Instant>,
    remote_cmd_at: Option<Instant>,
}

fn slot(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Rotation => 2,
    }
}

fn interval_elapsed(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.is_none_or(|at| now.saturating_duration_since(at) >= interval)
}

impl Dispatcher {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            command: MotionCommand::zero(),
            last_sent: [None; 3],
            fresh: [false; 3],
            // No stop is owed before the first remote command
            watchdog: WatchdogState::Tripped,
            map_read_at: None,
            write_at: None,
            triple_at: None,
            remote_cmd_at: None,
        }
    }

    pub fn command(&self) -> MotionCommand {
        self.command
    }

    pub fn watchdog(&self) -> WatchdogState {
        self.watchdog
    }

    pub fn health(&self) -> RuntimeHealth {
        if self.policy.remote_active && self.watchdog == WatchdogState::Tripped {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        }
    }

    pub fn map_refresh_due(&self, now: Instant) -> bool {
        interval_elapsed(self.map_read_at, self.policy.map_refresh_interval, now)
    }

    pub fn mark_map_refreshed(&mut self, now: Instant) {
        self.map_read_at = Some(now);
    }

    /// Local step change on one axis
    pub fn nudge(&mut self, axis: Axis, delta: i32) {
        let value = self.command.nudge(axis, delta);
        debug!("{} -> {}", axis, value);
    }

    /// Zero everything and stop right away, ignoring the write throttle
    pub fn all_stop<A: Actuator + ?Sized>(&mut self, actuator: &mut A) -> Result<(), RoverError> {
        self.command = MotionCommand::zero();
        self.fresh = [false; 3];
        self.stop_now(actuator)
    }

    /// Apply a validated remote command received at `now`
    pub fn apply_remote<A: Actuator + ?Sized>(
        &mut self,
        command: RemoteCommand,
        now: Instant,
        actuator: &mut A,
    ) -> Result<(), RoverError> {
        self.remote_cmd_at = Some(now);
        match command {
            RemoteCommand::StopZero => self.all_stop(actuator),
            RemoteCommand::Set { axis, value } => {
                let value = self.command.set(axis, value);
                self.fresh[slot(axis)] = true;
                debug!("Remote set {} -> {}", axis, value);
                Ok(())
            }
        }
    }

    /// One control tick: watchdog, then transmission
    pub fn tick<A: Actuator + ?Sized>(&mut self, now: Instant, actuator: &mut A) -> Result<TickReport, RoverError> {
        let mut report = TickReport::default();

        if self.policy.remote_active {
            self.check_watchdog(now, actuator, &mut report)?;
        }

        match self.policy.mode {
            CommandMode::SingleRegister => self.transmit_single(now, actuator, &mut report)?,
            CommandMode::TripleRedundant => self.transmit_triple(now, actuator, &mut report)?,
        }
        Ok(report)
    }

    /// Final stop before the session ends
    pub fn halt<A: Actuator + ?Sized>(&mut self, actuator: &mut A) -> Result<(), RoverError> {
        info!("Halting rover");
        self.all_stop(actuator)
    }

    fn check_watchdog<A: Actuator + ?Sized>(
        &mut self,
        now: Instant,
        actuator: &mut A,
        report: &mut TickReport,
    ) -> Result<(), RoverError> {
        let stale = self
            .remote_cmd_at
            .is_none_or(|at| now.saturating_duration_since(at) > self.policy.remote_timeout);

        match (stale, self.watchdog) {
            (true, WatchdogState::Armed) => {
                warn!(
                    "No remote command for {:?}, stopping rover",
                    self.policy.remote_timeout
                );
                self.watchdog = WatchdogState::Tripped;
                report.watchdog_tripped = true;
                self.all_stop(actuator)?;
            }
            (false, WatchdogState::Tripped) => {
                info!("Remote commands resumed, watchdog armed");
                self.watchdog = WatchdogState::Armed;
            }
            _ => {}
        }
        Ok(())
    }

    fn transmit_single<A: Actuator + ?Sized>(
        &mut self,
        now: Instant,
        actuator: &mut A,
        report: &mut TickReport,
    ) -> Result<(), RoverError> {
        if !interval_elapsed(self.write_at, self.policy.write_interval, now) {
            return Ok(());
        }

        for axis in Axis::ALL {
            let index = slot(axis);
            let value = self.command.get(axis);
            let fresh = std::mem::take(&mut self.fresh[index]);
            if !(self.policy.repeat || fresh || self.last_sent[index] != Some(value)) {
                continue;
            }
            self.last_sent[index] = Some(value);

            if !actuator.supports(axis) {
                if fresh {
                    warn!("{} is not supported by this rover", axis);
                    report.acks.push(Ack { axis, delivered: false });
                }
                continue;
            }

            let outcome = actuator.send_axis(axis, value);
            let delivered = settle(outcome, actuator)?;
            report.transmitted = true;
            if fresh {
                report.acks.push(Ack { axis, delivered });
            }
        }

        if report.transmitted {
            self.write_at = Some(now);
        }
        Ok(())
    }

    fn transmit_triple<A: Actuator + ?Sized>(
        &mut self,
        now: Instant,
        actuator: &mut A,
        report: &mut TickReport,
    ) -> Result<(), RoverError> {
        if !interval_elapsed(self.triple_at, self.policy.triple_interval, now) {
            return Ok(());
        }

        let outcome = actuator.send_motion(self.command);
        let delivered = settle(outcome, actuator)?;
        self.triple_at = Some(now);
        report.transmitted = true;

        for axis in Axis::ALL {
            let index = slot(axis);
            self.last_sent[index] = Some(self.command.get(axis));
            if std::mem::take(&mut self.fresh[index]) {
                report.acks.push(Ack { axis, delivered });
            }
        }
        Ok(())
    }

    fn stop_now<A: Actuator + ?Sized>(&mut self, actuator: &mut A) -> Result<(), RoverError> {
        match actuator.stop() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Stop command not acknowledged: {}", e),
        }
        self.last_sent = [Some(0); 3];
        Ok(())
    }
}

/// Turn a write outcome into an acknowledgement. Fatal errors stop the rover and propagate.
fn settle<A: Actuator + ?Sized>(outcome: Result<(), RoverError>, actuator: &mut A) -> Result<bool, RoverError> {
    match outcome {
        Ok(()) => Ok(true),
        Err(e) if e.is_fatal() => {
            if let Err(stop_err) = actuator.stop() {
                warn!("Fail-safe stop failed: {}", stop_err);
            }
            Err(e)
        }
        Err(e) => {
            warn!("Write not acknowledged: {}", e);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rover::{TransportError, WriteError};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Axis(Axis, i32),
        Motion(MotionCommand),
        Stop,
    }

    struct FakeActuator {
        calls: Vec<Call>,
        has_y: bool,
        fail_next: Option<RoverError>,
    }

    impl FakeActuator {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                has_y: true,
                fail_next: None,
            }
        }

        fn outcome(&mut self) -> Result<(), RoverError> {
            match self.fail_next.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn stops(&self) -> usize {
            self.calls.iter().filter(|c| **c == Call::Stop).count()
        }

        fn take(&mut self) -> Vec<Call> {
            std::mem::take(&mut self.calls)
        }
    }

    impl Actuator for FakeActuator {
        fn supports(&self, axis: Axis) -> bool {
            axis != Axis::Y || self.has_y
        }

        fn send_axis(&mut self, axis: Axis, value: i32) -> Result<(), RoverError> {
            self.calls.push(Call::Axis(axis, value));
            self.outcome()
        }

        fn send_motion(&mut self, motion: MotionCommand) -> Result<(), RoverError> {
            self.calls.push(Call::Motion(motion));
            self.outcome()
        }

        fn stop(&mut self) -> Result<(), RoverError> {
            self.calls.push(Call::Stop);
            Ok(())
        }
    }

    fn rejected() -> RoverError {
        RoverError::Write(WriteError::Rejected {
            controller: 0x10,
            reply: "NG".to_string(),
        })
    }

    fn unplugged() -> RoverError {
        RoverError::Write(WriteError::Transport(TransportError::Io(
            std::io::Error::other("unplugged"),
        )))
    }

    fn ms(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    fn set(axis: Axis, value: i32) -> RemoteCommand {
        RemoteCommand::Set { axis, value }
    }

    #[test]
    fn test_values_are_clamped_before_transmission() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, false, true));
        let mut actuator = FakeActuator::new();

        dispatcher.apply_remote(set(Axis::X, 10_000), t0, &mut actuator).unwrap();
        dispatcher.apply_remote(set(Axis::Rotation, -10_000), t0, &mut actuator).unwrap();
        dispatcher.tick(t0, &mut actuator).unwrap();

        assert!(actuator.calls.contains(&Call::Axis(Axis::X, 2100)));
        assert!(actuator.calls.contains(&Call::Axis(Axis::Rotation, -8000)));

        for _ in 0..200 {
            dispatcher.nudge(Axis::Y, -100);
        }
        assert_eq!(dispatcher.command().speed_y(), -2100);
    }

    #[test]
    fn test_watchdog_starts_tripped() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, true));
        let mut actuator = FakeActuator::new();

        let report = dispatcher.tick(t0, &mut actuator).unwrap();
        assert!(!report.watchdog_tripped);
        assert_eq!(actuator.stops(), 0);
        assert_eq!(dispatcher.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_watchdog_stops_exactly_once() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, true));
        let mut actuator = FakeActuator::new();

        dispatcher.apply_remote(set(Axis::X, 500), t0, &mut actuator).unwrap();
        dispatcher.tick(t0, &mut actuator).unwrap();
        assert_eq!(dispatcher.watchdog(), WatchdogState::Armed);
        assert_eq!(dispatcher.health(), RuntimeHealth::Ok);

        let report = dispatcher.tick(ms(t0, 400), &mut actuator).unwrap();
        assert!(!report.watchdog_tripped);

        let report = dispatcher.tick(ms(t0, 600), &mut actuator).unwrap();
        assert!(report.watchdog_tripped);
        assert!(dispatcher.command().is_zero());

        for step in 7..30 {
            let report = dispatcher.tick(ms(t0, step * 100), &mut actuator).unwrap();
            assert!(!report.watchdog_tripped);
        }
        assert_eq!(actuator.stops(), 1);
        assert_eq!(dispatcher.watchdog(), WatchdogState::Tripped);
    }

    #[test]
    fn test_watchdog_rearms_on_fresh_command() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, true));
        let mut actuator = FakeActuator::new();

        dispatcher.apply_remote(set(Axis::X, 100), t0, &mut actuator).unwrap();
        dispatcher.tick(t0, &mut actuator).unwrap();
        dispatcher.tick(ms(t0, 1000), &mut actuator).unwrap();
        assert_eq!(dispatcher.watchdog(), WatchdogState::Tripped);

        dispatcher.apply_remote(set(Axis::X, 200), ms(t0, 2000), &mut actuator).unwrap();
        let report = dispatcher.tick(ms(t0, 2000), &mut actuator).unwrap();
        assert_eq!(dispatcher.watchdog(), WatchdogState::Armed);
        // the fresh command transmits instead of being stopped
        assert!(!report.watchdog_tripped);
        assert_eq!(report.acks, vec![Ack { axis: Axis::X, delivered: true }]);

        dispatcher.tick(ms(t0, 3000), &mut actuator).unwrap();
        assert_eq!(actuator.stops(), 2);
    }

    #[test]
    fn test_watchdog_inactive_without_remote() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, false));
        let mut actuator = FakeActuator::new();

        dispatcher.nudge(Axis::X, 25);
        dispatcher.tick(ms(t0, 5000), &mut actuator).unwrap();
        assert_eq!(actuator.stops(), 0);
        assert_eq!(dispatcher.health(), RuntimeHealth::Ok);
        assert_eq!(dispatcher.command().speed_x(), 25);
    }

    #[test]
    fn test_repeat_policy_resends_every_cycle() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, false));
        let mut actuator = FakeActuator::new();

        dispatcher.tick(t0, &mut actuator).unwrap();
        assert_eq!(actuator.take().len(), 3);

        // throttled inside the write interval
        dispatcher.tick(ms(t0, 100), &mut actuator).unwrap();
        assert!(actuator.take().is_empty());

        dispatcher.tick(ms(t0, 400), &mut actuator).unwrap();
        assert_eq!(
            actuator.take(),
            vec![
                Call::Axis(Axis::X, 0),
                Call::Axis(Axis::Y, 0),
                Call::Axis(Axis::Rotation, 0)
            ]
        );
    }

    #[test]
    fn test_without_repeat_only_changes_are_sent() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, false, false));
        let mut actuator = FakeActuator::new();

        dispatcher.tick(t0, &mut actuator).unwrap();
        assert_eq!(actuator.take().len(), 3);

        dispatcher.tick(ms(t0, 500), &mut actuator).unwrap();
        assert!(actuator.take().is_empty());

        dispatcher.nudge(Axis::Rotation, 250);
        dispatcher.tick(ms(t0, 1000), &mut actuator).unwrap();
        assert_eq!(actuator.take(), vec![Call::Axis(Axis::Rotation, 250)]);
    }

    #[test]
    fn test_y_skipped_when_unsupported() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, true));
        let mut actuator = FakeActuator::new();
        actuator.has_y = false;

        dispatcher.apply_remote(set(Axis::Y, 300), t0, &mut actuator).unwrap();
        let report = dispatcher.tick(t0, &mut actuator).unwrap();

        assert_eq!(report.acks, vec![Ack { axis: Axis::Y, delivered: false }]);
        assert!(!actuator.calls.iter().any(|c| matches!(c, Call::Axis(Axis::Y, _))));
    }

    #[test]
    fn test_rejected_write_gives_negative_ack() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, false, true));
        let mut actuator = FakeActuator::new();
        actuator.fail_next = Some(rejected());

        dispatcher.apply_remote(set(Axis::X, 123), t0, &mut actuator).unwrap();
        let report = dispatcher.tick(t0, &mut actuator).unwrap();
        assert_eq!(report.acks, vec![Ack { axis: Axis::X, delivered: false }]);
        assert_eq!(actuator.stops(), 0);
    }

    #[test]
    fn test_fatal_write_stops_and_propagates() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, false));
        let mut actuator = FakeActuator::new();
        actuator.fail_next = Some(unplugged());

        assert!(dispatcher.tick(t0, &mut actuator).is_err());
        assert_eq!(actuator.calls, vec![Call::Axis(Axis::X, 0), Call::Stop]);
    }

    #[test]
    fn test_all_stop_ignores_throttle() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, false));
        let mut actuator = FakeActuator::new();

        dispatcher.nudge(Axis::X, 100);
        dispatcher.tick(t0, &mut actuator).unwrap();
        actuator.take();

        dispatcher.all_stop(&mut actuator).unwrap();
        assert_eq!(actuator.take(), vec![Call::Stop]);
        assert!(dispatcher.command().is_zero());
    }

    #[test]
    fn test_stopzero_refreshes_watchdog() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, true));
        let mut actuator = FakeActuator::new();

        dispatcher.apply_remote(set(Axis::X, 100), t0, &mut actuator).unwrap();
        dispatcher.apply_remote(RemoteCommand::StopZero, ms(t0, 300), &mut actuator).unwrap();
        assert_eq!(actuator.take(), vec![Call::Stop]);

        let report = dispatcher.tick(ms(t0, 700), &mut actuator).unwrap();
        assert!(!report.watchdog_tripped);
        assert!(report.acks.is_empty());
    }

    #[test]
    fn test_triple_mode_sends_whole_command() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::TripleRedundant, true, true));
        let mut actuator = FakeActuator::new();

        dispatcher.apply_remote(set(Axis::X, 300), t0, &mut actuator).unwrap();
        dispatcher.apply_remote(set(Axis::Rotation, -400), t0, &mut actuator).unwrap();
        let report = dispatcher.tick(t0, &mut actuator).unwrap();

        assert_eq!(
            actuator.take(),
            vec![Call::Motion(MotionCommand::new(300, 0, -400))]
        );
        assert_eq!(
            report.acks,
            vec![
                Ack { axis: Axis::X, delivered: true },
                Ack { axis: Axis::Rotation, delivered: true }
            ]
        );

        dispatcher.tick(ms(t0, 200), &mut actuator).unwrap();
        assert!(actuator.take().is_empty());
    }

    #[test]
    fn test_map_refresh_schedule() {
        let t0 = Instant::now();
        let mut dispatcher = Dispatcher::new(DispatchPolicy::new(CommandMode::SingleRegister, true, false));
        assert!(dispatcher.map_refresh_due(t0));
        dispatcher.mark_map_refreshed(t0);
        assert!(!dispatcher.map_refresh_due(ms(t0, 300)));
        assert!(dispatcher.map_refresh_due(ms(t0, 400)));
    }
}
