use crate::connection::{self, Connect, ReadError};
use crate::instruments::{ControlMode, DiagnosticGeneral, Reading, Status};
use crate::output;
use crate::reader::{self, RetryingReader, Timing};
use std::convert::Infallible;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CYCLE_DELAY: Duration = Duration::from_secs(5);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Intervals {
    pub cycle: Duration,
    pub reconnect: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self { cycle: CYCLE_DELAY, reconnect: RECONNECT_DELAY }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "poll::Args")]
pub struct Args {
    /// Time to wait between polling cycles.
    #[arg(long, default_value = "5s")]
    cycle_delay: humantime::Duration,

    /// Time to wait before reconnecting after the session has failed.
    #[arg(long, default_value = "5s")]
    reconnect_delay: humantime::Duration,
}

impl Args {
    pub fn intervals(&self) -> Intervals {
        Intervals { cycle: *self.cycle_delay, reconnect: *self.reconnect_delay }
    }
}

/// Receives every reading taken while polling.
pub trait Sink {
    fn emit(&mut self, reading: &Reading) -> Result<(), output::Error>;
}

impl<S: Sink> Sink for Option<S> {
    fn emit(&mut self, reading: &Reading) -> Result<(), output::Error> {
        match self {
            Some(sink) => sink.emit(reading),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum State {
    Disconnected,
    Connected,
    Polling,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("could not open the link to the device")]
    Link(#[from] connection::Error),
    #[error("could not read the identity of device {1}")]
    IdentityRead(#[source] ReadError, u8),
    #[error("device did not confirm it is at address {0}")]
    IdentityMismatch(u8),
    #[error("communications error")]
    Communication(#[from] reader::Error),
}

/// Connects to the device, verifies it, and polls it until cancelled.
///
/// A failed session is abandoned as a whole: the link is dropped and a fresh one is established
/// after [`Intervals::reconnect`].
pub struct PollLoop<C, S> {
    connector: C,
    sink: S,
    timing: Timing,
    intervals: Intervals,
    state: State,
}

impl<C: Connect, S: Sink> PollLoop<C, S> {
    pub fn new(connector: C, sink: S, timing: Timing, intervals: Intervals) -> Self {
        Self { connector, sink, timing, intervals, state: State::Disconnected }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub async fn run(&mut self, cancel: &CancellationToken) {
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = self.session() => Some(outcome),
            };
            self.transition(State::Disconnected);
            let delay = humantime::format_duration(self.intervals.reconnect);
            match outcome {
                None => {
                    info!("polling cancelled");
                    return;
                }
                Some(Ok(never)) => match never {},
                Some(Err(e @ SessionError::Communication(_))) => {
                    error!(
                        message = "communications error, retrying",
                        %delay,
                        error = (&e as &dyn std::error::Error)
                    );
                }
                Some(Err(e)) => {
                    warn!(
                        message = "could not establish communication, retrying",
                        %delay,
                        error = (&e as &dyn std::error::Error)
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("polling cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.intervals.reconnect) => {}
            }
        }
    }

    fn transition(&mut self, state: State) {
        if self.state != state {
            debug!(message = "session state", from = %self.state, to = %state);
            self.state = state;
        }
    }

    async fn session(&mut self) -> Result<Infallible, SessionError> {
        let mut client = self.connector.connect().await?;
        let device_id = client.device_id();
        match client.test().await {
            Ok(true) => {}
            Ok(false) => return Err(SessionError::IdentityMismatch(device_id)),
            Err(e) => return Err(SessionError::IdentityRead(e, device_id)),
        }
        self.transition(State::Connected);

        let mut reader = RetryingReader::new(client, self.timing);
        let diagnostic = DiagnosticGeneral::read(&mut reader).await?;
        let status = Status::read(&mut reader).await?;
        info!(
            message = "established communication",
            manufacturer = %status.manufacturer_id,
            model = %status.model_id,
            serial = %status.serial_number,
            software_version = %diagnostic.software_version,
        );

        self.transition(State::Polling);
        loop {
            let reading = Reading::read(&mut reader).await?;
            info!(
                message = "polled",
                control_mode = %ControlMode::describe(reading.control_mode),
                battery_voltage = %reading.basic.battery_voltage,
                true_power_capacity = %reading.derived.true_power_capacity,
            );
            let active = reading.alarms.active().collect::<Vec<_>>();
            if !active.is_empty() {
                warn!(message = "ACTIVE ALARMS", alarms = %active.join(", "));
            }
            if let Err(e) = self.sink.emit(&reading) {
                warn!(
                    message = "could not record reading",
                    error = (&e as &dyn std::error::Error)
                );
            }
            tokio::time::sleep(self.intervals.cycle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::IDENTITY;
    use crate::registers::{DecodedValue, RegisterAddress};
    use crate::testing::{CallLog, ScriptedBus, ScriptedConnector};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        readings: Vec<Reading>,
        /// Raised after every reading, breaking the bus it was read from.
        on_emit: Arc<AtomicBool>,
    }

    impl Sink for Recorder {
        fn emit(&mut self, reading: &Reading) -> Result<(), output::Error> {
            self.readings.push(reading.clone());
            self.on_emit.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn run_for<C: Connect, S: Sink>(poll: &mut PollLoop<C, S>, duration: Duration) {
        let cancel = CancellationToken::new();
        let stop = async {
            tokio::time::sleep(duration).await;
            cancel.cancel();
        };
        tokio::join!(poll.run(&cancel), stop);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_identity_check_never_polls() {
        let log = CallLog::default();
        let connector = {
            let log = Arc::clone(&log);
            ScriptedConnector::new(move |_| {
                Some(ScriptedBus::new(10).with(IDENTITY, &[7]).logging_to(Arc::clone(&log)))
            })
        };
        let connects = Arc::clone(&connector.connects);
        let mut poll =
            PollLoop::new(connector, Recorder::default(), Timing::default(), Intervals::default());
        let start = Instant::now();
        run_for(&mut poll, Duration::from_secs(12)).await;

        let connects = connects.lock().unwrap();
        let offsets = connects.iter().map(|c| *c - start).collect::<Vec<_>>();
        let expected = [0, 5, 10].map(Duration::from_secs);
        assert_eq!(offsets, expected);
        assert!(log.lock().unwrap().iter().all(|c| c.address == IDENTITY.linear()));
        assert!(poll.sink().readings.is_empty());
        assert_eq!(poll.state(), State::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_identity_never_polls() {
        let connector = ScriptedConnector::new(|_| Some(ScriptedBus::new(10).failing(usize::MAX)));
        let connects = Arc::clone(&connector.connects);
        let mut poll =
            PollLoop::new(connector, Recorder::default(), Timing::default(), Intervals::default());
        let start = Instant::now();
        run_for(&mut poll, Duration::from_secs(12)).await;

        let offsets = connects.lock().unwrap().iter().map(|c| *c - start).collect::<Vec<_>>();
        assert_eq!(offsets, [0, 5, 10].map(Duration::from_secs));
        assert!(poll.sink().readings.is_empty());
        assert_eq!(poll.state(), State::Disconnected);
    }

    /// Refuses every reading.
    #[derive(Default)]
    struct FullDisk {
        attempts: usize,
    }

    impl Sink for FullDisk {
        fn emit(&mut self, _: &Reading) -> Result<(), output::Error> {
            self.attempts += 1;
            Err(output::Error::WriteStdout(std::io::Error::other("disk full")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_keeps_polling() {
        let connector =
            ScriptedConnector::new(|_| Some(ScriptedBus::new(10).with(IDENTITY, &[10])));
        let connects = Arc::clone(&connector.connects);
        let mut poll =
            PollLoop::new(connector, FullDisk::default(), Timing::default(), Intervals::default());
        run_for(&mut poll, Duration::from_secs(20)).await;

        assert_eq!(connects.lock().unwrap().len(), 1);
        assert!(poll.sink().attempts >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unopenable_port_is_retried() {
        let connector = ScriptedConnector::new(|_| None);
        let connects = Arc::clone(&connector.connects);
        let mut poll =
            PollLoop::new(connector, Recorder::default(), Timing::default(), Intervals::default());
        run_for(&mut poll, Duration::from_secs(7)).await;
        assert_eq!(connects.lock().unwrap().len(), 2);
        assert!(poll.sink().readings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn communication_error_reconnects_after_delay() {
        let broken = Arc::new(AtomicBool::new(false));
        let logs = Arc::new(Mutex::new(Vec::<CallLog>::new()));
        let connector = {
            let (broken, logs) = (Arc::clone(&broken), Arc::clone(&logs));
            ScriptedConnector::new(move |_| {
                broken.store(false, Ordering::SeqCst);
                let bus = ScriptedBus::new(10)
                    .with(IDENTITY, &[10])
                    .with(RegisterAddress::new(4, 5), &[245])
                    .broken_by(Arc::clone(&broken));
                logs.lock().unwrap().push(bus.log());
                Some(bus)
            })
        };
        let connects = Arc::clone(&connector.connects);
        let sink = Recorder { readings: Vec::new(), on_emit: Arc::clone(&broken) };
        let mut poll = PollLoop::new(connector, sink, Timing::default(), Intervals::default());
        run_for(&mut poll, Duration::from_secs(40)).await;

        let connects = connects.lock().unwrap();
        let logs = logs.lock().unwrap();
        let readings = &poll.sink().readings;
        assert!(connects.len() >= 2);
        assert!(readings.len() >= 2);
        assert_eq!(readings[0].basic.battery_voltage, DecodedValue::Numeric(245.0 * 0.1));

        // The first session fails on the first read of its second cycle. A busy priming read
        // costs one pacing interval; the last retry is followed by its 500ms backoff, then the
        // reconnect delay.
        let last_call = logs[0].lock().unwrap().last().unwrap().at;
        assert_eq!(connects[1], last_call + Duration::from_millis(500) + RECONNECT_DELAY);
        let cycle_start = last_call - Duration::from_millis(100 + 100 + 100 + 200 + 300 + 400);
        assert!(cycle_start - connects[0] > CYCLE_DELAY);
    }
}
