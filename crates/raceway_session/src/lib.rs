//!The race session: an explicit state machine that sequences one starting
//!gate through a race, from idle through countdown, running, and results.
//!The session is the sole writer of race state. It drives the sensor panel
//!and gate, the finish line link, and (for multi-track races) the
//!coordinator client, and publishes display states for a renderer to
//!consume. A cancellation token set by the input router aborts a race from
//!any state back to idle.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use raceway_coord::CoordinatorClient;
use raceway_core::config::RaceConfig;
use raceway_core::error::ConfigError;
use raceway_core::{
    DisplayHandle, DisplayState, GatePosition, LaneResult, RaceOutcome, SensorPanel, NOT_FINISHED,
};
use raceway_link::{FinishLineLink, LinkTransport, PURGE_WINDOW};

pub mod error;
pub mod input;

use error::RaceError;

///Cadence for sensor polls and finish line reads.
const POLL_PERIOD: Duration = Duration::from_millis(100);

///Fixed pre-race countdown, measured from entering the countdown state.
const COUNTDOWN: Duration = Duration::from_secs(3);

///How long to hold the servo at the closed position before cutting the PWM
///signal. Leaving the signal on makes the servo hum and wear.
const GATE_RESET_PULSE: Duration = Duration::from_millis(100);

///Finish line discovery retry backoff, doubling up to the cap.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);

///Race lifecycle states. Bracketed multi-track states are only traversed
///when the configuration selects multi-track racing. Every non-idle state
///has an abort edge back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceState {
    Idle,
    ConnectingFinishLine,
    RegisteringRemote,
    WaitingLocalReady,
    WaitingRemoteReady,
    Countdown,
    Running,
    Finished,
    TimedOut,
}

enum RunEnd {
    Aborted,
    Finished,
    TimedOut,
}

///Per-lane finish times for one race. Each lane records at most once; a
///redundant notification for an already finished lane is logged and
///discarded.
struct LaneTimes {
    times: Vec<f64>,
}

impl LaneTimes {
    fn new(num_lanes: u8) -> Self {
        Self {
            times: vec![NOT_FINISHED; num_lanes as usize],
        }
    }

    fn record(&mut self, lane_number: u8, elapsed: Duration) {
        let slot = lane_number
            .checked_sub(1)
            .map(usize::from)
            .and_then(|i| self.times.get_mut(i));
        let Some(slot) = slot else {
            warn!("finish reported for unconfigured lane {}", lane_number);
            return;
        };
        if *slot != NOT_FINISHED {
            warn!("lane {} reported a redundant finish, keeping the first", lane_number);
            return;
        }
        let secs = elapsed.as_secs_f64();
        info!("lane {} finished, elapsed time: {:.3}", lane_number, secs);
        *slot = secs;
    }

    fn all_finished(&self) -> bool {
        self.times.iter().all(|t| *t != NOT_FINISHED)
    }

    fn into_results(self, track_name: &str) -> Vec<LaneResult> {
        self.times
            .into_iter()
            .enumerate()
            .map(|(index, lane_time)| LaneResult {
                track_name: track_name.to_string(),
                lane_number: index as u8 + 1,
                lane_time,
            })
            .collect()
    }
}

///One starting gate node's race orchestrator.
pub struct RaceSession<T: LinkTransport> {
    config: RaceConfig,
    panel: Box<dyn SensorPanel>,
    link: FinishLineLink<T>,
    coordinator: CoordinatorClient,
    display: DisplayHandle,
    state: RaceState,
}

impl<T: LinkTransport> RaceSession<T> {
    pub fn new(
        config: RaceConfig,
        panel: Box<dyn SensorPanel>,
        link: FinishLineLink<T>,
        coordinator: CoordinatorClient,
        display: DisplayHandle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            panel,
            link,
            coordinator,
            display,
            state: RaceState::Idle,
        })
    }

    pub fn state(&self) -> RaceState {
        self.state
    }

    pub fn link_connected(&self) -> bool {
        self.link.is_connected()
    }

    ///Leave the circuit. Best effort, called between race sessions and on
    ///shutdown.
    pub async fn deregister(&mut self) {
        self.coordinator.deregister().await;
    }

    ///Run one race attempt to completion. `Ok(Some(outcome))` is a finished
    ///or timed-out race; `Ok(None)` means the user aborted and no outcome
    ///was published. Errors abandon the attempt and leave the session back
    ///at idle; a link error additionally forces a fresh finish line
    ///connection on the next attempt.
    pub async fn run_attempt(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<RaceOutcome>, RaceError> {
        match self.attempt(cancel).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RaceError::Aborted) => {
                info!("race aborted, returning to idle");
                self.go_idle().await;
                Ok(None)
            }
            Err(err) => {
                self.go_idle().await;
                Err(err)
            }
        }
    }

    async fn attempt(&mut self, cancel: &CancellationToken) -> Result<RaceOutcome, RaceError> {
        if cancel.is_cancelled() {
            return Err(RaceError::Aborted);
        }

        self.enter(RaceState::ConnectingFinishLine, DisplayState::WaitingFinishLine);
        self.connect_finish_line(cancel).await?;

        if self.config.multi_track {
            self.enter(RaceState::RegisteringRemote, DisplayState::RegisteringRemote);
            self.coordinator
                .register(
                    &self.config.circuit,
                    &self.config.track_name,
                    self.config.num_lanes,
                    &self.config.car_icons,
                    cancel,
                )
                .await?;
        }

        //the one state a user may sit in arbitrarily long while staging cars
        self.enter(RaceState::WaitingLocalReady, DisplayState::WaitingLocalReady);
        self.wait_lanes(cancel, true).await?;
        info!("all lanes ready");

        if self.config.multi_track {
            self.enter(RaceState::WaitingRemoteReady, DisplayState::WaitingRemoteReady);
            self.coordinator.start(cancel).await?;
        }

        self.enter(
            RaceState::Countdown,
            DisplayState::Countdown {
                started_at: Instant::now(),
            },
        );
        sleep_checked(COUNTDOWN, cancel).await?;

        let outcome = self.run_race(cancel).await?;

        self.reset_gate().await;
        self.display.publish(DisplayState::Outcome(outcome.clone()));

        //placing a car back on a lane ended the results display in older
        //builds; now the gesture is clearing every lane
        self.wait_lanes(cancel, false).await?;
        self.enter(RaceState::Idle, DisplayState::Idle);
        Ok(outcome)
    }

    ///The timed portion of the race. Arms the finish line, purges anything
    ///it buffered before arming, releases the gate and polls until every
    ///configured lane finished, the race times out, or the user aborts.
    ///Exit priority per poll cycle: abort, then completion, then timeout.
    async fn run_race(&mut self, cancel: &CancellationToken) -> Result<RaceOutcome, RaceError> {
        self.link.arm().await?;
        self.link.purge(PURGE_WINDOW).await?;

        self.panel.set_gate(GatePosition::Released);
        let start = Instant::now();
        self.enter(RaceState::Running, DisplayState::Running { started_at: start });
        info!("race started");

        let race_timeout = Duration::from_secs_f64(self.config.race_timeout);
        let mut times = LaneTimes::new(self.config.num_lanes);

        let end = loop {
            if cancel.is_cancelled() {
                break RunEnd::Aborted;
            }
            if times.all_finished() {
                break RunEnd::Finished;
            }
            if start.elapsed() >= race_timeout {
                break RunEnd::TimedOut;
            }

            match self.link.poll_finish(POLL_PERIOD).await {
                Ok(Some(lane)) => times.record(lane, start.elapsed()),
                Ok(None) => {}
                Err(err) => {
                    warn!("finish line dropped mid race, abandoning attempt");
                    return Err(err.into());
                }
            }
        };

        //always suppress further notifications, whatever ended the race
        if let Err(err) = self.link.disarm().await {
            warn!("could not disarm finish line: {:?}", err);
        }

        match end {
            RunEnd::Aborted => Err(RaceError::Aborted),
            RunEnd::Finished => {
                info!("race finished");
                self.state = RaceState::Finished;
                self.collect_outcome(times, cancel).await
            }
            RunEnd::TimedOut => {
                info!("race timed out");
                self.state = RaceState::TimedOut;
                self.collect_outcome(times, cancel).await
            }
        }
    }

    ///Local results, merged across the circuit when multi-track.
    async fn collect_outcome(
        &mut self,
        times: LaneTimes,
        cancel: &CancellationToken,
    ) -> Result<RaceOutcome, RaceError> {
        let local = RaceOutcome::from_unsorted(times.into_results(&self.config.track_name));
        if self.config.multi_track {
            Ok(self.coordinator.results(local.results(), cancel).await?)
        } else {
            Ok(local)
        }
    }

    ///Retry discovery until the finish line is found, with bounded
    ///exponential backoff between scans. Retries indefinitely; only an
    ///abort gets us out.
    async fn connect_finish_line(&mut self, cancel: &CancellationToken) -> Result<(), RaceError> {
        if self.link.is_connected() {
            return Ok(());
        }
        let mut backoff = RECONNECT_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return Err(RaceError::Aborted);
            }
            match self.link.connect().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("finish line not found, scanning again"),
                Err(err) => warn!("finish line connect failed: {:?}", err),
            }
            sleep_checked(backoff, cancel).await?;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
    }

    ///Poll the lane sensors until every configured lane is occupied
    ///(`occupied = true`, staging) or empty (`occupied = false`, clearing
    ///the track after a race). No timeout; abort is the only other exit.
    async fn wait_lanes(
        &mut self,
        cancel: &CancellationToken,
        occupied: bool,
    ) -> Result<(), RaceError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RaceError::Aborted);
            }
            let done = if occupied {
                self.panel.all_lanes_occupied(self.config.num_lanes)
            } else {
                self.panel.all_lanes_empty(self.config.num_lanes)
            };
            if done {
                return Ok(());
            }
            sleep_checked(POLL_PERIOD, cancel).await?;
        }
    }

    ///Drive the servo back to the closed position, then cut the signal.
    async fn reset_gate(&mut self) {
        self.panel.set_gate(GatePosition::Closed);
        sleep(GATE_RESET_PULSE).await;
        self.panel.set_gate(GatePosition::Neutral);
    }

    async fn go_idle(&mut self) {
        self.reset_gate().await;
        self.enter(RaceState::Idle, DisplayState::Idle);
    }

    fn enter(&mut self, state: RaceState, display: DisplayState) {
        debug!("race state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.display.publish(display);
    }
}

async fn sleep_checked(duration: Duration, cancel: &CancellationToken) -> Result<(), RaceError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RaceError::Aborted),
        _ = sleep(duration) => Ok(()),
    }
}
