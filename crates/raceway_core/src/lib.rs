//!This is the core library for the raceway project. All other raceway libraries depend on this one. This includes the race data model, the sensor panel and gate contracts, and the display state channel.

use std::cmp::Ordering;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub mod config;
pub mod error;

///Reserved elapsed-time value meaning the lane never completed within the race timeout.
pub const NOT_FINISHED: f64 = f64::MAX;

///Commanded position of the starting gate actuator. `Neutral` stops driving
///the servo entirely to prevent hum and wear while no race is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePosition {
    Released,
    Closed,
    Neutral,
}

///Contract for the lane sensors and the gate actuator. Implemented by the
///GPIO panel on real hardware and by a simulated panel in development.
///Lane indexes are zero based.
pub trait SensorPanel: Send {
    fn lane_occupied(&self, lane: usize) -> bool;
    fn set_gate(&mut self, position: GatePosition);

    fn all_lanes_occupied(&self, num_lanes: u8) -> bool {
        (0..num_lanes as usize).all(|lane| self.lane_occupied(lane))
    }

    fn all_lanes_empty(&self, num_lanes: u8) -> bool {
        (0..num_lanes as usize).all(|lane| !self.lane_occupied(lane))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickDirection {
    Up,
    Down,
    Left,
    Right,
    Press,
}

///One edge-triggered press from the physical buttons or the joystick.
///What it means depends on the input context currently on top of the
///router's handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key1,
    Key2,
    Key3,
    Joystick(JoystickDirection),
}

///One lane's result. `lane_number` is 1-based on the wire and on the
///display. An unfinished lane carries the `NOT_FINISHED` sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneResult {
    #[serde(rename = "trackName")]
    pub track_name: String,
    #[serde(rename = "laneNumber")]
    pub lane_number: u8,
    #[serde(rename = "laneTime")]
    pub lane_time: f64,
}

impl LaneResult {
    pub fn finished(&self) -> bool {
        self.lane_time != NOT_FINISHED
    }
}

///Ordered results across all participating tracks. Ascending by elapsed
///time, unfinished lanes last. The sort is stable, so equal times and
///sentinel entries keep their original lane order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaceOutcome {
    results: Vec<LaneResult>,
}

impl RaceOutcome {
    pub fn from_unsorted(mut results: Vec<LaneResult>) -> Self {
        results.sort_by(|a, b| {
            a.lane_time
                .partial_cmp(&b.lane_time)
                .unwrap_or(Ordering::Equal)
        });
        Self { results }
    }

    ///For results that arrive already ordered, e.g. merged results from the
    ///race coordinator.
    pub fn from_sorted(results: Vec<LaneResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[LaneResult] {
        &self.results
    }
}

///Race state published for the display collaborator. The display renders
///these; the race core never renders anything itself.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayState {
    Idle,
    WaitingFinishLine,
    RegisteringRemote,
    WaitingLocalReady,
    WaitingRemoteReady,
    Countdown { started_at: Instant },
    Running { started_at: Instant },
    Outcome(RaceOutcome),
}

///Publishing side of the display channel. The race session is the only
///writer; any number of display consumers may watch the receiver without
///back-pressuring the race loop.
pub struct DisplayHandle {
    tx: watch::Sender<DisplayState>,
}

impl DisplayHandle {
    pub fn new() -> (Self, watch::Receiver<DisplayState>) {
        let (tx, rx) = watch::channel(DisplayState::Idle);
        (Self { tx }, rx)
    }

    pub fn publish(&self, state: DisplayState) {
        //send_replace never fails, even with no display attached
        self.tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(lane_number: u8, lane_time: f64) -> LaneResult {
        LaneResult {
            track_name: "Track-1".to_string(),
            lane_number,
            lane_time,
        }
    }

    #[test]
    fn outcome_sorts_ascending_with_unfinished_last() {
        let outcome = RaceOutcome::from_unsorted(vec![
            lane(1, NOT_FINISHED),
            lane(2, 1.5),
            lane(3, 0.9),
            lane(4, NOT_FINISHED),
        ]);
        let times: Vec<f64> = outcome.results().iter().map(|r| r.lane_time).collect();
        assert_eq!(times, vec![0.9, 1.5, NOT_FINISHED, NOT_FINISHED]);
        //stable: unfinished lanes keep their original relative order
        assert_eq!(outcome.results()[2].lane_number, 1);
        assert_eq!(outcome.results()[3].lane_number, 4);
    }

    #[test]
    fn outcome_sort_is_stable_for_equal_times() {
        let outcome =
            RaceOutcome::from_unsorted(vec![lane(2, 1.234), lane(1, 1.234), lane(3, 0.5)]);
        assert_eq!(outcome.results()[0].lane_number, 3);
        assert_eq!(outcome.results()[1].lane_number, 2);
        assert_eq!(outcome.results()[2].lane_number, 1);
    }

    #[test]
    fn lane_result_wire_field_names() {
        let json = serde_json::to_string(&lane(1, 1.25)).unwrap();
        assert!(json.contains("\"trackName\""));
        assert!(json.contains("\"laneNumber\""));
        assert!(json.contains("\"laneTime\""));
    }
}
