//!Race configuration. Owned by the configuration collaborator and
//!read-only to the race core while a race is active. The remote track
//!roster learned during multi-track registration does not live here; it is
//!owned by the coordinator client.

use serde::Deserialize;

use crate::error::ConfigError;

fn default_circuit() -> String {
    "DRR".to_string()
}

fn default_track_name() -> String {
    "Track-1".to_string()
}

fn default_num_lanes() -> u8 {
    2
}

fn default_race_timeout() -> f64 {
    5.0
}

fn default_car_icons() -> Vec<String> {
    ["convertible-red", "white", "blue", "black"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_finish_line_name() -> String {
    "FinishLine".to_string()
}

fn default_coord_port() -> u16 {
    1968
}

fn default_gate_closed() -> f64 {
    0.0
}

fn default_gate_released() -> f64 {
    1.0
}

fn default_barrier_timeout() -> f64 {
    300.0
}

///Configuration for one starting-gate node.
#[derive(Debug, Clone, Deserialize)]
pub struct RaceConfig {
    ///Name of the circuit this track races in when multi-track is selected.
    #[serde(default = "default_circuit")]
    pub circuit: String,
    #[serde(default = "default_track_name")]
    pub track_name: String,
    ///Number of local lanes, 1 through 4.
    #[serde(default = "default_num_lanes")]
    pub num_lanes: u8,
    ///Seconds after gate release before the race is declared over.
    #[serde(default = "default_race_timeout")]
    pub race_timeout: f64,
    ///Car icon per lane, consumed by the display and sent on registration.
    #[serde(default = "default_car_icons")]
    pub car_icons: Vec<String>,
    ///Advertised name of the finish line device to discover and connect.
    #[serde(default = "default_finish_line_name")]
    pub finish_line_name: String,
    #[serde(default)]
    pub coord_host: String,
    #[serde(default = "default_coord_port")]
    pub coord_port: u16,
    ///Race against other tracks in the circuit via the coordinator.
    #[serde(default)]
    pub multi_track: bool,
    ///Servo calibration, in the servo's -1.0..=1.0 range.
    #[serde(default = "default_gate_closed")]
    pub gate_closed: f64,
    #[serde(default = "default_gate_released")]
    pub gate_released: f64,
    ///Upper bound, in seconds, on the coordinator start/results barrier
    ///calls. These block until every track in the circuit arrives, so the
    ///bound is generous.
    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout: f64,
}

impl RaceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_lanes < 1 || self.num_lanes > 4 {
            return Err(format!("num_lanes must be 1..=4, got {}", self.num_lanes).into());
        }
        if !(self.race_timeout > 0.0) {
            return Err(format!("race_timeout must be > 0, got {}", self.race_timeout).into());
        }
        if self.car_icons.len() < self.num_lanes as usize {
            return Err(format!(
                "need at least {} car_icons, got {}",
                self.num_lanes,
                self.car_icons.len()
            )
            .into());
        }
        if self.multi_track && self.coord_host.is_empty() {
            return Err("multi_track racing needs a coord_host".into());
        }
        if !(self.barrier_timeout > 0.0) {
            return Err(
                format!("barrier_timeout must be > 0, got {}", self.barrier_timeout).into(),
            );
        }
        Ok(())
    }

    pub fn coordinator_base_url(&self) -> String {
        format!("http://{}:{}", self.coord_host, self.coord_port)
    }
}
