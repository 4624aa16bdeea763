//!A stand-in sensor panel for running off the Pi. Cars "appear" on every
//!lane for a while, then the track clears, over and over, so the race loop
//!can cycle end to end. Pair it with anything that accepts a TCP connection
//!on the configured finish line address (even `nc -l`) to exercise the
//!link; type `FIN1` there to finish lane 1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use raceway_core::{GatePosition, SensorPanel};

const STAGED_FOR: Duration = Duration::from_secs(10);
const CLEAR_FOR: Duration = Duration::from_secs(4);

pub struct SimPanel {
    occupied: Arc<AtomicBool>,
}

impl SimPanel {
    pub fn spawn() -> Self {
        let occupied = Arc::new(AtomicBool::new(false));
        let flag = occupied.clone();
        tokio::spawn(async move {
            loop {
                sleep(CLEAR_FOR).await;
                info!("sim: cars placed on every lane");
                flag.store(true, Ordering::Relaxed);
                sleep(STAGED_FOR).await;
                info!("sim: track cleared");
                flag.store(false, Ordering::Relaxed);
            }
        });
        Self { occupied }
    }
}

impl SensorPanel for SimPanel {
    fn lane_occupied(&self, _lane: usize) -> bool {
        self.occupied.load(Ordering::Relaxed)
    }

    fn set_gate(&mut self, position: GatePosition) {
        info!("sim: gate -> {:?}", position);
    }
}
