pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use config_rs::{Config, File};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raceway_coord::CoordinatorClient;
use raceway_core::config::RaceConfig;
use raceway_core::error::ConfigError;
use raceway_core::{DisplayHandle, DisplayState, InputEvent, SensorPanel};
use raceway_link::{FinishLineLink, LinkTransport, TcpTransport};
use raceway_session::error::RaceError;
use raceway_session::input::{HandlerSet, InputRouter};
use raceway_session::RaceSession;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raceway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 2 {
        warn!("at most one parameter, the config file, is expected.");
        warn!("got {}", args.join(","));
        return;
    }

    let mut builder = Config::builder();
    if let Some(cfg_name) = args.get(1) {
        builder = builder.add_source(File::with_name(cfg_name));
    }
    let config_res = builder
        .build()
        .and_then(|config| config.try_deserialize::<RaceConfig>());

    match config_res {
        Ok(config) => {
            info!("starting gate for track {} coming up", config.track_name);
            match run(config).await {
                Ok(_) => info!("starting gate shut down"),
                Err(err) => error!("starting gate exited with an error: {:?}", err),
            }
        }
        Err(err) => {
            error!("failed to parse config: {:?}", err);
        }
    }
}

async fn run(config: RaceConfig) -> Result<(), ConfigError> {
    config.validate()?;

    let (display, display_rx) = DisplayHandle::new();
    spawn_display_logger(display_rx);

    let (events_tx, events_rx) = mpsc::channel(16);
    let router = InputRouter::new();
    router.clone().spawn_dispatcher(events_rx);

    let panel = build_panel(&config, events_tx)?;
    let link = FinishLineLink::new(TcpTransport, &config.finish_line_name);
    let coordinator = CoordinatorClient::new(
        &config.coordinator_base_url(),
        Duration::from_secs_f64(config.barrier_timeout),
    )
    .map_err(|err| ConfigError::from(format!("{:?}", err)))?;

    let mut session = RaceSession::new(config, panel, link, coordinator, display)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = race_loop(&mut session, &router) => {}
    }

    //best effort goodbye to the coordinator before the process exits
    session.deregister().await;
    Ok(())
}

///Iterate over successive race sessions forever. Each pass leaves any old
///circuit registration behind, arms a fresh abort token, routes every key
///to it, and then runs race attempts until the user backs out or something
///fatal sends us back here.
async fn race_loop<T: LinkTransport>(session: &mut RaceSession<T>, router: &Arc<InputRouter>) {
    loop {
        session.deregister().await;

        let cancel = CancellationToken::new();
        let _abort_context = router.push(HandlerSet::race_abort(cancel.clone()));

        loop {
            match session.run_attempt(&cancel).await {
                Ok(Some(outcome)) => {
                    info!("race complete with {} lanes", outcome.results().len());
                }
                Ok(None) => break, //user aborted, back to the top
                Err(RaceError::Link(err)) => {
                    //recoverable: the next attempt re-runs discovery
                    warn!("lost the finish line, reconnecting: {:?}", err);
                }
                Err(err) => {
                    error!("race attempt failed: {:?}", err);
                    break;
                }
            }
            if cancel.is_cancelled() {
                break;
            }
        }
    }
}

fn spawn_display_logger(mut rx: watch::Receiver<DisplayState>) {
    tokio::spawn(async move {
        loop {
            let state = rx.borrow_and_update().clone();
            render(&state);
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}

///Stand-in for the display collaborator: narrate state transitions to the
///log instead of the LCD.
fn render(state: &DisplayState) {
    match state {
        DisplayState::Idle => info!("display: ready to race"),
        DisplayState::WaitingFinishLine => info!("display: searching for the finish line"),
        DisplayState::RegisteringRemote => info!("display: joining the circuit"),
        DisplayState::WaitingLocalReady => info!("display: waiting for cars at the gate"),
        DisplayState::WaitingRemoteReady => info!("display: waiting for the remote track"),
        DisplayState::Countdown { .. } => info!("display: 3... 2... 1..."),
        DisplayState::Running { .. } => info!("display: race running"),
        DisplayState::Outcome(outcome) => {
            for result in outcome.results() {
                if result.finished() {
                    info!(
                        "display: {} lane {}: {:.3}s",
                        result.track_name, result.lane_number, result.lane_time
                    );
                } else {
                    info!(
                        "display: {} lane {}: did not finish",
                        result.track_name, result.lane_number
                    );
                }
            }
        }
    }
}

#[cfg(feature = "rpi")]
fn build_panel(
    config: &RaceConfig,
    events: mpsc::Sender<InputEvent>,
) -> Result<Box<dyn SensorPanel>, ConfigError> {
    let panel = raceway_gpio::GpioPanel::try_build(
        &raceway_gpio::PanelPins::default(),
        config.gate_closed,
        config.gate_released,
        events,
    )?;
    Ok(Box::new(panel))
}

#[cfg(not(feature = "rpi"))]
fn build_panel(
    _config: &RaceConfig,
    _events: mpsc::Sender<InputEvent>,
) -> Result<Box<dyn SensorPanel>, ConfigError> {
    Ok(Box::new(sim::SimPanel::spawn()))
}
