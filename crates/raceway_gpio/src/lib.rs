//!Raspberry Pi hardware for the starting gate: lane IR sensors, the gate
//!servo, and the keys and joystick on the LCD HAT. Lane levels fan out over
//!watch channels updated from pin interrupts; button presses are debounced
//!and forwarded as `InputEvent`s for the input router.

use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use raceway_core::{GatePosition, InputEvent, JoystickDirection, SensorPanel};

pub mod error;

use error::GpioError;

const KEY_DEBOUNCE: Duration = Duration::from_millis(100);
const JOYSTICK_DEBOUNCE: Duration = Duration::from_millis(20);

///Servo PWM parameters: 50 Hz frame, 1.0 to 2.0 ms pulse across the
///servo's -1.0..=1.0 range.
const SERVO_FREQUENCY: f64 = 50.0;

///BCM pin assignments. The defaults match the prototyping HAT wiring.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelPins {
    pub lanes: Vec<u8>,
    pub servo: u8,
    pub key_1: u8,
    pub key_2: u8,
    pub key_3: u8,
    pub joy_up: u8,
    pub joy_down: u8,
    pub joy_left: u8,
    pub joy_right: u8,
    pub joy_press: u8,
}

impl Default for PanelPins {
    fn default() -> Self {
        Self {
            lanes: vec![7, 23, 22, 4],
            servo: 12,
            key_1: 21,
            key_2: 20,
            key_3: 16,
            joy_up: 6,
            joy_down: 19,
            joy_left: 5,
            joy_right: 26,
            joy_press: 13,
        }
    }
}

///Sensor panel backed by the Pi's GPIO header.
pub struct GpioPanel {
    lanes: Vec<watch::Receiver<bool>>,
    //pins are held only to keep their interrupt callbacks registered
    _pins: Vec<InputPin>,
    servo: OutputPin,
    gate_closed: f64,
    gate_released: f64,
}

impl GpioPanel {
    pub fn try_build(
        pins: &PanelPins,
        gate_closed: f64,
        gate_released: f64,
        events: mpsc::Sender<InputEvent>,
    ) -> Result<Self, GpioError> {
        let gpio = Gpio::new()?;

        let mut lanes = Vec::with_capacity(pins.lanes.len());
        let mut held = Vec::new();
        for &pin in &pins.lanes {
            let (rx, pin) = watch_lane(&gpio, pin)?;
            lanes.push(rx);
            held.push(pin);
        }

        for (pin, event, debounce) in [
            (pins.key_1, InputEvent::Key1, KEY_DEBOUNCE),
            (pins.key_2, InputEvent::Key2, KEY_DEBOUNCE),
            (pins.key_3, InputEvent::Key3, KEY_DEBOUNCE),
            (
                pins.joy_up,
                InputEvent::Joystick(JoystickDirection::Up),
                JOYSTICK_DEBOUNCE,
            ),
            (
                pins.joy_down,
                InputEvent::Joystick(JoystickDirection::Down),
                JOYSTICK_DEBOUNCE,
            ),
            (
                pins.joy_left,
                InputEvent::Joystick(JoystickDirection::Left),
                JOYSTICK_DEBOUNCE,
            ),
            (
                pins.joy_right,
                InputEvent::Joystick(JoystickDirection::Right),
                JOYSTICK_DEBOUNCE,
            ),
            (
                pins.joy_press,
                InputEvent::Joystick(JoystickDirection::Press),
                JOYSTICK_DEBOUNCE,
            ),
        ] {
            held.push(watch_button(&gpio, pin, debounce, events.clone(), event)?);
        }

        let servo = gpio.get(pins.servo)?.into_output();

        Ok(Self {
            lanes,
            _pins: held,
            servo,
            gate_closed,
            gate_released,
        })
    }

    fn drive_servo(&mut self, value: f64) {
        let pulse_ms = 1.5 + 0.5 * value.clamp(-1.0, 1.0);
        let duty = pulse_ms / (1000.0 / SERVO_FREQUENCY);
        if let Err(err) = self.servo.set_pwm_frequency(SERVO_FREQUENCY, duty) {
            error!("error driving gate servo: {}", err);
        }
    }
}

impl SensorPanel for GpioPanel {
    fn lane_occupied(&self, lane: usize) -> bool {
        self.lanes.get(lane).map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn set_gate(&mut self, position: GatePosition) {
        debug!("gate -> {:?}", position);
        match position {
            GatePosition::Released => self.drive_servo(self.gate_released),
            GatePosition::Closed => self.drive_servo(self.gate_closed),
            GatePosition::Neutral => {
                //stop the PWM signal entirely to prevent servo hum and wear
                if let Err(err) = self.servo.clear_pwm() {
                    error!("error idling gate servo: {}", err);
                }
            }
        }
    }
}

fn watch_lane(gpio: &Gpio, pin: u8) -> Result<(watch::Receiver<bool>, InputPin), GpioError> {
    let pin = gpio.get(pin)?;
    let mut pin = pin.into_input_pullup();
    //the IR sensor pulls the line low while a car sits over it
    let (tx, rx) = watch::channel(pin.read() == Level::Low);
    pin.set_async_interrupt(Trigger::Both, move |level| {
        let _ = tx.send(level == Level::Low);
    })?;
    Ok((rx, pin))
}

fn watch_button(
    gpio: &Gpio,
    pin: u8,
    debounce: Duration,
    events: mpsc::Sender<InputEvent>,
    event: InputEvent,
) -> Result<InputPin, GpioError> {
    let pin = gpio.get(pin)?;
    let mut pin = pin.into_input_pullup();
    let mut last: Option<Instant> = None;
    pin.set_async_interrupt(Trigger::FallingEdge, move |_level| {
        let now = Instant::now();
        if let Some(previous) = last {
            if now.duration_since(previous) < debounce {
                return;
            }
        }
        last = Some(now);
        if let Err(err) = events.try_send(event) {
            warn!("dropping input event {:?}: {}", event, err);
        }
    })?;
    Ok(pin)
}
