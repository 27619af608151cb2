//! Raspberry Pi backend.
//!
//! Commands are either bridged out over a serial port or executed directly
//! on the GPIO header. A GPIO command is a comma separated frame
//! `x,y,counter,a1,a2,a3,b4,b5,b6`: servo target angles first, a counter
//! the client ignores, then up to six action pin switches. Trailing fields
//! may be omitted and leave the hardware untouched.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
#[cfg(feature = "gpio-rppal")]
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info};
use serde::Deserialize;

use crate::config::{RaspberrySettings, ServoAxis};
use crate::serial::{self, SerialLink};
use crate::worker::SharedState;

use super::DeviceBackend;

const LISTEN_IDLE: Duration = Duration::from_millis(50);

/// Where device commands come from.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    #[default]
    Network,
    Serial,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputMode::Network => write!(f, "network"),
            InputMode::Serial => write!(f, "serial"),
        }
    }
}

/// Where device commands go.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Serial,
    Gpio,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Serial => write!(f, "serial"),
            OutputMode::Gpio => write!(f, "gpio"),
        }
    }
}

/// One decoded GPIO frame. Fields absent from the frame stay `None`.
#[derive(Debug, Default, PartialEq, Eq)]
struct GpioCommand {
    x: Option<i32>,
    y: Option<i32>,
    actions: [Option<bool>; 6],
}

/// Splits a comma separated command into its positional fields. Any
/// unparsable servo or action field rejects the whole frame; the counter
/// field is never interpreted.
fn parse_gpio_command(raw: &str) -> Option<GpioCommand> {
    let mut command = GpioCommand::default();
    for (n, part) in raw.split(',').enumerate() {
        let part = part.trim();
        match n {
            0 => command.x = Some(part.parse().ok()?),
            1 => command.y = Some(part.parse().ok()?),
            2 => {}
            3..=8 => command.actions[n - 3] = Some(part.parse::<i32>().ok()? != 0),
            _ => {}
        }
    }
    Some(command)
}

/// Clamps the requested angle into the configured limits and maps it onto
/// the duty cycle range. The divisor switches to the limit span when
/// limits are active. Returns the clamped angle together with the duty
/// cycle percentage.
#[allow(dead_code)]
fn servo_duty(axis: &ServoAxis, use_limit: bool, angle: i32) -> (i32, f64) {
    let angle = if angle < axis.limit_min {
        axis.limit_min
    } else if angle > axis.limit_max {
        axis.limit_max
    } else {
        angle
    };
    let span = if use_limit {
        axis.limit_max - axis.limit_min
    } else {
        axis.angle_max - axis.angle_min
    };
    if span == 0 {
        return (angle, axis.cycle_min);
    }
    let duty = axis.cycle_min + (angle as f64 / span as f64) * (axis.cycle_max - axis.cycle_min);
    (angle, duty)
}

pub struct Raspberry {
    settings: RaspberrySettings,
    link: Arc<SerialLink>,
    state: Arc<SharedState>,
    #[cfg(feature = "gpio-rppal")]
    gpio: Mutex<Option<rig::GpioRig>>,
}

impl Raspberry {
    pub fn new(
        settings: RaspberrySettings,
        link: Arc<SerialLink>,
        state: Arc<SharedState>,
    ) -> Self {
        Raspberry {
            settings,
            link,
            state,
            #[cfg(feature = "gpio-rppal")]
            gpio: Mutex::new(None),
        }
    }

    fn send_gpio(&self, raw: &str) {
        let Some(command) = parse_gpio_command(raw) else {
            error!("Malformed GPIO command: {}", raw);
            return;
        };
        if self.apply_gpio(&command) {
            debug!("SENDING TO GPIO: {}", raw);
        }
    }

    #[cfg(feature = "gpio-rppal")]
    fn init_gpio(&self) -> Result<()> {
        let mut guard = self
            .gpio
            .lock()
            .map_err(|_| anyhow::anyhow!("GPIO state lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(rig::GpioRig::init(&self.settings)?);
        }
        Ok(())
    }

    #[cfg(not(feature = "gpio-rppal"))]
    fn init_gpio(&self) -> Result<()> {
        anyhow::bail!("GPIO output mode requires the gpio-rppal feature")
    }

    #[cfg(feature = "gpio-rppal")]
    fn apply_gpio(&self, command: &GpioCommand) -> bool {
        let mut guard = match self.gpio.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("GPIO state lock poisoned");
                return false;
            }
        };
        if guard.is_none() {
            match rig::GpioRig::init(&self.settings) {
                Ok(rig) => *guard = Some(rig),
                Err(e) => {
                    error!("GPIO init error: {}", e);
                    return false;
                }
            }
        }
        let Some(rig) = guard.as_mut() else {
            return false;
        };
        match rig.apply(command, &self.settings) {
            Ok(()) => true,
            Err(e) => {
                error!("GPIO error: {}", e);
                false
            }
        }
    }

    #[cfg(not(feature = "gpio-rppal"))]
    fn apply_gpio(&self, _command: &GpioCommand) -> bool {
        error!("GPIO output is not compiled in");
        false
    }

    /// Reads device responses from the output port. Responses are echoed
    /// to the input port when commands also arrive over serial, so an
    /// attached controller sees what the device reported.
    fn run_output_listener(&self) {
        while !self.state.shutdown.load(Ordering::SeqCst) {
            match self.link.listen() {
                Some(line) => {
                    if let Some(status) = serial::decode_frame(self.link.format(), &line) {
                        if self.settings.mode_input == InputMode::Serial {
                            self.link
                                .send_input(&serial::encode_frame(self.link.format(), &status));
                        }
                        self.state.set_serial_status(&status);
                    }
                }
                None => thread::sleep(LISTEN_IDLE),
            }
            self.link.update();
        }
    }

    fn run_input_listener(&self) {
        while !self.state.shutdown.load(Ordering::SeqCst) {
            match self.link.listen_input() {
                Some(line) => {
                    if let Some(command) = serial::decode_frame(self.link.format(), &line) {
                        self.send(&command);
                    }
                }
                None => thread::sleep(LISTEN_IDLE),
            }
        }
    }
}

impl DeviceBackend for Raspberry {
    fn start(self: Arc<Self>) -> Result<()> {
        info!("Input mode: {}", self.settings.mode_input);
        info!("Output mode: {}", self.settings.mode_output);
        info!(
            "Serial input port: {}",
            self.settings.serial_input.as_deref().unwrap_or("-")
        );
        info!(
            "Serial output port: {}",
            self.settings.serial_output.as_deref().unwrap_or("-")
        );

        if self.settings.mode_output == OutputMode::Gpio {
            self.init_gpio()?;
        }
        if self.settings.mode_output == OutputMode::Serial && self.link.output_path().is_some() {
            info!("Starting serial output thread...");
            let device = self.clone();
            thread::spawn(move || device.run_output_listener());
        }
        if self.settings.mode_input == InputMode::Serial && self.link.input_path().is_some() {
            info!("Starting serial input thread...");
            let device = self.clone();
            thread::spawn(move || device.run_input_listener());
        }
        Ok(())
    }

    fn send(&self, command: &str) {
        match self.settings.mode_output {
            OutputMode::Serial => self.link.send(command),
            OutputMode::Gpio => self.send_gpio(command),
        }
    }

    fn stop(&self) {
        #[cfg(feature = "gpio-rppal")]
        if let Ok(mut guard) = self.gpio.lock() {
            if let Some(mut rig) = guard.take() {
                info!("Cleaning GPIO...");
                rig.cleanup();
            }
        }
        if self.settings.mode_output == OutputMode::Serial
            || self.settings.mode_input == InputMode::Serial
        {
            info!("Cleaning serial ports...");
            self.link.clear();
        }
    }
}

/// Pin driver. Pin numbers are BCM; servo pins run software PWM.
#[cfg(feature = "gpio-rppal")]
mod rig {
    use anyhow::{Context, Result};
    use log::debug;
    use rppal::gpio::{Gpio, OutputPin};
    use std::thread;

    use crate::config::{PinSettings, RaspberrySettings, ServoAxis};

    use super::{servo_duty, GpioCommand};

    const ACTION_LABELS: [&str; 6] = ["A1", "A2", "A3", "B4", "B5", "B6"];

    pub(super) struct GpioRig {
        servo_x: OutputPin,
        servo_y: OutputPin,
        actions: [OutputPin; 6],
        pins: PinSettings,
    }

    impl GpioRig {
        /// Claims every configured pin, starts the servo PWM at the
        /// configured initial duty and centers both axes.
        pub(super) fn init(settings: &RaspberrySettings) -> Result<Self> {
            let gpio = Gpio::new().context("GPIO controller unavailable")?;
            let pins = settings.pins.clone();
            let mut rig = GpioRig {
                servo_x: claim(&gpio, pins.servo_x)?,
                servo_y: claim(&gpio, pins.servo_y)?,
                actions: [
                    claim(&gpio, pins.action_a1)?,
                    claim(&gpio, pins.action_a2)?,
                    claim(&gpio, pins.action_a3)?,
                    claim(&gpio, pins.action_b4)?,
                    claim(&gpio, pins.action_b5)?,
                    claim(&gpio, pins.action_b6)?,
                ],
                pins,
            };

            let servo = &settings.servo;
            rig.servo_x
                .set_pwm_frequency(servo.x.freq_hz, servo.x.cycle_start / 100.0)
                .context("servo X PWM start failed")?;
            rig.servo_y
                .set_pwm_frequency(servo.y.freq_hz, servo.y.cycle_start / 100.0)
                .context("servo Y PWM start failed")?;

            drive_servo(
                &mut rig.servo_x,
                "X",
                rig.pins.servo_x,
                &servo.x,
                servo.use_limit,
                servo.x.angle_start,
            )?;
            drive_servo(
                &mut rig.servo_y,
                "Y",
                rig.pins.servo_y,
                &servo.y,
                servo.use_limit,
                servo.y.angle_start,
            )?;
            for index in 0..rig.actions.len() {
                rig.set_action(index, false);
            }
            Ok(rig)
        }

        pub(super) fn apply(
            &mut self,
            command: &GpioCommand,
            settings: &RaspberrySettings,
        ) -> Result<()> {
            let servo = &settings.servo;
            if let Some(angle) = command.x {
                drive_servo(
                    &mut self.servo_x,
                    "X",
                    self.pins.servo_x,
                    &servo.x,
                    servo.use_limit,
                    angle,
                )?;
            }
            if let Some(angle) = command.y {
                drive_servo(
                    &mut self.servo_y,
                    "Y",
                    self.pins.servo_y,
                    &servo.y,
                    servo.use_limit,
                    angle,
                )?;
            }
            for (index, action) in command.actions.iter().enumerate() {
                if let Some(value) = *action {
                    self.set_action(index, value);
                }
            }
            Ok(())
        }

        fn set_action(&mut self, index: usize, value: bool) {
            let pin_number = self.action_pin(index);
            let label = ACTION_LABELS[index];
            if value {
                self.actions[index].set_high();
                debug!("ACTION ON: {} (PIN {}, {})", label, pin_number, value);
            } else {
                self.actions[index].set_low();
                debug!("ACTION OFF: {} (PIN {}, {})", label, pin_number, value);
            }
            if !self.pins.action_delay.is_zero() {
                debug!("DELAY_PIN: {}", self.pins.action_delay.as_secs_f64());
                thread::sleep(self.pins.action_delay);
            }
        }

        fn action_pin(&self, index: usize) -> u8 {
            [
                self.pins.action_a1,
                self.pins.action_a2,
                self.pins.action_a3,
                self.pins.action_b4,
                self.pins.action_b5,
                self.pins.action_b6,
            ][index]
        }

        /// Stops the servo PWM and drops every action pin. Pins revert to
        /// inputs when released.
        pub(super) fn cleanup(&mut self) {
            let _ = self.servo_x.clear_pwm();
            let _ = self.servo_y.clear_pwm();
            for pin in self.actions.iter_mut() {
                pin.set_low();
            }
        }
    }

    fn claim(gpio: &Gpio, pin: u8) -> Result<OutputPin> {
        Ok(gpio
            .get(pin)
            .with_context(|| format!("failed to claim GPIO pin {}", pin))?
            .into_output())
    }

    fn drive_servo(
        pin: &mut OutputPin,
        label: &str,
        pin_number: u8,
        axis: &ServoAxis,
        use_limit: bool,
        angle: i32,
    ) -> Result<()> {
        let (angle, duty) = servo_duty(axis, use_limit, angle);
        debug!("SERVO {}: {} (PIN {} {})", label, angle, pin_number, duty);
        pin.set_pwm_frequency(axis.freq_hz, duty / 100.0)
            .with_context(|| format!("servo {} PWM update failed", label))?;
        if !axis.delay.is_zero() {
            debug!("DELAY {}: {}", label, axis.delay.as_secs_f64());
            thread::sleep(axis.delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn default_axis() -> ServoAxis {
        Config::default().raspberry.servo.x
    }

    #[test]
    fn servo_duty_maps_angles_onto_the_cycle_range() {
        let axis = default_axis();
        assert_eq!(servo_duty(&axis, false, 0), (0, 2.5));
        assert_eq!(servo_duty(&axis, false, 90), (90, 7.5));
        assert_eq!(servo_duty(&axis, false, 180), (180, 12.5));
    }

    #[test]
    fn servo_duty_clamps_out_of_range_angles() {
        let axis = default_axis();
        assert_eq!(servo_duty(&axis, false, -45), (0, 2.5));
        assert_eq!(servo_duty(&axis, false, 270), (180, 12.5));
    }

    #[test]
    fn servo_duty_divisor_follows_the_limit_span() {
        let mut axis = default_axis();
        axis.limit_min = 30;
        axis.limit_max = 150;

        let (angle, duty) = servo_duty(&axis, false, 0);
        assert_eq!(angle, 30);
        assert!((duty - (2.5 + (30.0 / 180.0) * 10.0)).abs() < 1e-9);

        let (angle, duty) = servo_duty(&axis, true, 0);
        assert_eq!(angle, 30);
        assert!((duty - (2.5 + (30.0 / 120.0) * 10.0)).abs() < 1e-9);
    }

    #[test]
    fn full_gpio_frame_parses_every_field() {
        let command = parse_gpio_command("90,45,12,1,0,1,0,1,0").unwrap();
        assert_eq!(command.x, Some(90));
        assert_eq!(command.y, Some(45));
        assert_eq!(
            command.actions,
            [
                Some(true),
                Some(false),
                Some(true),
                Some(false),
                Some(true),
                Some(false)
            ]
        );
    }

    #[test]
    fn partial_gpio_frame_leaves_missing_fields_unset() {
        let command = parse_gpio_command("120,60").unwrap();
        assert_eq!(command.x, Some(120));
        assert_eq!(command.y, Some(60));
        assert_eq!(command.actions, [None; 6]);
    }

    #[test]
    fn counter_field_is_not_interpreted() {
        let command = parse_gpio_command("90,45,abc,1").unwrap();
        assert_eq!(command.actions[0], Some(true));
    }

    #[test]
    fn malformed_gpio_frames_are_rejected() {
        assert_eq!(parse_gpio_command("x,45"), None);
        assert_eq!(parse_gpio_command("90,45,0,yes"), None);
        assert_eq!(parse_gpio_command(""), None);
    }

    #[test]
    fn mode_labels_match_config_values() {
        assert_eq!(InputMode::Network.to_string(), "network");
        assert_eq!(InputMode::Serial.to_string(), "serial");
        assert_eq!(OutputMode::Serial.to_string(), "serial");
        assert_eq!(OutputMode::Gpio.to_string(), "gpio");
    }
}
