//! Arduino backend. Commands go out over a single serial port and status
//! lines come back on the same port.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::serial::{self, SerialLink};
use crate::worker::SharedState;

use super::DeviceBackend;

const LISTEN_IDLE: Duration = Duration::from_millis(50);

pub struct Arduino {
    link: Arc<SerialLink>,
    state: Arc<SharedState>,
    status_check: bool,
}

impl Arduino {
    pub fn new(link: Arc<SerialLink>, state: Arc<SharedState>, status_check: bool) -> Self {
        Arduino {
            link,
            state,
            status_check,
        }
    }
}

impl DeviceBackend for Arduino {
    fn start(self: Arc<Self>) -> Result<()> {
        match self.link.output_path() {
            Some(port) => info!("Serial port: {}", port),
            None => warn!(
                "No serial port configured. Available ports: {:?}",
                serial::available_ports()
            ),
        }
        if self.status_check {
            let link = self.link.clone();
            let state = self.state.clone();
            thread::spawn(move || run_listener(link, state));
        }
        Ok(())
    }

    fn send(&self, command: &str) {
        self.link.send(command);
    }

    fn stop(&self) {
        self.link.clear();
    }
}

/// Reads status lines from the device and polls it in the configured
/// interval. JSON frames that are not command envelopes are dropped.
fn run_listener(link: Arc<SerialLink>, state: Arc<SharedState>) {
    while !state.shutdown.load(Ordering::SeqCst) {
        match link.listen() {
            Some(line) => {
                if let Some(status) = serial::decode_frame(link.format(), &line) {
                    state.set_serial_status(&status);
                }
            }
            None => thread::sleep(LISTEN_IDLE),
        }
        link.update();
    }
}
