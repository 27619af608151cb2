//! Device backends.
//!
//! A backend receives every command addressed to the hardware, whether it
//! arrived over the data socket or from the webserver, and turns it into
//! serial writes or GPIO changes. Backends spawn their own listener
//! threads on start and release hardware on stop.

pub mod arduino;
pub mod raspberry;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::protocol::Envelope;
use crate::sockets::Sockets;
use crate::status::StatusProbe;
use crate::worker::SharedState;

const COMMAND_POLL: Duration = Duration::from_millis(200);
const STATUS_TICK: Duration = Duration::from_secs(1);

/// Hardware platform the client drives.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Arduino,
    Raspberry,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Arduino => write!(f, "arduino"),
            DeviceKind::Raspberry => write!(f, "raspberry"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arduino" => Ok(DeviceKind::Arduino),
            "raspberry" => Ok(DeviceKind::Raspberry),
            other => Err(anyhow!("unknown device type: {}", other)),
        }
    }
}

/// A running hardware backend.
pub trait DeviceBackend: Send + Sync {
    /// Spawns the backend's listener threads and claims its hardware.
    fn start(self: Arc<Self>) -> Result<()>;

    /// Handles one command addressed to the device.
    fn send(&self, command: &str);

    /// Releases serial ports, GPIO pins and anything else the backend holds.
    fn stop(&self);
}

/// Feeds queued device commands to the backend until shutdown.
pub fn run_command_loop(
    backend: Arc<dyn DeviceBackend>,
    commands: Receiver<String>,
    state: Arc<SharedState>,
) {
    while !state.shutdown.load(Ordering::SeqCst) {
        match commands.recv_timeout(COMMAND_POLL) {
            Ok(command) => backend.send(&command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Refreshes the device status line in the configured interval.
///
/// The status is always collected so the webserver can serve it. It is
/// pushed through the loop socket only when it changed and a server
/// connection exists; web mode runs without sockets and never pushes.
pub fn run_status_loop(
    state: Arc<SharedState>,
    probe: Arc<dyn StatusProbe>,
    sockets: Option<Arc<Sockets>>,
    interval: Duration,
) {
    let mut last_check: Option<Instant> = None;
    while !state.shutdown.load(Ordering::SeqCst) {
        let due = last_check.map_or(true, |at| at.elapsed() >= interval);
        if due {
            last_check = Some(Instant::now());
            let serial_status = state.serial_status();
            let status = probe.status(serial_status.as_deref());
            if state.swap_status(&status) && state.connected.load(Ordering::SeqCst) {
                if let Some(sockets) = &sockets {
                    sockets.send_self(&Envelope::self_loop(&status));
                }
            }
        }
        thread::sleep(STATUS_TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct RecordingBackend {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            RecordingBackend {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl DeviceBackend for RecordingBackend {
        fn start(self: Arc<Self>) -> Result<()> {
            Ok(())
        }

        fn send(&self, command: &str) {
            self.sent.lock().unwrap().push(command.to_string());
        }

        fn stop(&self) {}
    }

    #[test]
    fn device_kind_parses_case_insensitively() {
        assert_eq!("arduino".parse::<DeviceKind>().unwrap(), DeviceKind::Arduino);
        assert_eq!(
            " Raspberry ".parse::<DeviceKind>().unwrap(),
            DeviceKind::Raspberry
        );
        assert!("esp32".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn device_kind_display_round_trips() {
        for kind in [DeviceKind::Arduino, DeviceKind::Raspberry] {
            assert_eq!(kind.to_string().parse::<DeviceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn command_loop_drains_queue_then_exits_on_disconnect() {
        let backend = Arc::new(RecordingBackend::new());
        let state = Arc::new(SharedState::default());
        let (tx, rx) = mpsc::channel();
        tx.send("90,45".to_string()).unwrap();
        tx.send("0,0,0,1".to_string()).unwrap();
        drop(tx);

        run_command_loop(backend.clone(), rx, state);

        let sent = backend.sent.lock().unwrap();
        assert_eq!(*sent, vec!["90,45".to_string(), "0,0,0,1".to_string()]);
    }

    #[test]
    fn status_loop_collects_without_sockets() {
        let state = Arc::new(SharedState::default());
        let probe: Arc<dyn StatusProbe> = Arc::new(crate::status::ClockStatus);
        let loop_state = state.clone();
        thread::spawn(move || {
            run_status_loop(loop_state, probe, None, Duration::from_secs(0));
        });

        let mut status = String::new();
        for _ in 0..100 {
            status = state.status();
            if !status.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(status.starts_with("STATUS: "), "status was {:?}", status);
        state.shutdown.store(true, Ordering::SeqCst);
    }
}
