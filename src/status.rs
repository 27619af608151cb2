//! Device status reporting hook.
//!
//! The worker polls a [`StatusProbe`] on an interval and pushes the result
//! to the server whenever it changes. The default probe reports a wall
//! clock; deployments with real telemetry swap in their own impl.

use crate::logging::clock_hms;

pub trait StatusProbe: Send + Sync {
    /// Called once when the device backend is up.
    fn init(&self) {}

    /// Produce the current status line. `serial_status` carries the last
    /// line the device reported over serial, when there is one.
    fn status(&self, serial_status: Option<&str>) -> String;
}

/// Default probe: the current time, so the server can see the client alive.
#[derive(Debug, Default)]
pub struct ClockStatus;

impl StatusProbe for ClockStatus {
    fn status(&self, _serial_status: Option<&str>) -> String {
        format!("STATUS: {}", clock_hms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_status_has_prefix() {
        let probe = ClockStatus;
        let status = probe.status(None);
        assert!(status.starts_with("STATUS: "));
        // HH:MM:SS
        assert_eq!(status.len(), "STATUS: ".len() + 8);
    }
}
