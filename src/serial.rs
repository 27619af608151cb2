//! Serial link to the servo device.
//!
//! Two independently configured ports share one link: the output port talks
//! to the device itself, the input port listens to an upstream controller.
//! Ports open lazily on first use and reopen automatically on the next use
//! after an I/O failure. Open failures are logged once per disconnect.

use log::{error, info, warn};
use serde::Deserialize;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::{Envelope, CMD_STATUS};

pub const DATA_TYPE_CMD: &str = "cmd";
pub const END_CHAR: u8 = b'\n';

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SerialFormat {
    #[default]
    Raw,
    Json,
}

impl std::fmt::Display for SerialFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SerialFormat::Raw => "RAW",
            SerialFormat::Json => "JSON",
        };
        write!(f, "{}", s)
    }
}

/// Frame a command for the wire. JSON format wraps the command in a
/// `{"k":"cmd","v":...,"t":...}` object.
pub fn encode_frame(format: SerialFormat, command: &str) -> String {
    match format {
        SerialFormat::Raw => command.to_string(),
        SerialFormat::Json => Envelope::stamped(DATA_TYPE_CMD, command)
            .to_json()
            .unwrap_or_else(|_| command.to_string()),
    }
}

/// Recover the command from a received line. JSON lines with any other
/// `k` are discarded.
pub fn decode_frame(format: SerialFormat, line: &str) -> Option<String> {
    match format {
        SerialFormat::Raw => Some(line.to_string()),
        SerialFormat::Json => Envelope::from_json(line)
            .ok()
            .filter(|env| env.k == DATA_TYPE_CMD)
            .map(|env| env.v),
    }
}

struct PortSlot {
    label: &'static str,
    path: Option<String>,
    port: Option<Box<dyn SerialPort>>,
    disconnected: bool,
    buffer: Vec<u8>,
}

impl PortSlot {
    fn new(label: &'static str, path: Option<String>) -> Self {
        PortSlot {
            label,
            path,
            port: None,
            disconnected: false,
            buffer: Vec::new(),
        }
    }

    fn open_if_needed(&mut self, baud_rate: u32) {
        if self.port.is_some() {
            return;
        }
        let Some(path) = self.path.clone() else {
            return;
        };
        match serialport::new(path.as_str(), baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(port) => {
                info!("Serial ({}) port opened: {}", self.label, path);
                self.port = Some(port);
                self.disconnected = false;
            }
            Err(e) => {
                if !self.disconnected {
                    error!(
                        "Serial ({}) initialize error (opened by other app?): {}",
                        self.label, e
                    );
                }
                self.disconnected = true;
            }
        }
    }

    fn write_line(&mut self, frame: &str) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        let mut bytes = frame.as_bytes().to_vec();
        bytes.push(END_CHAR);
        match port.write_all(&bytes) {
            Ok(()) => true,
            Err(e) => {
                error!("Serial ({}) data sending error: {}", self.label, e);
                self.port = None;
                false
            }
        }
    }

    /// One non-blocking poll. Returns a complete line when available;
    /// callers sleep between polls.
    fn poll_line(&mut self) -> Option<String> {
        if let Some(line) = take_line(&mut self.buffer) {
            return Some(line);
        }
        let port = self.port.as_mut()?;
        let pending = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                error!("Serial ({}) listener error: {}", self.label, e);
                self.port = None;
                return None;
            }
        };
        if pending == 0 {
            return None;
        }
        let mut chunk = vec![0u8; pending];
        match port.read(&mut chunk) {
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("Serial ({}) listener error: {}", self.label, e);
                self.port = None;
                return None;
            }
        }
        take_line(&mut self.buffer)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            if let Some(path) = &self.path {
                info!("Serial ({}) port closed: {}", self.label, path);
            }
        }
        self.buffer.clear();
    }
}

/// Pop the first newline-terminated line off `buffer`, stripping the
/// trailing CR/LF.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|b| *b == END_CHAR)?;
    let line: Vec<u8> = buffer.drain(..=pos).collect();
    let text = String::from_utf8_lossy(&line);
    Some(text.trim_end_matches(['\r', '\n']).to_string())
}

pub struct SerialLink {
    baud_rate: u32,
    format: SerialFormat,
    out: Mutex<PortSlot>,
    input: Mutex<PortSlot>,
    sending: AtomicBool,
    check_status: bool,
    last_status_check: Mutex<Instant>,
}

impl SerialLink {
    pub fn new(
        baud_rate: u32,
        format: SerialFormat,
        port_out: Option<String>,
        port_in: Option<String>,
        check_status: bool,
    ) -> Self {
        SerialLink {
            baud_rate,
            format,
            out: Mutex::new(PortSlot::new("OUTPUT", port_out)),
            input: Mutex::new(PortSlot::new("INPUT", port_in)),
            sending: AtomicBool::new(false),
            check_status,
            last_status_check: Mutex::new(Instant::now()),
        }
    }

    pub fn format(&self) -> SerialFormat {
        self.format
    }

    pub fn output_path(&self) -> Option<String> {
        self.out.lock().ok().and_then(|slot| slot.path.clone())
    }

    pub fn input_path(&self) -> Option<String> {
        self.input.lock().ok().and_then(|slot| slot.path.clone())
    }

    /// Send a command to the device via the output port.
    pub fn send(&self, command: &str) {
        let frame = encode_frame(self.format, command);
        let Ok(mut slot) = self.out.lock() else {
            return;
        };
        if slot.path.is_none() {
            return;
        }
        slot.open_if_needed(self.baud_rate);
        self.sending.store(true, Ordering::SeqCst);
        slot.write_line(&frame);
        self.sending.store(false, Ordering::SeqCst);
    }

    /// Send a line up the input port, towards the connected controller.
    pub fn send_input(&self, command: &str) {
        let frame = encode_frame(self.format, command);
        let Ok(mut slot) = self.input.lock() else {
            return;
        };
        if slot.path.is_none() {
            return;
        }
        slot.open_if_needed(self.baud_rate);
        slot.write_line(&frame);
    }

    /// Poll the output port for a line from the device. Returns the raw
    /// line; frame decoding is up to the caller.
    pub fn listen(&self) -> Option<String> {
        let mut slot = self.out.lock().ok()?;
        slot.path.as_ref()?;
        slot.open_if_needed(self.baud_rate);
        slot.poll_line()
    }

    /// Poll the input port for a command from the upstream controller.
    pub fn listen_input(&self) -> Option<String> {
        let mut slot = self.input.lock().ok()?;
        slot.path.as_ref()?;
        slot.open_if_needed(self.baud_rate);
        slot.poll_line()
    }

    /// Periodic tick from the device listener thread: ask the device for
    /// its status at most every few seconds, and never mid-send.
    pub fn update(&self) {
        if !self.check_status || self.sending.load(Ordering::SeqCst) {
            return;
        }
        let open = self
            .out
            .lock()
            .map(|slot| slot.port.is_some())
            .unwrap_or(false);
        if !open {
            return;
        }
        let due = {
            let Ok(mut last) = self.last_status_check.lock() else {
                return;
            };
            if last.elapsed() > STATUS_CHECK_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.send(CMD_STATUS);
        }
    }

    /// Close both ports.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.out.lock() {
            slot.close();
        }
        if let Ok(mut slot) = self.input.lock() {
            slot.close();
        }
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}
