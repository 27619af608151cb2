//! SERVO CAM device client.
//!
//! Runs next to a camera and a servo device (an Arduino over serial, or the
//! Raspberry Pi's own GPIO header), streams video to the SERVO CAM server
//! and executes device commands pushed back by it. Can also run standalone
//! in web mode, serving an MJPEG stream and accepting commands over HTTP.
//!
//! # Module structure
//!
//! - `protocol`: the JSON wire envelope and command/response constants
//! - `sockets`: CONN handshake, DATA command intake, STATUS push, loop socket
//! - `handler`: envelope dispatch on the socket dispatch thread
//! - `serial`: auto-reconnecting serial link to the servo hardware
//! - `device`: arduino and raspberry backends behind a common trait
//! - `camera` / `video`: frame capture and the publisher loop
//! - `webserver`: the web-mode HTTP interface
//! - `worker`: orchestration and shared state
//!
//! Compatible with server version 0.9.2 and later.

pub mod camera;
pub mod config;
pub mod crypto;
pub mod device;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod serial;
pub mod sockets;
pub mod status;
pub mod video;
pub mod webserver;
pub mod worker;

pub use config::Config;
pub use device::{DeviceBackend, DeviceKind};
pub use handler::Handler;
pub use protocol::Envelope;
pub use sockets::{SocketConfig, Sockets};
pub use worker::{SharedState, Worker};
