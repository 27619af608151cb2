//! Client orchestration. The worker wires config, sockets, the device
//! backend, the status loop and video together, and owns the state every
//! thread shares.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::info;

use crate::camera::CameraSource;
use crate::config::Config;
use crate::crypto::TransportCipher;
use crate::device::arduino::Arduino;
use crate::device::raspberry::Raspberry;
use crate::device::{self, DeviceBackend, DeviceKind};
use crate::handler::Handler;
use crate::serial::SerialLink;
use crate::sockets::{SocketConfig, Sockets};
use crate::status::{ClockStatus, StatusProbe};
use crate::video::{self, FrameStore, VideoConfig, VideoPublisher};
use crate::webserver::{WebConfig, Webserver};

const SERVER_IP_POLL: Duration = Duration::from_millis(100);

/// Flags and values shared by every thread in the client.
#[derive(Default)]
pub struct SharedState {
    pub connected: AtomicBool,
    pub shutdown: AtomicBool,
    pub video_restart: AtomicBool,
    server_ip: Mutex<Option<String>>,
    status: Mutex<String>,
    serial_status: Mutex<String>,
}

impl SharedState {
    pub fn server_ip(&self) -> Option<String> {
        self.server_ip.lock().ok().and_then(|ip| ip.clone())
    }

    pub fn set_server_ip(&self, ip: Option<String>) {
        if let Ok(mut slot) = self.server_ip.lock() {
            *slot = ip;
        }
    }

    pub fn status(&self) -> String {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Stores a freshly collected status line. True when it differs from
    /// the previous one.
    pub fn swap_status(&self, status: &str) -> bool {
        let Ok(mut slot) = self.status.lock() else {
            return false;
        };
        if *slot == status {
            return false;
        }
        *slot = status.to_string();
        true
    }

    pub fn serial_status(&self) -> Option<String> {
        self.serial_status
            .lock()
            .ok()
            .map(|s| s.clone())
            .filter(|s| !s.is_empty())
    }

    pub fn set_serial_status(&self, status: &str) {
        if let Ok(mut slot) = self.serial_status.lock() {
            *slot = status.to_string();
        }
    }
}

pub struct Worker {
    config: Config,
    hostname: String,
    state: Arc<SharedState>,
}

impl Worker {
    pub fn new(config: Config) -> Self {
        let hostname = config
            .hostname
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        Worker {
            config,
            hostname,
            state: Arc::new(SharedState::default()),
        }
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    /// Runs the client until shutdown. Blocks on the video loop.
    pub fn run(&self) -> Result<()> {
        self.log_banner();

        if let Some(ip) = &self.config.server_ip {
            self.state.set_server_ip(Some(ip.clone()));
        }

        let camera = CameraSource::open(&self.config.camera)?;
        let frames = Arc::new(FrameStore::new());
        let (device_tx, device_rx) = mpsc::channel::<String>();

        if self.config.web {
            self.run_web(camera, frames, device_tx, device_rx)
        } else {
            self.run_socket(camera, frames, device_tx, device_rx)
        }
    }

    fn log_banner(&self) {
        let cfg = &self.config;
        info!("Servo Cam client starting...");
        info!("Version: {}", env!("CARGO_PKG_VERSION"));
        info!("------------------------");
        info!("Debug: {}", cfg.debug);
        info!("Verbose: {}", cfg.verbose);
        info!("Status check: {}", cfg.status.check);
        info!("Status check interval: {}", cfg.status.interval.as_secs());
        info!("Camera index: {}", cfg.camera.index);
        info!("Use Pi camera: {}", cfg.camera.use_pi);
        info!("Web: {}", cfg.web);
        info!("Client IP: {}", cfg.client_ip);
        info!("Device: {}", cfg.device);
    }

    fn cipher_for(&self, enabled: bool) -> Option<TransportCipher> {
        if !enabled {
            return None;
        }
        self.config
            .security
            .aes_key
            .as_deref()
            .map(TransportCipher::from_passphrase)
    }

    fn build_backend(&self) -> Arc<dyn DeviceBackend> {
        let cfg = &self.config;
        match cfg.device {
            DeviceKind::Arduino => {
                let link = Arc::new(SerialLink::new(
                    cfg.serial.baud_rate,
                    cfg.arduino.data_format,
                    cfg.arduino.serial_port.clone(),
                    None,
                    cfg.status.check,
                ));
                Arc::new(Arduino::new(link, self.state.clone(), cfg.status.check))
            }
            DeviceKind::Raspberry => {
                let link = Arc::new(SerialLink::new(
                    cfg.serial.baud_rate,
                    cfg.raspberry.data_format,
                    cfg.raspberry.serial_output.clone(),
                    cfg.raspberry.serial_input.clone(),
                    cfg.status.check,
                ));
                Arc::new(Raspberry::new(
                    cfg.raspberry.clone(),
                    link,
                    self.state.clone(),
                ))
            }
        }
    }

    /// Starts the backend, its command feed and the status loop.
    fn start_device(
        &self,
        backend: Arc<dyn DeviceBackend>,
        sockets: Option<Arc<Sockets>>,
        device_rx: mpsc::Receiver<String>,
    ) -> Result<()> {
        info!("Starting device worker: {}", self.config.device);
        backend.clone().start()?;

        let probe: Arc<dyn StatusProbe> = Arc::new(ClockStatus);
        probe.init();

        let loop_backend = backend;
        let loop_state = self.state.clone();
        thread::spawn(move || device::run_command_loop(loop_backend, device_rx, loop_state));

        if self.config.status.check {
            info!("Starting status check thread...");
            let state = self.state.clone();
            let interval = self.config.status.interval;
            thread::spawn(move || device::run_status_loop(state, probe, sockets, interval));
        }
        Ok(())
    }

    fn run_socket(
        &self,
        camera: CameraSource,
        frames: Arc<FrameStore>,
        device_tx: mpsc::Sender<String>,
        device_rx: mpsc::Receiver<String>,
    ) -> Result<()> {
        let cfg = &self.config;
        let sockets = Sockets::new(
            SocketConfig {
                bind_ip: cfg.client_ip.clone(),
                conn_port: cfg.ports.conn,
                data_port: cfg.ports.data,
                status_port: cfg.ports.status,
                pull_wait: cfg.socket.pull_wait,
                pull_linger: cfg.socket.pull_linger,
                push_wait: cfg.socket.push_wait,
                push_linger: cfg.socket.push_linger,
            },
            self.hostname.clone(),
            self.cipher_for(cfg.security.encrypt_data),
            self.state.clone(),
        );
        let handler = Arc::new(Handler::new(sockets.clone(), self.state.clone(), device_tx));
        sockets.start(handler)?;

        info!("Waiting for server IP...");
        while self.state.server_ip().is_none() {
            if self.state.shutdown.load(Ordering::SeqCst) {
                sockets.stop();
                return Ok(());
            }
            thread::sleep(SERVER_IP_POLL);
        }

        let backend = self.build_backend();
        self.start_device(backend.clone(), Some(sockets.clone()), device_rx)?;

        let mut publisher = VideoPublisher::new(
            VideoConfig {
                video_port: cfg.ports.video,
                hostname: self.hostname.clone(),
                jpeg: cfg.stream.jpeg,
                jpeg_quality: cfg.stream.jpeg_quality,
                resize_width: cfg.stream.resize_width,
            },
            self.cipher_for(cfg.security.encrypt_video),
            camera,
            frames,
            self.state.clone(),
        );
        if let Some(ip) = self.state.server_ip() {
            info!("Starting sending video to {}", ip);
        }
        publisher.run();

        sockets.stop();
        publisher.stop();
        backend.stop();
        Ok(())
    }

    fn run_web(
        &self,
        mut camera: CameraSource,
        frames: Arc<FrameStore>,
        device_tx: mpsc::Sender<String>,
        device_rx: mpsc::Receiver<String>,
    ) -> Result<()> {
        let cfg = &self.config;
        let backend = self.build_backend();
        self.start_device(backend.clone(), None, device_rx)?;

        info!("Starting web server on port {}", cfg.ports.web);
        let handle = Webserver::spawn(
            WebConfig {
                bind_ip: cfg.client_ip.clone(),
                port: cfg.ports.web,
                token: cfg.security.web_token.clone(),
                jpeg_quality: cfg.stream.jpeg_quality,
                resize_width: cfg.stream.resize_width,
            },
            frames.clone(),
            self.state.clone(),
            device_tx,
        )?;

        video::run_capture(&mut camera, &frames, &self.state);

        handle.stop();
        backend.stop();
        camera.close();
        Ok(())
    }
}
