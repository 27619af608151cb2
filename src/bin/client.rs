//! client - the SERVO CAM device client.
//!
//! Loads the TOML config, layers the CLI flags on top, then runs either the
//! socket stack (handshake, command dispatch, video publishing) or, with
//! `--web`, a local HTTP interface with an MJPEG stream.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use servocam_client::config::{Config, DEFAULT_CONFIG_PATH};
use servocam_client::device::DeviceKind;
use servocam_client::logging::{self, LogOptions};
use servocam_client::worker::Worker;

#[derive(Parser, Debug)]
#[command(author, version, about = "SERVO CAM device client")]
struct Args {
    /// Path to the config file.
    #[arg(long, env = "SERVOCAM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Device type: arduino or raspberry.
    #[arg(short = 'd', long, env = "SERVOCAM_DEVICE")]
    device: Option<DeviceKind>,

    /// Use the Raspberry Pi camera.
    #[arg(short = 'p', long, env = "SERVOCAM_PI")]
    pi: bool,

    /// Capture device index.
    #[arg(short = 'c', long, env = "SERVOCAM_CAMERA")]
    camera: Option<u32>,

    /// Capture width in pixels.
    #[arg(short = 'x', long, env = "SERVOCAM_WIDTH")]
    width: Option<u32>,

    /// Capture height in pixels.
    #[arg(short = 'y', long, env = "SERVOCAM_HEIGHT")]
    height: Option<u32>,

    /// IP address to bind the client sockets to.
    #[arg(short = 'i', long, env = "SERVOCAM_IP")]
    ip: Option<String>,

    /// Server IP, pre-set without waiting for the handshake.
    #[arg(short = 's', long, env = "SERVOCAM_SERVER_IP")]
    server_ip: Option<String>,

    /// Run the local web interface instead of connecting to a server.
    #[arg(short = 'w', long, env = "SERVOCAM_WEB")]
    web: bool,

    /// Verbose logging.
    #[arg(short = 'v', long, env = "SERVOCAM_VERBOSE")]
    verbose: bool,

    /// Silence console output.
    #[arg(short = 'n', long, env = "SERVOCAM_HIDDEN")]
    hidden: bool,

    /// Enable the periodic device status check.
    #[arg(short = 'u', long, env = "SERVOCAM_STATUS")]
    status: bool,

    /// Debug logging (implies --verbose).
    #[arg(short = 'e', long, env = "SERVOCAM_DEBUG")]
    debug: bool,
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(device) = args.device {
        config.device = device;
    }
    if args.pi {
        config.camera.use_pi = true;
    }
    if let Some(index) = args.camera {
        config.camera.index = index;
    }
    if let Some(width) = args.width {
        config.camera.width = Some(width);
    }
    if let Some(height) = args.height {
        config.camera.height = Some(height);
    }
    if let Some(ip) = &args.ip {
        config.client_ip = ip.clone();
    }
    if let Some(ip) = &args.server_ip {
        config.server_ip = Some(ip.clone());
    }
    if args.web {
        config.web = true;
    }
    if args.verbose {
        config.verbose = true;
    }
    if args.hidden {
        config.silent = true;
    }
    if args.status {
        config.status.check = true;
    }
    if args.debug {
        config.debug = true;
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = if args.config.exists() {
        Config::from_path(&args.config)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args);
    config.validate()?;

    logging::init(&LogOptions {
        debug: config.debug,
        verbose: config.verbose,
        silent: config.silent,
        info_file: config.log.info_enabled.then(|| config.log.info_file.clone()),
        error_file: config
            .log
            .error_enabled
            .then(|| config.log.error_file.clone()),
    })?;

    let worker = Worker::new(config);
    let state = worker.state();
    ctrlc::set_handler(move || {
        info!("Exiting...");
        state.shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to install the interrupt handler")?;

    worker.run()
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
