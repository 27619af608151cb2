use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::raspberry::{InputMode, OutputMode};
use crate::device::DeviceKind;
use crate::serial::SerialFormat;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const DEFAULT_CLIENT_IP: &str = "*";
const DEFAULT_PORT_VIDEO: u16 = 5555;
const DEFAULT_PORT_DATA: u16 = 6666;
const DEFAULT_PORT_CONN: u16 = 6667;
const DEFAULT_PORT_STATUS: u16 = 6668;
const DEFAULT_PORT_WEB: u16 = 8888;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 5;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_BAUD_RATE: u32 = 9600;
const DEFAULT_INFO_LOG_FILE: &str = "info.log";
const DEFAULT_ERROR_LOG_FILE: &str = "error.log";
const DEFAULT_SERVO_FREQ_HZ: f64 = 50.0;
const DEFAULT_ANGLE_START: i32 = 90;
const DEFAULT_ANGLE_MIN: i32 = 0;
const DEFAULT_ANGLE_MAX: i32 = 180;
const DEFAULT_LIMIT_MIN: i32 = 0;
const DEFAULT_LIMIT_MAX: i32 = 180;
const DEFAULT_CYCLE_START: f64 = 0.0;
const DEFAULT_CYCLE_MIN: f64 = 2.5;
const DEFAULT_CYCLE_MAX: f64 = 12.5;
const DEFAULT_SERVO_DELAY_SECS: f64 = 0.02;
const DEFAULT_ACTION_DELAY_SECS: f64 = 0.0;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    client: Option<ClientConfigFile>,
    serial: Option<SerialConfigFile>,
    security: Option<SecurityConfigFile>,
    log: Option<LogConfigFile>,
    device: Option<DeviceConfigFile>,
    servo: Option<ServoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    debug: Option<bool>,
    verbose: Option<bool>,
    silent: Option<bool>,
    web: Option<bool>,
    device: Option<DeviceKind>,
    hostname: Option<String>,
    ip: Option<String>,
    server_ip: Option<String>,
    port: Option<PortConfigFile>,
    camera: Option<CameraConfigFile>,
    status: Option<StatusConfigFile>,
    stream: Option<StreamConfigFile>,
    socket: Option<SocketConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PortConfigFile {
    conn: Option<u16>,
    data: Option<u16>,
    status: Option<u16>,
    video: Option<u16>,
    web: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    use_pi: Option<bool>,
    idx: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusConfigFile {
    check: Option<bool>,
    interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg: Option<bool>,
    jpeg_quality: Option<u8>,
    resize: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SocketConfigFile {
    pull_wait: Option<bool>,
    pull_linger: Option<bool>,
    push_wait: Option<bool>,
    push_linger: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialConfigFile {
    baud_rate: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SecurityConfigFile {
    aes: Option<AesConfigFile>,
    web: Option<WebSecurityConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct AesConfigFile {
    data: Option<bool>,
    video: Option<bool>,
    key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WebSecurityConfigFile {
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LogConfigFile {
    info: Option<LogTargetConfigFile>,
    error: Option<LogTargetConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct LogTargetConfigFile {
    enabled: Option<bool>,
    file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    arduino: Option<ArduinoConfigFile>,
    raspberry: Option<RaspberryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ArduinoConfigFile {
    serial: Option<String>,
    data_format: Option<SerialFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct RaspberryConfigFile {
    mode_input: Option<InputMode>,
    mode_output: Option<OutputMode>,
    serial_input: Option<String>,
    serial_output: Option<String>,
    data_format: Option<SerialFormat>,
    pin: Option<PinConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PinConfigFile {
    servo_x: Option<u8>,
    servo_y: Option<u8>,
    action_a1: Option<u8>,
    action_a2: Option<u8>,
    action_a3: Option<u8>,
    action_b4: Option<u8>,
    action_b5: Option<u8>,
    action_b6: Option<u8>,
    action_delay: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServoConfigFile {
    use_limit: Option<bool>,
    x: Option<ServoAxisConfigFile>,
    y: Option<ServoAxisConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServoAxisConfigFile {
    freq: Option<f64>,
    angle_start: Option<i32>,
    angle_min: Option<i32>,
    angle_max: Option<i32>,
    limit_min: Option<i32>,
    limit_max: Option<i32>,
    cycle_start: Option<f64>,
    cycle_min: Option<f64>,
    cycle_max: Option<f64>,
    delay: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub verbose: bool,
    pub silent: bool,
    pub web: bool,
    pub device: DeviceKind,
    pub hostname: Option<String>,
    pub client_ip: String,
    pub server_ip: Option<String>,
    pub ports: PortSettings,
    pub camera: CameraSettings,
    pub status: StatusSettings,
    pub stream: StreamSettings,
    pub socket: SocketSettings,
    pub serial: SerialSettings,
    pub security: SecuritySettings,
    pub log: LogSettings,
    pub arduino: ArduinoSettings,
    pub raspberry: RaspberrySettings,
}

#[derive(Debug, Clone)]
pub struct PortSettings {
    pub conn: u16,
    pub data: u16,
    pub status: u16,
    pub video: u16,
    pub web: u16,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub use_pi: bool,
    pub index: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct StatusSettings {
    pub check: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub jpeg: bool,
    pub jpeg_quality: u8,
    pub resize_width: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SocketSettings {
    pub pull_wait: bool,
    pub pull_linger: bool,
    pub push_wait: bool,
    pub push_linger: bool,
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
}

#[derive(Debug, Clone)]
pub struct SecuritySettings {
    pub encrypt_data: bool,
    pub encrypt_video: bool,
    pub aes_key: Option<String>,
    pub web_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub info_enabled: bool,
    pub error_enabled: bool,
    pub info_file: PathBuf,
    pub error_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArduinoSettings {
    pub serial_port: Option<String>,
    pub data_format: SerialFormat,
}

#[derive(Debug, Clone)]
pub struct RaspberrySettings {
    pub mode_input: InputMode,
    pub mode_output: OutputMode,
    pub serial_input: Option<String>,
    pub serial_output: Option<String>,
    pub data_format: SerialFormat,
    pub pins: PinSettings,
    pub servo: ServoSettings,
}

#[derive(Debug, Clone)]
pub struct PinSettings {
    pub servo_x: u8,
    pub servo_y: u8,
    pub action_a1: u8,
    pub action_a2: u8,
    pub action_a3: u8,
    pub action_b4: u8,
    pub action_b5: u8,
    pub action_b6: u8,
    pub action_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ServoSettings {
    pub use_limit: bool,
    pub x: ServoAxis,
    pub y: ServoAxis,
}

#[derive(Debug, Clone)]
pub struct ServoAxis {
    pub freq_hz: f64,
    pub angle_start: i32,
    pub angle_min: i32,
    pub angle_max: i32,
    pub limit_min: i32,
    pub limit_max: i32,
    pub cycle_start: f64,
    pub cycle_min: f64,
    pub cycle_max: f64,
    pub delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_file(ConfigFile::default())
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Config::from_file(read_config_file(path)?))
    }

    fn from_file(file: ConfigFile) -> Self {
        let client = file.client.as_ref();
        let port = client.and_then(|c| c.port.as_ref());
        let camera = client.and_then(|c| c.camera.as_ref());
        let status = client.and_then(|c| c.status.as_ref());
        let stream = client.and_then(|c| c.stream.as_ref());
        let socket = client.and_then(|c| c.socket.as_ref());
        let aes = file.security.as_ref().and_then(|s| s.aes.as_ref());
        let web_sec = file.security.as_ref().and_then(|s| s.web.as_ref());
        let log_info = file.log.as_ref().and_then(|l| l.info.as_ref());
        let log_error = file.log.as_ref().and_then(|l| l.error.as_ref());
        let arduino = file.device.as_ref().and_then(|d| d.arduino.as_ref());
        let raspberry = file.device.as_ref().and_then(|d| d.raspberry.as_ref());
        let pin = raspberry.and_then(|r| r.pin.as_ref());
        let servo = file.servo.as_ref();

        Config {
            debug: client.and_then(|c| c.debug).unwrap_or(false),
            verbose: client.and_then(|c| c.verbose).unwrap_or(false),
            silent: client.and_then(|c| c.silent).unwrap_or(false),
            web: client.and_then(|c| c.web).unwrap_or(false),
            device: client.and_then(|c| c.device).unwrap_or_default(),
            hostname: client.and_then(|c| non_empty(c.hostname.as_deref())),
            client_ip: client
                .and_then(|c| non_empty(c.ip.as_deref()))
                .unwrap_or_else(|| DEFAULT_CLIENT_IP.to_string()),
            server_ip: client.and_then(|c| non_empty(c.server_ip.as_deref())),
            ports: PortSettings {
                conn: port.and_then(|p| p.conn).unwrap_or(DEFAULT_PORT_CONN),
                data: port.and_then(|p| p.data).unwrap_or(DEFAULT_PORT_DATA),
                status: port.and_then(|p| p.status).unwrap_or(DEFAULT_PORT_STATUS),
                video: port.and_then(|p| p.video).unwrap_or(DEFAULT_PORT_VIDEO),
                web: port.and_then(|p| p.web).unwrap_or(DEFAULT_PORT_WEB),
            },
            camera: CameraSettings {
                use_pi: camera.and_then(|c| c.use_pi).unwrap_or(false),
                index: camera.and_then(|c| c.idx).unwrap_or(0),
                width: camera.and_then(|c| c.width).filter(|w| *w > 0),
                height: camera.and_then(|c| c.height).filter(|h| *h > 0),
            },
            status: StatusSettings {
                check: status.and_then(|s| s.check).unwrap_or(false),
                interval: Duration::from_secs(
                    status
                        .and_then(|s| s.interval)
                        .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
                ),
            },
            stream: StreamSettings {
                jpeg: stream.and_then(|s| s.jpeg).unwrap_or(false),
                jpeg_quality: stream
                    .and_then(|s| s.jpeg_quality)
                    .unwrap_or(DEFAULT_JPEG_QUALITY),
                resize_width: stream.and_then(|s| s.resize).filter(|w| *w > 0),
            },
            socket: SocketSettings {
                pull_wait: socket.and_then(|s| s.pull_wait).unwrap_or(false),
                pull_linger: socket.and_then(|s| s.pull_linger).unwrap_or(false),
                push_wait: socket.and_then(|s| s.push_wait).unwrap_or(false),
                push_linger: socket.and_then(|s| s.push_linger).unwrap_or(true),
            },
            serial: SerialSettings {
                baud_rate: file
                    .serial
                    .as_ref()
                    .and_then(|s| s.baud_rate)
                    .unwrap_or(DEFAULT_BAUD_RATE),
            },
            security: SecuritySettings {
                encrypt_data: aes.and_then(|a| a.data).unwrap_or(false),
                encrypt_video: aes.and_then(|a| a.video).unwrap_or(false),
                aes_key: aes.and_then(|a| non_empty(a.key.as_deref())),
                web_token: web_sec.and_then(|w| non_empty(w.token.as_deref())),
            },
            log: LogSettings {
                info_enabled: log_info.and_then(|t| t.enabled).unwrap_or(false),
                error_enabled: log_error.and_then(|t| t.enabled).unwrap_or(true),
                info_file: log_info
                    .and_then(|t| non_empty(t.file.as_deref()))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_INFO_LOG_FILE)),
                error_file: log_error
                    .and_then(|t| non_empty(t.file.as_deref()))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ERROR_LOG_FILE)),
            },
            arduino: ArduinoSettings {
                serial_port: arduino.and_then(|a| non_empty(a.serial.as_deref())),
                data_format: arduino.and_then(|a| a.data_format).unwrap_or_default(),
            },
            raspberry: RaspberrySettings {
                mode_input: raspberry.and_then(|r| r.mode_input).unwrap_or_default(),
                mode_output: raspberry.and_then(|r| r.mode_output).unwrap_or_default(),
                serial_input: raspberry.and_then(|r| non_empty(r.serial_input.as_deref())),
                serial_output: raspberry.and_then(|r| non_empty(r.serial_output.as_deref())),
                data_format: raspberry.and_then(|r| r.data_format).unwrap_or_default(),
                pins: PinSettings {
                    servo_x: pin.and_then(|p| p.servo_x).unwrap_or(0),
                    servo_y: pin.and_then(|p| p.servo_y).unwrap_or(0),
                    action_a1: pin.and_then(|p| p.action_a1).unwrap_or(0),
                    action_a2: pin.and_then(|p| p.action_a2).unwrap_or(0),
                    action_a3: pin.and_then(|p| p.action_a3).unwrap_or(0),
                    action_b4: pin.and_then(|p| p.action_b4).unwrap_or(0),
                    action_b5: pin.and_then(|p| p.action_b5).unwrap_or(0),
                    action_b6: pin.and_then(|p| p.action_b6).unwrap_or(0),
                    action_delay: Duration::from_secs_f64(
                        pin.and_then(|p| p.action_delay)
                            .unwrap_or(DEFAULT_ACTION_DELAY_SECS),
                    ),
                },
                servo: ServoSettings {
                    use_limit: servo.and_then(|s| s.use_limit).unwrap_or(false),
                    x: servo_axis(servo.and_then(|s| s.x.as_ref())),
                    y: servo_axis(servo.and_then(|s| s.y.as_ref())),
                },
            },
        }
    }

    /// Normalize implied flags, then reject configurations the client
    /// cannot run with.
    pub fn validate(&mut self) -> Result<()> {
        if self.debug {
            self.verbose = true;
            self.silent = false;
        }

        // REQUIRED: encrypted video is always JPEG-compressed
        if self.security.encrypt_video {
            self.stream.jpeg = true;
        }

        if self.stream.jpeg_quality == 0 || self.stream.jpeg_quality > 100 {
            return Err(anyhow!("stream.jpeg_quality must be between 1 and 100"));
        }
        let ports = [
            self.ports.conn,
            self.ports.data,
            self.ports.status,
            self.ports.video,
            self.ports.web,
        ];
        if ports.iter().any(|p| *p == 0) {
            return Err(anyhow!("all client ports must be non-zero"));
        }
        if (self.security.encrypt_data || self.security.encrypt_video)
            && self.security.aes_key.is_none()
        {
            return Err(anyhow!(
                "security.aes.key is required when data or video encryption is enabled"
            ));
        }
        if self.device == DeviceKind::Raspberry && self.raspberry.mode_output == OutputMode::Gpio {
            let pins = &self.raspberry.pins;
            let all = [
                pins.servo_x,
                pins.servo_y,
                pins.action_a1,
                pins.action_a2,
                pins.action_a3,
                pins.action_b4,
                pins.action_b5,
                pins.action_b6,
            ];
            if all.iter().any(|p| *p == 0) {
                return Err(anyhow!(
                    "GPIO output mode requires every device.raspberry.pin to be set"
                ));
            }
        }
        Ok(())
    }
}

fn servo_axis(axis: Option<&ServoAxisConfigFile>) -> ServoAxis {
    ServoAxis {
        freq_hz: axis.and_then(|a| a.freq).unwrap_or(DEFAULT_SERVO_FREQ_HZ),
        angle_start: axis
            .and_then(|a| a.angle_start)
            .unwrap_or(DEFAULT_ANGLE_START),
        angle_min: axis.and_then(|a| a.angle_min).unwrap_or(DEFAULT_ANGLE_MIN),
        angle_max: axis.and_then(|a| a.angle_max).unwrap_or(DEFAULT_ANGLE_MAX),
        limit_min: axis.and_then(|a| a.limit_min).unwrap_or(DEFAULT_LIMIT_MIN),
        limit_max: axis.and_then(|a| a.limit_max).unwrap_or(DEFAULT_LIMIT_MAX),
        cycle_start: axis
            .and_then(|a| a.cycle_start)
            .unwrap_or(DEFAULT_CYCLE_START),
        cycle_min: axis.and_then(|a| a.cycle_min).unwrap_or(DEFAULT_CYCLE_MIN),
        cycle_max: axis.and_then(|a| a.cycle_max).unwrap_or(DEFAULT_CYCLE_MAX),
        delay: Duration::from_secs_f64(
            axis.and_then(|a| a.delay).unwrap_or(DEFAULT_SERVO_DELAY_SECS),
        ),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Config {
        Config::from_file(toml::from_str(raw).unwrap())
    }

    #[test]
    fn defaults_without_file() {
        let cfg = Config::default();
        assert_eq!(cfg.client_ip, "*");
        assert_eq!(cfg.ports.video, 5555);
        assert_eq!(cfg.ports.data, 6666);
        assert_eq!(cfg.ports.conn, 6667);
        assert_eq!(cfg.ports.status, 6668);
        assert_eq!(cfg.ports.web, 8888);
        assert_eq!(cfg.device, DeviceKind::Arduino);
        assert_eq!(cfg.status.interval, Duration::from_secs(5));
        assert_eq!(cfg.stream.jpeg_quality, 80);
        assert_eq!(cfg.serial.baud_rate, 9600);
        assert!(!cfg.log.info_enabled);
        assert!(cfg.log.error_enabled);
        assert!(!cfg.socket.push_wait);
        assert!(cfg.socket.push_linger);
        assert_eq!(cfg.raspberry.servo.x.cycle_min, 2.5);
        assert_eq!(cfg.raspberry.servo.x.cycle_max, 12.5);
        assert_eq!(cfg.raspberry.servo.y.angle_start, 90);
    }

    #[test]
    fn file_overrides_defaults() {
        let cfg = parse(
            "[client]\n\
             device = \"raspberry\"\n\
             ip = \"192.168.1.20\"\n\
             [client.port]\n\
             data = 7001\n\
             [client.status]\n\
             check = true\n\
             interval = 10\n\
             [servo.x]\n\
             angle_start = 45\n",
        );
        assert_eq!(cfg.device, DeviceKind::Raspberry);
        assert_eq!(cfg.client_ip, "192.168.1.20");
        assert_eq!(cfg.ports.data, 7001);
        assert_eq!(cfg.ports.conn, 6667);
        assert!(cfg.status.check);
        assert_eq!(cfg.status.interval, Duration::from_secs(10));
        assert_eq!(cfg.raspberry.servo.x.angle_start, 45);
        assert_eq!(cfg.raspberry.servo.y.angle_start, 90);
    }

    #[test]
    fn empty_strings_read_as_unset() {
        let cfg = parse(
            "[client]\n\
             hostname = \"\"\n\
             server_ip = \" \"\n\
             [security.web]\n\
             token = \"\"\n",
        );
        assert_eq!(cfg.hostname, None);
        assert_eq!(cfg.server_ip, None);
        assert_eq!(cfg.security.web_token, None);
    }

    #[test]
    fn debug_implies_verbose_and_unsilences() {
        let mut cfg = parse("[client]\ndebug = true\nsilent = true\n");
        cfg.validate().unwrap();
        assert!(cfg.verbose);
        assert!(!cfg.silent);
    }

    #[test]
    fn video_encryption_forces_jpeg() {
        let mut cfg = parse(
            "[security.aes]\n\
             video = true\n\
             key = \"supersecret\"\n",
        );
        assert!(!cfg.stream.jpeg);
        cfg.validate().unwrap();
        assert!(cfg.stream.jpeg);
    }

    #[test]
    fn encryption_without_key_is_rejected() {
        let mut cfg = parse("[security.aes]\ndata = true\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn jpeg_quality_bounds() {
        let mut cfg = parse("[client.stream]\njpeg_quality = 0\n");
        assert!(cfg.validate().is_err());
        let mut cfg = parse("[client.stream]\njpeg_quality = 101\n");
        assert!(cfg.validate().is_err());
        let mut cfg = parse("[client.stream]\njpeg_quality = 100\n");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn gpio_mode_requires_pins() {
        let mut cfg = parse(
            "[client]\n\
             device = \"raspberry\"\n\
             [device.raspberry]\n\
             mode_output = \"gpio\"\n",
        );
        assert!(cfg.validate().is_err());

        let mut cfg = parse(
            "[client]\n\
             device = \"raspberry\"\n\
             [device.raspberry]\n\
             mode_output = \"gpio\"\n\
             [device.raspberry.pin]\n\
             servo_x = 12\n\
             servo_y = 13\n\
             action_a1 = 5\n\
             action_a2 = 6\n\
             action_a3 = 16\n\
             action_b4 = 20\n\
             action_b5 = 21\n\
             action_b6 = 26\n",
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_camera_dimensions_read_as_unset() {
        let cfg = parse("[client.camera]\nwidth = 0\nheight = 480\n");
        assert_eq!(cfg.camera.width, None);
        assert_eq!(cfg.camera.height, Some(480));
    }

    #[test]
    fn serial_format_from_file() {
        let cfg = parse("[device.arduino]\ndata_format = \"JSON\"\n");
        assert_eq!(cfg.arduino.data_format, SerialFormat::Json);
    }
}
