use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::NamedTempFile;

use servocam_client::config::Config;
use servocam_client::device::DeviceKind;

fn write_config(raw: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(raw.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file() {
    let file = write_config(
        r#"
[client]
device = "raspberry"
hostname = "cam-lab"
ip = "192.168.1.20"
server_ip = "192.168.1.2"
web = false

[client.port]
video = 5001
data = 5002
conn = 5003
status = 5004

[client.camera]
idx = 1
width = 1280
height = 720

[client.status]
check = true
interval = 15

[client.stream]
jpeg = true
jpeg_quality = 65
resize = 640

[serial]
baud_rate = 115200

[security.web]
token = "t0ken"

[device.raspberry]
mode_output = "serial"
serial_output = "/dev/ttyUSB0"
data_format = "JSON"
"#,
    );

    let mut cfg = Config::from_path(file.path()).expect("load config");
    cfg.validate().expect("valid config");

    assert_eq!(cfg.device, DeviceKind::Raspberry);
    assert_eq!(cfg.hostname.as_deref(), Some("cam-lab"));
    assert_eq!(cfg.client_ip, "192.168.1.20");
    assert_eq!(cfg.server_ip.as_deref(), Some("192.168.1.2"));
    assert_eq!(cfg.ports.video, 5001);
    assert_eq!(cfg.ports.data, 5002);
    assert_eq!(cfg.ports.conn, 5003);
    assert_eq!(cfg.ports.status, 5004);
    assert_eq!(cfg.ports.web, 8888);
    assert_eq!(cfg.camera.index, 1);
    assert_eq!(cfg.camera.width, Some(1280));
    assert_eq!(cfg.camera.height, Some(720));
    assert!(cfg.status.check);
    assert_eq!(cfg.status.interval, Duration::from_secs(15));
    assert!(cfg.stream.jpeg);
    assert_eq!(cfg.stream.jpeg_quality, 65);
    assert_eq!(cfg.stream.resize_width, Some(640));
    assert_eq!(cfg.serial.baud_rate, 115200);
    assert_eq!(cfg.security.web_token.as_deref(), Some("t0ken"));
    assert_eq!(cfg.raspberry.serial_output.as_deref(), Some("/dev/ttyUSB0"));
}

#[test]
fn missing_keys_fall_back_to_defaults() {
    let file = write_config("[client]\nverbose = true\n");
    let cfg = Config::from_path(file.path()).expect("load config");

    assert!(cfg.verbose);
    assert_eq!(cfg.ports.video, 5555);
    assert_eq!(cfg.ports.data, 6666);
    assert_eq!(cfg.ports.conn, 6667);
    assert_eq!(cfg.ports.status, 6668);
    assert_eq!(cfg.device, DeviceKind::Arduino);
    assert_eq!(cfg.stream.jpeg_quality, 80);
    assert_eq!(cfg.serial.baud_rate, 9600);
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::from_path(Path::new("/nonexistent/servocam.toml")).is_err());
}

#[test]
fn invalid_toml_is_an_error() {
    let file = write_config("[client\ndevice = ???\n");
    assert!(Config::from_path(file.path()).is_err());
}

#[test]
fn zero_port_fails_validation() {
    let file = write_config("[client.port]\ndata = 0\n");
    let mut cfg = Config::from_path(file.path()).expect("load config");
    assert!(cfg.validate().is_err());
}

#[test]
fn video_encryption_forces_jpeg_from_file() {
    let file = write_config(
        "[security.aes]\nvideo = true\nkey = \"sharedsecret\"\n[client.stream]\njpeg = false\n",
    );
    let mut cfg = Config::from_path(file.path()).expect("load config");
    assert!(!cfg.stream.jpeg);
    cfg.validate().expect("valid config");
    assert!(cfg.stream.jpeg);
    assert!(cfg.security.encrypt_video);
}
