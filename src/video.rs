//! Video capture and frame publishing.
//!
//! Socket mode runs [`VideoPublisher::run`] on the main thread: read a
//! frame, keep the newest one shared for other consumers, publish it to the
//! server's video port. Web mode runs [`run_capture`] instead and leaves
//! delivery to the HTTP layer.
//!
//! Wire format per frame: a length-prefixed `"<hostname>@<timestamp_ms>"`
//! header, a payload kind byte, the length-prefixed payload (JPEG bytes,
//! optionally encrypted, or width/height-prefixed raw RGB8), then a 2-byte
//! `OK` acknowledgement read back. An unacknowledged frame within the
//! timeout counts as a transport failure.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use log::{debug, error, info};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::camera::CameraSource;
use crate::crypto::TransportCipher;
use crate::protocol::now_ms;
use crate::worker::SharedState;

pub const FRAME_KIND_RAW: u8 = 0;
pub const FRAME_KIND_JPEG: u8 = 1;

const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const RESTART_PAUSE: Duration = Duration::from_secs(1);
const CAPTURE_PAUSE: Duration = Duration::from_millis(33);
const READ_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Latest captured frame, shared between the capture loop and the HTTP
/// stream.
#[derive(Default)]
pub struct FrameStore {
    latest: Mutex<Option<RgbImage>>,
}

impl FrameStore {
    pub fn new() -> Self {
        FrameStore::default()
    }

    pub fn set(&self, frame: RgbImage) {
        if let Ok(mut slot) = self.latest.lock() {
            *slot = Some(frame);
        }
    }

    pub fn latest(&self) -> Option<RgbImage> {
        self.latest.lock().ok().and_then(|slot| slot.clone())
    }
}

/// JPEG-encode a frame at the given quality.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(frame)
        .context("jpeg encoding failed")?;
    Ok(buffer)
}

/// Resize to a target width, keeping the aspect ratio.
pub fn resize_to_width(frame: &RgbImage, width: u32) -> RgbImage {
    if width == 0 || frame.width() == 0 || frame.width() == width {
        return frame.clone();
    }
    let height = (frame.height() as u64 * width as u64 / frame.width() as u64).max(1) as u32;
    image::imageops::resize(frame, width, height, FilterType::Triangle)
}

#[derive(Clone, Debug)]
pub struct VideoConfig {
    pub video_port: u16,
    pub hostname: String,
    pub jpeg: bool,
    pub jpeg_quality: u8,
    pub resize_width: Option<u32>,
}

pub struct VideoPublisher {
    cfg: VideoConfig,
    cipher: Option<TransportCipher>,
    state: Arc<SharedState>,
    frames: Arc<FrameStore>,
    camera: CameraSource,
    sender: Option<TcpStream>,
}

impl VideoPublisher {
    pub fn new(
        cfg: VideoConfig,
        cipher: Option<TransportCipher>,
        camera: CameraSource,
        frames: Arc<FrameStore>,
        state: Arc<SharedState>,
    ) -> Self {
        VideoPublisher {
            cfg,
            cipher,
            state,
            frames,
            camera,
            sender: None,
        }
    }

    /// Publish frames until shutdown. Never exits on error.
    ///
    /// Delivered frames are paced by the capture device and the server
    /// acknowledgement; an undelivered frame would spin the loop on a
    /// synthetic capture source, so those iterations pause instead.
    pub fn run(&mut self) {
        while !self.state.shutdown.load(Ordering::SeqCst) {
            if self.state.video_restart.swap(false, Ordering::SeqCst) {
                self.restart_sender();
            }
            match self.camera.read() {
                Ok(frame) => {
                    self.frames.set(frame.clone());
                    if !self.send_frame(&frame) {
                        thread::sleep(CAPTURE_PAUSE);
                    }
                }
                Err(e) => {
                    error!("Video capture error: {}", e);
                    thread::sleep(READ_ERROR_PAUSE);
                }
            }
        }
    }

    /// Close the camera and the sender.
    pub fn stop(&mut self) {
        self.camera.close();
        self.sender = None;
    }

    /// True when the frame reached the server and was acknowledged.
    fn send_frame(&mut self, frame: &RgbImage) -> bool {
        let Some(server_ip) = self.state.server_ip() else {
            return false;
        };
        if self.sender.is_none() {
            self.sender = self.connect_sender(&server_ip);
            if self.sender.is_none() {
                self.state.connected.store(false, Ordering::SeqCst);
                thread::sleep(RESTART_PAUSE);
                return false;
            }
        }

        let (kind, payload) = match self.encode_payload(frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Video frame encode error: {}", e);
                self.state.connected.store(false, Ordering::SeqCst);
                return false;
            }
        };
        let header = format!("{}@{}", self.cfg.hostname, now_ms());

        match self.write_frame(&header, kind, &payload) {
            Ok(()) => {
                self.state.connected.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!("Video send error: {}", e);
                // drop and respawn the sender, then keep publishing
                self.sender = None;
                self.sender = self.connect_sender(&server_ip);
                self.state.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn encode_payload(&self, frame: &RgbImage) -> Result<(u8, Vec<u8>)> {
        let resized;
        let frame = match self.cfg.resize_width {
            Some(width) if width > 0 => {
                resized = resize_to_width(frame, width);
                &resized
            }
            _ => frame,
        };

        if self.cfg.jpeg {
            let mut payload = encode_jpeg(frame, self.cfg.jpeg_quality)?;
            if let Some(cipher) = &self.cipher {
                payload = cipher.encrypt(&payload)?;
            }
            Ok((FRAME_KIND_JPEG, payload))
        } else {
            let mut payload = Vec::with_capacity(8 + frame.as_raw().len());
            payload.extend_from_slice(&frame.width().to_be_bytes());
            payload.extend_from_slice(&frame.height().to_be_bytes());
            payload.extend_from_slice(frame.as_raw());
            Ok((FRAME_KIND_RAW, payload))
        }
    }

    fn write_frame(&mut self, header: &str, kind: u8, payload: &[u8]) -> Result<()> {
        let stream = self
            .sender
            .as_mut()
            .context("video sender not connected")?;
        stream.write_all(&(header.len() as u32).to_be_bytes())?;
        stream.write_all(header.as_bytes())?;
        stream.write_all(&[kind])?;
        stream.write_all(&(payload.len() as u32).to_be_bytes())?;
        stream.write_all(payload)?;
        stream.flush()?;

        let mut ack = [0u8; 2];
        stream.read_exact(&mut ack)?;
        if &ack != b"OK" {
            anyhow::bail!("unexpected frame acknowledgement");
        }
        Ok(())
    }

    fn connect_sender(&self, server_ip: &str) -> Option<TcpStream> {
        let addr = format!("{}:{}", server_ip, self.cfg.video_port);
        match TcpStream::connect(&addr) {
            Ok(stream) => {
                let _ = stream.set_read_timeout(Some(SEND_TIMEOUT));
                let _ = stream.set_write_timeout(Some(SEND_TIMEOUT));
                info!("Video sender connected to {}", addr);
                Some(stream)
            }
            Err(e) => {
                debug!("Video sender connect failed ({}): {}", addr, e);
                None
            }
        }
    }

    fn restart_sender(&mut self) {
        info!("Restarting video sender...");
        self.sender = None;
        thread::sleep(RESTART_PAUSE);
        if let Some(server_ip) = self.state.server_ip() {
            self.sender = self.connect_sender(&server_ip);
        }
    }
}

/// Web-mode loop: capture into the frame store, no publishing.
pub fn run_capture(camera: &mut CameraSource, frames: &FrameStore, state: &SharedState) {
    while !state.shutdown.load(Ordering::SeqCst) {
        match camera.read() {
            Ok(frame) => frames.set(frame),
            Err(e) => {
                error!("Video capture error: {}", e);
                thread::sleep(READ_ERROR_PAUSE);
            }
        }
        thread::sleep(CAPTURE_PAUSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn read_published_frame(stream: &mut TcpStream) -> (String, u8, Vec<u8>) {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut header = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut header).unwrap();
        let mut kind = [0u8; 1];
        stream.read_exact(&mut kind).unwrap();
        stream.read_exact(&mut len).unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut payload).unwrap();
        stream.write_all(b"OK").unwrap();
        (String::from_utf8(header).unwrap(), kind[0], payload)
    }

    #[test]
    fn jpeg_encoding_emits_jpeg_magic() {
        let frame = RgbImage::new(16, 16);
        let jpg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let frame = RgbImage::new(100, 50);
        let resized = resize_to_width(&frame, 40);
        assert_eq!(resized.width(), 40);
        assert_eq!(resized.height(), 20);
    }

    #[test]
    fn resize_to_same_width_is_identity() {
        let frame = RgbImage::new(64, 48);
        let resized = resize_to_width(&frame, 64);
        assert_eq!((resized.width(), resized.height()), (64, 48));
    }

    #[test]
    fn frame_store_returns_latest() {
        let store = FrameStore::new();
        assert!(store.latest().is_none());
        store.set(RgbImage::new(8, 8));
        store.set(RgbImage::new(4, 4));
        assert_eq!(store.latest().unwrap().width(), 4);
    }

    #[test]
    fn published_frame_reaches_the_server_and_is_acked() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            tx.send(read_published_frame(&mut stream)).unwrap();
        });

        let state = Arc::new(SharedState::default());
        state.set_server_ip(Some("127.0.0.1".to_string()));
        let cfg = VideoConfig {
            video_port: port,
            hostname: "testhost".to_string(),
            jpeg: true,
            jpeg_quality: 80,
            resize_width: None,
        };
        let mut publisher = VideoPublisher::new(
            cfg,
            None,
            CameraSource::synthetic(32, 32),
            Arc::new(FrameStore::new()),
            state.clone(),
        );
        let frame = publisher.camera.read().unwrap();
        assert!(publisher.send_frame(&frame));

        let (header, kind, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        server.join().unwrap();
        assert!(header.starts_with("testhost@"));
        assert_eq!(kind, FRAME_KIND_JPEG);
        assert_eq!(&payload[..2], &[0xFF, 0xD8]);
        assert!(state.connected.load(Ordering::SeqCst));
    }

    #[test]
    fn frames_are_not_published_without_a_server() {
        let cfg = VideoConfig {
            video_port: 0,
            hostname: "testhost".to_string(),
            jpeg: true,
            jpeg_quality: 80,
            resize_width: None,
        };
        let mut publisher = VideoPublisher::new(
            cfg,
            None,
            CameraSource::synthetic(16, 16),
            Arc::new(FrameStore::new()),
            Arc::new(SharedState::default()),
        );
        let frame = RgbImage::new(16, 16);
        // no server ip yet: skipped, so the publish loop paces itself
        assert!(!publisher.send_frame(&frame));
    }

    #[test]
    fn encrypted_payloads_are_not_plain_jpeg() {
        let state = Arc::new(SharedState::default());
        let cfg = VideoConfig {
            video_port: 0,
            hostname: "testhost".to_string(),
            jpeg: true,
            jpeg_quality: 80,
            resize_width: None,
        };
        let publisher = VideoPublisher::new(
            cfg,
            Some(TransportCipher::from_passphrase("secret")),
            CameraSource::synthetic(16, 16),
            Arc::new(FrameStore::new()),
            state,
        );
        let frame = RgbImage::new(16, 16);
        let (kind, payload) = publisher.encode_payload(&frame).unwrap();
        assert_eq!(kind, FRAME_KIND_JPEG);
        assert_ne!(&payload[..2], &[0xFF, 0xD8]);

        let cipher = TransportCipher::from_passphrase("secret");
        let clear = cipher.decrypt(&payload).unwrap();
        assert_eq!(&clear[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn raw_payloads_carry_dimensions() {
        let state = Arc::new(SharedState::default());
        let cfg = VideoConfig {
            video_port: 0,
            hostname: "testhost".to_string(),
            jpeg: false,
            jpeg_quality: 80,
            resize_width: None,
        };
        let publisher = VideoPublisher::new(
            cfg,
            None,
            CameraSource::synthetic(8, 4),
            Arc::new(FrameStore::new()),
            state,
        );
        let frame = RgbImage::new(8, 4);
        let (kind, payload) = publisher.encode_payload(&frame).unwrap();
        assert_eq!(kind, FRAME_KIND_RAW);
        assert_eq!(&payload[..4], &8u32.to_be_bytes());
        assert_eq!(&payload[4..8], &4u32.to_be_bytes());
        assert_eq!(payload.len(), 8 + 8 * 4 * 3);
    }
}
