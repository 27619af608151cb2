//! Camera capture sources.
//!
//! The real backend (nokhwa) sits behind the `camera-nokhwa` feature so the
//! client builds and tests on machines without a camera stack. Without the
//! feature every capture index maps to a synthetic source that generates a
//! moving test pattern.

use anyhow::Result;
use image::RgbImage;
use log::info;

use crate::config::CameraSettings;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "camera-nokhwa")]
    Device(device::NokhwaCamera),
}

impl CameraSource {
    /// Open the capture backend selected at build time.
    ///
    /// The CSI camera is exposed as the first capture device, so `use_pi`
    /// forces index 0.
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        let index = if settings.use_pi { 0 } else { settings.index };

        #[cfg(feature = "camera-nokhwa")]
        {
            let camera = device::NokhwaCamera::open(index, settings.width, settings.height)?;
            Ok(CameraSource {
                backend: CameraBackend::Device(camera),
            })
        }

        #[cfg(not(feature = "camera-nokhwa"))]
        {
            info!(
                "Camera backend not compiled in, camera {} maps to the synthetic source",
                index
            );
            Ok(CameraSource::synthetic(
                settings.width.unwrap_or(DEFAULT_WIDTH),
                settings.height.unwrap_or(DEFAULT_HEIGHT),
            ))
        }
    }

    /// Synthetic source with a fixed resolution.
    pub fn synthetic(width: u32, height: u32) -> Self {
        CameraSource {
            backend: CameraBackend::Synthetic(SyntheticCamera::new(width, height)),
        }
    }

    /// Capture the next frame as RGB8.
    pub fn read(&mut self) -> Result<RgbImage> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => Ok(camera.next_frame()),
            #[cfg(feature = "camera-nokhwa")]
            CameraBackend::Device(camera) => camera.next_frame(),
        }
    }

    /// Release the capture device.
    pub fn close(&mut self) {
        match &mut self.backend {
            CameraBackend::Synthetic(_) => {}
            #[cfg(feature = "camera-nokhwa")]
            CameraBackend::Device(camera) => camera.close(),
        }
    }
}

/// Test-pattern source. Simulates a scene with occasional changes so
/// consecutive frames differ and motion is visible downstream.
struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticCamera {
    fn new(width: u32, height: u32) -> Self {
        SyntheticCamera {
            width: width.max(1),
            height: height.max(1),
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn next_frame(&mut self) -> RgbImage {
        self.frame_count += 1;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }

        // dimensions and buffer length agree by construction
        RgbImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

#[cfg(feature = "camera-nokhwa")]
mod device {
    use anyhow::{Context, Result};
    use image::RgbImage;
    use log::info;
    use nokhwa::{
        pixel_format::RgbFormat,
        utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
        Camera,
    };
    use std::time::Duration;

    const WARMUP: Duration = Duration::from_secs(2);

    pub(super) struct NokhwaCamera {
        camera: Camera,
    }

    impl NokhwaCamera {
        pub(super) fn open(index: u32, width: Option<u32>, height: Option<u32>) -> Result<Self> {
            let requested = match (width, height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => {
                    RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                        CameraFormat::new_from(w, h, FrameFormat::MJPEG, 30),
                    ))
                }
                _ => RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
            };
            let mut camera = Camera::new(CameraIndex::Index(index), requested)
                .with_context(|| format!("failed to open camera {}", index))?;
            camera
                .open_stream()
                .with_context(|| format!("failed to start camera {} stream", index))?;
            info!("Camera {} opened: {:?}", index, camera.camera_format());
            // sensor warmup before the first frame is trusted
            std::thread::sleep(WARMUP);
            Ok(NokhwaCamera { camera })
        }

        pub(super) fn next_frame(&mut self) -> Result<RgbImage> {
            let frame = self.camera.frame().context("camera frame capture failed")?;
            frame
                .decode_image::<RgbFormat>()
                .context("camera frame decode failed")
        }

        pub(super) fn close(&mut self) {
            let _ = self.camera.stop_stream();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_camera_produces_frames() {
        let mut source = CameraSource::synthetic(64, 48);
        let frame = source.read().unwrap();
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
    }

    #[test]
    fn synthetic_frames_differ_over_time() {
        let mut source = CameraSource::synthetic(32, 32);
        let first = source.read().unwrap();
        let second = source.read().unwrap();
        assert_ne!(first.into_raw(), second.into_raw());
    }

    #[test]
    fn zero_dimensions_are_clamped() {
        let mut source = CameraSource::synthetic(0, 0);
        let frame = source.read().unwrap();
        assert_eq!(frame.width(), 1);
        assert_eq!(frame.height(), 1);
    }
}
