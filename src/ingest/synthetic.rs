//! Synthetic camera transport (`stub://`).
//!
//! Produces generated RGB frames paced to the camera's configured fps. Every 50 frames
//! the scene changes so downstream recognition sees variation.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::CameraConfig;

use super::transport::{CameraTransport, CapturedImage, FrameStream};

pub struct SyntheticTransport;

impl SyntheticTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SyntheticTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraTransport for SyntheticTransport {
    fn scheme(&self) -> &'static str {
        "stub"
    }

    fn open(&self, camera: &CameraConfig) -> Result<Box<dyn FrameStream>> {
        log::info!(
            "SyntheticTransport: connected to {} (synthetic)",
            camera.source_uri
        );
        Ok(Box::new(SyntheticStream {
            width: camera.resolution.width,
            height: camera.resolution.height,
            frame_period: Duration::from_secs_f64(1.0 / f64::from(camera.fps.max(1))),
            // Different cameras start from different scenes.
            scene_state: camera.camera_id.bytes().fold(0u8, |acc, b| acc.wrapping_add(b)),
            frame_count: 0,
            next_due: None,
        }))
    }
}

struct SyntheticStream {
    width: u32,
    height: u32,
    frame_period: Duration,
    scene_state: u8,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticStream {
    fn pace(&mut self) {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // Do not try to catch up after a stall.
        self.next_due = Some(due.max(now) + self.frame_period);
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.width as usize * self.height as usize * 3;
        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let seed = u64::from(self.scene_state) * 31;
        (0..pixel_count)
            .map(|i| ((i as u64 + seed) % 256) as u8)
            .collect()
    }
}

impl FrameStream for SyntheticStream {
    fn next_frame(&mut self) -> Result<CapturedImage> {
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(CapturedImage {
            pixels,
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(fps: u32) -> CameraConfig {
        let mut camera = CameraConfig::new("cam_stub", "stub://test", "Lobby");
        camera.fps = fps;
        camera.resolution.width = 16;
        camera.resolution.height = 8;
        camera
    }

    #[test]
    fn synthetic_stream_produces_frames_of_configured_size() -> Result<()> {
        let mut stream = SyntheticTransport::new().open(&camera(1000))?;
        let image = stream.next_frame()?;
        assert_eq!(image.width, 16);
        assert_eq!(image.height, 8);
        assert_eq!(image.pixels.len(), 16 * 8 * 3);
        Ok(())
    }

    #[test]
    fn scene_changes_every_fifty_frames() -> Result<()> {
        let mut stream = SyntheticTransport::new().open(&camera(100_000))?;
        let first = stream.next_frame()?.pixels;
        let mut last = Vec::new();
        for _ in 2..50 {
            last = stream.next_frame()?.pixels;
        }
        assert_eq!(first, last);
        let changed = stream.next_frame()?.pixels;
        assert_ne!(first, changed);
        Ok(())
    }

    #[test]
    fn stream_is_paced_to_fps() -> Result<()> {
        let mut stream = SyntheticTransport::new().open(&camera(50))?;
        let started = Instant::now();
        for _ in 0..5 {
            stream.next_frame()?;
        }
        // First frame is immediate, the next four wait one period each.
        assert!(started.elapsed() >= Duration::from_millis(75));
        Ok(())
    }
}
