use image::{GrayImage, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CaptureError;

/// Geometry of one physical monitor, in desktop (logical) coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    pub id: u32,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
}

impl MonitorInfo {
    pub fn label(&self) -> String {
        format!(
            "{} · {}x{} at ({}, {}){}",
            self.name,
            self.width,
            self.height,
            self.x,
            self.y,
            if self.is_primary { " (primary)" } else { "" }
        )
    }
}

/// Which monitors a group captures each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureTarget {
    /// The primary monitor only
    #[default]
    Primary,
    /// Every monitor, in stable (origin-sorted) order
    AllMonitors,
}

/// One grayscale capture together with the monitor it came from
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub monitor: MonitorInfo,
    pub image: GrayImage,
}

impl CapturedFrame {
    /// Convert a pixel position inside the frame to absolute desktop coordinates.
    ///
    /// Captures on HiDPI displays come back in physical pixels while monitor
    /// geometry is logical, so positions are scaled by the ratio between them.
    pub fn to_desktop(&self, px: u32, py: u32) -> (i32, i32) {
        let scale_x = if self.image.width() > 0 {
            self.monitor.width as f64 / self.image.width() as f64
        } else {
            1.0
        };
        let scale_y = if self.image.height() > 0 {
            self.monitor.height as f64 / self.image.height() as f64
        } else {
            1.0
        };

        (
            self.monitor.x + (px as f64 * scale_x).round() as i32,
            self.monitor.y + (py as f64 * scale_y).round() as i32,
        )
    }
}

/// Screen capture capability consumed by the automation worker.
///
/// Implementations are created on the worker thread (see
/// [`DeviceFactory`](crate::controller::DeviceFactory)) and therefore need not
/// be `Send`.
pub trait ScreenCapture {
    /// Enumerate monitors in a stable order
    fn monitors(&mut self) -> Result<Vec<MonitorInfo>, CaptureError>;

    /// Capture one monitor as grayscale
    fn capture(&mut self, monitor: &MonitorInfo) -> Result<GrayImage, CaptureError>;

    /// Capture every monitor selected by `target`.
    ///
    /// A monitor that fails to capture is logged and skipped; the call only
    /// fails when enumeration fails or no monitor could be captured at all.
    fn grab(&mut self, target: CaptureTarget) -> Result<Vec<CapturedFrame>, CaptureError> {
        let monitors = self.monitors()?;
        let selected: Vec<MonitorInfo> = match target {
            CaptureTarget::Primary => monitors
                .iter()
                .find(|m| m.is_primary)
                .or_else(|| monitors.first())
                .cloned()
                .into_iter()
                .collect(),
            CaptureTarget::AllMonitors => monitors,
        };

        if selected.is_empty() {
            return Err(CaptureError::NoMonitors);
        }

        let mut frames = Vec::with_capacity(selected.len());
        let mut last_error = None;
        for monitor in selected {
            match self.capture(&monitor) {
                Ok(image) => frames.push(CapturedFrame { monitor, image }),
                Err(err) => {
                    warn!("Capture of {} failed: {err}", monitor.name);
                    last_error = Some(err);
                }
            }
        }

        match (frames.is_empty(), last_error) {
            (true, Some(err)) => Err(err),
            _ => Ok(frames),
        }
    }
}

/// Screen capture backed by `xcap`
///
/// # Platform-Specific Implementation
///
/// ## macOS
/// - Requires Screen Recording permission (System Settings > Privacy & Security > Screen Recording)
/// - Captures at native (Retina) resolution; geometry is reported in points
///
/// ## Windows
/// - No special permissions required
/// - Supports multi-monitor setups
///
/// ## Linux
/// - X11 or Wayland (via the desktop portal) depending on the session
#[derive(Debug, Default)]
pub struct XcapCapture;

impl XcapCapture {
    pub fn new() -> Self {
        Self
    }

    fn find_monitor(id: u32) -> Result<xcap::Monitor, CaptureError> {
        let monitors = xcap::Monitor::all()
            .map_err(|err| CaptureError::EnumerationFailed(err.to_string().into()))?;
        monitors
            .into_iter()
            .find(|m| m.id().ok() == Some(id))
            .ok_or(CaptureError::MonitorGone(id))
    }
}

impl ScreenCapture for XcapCapture {
    fn monitors(&mut self) -> Result<Vec<MonitorInfo>, CaptureError> {
        let monitors = xcap::Monitor::all()
            .map_err(|err| CaptureError::EnumerationFailed(err.to_string().into()))?;

        let mut infos: Vec<MonitorInfo> = monitors
            .iter()
            .enumerate()
            .map(|(idx, monitor)| MonitorInfo {
                id: monitor.id().unwrap_or(idx as u32),
                name: monitor
                    .name()
                    .unwrap_or_else(|_| format!("Display {}", idx + 1)),
                x: monitor.x().unwrap_or(0),
                y: monitor.y().unwrap_or(0),
                width: monitor.width().unwrap_or(0),
                height: monitor.height().unwrap_or(0),
                is_primary: monitor.is_primary().unwrap_or(false),
            })
            .collect();

        if infos.is_empty() {
            return Err(CaptureError::NoMonitors);
        }

        infos.sort_by_key(|m| (m.x, m.y));
        Ok(infos)
    }

    fn capture(&mut self, monitor: &MonitorInfo) -> Result<GrayImage, CaptureError> {
        let handle = Self::find_monitor(monitor.id)?;
        let image = handle
            .capture_image()
            .map_err(|err| CaptureError::CaptureFailed {
                monitor: monitor.name.clone(),
                source: err.to_string().into(),
            })?;

        debug!(
            "Captured {} at {}x{}",
            monitor.name,
            image.width(),
            image.height()
        );

        Ok(to_grayscale(&image))
    }
}

/// Convert RGBA pixels to single-channel luma.
///
/// Uses the ITU-R BT.601 formula: Y = 0.299*R + 0.587*G + 0.114*B
pub fn to_grayscale(image: &RgbaImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut luma = vec![0u8; (width as usize) * (height as usize)];

    luma.par_iter_mut()
        .zip(image.as_raw().par_chunks_exact(4))
        .for_each(|(dst, px)| {
            let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            *dst = y.round().clamp(0.0, 255.0) as u8;
        });

    // Length always matches width * height
    GrayImage::from_raw(width, height, luma).unwrap_or_else(|| GrayImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn monitor(id: u32, x: i32, primary: bool) -> MonitorInfo {
        MonitorInfo {
            id,
            name: format!("Display {id}"),
            x,
            y: 0,
            width: 100,
            height: 50,
            is_primary: primary,
        }
    }

    struct StubCapture {
        monitors: Vec<MonitorInfo>,
        failing: Vec<u32>,
    }

    impl ScreenCapture for StubCapture {
        fn monitors(&mut self) -> Result<Vec<MonitorInfo>, CaptureError> {
            Ok(self.monitors.clone())
        }

        fn capture(&mut self, monitor: &MonitorInfo) -> Result<GrayImage, CaptureError> {
            if self.failing.contains(&monitor.id) {
                return Err(CaptureError::MonitorGone(monitor.id));
            }
            Ok(GrayImage::new(monitor.width, monitor.height))
        }
    }

    #[test]
    fn test_grayscale_weights() {
        let mut rgba = RgbaImage::new(3, 1);
        rgba.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        rgba.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
        rgba.put_pixel(2, 0, Rgba([0, 0, 255, 255]));

        let gray = to_grayscale(&rgba);
        assert_eq!(gray.get_pixel(0, 0)[0], 76);
        assert_eq!(gray.get_pixel(1, 0)[0], 150);
        assert_eq!(gray.get_pixel(2, 0)[0], 29);
    }

    #[test]
    fn test_grayscale_white_stays_white() {
        let rgba = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        let gray = to_grayscale(&rgba);
        assert!(gray.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_to_desktop_applies_origin_and_scale() {
        let frame = CapturedFrame {
            monitor: MonitorInfo {
                x: 1920,
                y: 0,
                width: 100,
                height: 50,
                ..monitor(2, 1920, false)
            },
            // Physical capture at 2x
            image: GrayImage::new(200, 100),
        };
        assert_eq!(frame.to_desktop(100, 50), (1970, 25));
    }

    #[test]
    fn test_grab_primary_prefers_primary_flag() {
        let mut capture = StubCapture {
            monitors: vec![monitor(1, 0, false), monitor(2, 100, true)],
            failing: vec![],
        };
        let frames = capture.grab(CaptureTarget::Primary).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].monitor.id, 2);
    }

    #[test]
    fn test_grab_all_skips_failing_monitor() {
        let mut capture = StubCapture {
            monitors: vec![monitor(1, 0, true), monitor(2, 100, false)],
            failing: vec![1],
        };
        let frames = capture.grab(CaptureTarget::AllMonitors).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].monitor.id, 2);
    }

    #[test]
    fn test_grab_fails_when_every_monitor_fails() {
        let mut capture = StubCapture {
            monitors: vec![monitor(1, 0, true)],
            failing: vec![1],
        };
        assert!(capture.grab(CaptureTarget::AllMonitors).is_err());
    }

    #[test]
    fn test_grab_with_no_monitors() {
        let mut capture = StubCapture {
            monitors: vec![],
            failing: vec![],
        };
        assert!(matches!(
            capture.grab(CaptureTarget::Primary),
            Err(CaptureError::NoMonitors)
        ));
    }
}
