//! Screen template matching and click automation.
//!
//! Each automation group captures the screen, searches its templates with
//! multi-scale normalized cross-correlation and clicks the first match, with
//! run/pause/stop control, pause-aware timing and an inactivity auto-stop.

pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod input;
pub mod matcher;
pub mod messaging;
pub mod notify;
pub mod state;
pub mod templates;
pub mod timing;

pub use controller::{AutomationController, ControllerFactory, DeviceFactory, Devices, NativeDevices};
pub use error::{AppResult, ControlError, ValidationError};
pub use state::{RunStatus, StopReason};
