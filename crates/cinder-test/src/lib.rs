//! Test rig for the Cinder GPU layer.
//!
//! Provides a device and queue wired for headless use, helpers for creating
//! memory, images and shaders, and pixel comparison for readback checks.

pub mod harness;

#[cfg(test)]
mod scenarios;

pub use harness::{compare_pixels, test_window, TestRig};

use cinder_gpu::{GpuError, QueueConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Pixel comparison failed: {0}")]
    PixelComparison(String),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Test rig configuration.
#[derive(Debug, Clone)]
pub struct RigConfig {
    pub queue: QueueConfig,
    /// Host memory budget for the rig's device.
    pub memory_budget: u64,
    /// Maximum allowed per-channel difference (0.0-1.0) in pixel checks.
    pub threshold: f64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            memory_budget: 256 * 1024 * 1024,
            threshold: 0.004,
        }
    }
}
