//! Headless device, queue and resource helpers for tests.

use std::sync::Arc;
use std::time::Duration;

use cinder_core::{ImageFormat, ImageType, Stage};
use cinder_gpu::{
    encode_control, CmdBuf, CmdBufConfig, CmdList, Device, DeviceConfig, Fence, Image, ImageFlags,
    ImageLayout, ImageLayoutConfig, MemBlock, MemBlockConfig, MemBlockFlags, ProgramEntry, Queue,
    Shader, ShaderConfig,
};
use parking_lot::Mutex;
use raw_window_handle::{RawWindowHandle, WebWindowHandle};
use tracing::debug;

use crate::{Result, RigConfig, TestError};

/// How long a rig waits for submitted work before giving up.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A device and queue with error capture.
pub struct TestRig {
    // Dropped before the device handle so the worker joins first.
    queue: Queue,
    device: Device,
    errors: Arc<Mutex<Vec<String>>>,
    threshold: f64,
}

impl TestRig {
    pub fn new() -> Result<Self> {
        Self::with_config(RigConfig::default())
    }

    pub fn with_config(config: RigConfig) -> Result<Self> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let device = Device::new(
            DeviceConfig::new()
                .with_memory_budget(config.memory_budget)
                .with_error_callback(move |context, err| {
                    sink.lock().push(format!("{context}: {err}"));
                }),
        )?;
        let queue = Queue::new(&device, config.queue)?;
        debug!(device = device.id(), queue = queue.id(), "Created test rig");
        Ok(Self {
            queue,
            device,
            errors,
            threshold: config.threshold,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Messages passed to the device error callback so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// CPU-visible block of `size` bytes.
    pub fn block(&self, size: u32) -> Result<MemBlock> {
        Ok(MemBlock::new(&self.device, MemBlockConfig::new(size))?)
    }

    /// Block that can hold images.
    pub fn image_block(&self, size: u32) -> Result<MemBlock> {
        let config =
            MemBlockConfig::new(size).with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE);
        Ok(MemBlock::new(&self.device, config)?)
    }

    /// Block that can hold shader code.
    pub fn code_block(&self, size: u32) -> Result<MemBlock> {
        let config =
            MemBlockConfig::new(size).with_flags(MemBlockFlags::default() | MemBlockFlags::CODE);
        Ok(MemBlock::new(&self.device, config)?)
    }

    /// Command buffer with `size` bytes of its own memory attached.
    pub fn cmdbuf(&self, size: u32) -> Result<(CmdBuf, MemBlock)> {
        let memory = self.block(size)?;
        let mut cmdbuf = CmdBuf::new(&self.device, CmdBufConfig::default())?;
        cmdbuf.add_memory(&memory, 0, size)?;
        Ok((cmdbuf, memory))
    }

    /// Single-level 2D image at `offset` of `block`.
    pub fn image_2d(
        &self,
        block: &MemBlock,
        offset: u32,
        width: u32,
        height: u32,
        format: ImageFormat,
        flags: ImageFlags,
    ) -> Result<Image> {
        let layout = ImageLayout::new(
            &ImageLayoutConfig::new(ImageType::Tex2D, format, [width, height, 1]).with_flags(flags),
        )?;
        Ok(Image::new(&layout, block, offset)?)
    }

    /// Shader for `stage` whose single program sits at `offset` of `block`.
    pub fn shader(&self, block: &MemBlock, offset: u32, stage: Stage) -> Result<Shader> {
        let control = encode_control(
            stage,
            &[ProgramEntry {
                code_offset: 0,
                code_size: 0x100,
                num_gprs: 8,
                const_buf_size: 0,
            }],
        );
        Ok(Shader::new(&ShaderConfig::new(block, offset, &control))?)
    }

    /// Submit `list`, flush and block until it has executed.
    pub fn submit_and_wait(&mut self, list: &CmdList) -> Result<()> {
        let fence = Fence::new(&self.device)?;
        self.queue.submit_commands(list)?;
        self.queue.signal_fence(&fence, true)?;
        fence.wait(Some(SUBMIT_TIMEOUT)).into_result()?;
        Ok(())
    }

    /// Read the first level of a 2D RGBA8 image, row by row.
    pub fn read_rgba8(&self, image: &Image, block: &MemBlock) -> Result<Vec<[u8; 4]>> {
        let layout = image.layout();
        if layout.format().texel_size() != 4 {
            return Err(TestError::PixelComparison(format!(
                "{:?} is not a 4-byte format",
                layout.format()
            )));
        }
        let level = layout
            .level(0)
            .copied()
            .ok_or_else(|| TestError::PixelComparison("image has no levels".to_string()))?;
        let base = (image.gpu_addr() - block.gpu_addr()) as u32;
        let mut pixels = Vec::with_capacity((level.width * level.height) as usize);
        let mut row = vec![0u8; (level.width * 4) as usize];
        for y in 0..level.height {
            block.read_bytes(base + y * level.row_pitch, &mut row)?;
            pixels.extend(row.chunks_exact(4).map(|t| [t[0], t[1], t[2], t[3]]));
        }
        Ok(pixels)
    }
}

/// Window handle for swapchains that are never shown.
pub fn test_window() -> RawWindowHandle {
    RawWindowHandle::Web(WebWindowHandle::new(1))
}

/// Compare RGBA8 pixels allowing a per-channel difference of `threshold`.
pub fn compare_pixels(actual: &[[u8; 4]], expected: &[[u8; 4]], threshold: f64) -> Result<()> {
    if actual.len() != expected.len() {
        return Err(TestError::PixelComparison(format!(
            "pixel count differs: {} vs {}",
            actual.len(),
            expected.len()
        )));
    }
    let limit = threshold * 255.0;
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let worst = a
            .iter()
            .zip(e)
            .map(|(&a, &e)| (i32::from(a) - i32::from(e)).unsigned_abs())
            .max()
            .unwrap_or(0);
        if f64::from(worst) > limit {
            return Err(TestError::PixelComparison(format!(
                "pixel {i}: got {a:?}, expected {e:?}"
            )));
        }
    }
    Ok(())
}
