//! Swapchain management.
//!
//! A swapchain rotates a fixed pool of presentable images through
//! Free → Acquired → Presenting → Free. Presentation is carried out by the
//! worker of the queue that presented the image: the new image replaces the
//! one on screen, which retires and signals its fence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cinder_core::{ImageType, MsMode, Scissor};
use parking_lot::{Condvar, Mutex};
use raw_window_handle::RawWindowHandle;
use tracing::{debug, info, trace};

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::{Image, ImageFlags};
use crate::sync::Fence;

/// Fewest images a swapchain can rotate through.
const MIN_IMAGES: usize = 2;

static NEXT_SWAPCHAIN_ID: AtomicU32 = AtomicU32::new(0);

/// Swapchain configuration.
#[derive(Debug, Clone)]
pub struct SwapchainConfig {
    /// Display refreshes each presentation is held for. Zero does not pace.
    pub swap_interval: u32,
    pub refresh_period: Duration,
    /// How long acquisition waits for an image to retire.
    pub acquire_timeout: Duration,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            swap_interval: 1,
            refresh_period: Duration::from_micros(16_667),
            acquire_timeout: Duration::from_secs(1),
        }
    }
}

impl SwapchainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_swap_interval(mut self, interval: u32) -> Self {
        self.swap_interval = interval;
        self
    }

    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Acquired,
    Presenting,
}

/// The most recent image put on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
    pub slot: usize,
    /// Number of presentations so far, starting at 1.
    pub frame: u64,
    pub crop: Scissor,
}

#[derive(Debug)]
struct SwapchainState {
    slots: Vec<SlotState>,
    /// Fence value each Presenting slot signals on retirement.
    retire_values: Vec<u64>,
    displayed: Option<usize>,
    /// Presents handed to a queue but not yet carried out.
    in_flight: usize,
    frames: u64,
    crop: Scissor,
    swap_interval: u32,
    last: Option<PresentedFrame>,
}

/// State shared with the queue workers that present images.
pub(crate) struct SwapchainShared {
    id: u32,
    refresh_period: Duration,
    fences: Vec<Fence>,
    state: Mutex<SwapchainState>,
    cond: Condvar,
}

impl SwapchainShared {
    /// Put `slot` on screen and retire the image it replaces.
    pub(crate) fn on_present(&self, slot: usize) {
        let interval = {
            let mut state = self.state.lock();
            if let Some(prev) = state.displayed.replace(slot) {
                if prev != slot {
                    state.slots[prev] = SlotState::Free;
                    self.fences[prev].shared().complete(state.retire_values[prev]);
                }
            }
            state.in_flight = state.in_flight.saturating_sub(1);
            state.frames += 1;
            state.last = Some(PresentedFrame {
                slot,
                frame: state.frames,
                crop: state.crop,
            });
            trace!(swapchain = self.id, slot, frame = state.frames, "Presented image");
            self.cond.notify_all();
            state.swap_interval
        };
        if interval > 0 {
            thread::sleep(self.refresh_period * interval);
        }
    }

    /// Give `slot` back without presenting it; its fence reports an error.
    pub(crate) fn abandon(&self, slot: usize) {
        let mut state = self.state.lock();
        state.slots[slot] = SlotState::Free;
        state.in_flight = state.in_flight.saturating_sub(1);
        self.fences[slot].shared().fail(state.retire_values[slot]);
        debug!(swapchain = self.id, slot, "Abandoned presentation");
        self.cond.notify_all();
    }
}

/// A rotating pool of presentable images bound to a native window.
pub struct Swapchain {
    window: RawWindowHandle,
    images: Vec<Image>,
    acquire_timeout: Duration,
    shared: Arc<SwapchainShared>,
}

impl Swapchain {
    /// Create a swapchain over `images`: at least two 2D single-sampled
    /// images of one size and format created with `USAGE_PRESENT`.
    pub fn new(
        device: &Device,
        window: RawWindowHandle,
        images: &[&Image],
        config: SwapchainConfig,
    ) -> Result<Self> {
        // The image on screen only retires once another replaces it.
        if images.len() < MIN_IMAGES {
            return Err(GpuError::InvalidArgument(format!(
                "a swapchain needs at least {MIN_IMAGES} images, got {}",
                images.len()
            )));
        }
        let reference = images[0].layout();
        for (i, image) in images.iter().enumerate() {
            let layout = image.layout();
            if layout.image_type() != ImageType::Tex2D || layout.ms_mode() != MsMode::X1 {
                return Err(GpuError::InvalidArgument(format!(
                    "swapchain image {i} is not a single-sampled 2D image"
                )));
            }
            if !layout.flags().contains(ImageFlags::USAGE_PRESENT) {
                return Err(GpuError::InvalidArgument(format!(
                    "swapchain image {i} was not created for presentation"
                )));
            }
            if layout.width() != reference.width()
                || layout.height() != reference.height()
                || layout.format() != reference.format()
            {
                return Err(GpuError::InvalidArgument(format!(
                    "swapchain image {i} does not match the first image"
                )));
            }
        }

        let count = images.len();
        let mut fences = Vec::with_capacity(count);
        let mut retire_values = Vec::with_capacity(count);
        for _ in 0..count {
            let fence = Fence::new(device)?;
            let value = fence.schedule().value;
            fence.shared().complete(value);
            retire_values.push(value);
            fences.push(fence);
        }

        let id = NEXT_SWAPCHAIN_ID.fetch_add(1, Ordering::Relaxed);
        let crop = Scissor::new(0, 0, reference.width(), reference.height());
        info!(
            swapchain = id,
            images = count,
            width = reference.width(),
            height = reference.height(),
            format = ?reference.format(),
            "Created swapchain"
        );

        Ok(Self {
            window,
            images: images.iter().map(|&image| *image).collect(),
            acquire_timeout: config.acquire_timeout,
            shared: Arc::new(SwapchainShared {
                id,
                refresh_period: config.refresh_period,
                fences,
                state: Mutex::new(SwapchainState {
                    slots: vec![SlotState::Free; count],
                    retire_values,
                    displayed: None,
                    in_flight: 0,
                    frames: 0,
                    crop,
                    swap_interval: config.swap_interval,
                    last: None,
                }),
                cond: Condvar::new(),
            }),
        })
    }

    pub fn window(&self) -> RawWindowHandle {
        self.window
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, slot: usize) -> Option<&Image> {
        self.images.get(slot)
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.shared.state.lock().slots.get(slot).copied()
    }

    /// Fence signaled when `slot` retires from the screen.
    pub fn slot_fence(&self, slot: usize) -> Option<&Fence> {
        self.shared.fences.get(slot)
    }

    pub(crate) fn shared(&self) -> &Arc<SwapchainShared> {
        &self.shared
    }

    /// Take a free image.
    ///
    /// Waits while a pending presentation may retire one. Fails with
    /// `InvalidState` if no image can become free without another present.
    pub fn acquire_image(&self) -> Result<(usize, &Fence)> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(slot) = state.slots.iter().position(|&s| s == SlotState::Free) {
                state.slots[slot] = SlotState::Acquired;
                trace!(swapchain = self.shared.id, slot, "Acquired image");
                return Ok((slot, &self.shared.fences[slot]));
            }
            if state.in_flight == 0 {
                return Err(GpuError::InvalidState(
                    "every image is acquired or on screen".to_string(),
                ));
            }
            if self
                .shared
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(GpuError::Timeout);
            }
        }
    }

    /// Move an acquired slot to Presenting and arm its retirement fence.
    pub(crate) fn begin_present(&self, slot: usize) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.slots.get(slot) {
            Some(SlotState::Acquired) => {}
            Some(other) => {
                return Err(GpuError::InvalidState(format!(
                    "slot {slot} is {other:?}, not acquired"
                )))
            }
            None => {
                return Err(GpuError::InvalidArgument(format!(
                    "slot {slot} out of range for {} images",
                    self.images.len()
                )))
            }
        }
        state.slots[slot] = SlotState::Presenting;
        state.retire_values[slot] = self.shared.fences[slot].schedule().value;
        state.in_flight += 1;
        Ok(())
    }

    /// Restrict presentation to a sub-rectangle of the images.
    pub fn set_crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        let layout = self.images[0].layout();
        let fits = width > 0
            && height > 0
            && u64::from(x) + u64::from(width) <= u64::from(layout.width())
            && u64::from(y) + u64::from(height) <= u64::from(layout.height());
        if !fits {
            return Err(GpuError::InvalidArgument(format!(
                "crop {width}x{height}+{x}+{y} outside {}x{} image",
                layout.width(),
                layout.height()
            )));
        }
        self.shared.state.lock().crop = Scissor::new(x, y, width, height);
        Ok(())
    }

    pub fn set_swap_interval(&self, interval: u32) {
        self.shared.state.lock().swap_interval = interval;
    }

    pub fn last_presented(&self) -> Option<PresentedFrame> {
        self.shared.state.lock().last
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("id", &self.shared.id)
            .field("images", &self.images.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::image::{ImageLayout, ImageLayoutConfig};
    use crate::memory::{MemBlock, MemBlockConfig, MemBlockFlags};
    use cinder_core::ImageFormat;
    use raw_window_handle::WebWindowHandle;

    fn images(device: &Device, count: usize, flags: ImageFlags) -> (MemBlock, Vec<Image>) {
        let layout = ImageLayout::new(
            &ImageLayoutConfig::new(ImageType::Tex2D, ImageFormat::RGBA8Unorm, [64, 32, 1])
                .with_flags(flags),
        )
        .unwrap();
        let stride = layout.size().next_multiple_of(u64::from(layout.alignment())) as u32;
        let block = MemBlock::new(
            device,
            MemBlockConfig::new((stride * count as u32).next_multiple_of(0x1000))
                .with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE),
        )
        .unwrap();
        let images = (0..count)
            .map(|i| Image::new(&layout, &block, stride * i as u32).unwrap())
            .collect();
        (block, images)
    }

    fn window() -> RawWindowHandle {
        RawWindowHandle::Web(WebWindowHandle::new(1))
    }

    fn swapchain(device: &Device, images: &[Image]) -> Swapchain {
        let refs: Vec<&Image> = images.iter().collect();
        let config = SwapchainConfig::new()
            .with_swap_interval(0)
            .with_acquire_timeout(Duration::from_millis(20));
        Swapchain::new(device, window(), &refs, config).unwrap()
    }

    #[test]
    fn rejects_non_presentable_images() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let (_block, imgs) = images(&device, 2, ImageFlags::USAGE_RENDER);
        let refs: Vec<&Image> = imgs.iter().collect();
        assert!(Swapchain::new(&device, window(), &refs, SwapchainConfig::default()).is_err());
        assert!(Swapchain::new(&device, window(), &[], SwapchainConfig::default()).is_err());
    }

    #[test]
    fn single_image_is_rejected() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let (_block, imgs) = images(&device, 1, ImageFlags::USAGE_PRESENT);
        assert!(matches!(
            Swapchain::new(&device, window(), &[&imgs[0]], SwapchainConfig::default()),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn slots_cycle_through_states() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let (_block, imgs) = images(&device, 2, ImageFlags::USAGE_PRESENT | ImageFlags::USAGE_RENDER);
        let chain = swapchain(&device, &imgs);

        let (a, fence_a) = chain.acquire_image().unwrap();
        assert!(fence_a.is_signaled());
        let (b, _) = chain.acquire_image().unwrap();
        assert_ne!(a, b);
        assert!(matches!(chain.acquire_image(), Err(GpuError::InvalidState(_))));

        chain.begin_present(a).unwrap();
        assert_eq!(chain.slot_state(a), Some(SlotState::Presenting));
        assert!(!chain.slot_fence(a).unwrap().is_signaled());
        assert!(chain.begin_present(a).is_err());

        chain.shared().on_present(a);
        // The first image on screen stays there until replaced.
        assert_eq!(chain.slot_state(a), Some(SlotState::Presenting));

        chain.begin_present(b).unwrap();
        chain.shared().on_present(b);
        assert_eq!(chain.slot_state(a), Some(SlotState::Free));
        assert!(chain.slot_fence(a).unwrap().is_signaled());

        let last = chain.last_presented().unwrap();
        assert_eq!((last.slot, last.frame), (b, 2));
        assert_eq!(last.crop, Scissor::new(0, 0, 64, 32));
    }

    #[test]
    fn acquire_times_out_while_present_pending() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let (_block, imgs) = images(&device, 2, ImageFlags::USAGE_PRESENT);
        let chain = swapchain(&device, &imgs);
        let (slot, _) = chain.acquire_image().unwrap();
        chain.acquire_image().unwrap();
        chain.begin_present(slot).unwrap();
        assert!(matches!(chain.acquire_image(), Err(GpuError::Timeout)));
    }

    #[test]
    fn crop_must_fit() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let (_block, imgs) = images(&device, 2, ImageFlags::USAGE_PRESENT);
        let chain = swapchain(&device, &imgs);
        assert!(chain.set_crop(0, 0, 65, 32).is_err());
        chain.set_crop(8, 8, 16, 16).unwrap();
        let (slot, _) = chain.acquire_image().unwrap();
        chain.begin_present(slot).unwrap();
        chain.shared().on_present(slot);
        assert_eq!(chain.last_presented().unwrap().crop, Scissor::new(8, 8, 16, 16));
    }
}
