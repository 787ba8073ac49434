//! Cinder Demo
//!
//! Drives a headless swapchain through a queue: every frame clears a small
//! pattern image, blits it over the acquired swapchain image and presents it.
//! Command memory grows on demand through the command buffer's grow callback.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cinder-demo -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames <N>`: Frames to present (default: 120)
//! - `--images <N>`: Swapchain images, at least 2 (default: 3)
//! - `--width <N>`, `--height <N>`: Swapchain size (default: 320x180)
//! - `--swap-interval <N>`: Refreshes per presentation (default: 0)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cinder_core::{BlitFlags, BlitRect, ColorMask, ImageFormat, ImageType};
use cinder_gpu::{
    CmdBuf, CmdBufConfig, Device, DeviceConfig, Fence, Image, ImageFlags, ImageLayout,
    ImageLayoutConfig, ImageView, MemBlock, MemBlockConfig, MemBlockFlags, Queue, QueueConfig,
    Swapchain, SwapchainConfig,
};
use parking_lot::Mutex;
use raw_window_handle::{RawWindowHandle, WebWindowHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PATTERN_SIZE: u32 = 16;
const CMDMEM_SIZE: u32 = 0x10000;
const STATS_INTERVAL: u64 = 30;

/// Demo parameters.
#[derive(Debug, Clone)]
struct DemoParams {
    frames: u64,
    images: usize,
    width: u32,
    height: u32,
    swap_interval: u32,
}

impl Default for DemoParams {
    fn default() -> Self {
        Self {
            frames: 120,
            images: 3,
            width: 320,
            height: 180,
            swap_interval: 0,
        }
    }
}

impl DemoParams {
    /// Parse demo parameters from command line arguments.
    fn from_args() -> anyhow::Result<Self> {
        let mut params = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .with_context(|| format!("{flag} needs a value"))
            };
            match flag {
                "--frames" => params.frames = value()?.parse()?,
                "--images" => params.images = value()?.parse()?,
                "--width" => params.width = value()?.parse()?,
                "--height" => params.height = value()?.parse()?,
                "--swap-interval" => params.swap_interval = value()?.parse()?,
                other => anyhow::bail!("unknown option {other}"),
            }
            i += 2;
        }

        // One image stays on screen, so rotation needs a second.
        anyhow::ensure!(params.images >= 2, "at least two swapchain images are needed");
        Ok(params)
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let params = DemoParams::from_args()?;
    info!(?params, "Cinder Demo");
    run(&params)
}

fn print_help() {
    eprintln!(
        "Cinder Demo

USAGE:
    cargo run -p cinder-demo -- [OPTIONS]

OPTIONS:
    --frames <N>          Frames to present (default: 120)
    --images <N>          Swapchain images, at least 2 (default: 3)
    --width <N>           Swapchain width (default: 320)
    --height <N>          Swapchain height (default: 180)
    --swap-interval <N>   Refreshes per presentation (default: 0)
    -h, --help            Print this help message"
    );
}

fn image_layout(
    format: ImageFormat,
    width: u32,
    height: u32,
    flags: ImageFlags,
) -> anyhow::Result<ImageLayout> {
    let config =
        ImageLayoutConfig::new(ImageType::Tex2D, format, [width, height, 1]).with_flags(flags);
    Ok(ImageLayout::new(&config)?)
}

fn run(params: &DemoParams) -> anyhow::Result<()> {
    let device = Device::new(DeviceConfig::new().with_error_callback(|context, err| {
        error!(context, error = %err, "GPU fault");
    }))?;
    let mut queue = Queue::new(&device, QueueConfig::default())?;

    // Pattern image followed by the swapchain images in one block.
    let pattern_layout = image_layout(
        ImageFormat::RGBA8Unorm,
        PATTERN_SIZE,
        PATTERN_SIZE,
        ImageFlags::USAGE_RENDER,
    )?;
    let screen_layout = image_layout(
        ImageFormat::BGRA8Unorm,
        params.width,
        params.height,
        ImageFlags::USAGE_RENDER | ImageFlags::USAGE_PRESENT,
    )?;
    let align = |size: u64, alignment: u32| size.next_multiple_of(u64::from(alignment));
    let pattern_span = align(pattern_layout.size(), screen_layout.alignment());
    let screen_span = align(screen_layout.size(), screen_layout.alignment());
    let total = align(pattern_span + screen_span * params.images as u64, 0x1000);
    let image_mem = MemBlock::new(
        &device,
        MemBlockConfig::new(u32::try_from(total).context("swapchain images too large")?)
            .with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE),
    )?;

    let pattern = Image::new(&pattern_layout, &image_mem, 0)?;
    let screens = (0..params.images)
        .map(|i| {
            let offset = pattern_span + screen_span * i as u64;
            Image::new(&screen_layout, &image_mem, u32::try_from(offset)?)
                .map_err(anyhow::Error::from)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let swapchain = Swapchain::new(
        &device,
        RawWindowHandle::Web(WebWindowHandle::new(1)),
        &screens.iter().collect::<Vec<_>>(),
        SwapchainConfig::new().with_swap_interval(params.swap_interval),
    )?;

    let extra_mem: Arc<Mutex<Vec<MemBlock>>> = Arc::default();
    let mut cmdbuf = {
        let extra_mem = Arc::clone(&extra_mem);
        CmdBuf::new(
            &device,
            CmdBufConfig::new().with_grow_callback(move |cmdbuf: &mut CmdBuf, requested| {
                let size = requested.max(CMDMEM_SIZE).next_multiple_of(0x1000);
                match MemBlock::new(cmdbuf.device(), MemBlockConfig::new(size)) {
                    Ok(block) => match cmdbuf.add_memory(&block, 0, size) {
                        Ok(()) => extra_mem.lock().push(block),
                        Err(err) => warn!(error = %err, "Failed to attach command memory"),
                    },
                    Err(err) => warn!(error = %err, "Failed to allocate command memory"),
                }
            }),
        )?
    };
    let cmd_mem = MemBlock::new(&device, MemBlockConfig::new(CMDMEM_SIZE))?;
    cmdbuf.add_memory(&cmd_mem, 0, CMDMEM_SIZE)?;

    let frame_done = Fence::new(&device)?;
    let pattern_view = ImageView::new(&pattern);
    let pattern_rect = BlitRect::new(0, 0, PATTERN_SIZE, PATTERN_SIZE);
    let screen_rect = BlitRect::new(0, 0, params.width, params.height);
    let start = Instant::now();

    for frame in 0..params.frames {
        // Recording memory is reused once the previous frame retired.
        if frame > 0 {
            frame_done.wait(None).into_result()?;
            cmdbuf.clear();
        }

        let slot = queue.acquire_image(&swapchain)?;
        let screen = swapchain.image(slot).context("acquired slot out of range")?;
        let screen_view = ImageView::new(screen);

        let t = frame as f32 / params.frames.max(1) as f32;
        cmdbuf.bind_render_targets(&[&pattern_view], None)?;
        cmdbuf.clear_color_float(0, ColorMask::RGBA, [t, 0.25, 1.0 - t, 1.0])?;
        cmdbuf.blit_image(
            &pattern_view,
            &pattern_rect,
            &screen_view,
            &screen_rect,
            BlitFlags::FILTER_LINEAR,
            0,
        )?;
        let list = cmdbuf.finish_list();

        queue.submit_commands(&list)?;
        queue.present_image(&swapchain, slot)?;
        queue.signal_fence(&frame_done, true)?;

        if (frame + 1) % STATS_INTERVAL == 0 {
            let stats = queue.stats();
            info!(
                frame = frame + 1,
                presents = stats.presents,
                commands = stats.commands,
                bytes_copied = stats.bytes_copied,
                "Progress"
            );
        }
    }

    queue.wait_idle()?;
    let stats = queue.stats();
    let elapsed = start.elapsed();
    info!(
        frames = params.frames,
        elapsed_ms = elapsed.as_millis() as u64,
        lists = stats.lists,
        commands = stats.commands,
        clears = stats.clears,
        copies = stats.copies,
        presents = stats.presents,
        extra_command_blocks = extra_mem.lock().len(),
        last = ?swapchain.last_presented(),
        "Done"
    );
    Ok(())
}
