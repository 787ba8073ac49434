//! Explicit GPU command submission for the Cinder layer.
//!
//! This crate provides:
//! - Devices and GPU-addressable memory blocks
//! - Command buffers recording into client-provided memory
//! - Queues executing command lists in FIFO order on worker threads
//! - Fences for CPU and cross-queue synchronization
//! - Image layouts, views, descriptors and shader loading
//! - Swapchains presenting images through a queue

pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
mod exec;
pub mod handle;
pub mod image;
pub mod memory;
pub mod queue;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use command::{CmdBuf, CmdBufConfig, CmdList, GrowCallback};
pub use descriptors::{ImageDescriptor, ResHandle, Sampler, SamplerDescriptor};
pub use device::{Device, DeviceConfig, ErrorCallback, MemoryProvider, SystemMemory};
pub use error::{GpuError, Result};
pub use exec::ExecStats;
pub use image::{Image, ImageFlags, ImageLayout, ImageLayoutConfig, ImageView, MipLevel};
pub use memory::{MemBlock, MemBlockConfig, MemBlockFlags};
pub use queue::{Queue, QueueConfig, QueueFlags};
pub use shader::{encode_control, ProgramEntry, Shader, ShaderConfig};
pub use swapchain::{PresentedFrame, SlotState, Swapchain, SwapchainConfig};
pub use sync::{Fence, FenceStatus};
