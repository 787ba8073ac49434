//! Core types for the Cinder GPU command layer.
//!
//! This crate provides the plain data shared by the encoder and the executor:
//! - Enumerations for shader stages, texel formats and pipeline options
//! - Fixed-format pipeline state records
//! - The command stream wire format

mod macros;

pub mod error;
pub mod state;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use state::{
    BlitRect, BufExtents, CopyBuf, DepthStencilState, RasterizerState, Scissor, Viewport,
    VtxAttribState, VtxBufferState,
};
pub use types::{
    Barrier, BlitFlags, ColorMask, CompareOp, ComponentKind, DsSource, Face, Filter, FrontFace,
    IdxFormat, ImageFormat, ImageType, InvalidateFlags, MipFilter, MsMode, PolygonMode, Primitive,
    SamplerReduction, Stage, StageFlags, StencilOp, Swizzle, TiledCacheOp, VtxAttribSize,
    VtxAttribType, WrapMode,
};
pub use wire::{
    Command, CommandReader, DispatchIndirectData, DrawIndexedIndirectData, DrawIndirectData,
    FenceRef, Opcode, ShaderBinding, ViewTarget,
};

/// A device-visible address.
pub type GpuAddr = u64;

/// Layer-wide constants.
pub mod constants {
    /// Size and alignment granularity of memory blocks.
    pub const MEMBLOCK_ALIGNMENT: u32 = 0x1000;
    /// Alignment of command memory ranges and instruction records.
    pub const CMDMEM_ALIGNMENT: u32 = 4;
    /// Smallest command memory pool a queue may be created with.
    pub const QUEUE_MIN_CMDMEM_SIZE: u32 = 0x10000;
    /// Alignment of shader code inside a code memory block.
    pub const SHADER_CODE_ALIGNMENT: u32 = 0x100;
    /// Size of an image descriptor record.
    pub const IMAGE_DESCRIPTOR_SIZE: u32 = 32;
    /// Size of a sampler descriptor record.
    pub const SAMPLER_DESCRIPTOR_SIZE: u32 = 32;
    /// Alignment required for uniform buffer addresses.
    pub const UNIFORM_BUF_ALIGNMENT: u32 = 0x100;
    /// Largest uniform buffer that may be bound.
    pub const UNIFORM_BUF_MAX_SIZE: u32 = 0x10000;
    /// Largest payload accepted by a single inline data record.
    pub const MAX_PUSH_DATA_SIZE: u32 = 0x10000;

    pub const NUM_STAGES: usize = 6;
    pub const NUM_UNIFORM_BUFS: u32 = 16;
    pub const NUM_STORAGE_BUFS: u32 = 16;
    pub const NUM_TEXTURE_BINDINGS: u32 = 32;
    pub const NUM_IMAGE_BINDINGS: u32 = 8;
    pub const MAX_VERTEX_ATTRIBS: u32 = 32;
    pub const MAX_VERTEX_BUFFERS: u32 = 16;
    pub const NUM_VIEWPORTS: u32 = 16;
    pub const MAX_RENDER_TARGETS: u32 = 8;
    pub const MAX_MIP_LEVELS: usize = 15;
}
