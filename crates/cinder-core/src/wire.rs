//! Command stream wire format.
//!
//! A command list is a sequence of 32-bit words. Every instruction starts
//! with a header word holding the opcode in the low 16 bits and the number of
//! payload words in the high 16 bits, followed by the payload. 64-bit values
//! are stored low word first.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::macros::raw_enum;
use crate::state::{
    BlitRect, BufExtents, CopyBuf, DepthStencilState, RasterizerState, Scissor, Viewport,
    VtxAttribState, VtxBufferState,
};
use crate::types::{
    Barrier, BlitFlags, ColorMask, CompareOp, Face, FrontFace, IdxFormat, ImageFormat,
    InvalidateFlags, PolygonMode, Primitive, Stage, StageFlags, StencilOp, TiledCacheOp,
    VtxAttribSize, VtxAttribType,
};
use crate::GpuAddr;

/// Largest payload a single instruction can carry, in words.
pub const MAX_PAYLOAD_WORDS: usize = 0xFFFF;

raw_enum! {
    /// Instruction opcodes.
    pub enum Opcode {
        WaitFence = 0x01,
        SignalFence = 0x02,
        Barrier = 0x03,
        BindShaders = 0x10,
        BindUniformBuffers = 0x11,
        BindStorageBuffers = 0x12,
        BindTextures = 0x13,
        BindImages = 0x14,
        BindImageDescriptorSet = 0x15,
        BindSamplerDescriptorSet = 0x16,
        BindRenderTargets = 0x17,
        BindRasterizerState = 0x18,
        BindDepthStencilState = 0x19,
        BindVtxAttribState = 0x1a,
        BindVtxBufferState = 0x1b,
        BindVtxBuffers = 0x1c,
        BindIdxBuffer = 0x1d,
        SetViewports = 0x20,
        SetScissors = 0x21,
        SetDepthBounds = 0x22,
        SetStencil = 0x23,
        SetPrimitiveRestart = 0x24,
        SetTileSize = 0x25,
        TiledCacheOp = 0x26,
        ClearColor = 0x30,
        ClearDepthStencil = 0x31,
        DiscardColor = 0x32,
        DiscardDepthStencil = 0x33,
        Draw = 0x40,
        DrawIndirect = 0x41,
        DrawIndexed = 0x42,
        DrawIndexedIndirect = 0x43,
        Dispatch = 0x44,
        DispatchIndirect = 0x45,
        PushData = 0x50,
        PushConstants = 0x51,
        CopyBuffer = 0x60,
        CopyImage = 0x61,
        BlitImage = 0x62,
        ResolveImage = 0x63,
        CopyBufferToImage = 0x64,
        CopyImageToBuffer = 0x65,
    }
}

/// A fence as referenced from the command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceRef {
    /// Slot in the device fence table.
    pub index: u32,
    /// Generation of the slot when the instruction was recorded.
    pub generation: u32,
    /// Value the fence reaches when signaled by this instruction.
    pub value: u64,
}

/// One shader bound by a `BindShaders` instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderBinding {
    pub stage: Stage,
    pub valid: bool,
    pub code_addr: GpuAddr,
    pub code_size: u32,
    pub program_id: u32,
}

/// A resolved image subresource as the executor sees it.
///
/// `addr` already points at the selected mip level and first layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewTarget {
    pub addr: GpuAddr,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub samples: u32,
    pub row_pitch: u32,
    pub slice_stride: u32,
}

impl ViewTarget {
    /// Bytes per pixel including all samples.
    pub const fn pixel_size(&self) -> u32 {
        self.format.texel_size() * self.samples
    }

    /// Byte offset of the first sample of a pixel.
    pub const fn pixel_offset(&self, x: u32, y: u32, z: u32) -> u64 {
        z as u64 * self.slice_stride as u64
            + y as u64 * self.row_pitch as u64
            + x as u64 * self.pixel_size() as u64
    }

    /// Returns true if the box lies inside the target.
    pub const fn contains(&self, rect: &BlitRect) -> bool {
        rect.x as u64 + rect.width as u64 <= self.width as u64
            && rect.y as u64 + rect.height as u64 <= self.height as u64
            && rect.z as u64 + rect.depth as u64 <= self.depth_or_layers as u64
    }

    /// Number of bytes spanned from `addr` to the end of the last row of the last slice.
    pub const fn span(&self) -> u64 {
        if self.depth_or_layers == 0 || self.height == 0 {
            return 0;
        }
        (self.depth_or_layers as u64 - 1)
            .saturating_mul(self.slice_stride as u64)
            .saturating_add(self.height as u64 * self.row_pitch as u64)
    }
}

/// Parameters fetched by `DrawIndirect`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirectData {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Parameters fetched by `DrawIndexedIndirect`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectData {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Parameters fetched by `DispatchIndirect`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchIndirectData {
    pub num_groups_x: u32,
    pub num_groups_y: u32,
    pub num_groups_z: u32,
}

/// A decoded instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    WaitFence(FenceRef),
    SignalFence {
        fence: FenceRef,
        flush: bool,
    },
    Barrier {
        mode: Barrier,
        invalidate: InvalidateFlags,
    },
    BindShaders {
        mask: StageFlags,
        bindings: Vec<ShaderBinding>,
    },
    BindUniformBuffers {
        stage: Stage,
        first_id: u32,
        buffers: Vec<BufExtents>,
    },
    BindStorageBuffers {
        stage: Stage,
        first_id: u32,
        buffers: Vec<BufExtents>,
    },
    BindTextures {
        stage: Stage,
        first_id: u32,
        handles: Vec<u32>,
    },
    BindImages {
        stage: Stage,
        first_id: u32,
        handles: Vec<u32>,
    },
    BindImageDescriptorSet {
        addr: GpuAddr,
        num_descriptors: u32,
    },
    BindSamplerDescriptorSet {
        addr: GpuAddr,
        num_descriptors: u32,
    },
    BindRenderTargets {
        colors: Vec<ViewTarget>,
        depth: Option<ViewTarget>,
    },
    BindRasterizerState(RasterizerState),
    BindDepthStencilState(DepthStencilState),
    BindVtxAttribState(Vec<VtxAttribState>),
    BindVtxBufferState(Vec<VtxBufferState>),
    BindVtxBuffers {
        first_id: u32,
        buffers: Vec<BufExtents>,
    },
    BindIdxBuffer {
        format: IdxFormat,
        addr: GpuAddr,
    },
    SetViewports {
        first_id: u32,
        viewports: Vec<Viewport>,
    },
    SetScissors {
        first_id: u32,
        scissors: Vec<Scissor>,
    },
    SetDepthBounds {
        enable: bool,
        near: f32,
        far: f32,
    },
    SetStencil {
        face: Face,
        mask: u8,
        func_ref: u8,
        func_mask: u8,
    },
    SetPrimitiveRestart {
        enable: bool,
        index: u32,
    },
    SetTileSize {
        width: u32,
        height: u32,
    },
    TiledCacheOp(TiledCacheOp),
    ClearColor {
        target_id: u32,
        mask: ColorMask,
        data: [u32; 4],
    },
    ClearDepthStencil {
        clear_depth: bool,
        depth: f32,
        stencil_mask: u8,
        stencil: u8,
    },
    DiscardColor {
        target_id: u32,
    },
    DiscardDepthStencil,
    Draw {
        prim: Primitive,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndirect {
        prim: Primitive,
        addr: GpuAddr,
    },
    DrawIndexed {
        prim: Primitive,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndexedIndirect {
        prim: Primitive,
        addr: GpuAddr,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        addr: GpuAddr,
    },
    PushData {
        addr: GpuAddr,
        data: Vec<u32>,
    },
    PushConstants {
        ubo_addr: GpuAddr,
        ubo_size: u32,
        offset: u32,
        data: Vec<u32>,
    },
    CopyBuffer {
        src: GpuAddr,
        dst: GpuAddr,
        size: u64,
    },
    CopyImage {
        src: ViewTarget,
        src_rect: BlitRect,
        dst: ViewTarget,
        dst_rect: BlitRect,
        flags: BlitFlags,
    },
    BlitImage {
        src: ViewTarget,
        src_rect: BlitRect,
        dst: ViewTarget,
        dst_rect: BlitRect,
        flags: BlitFlags,
        factor: u32,
    },
    ResolveImage {
        src: ViewTarget,
        dst: ViewTarget,
    },
    CopyBufferToImage {
        src: CopyBuf,
        dst: ViewTarget,
        dst_rect: BlitRect,
        flags: BlitFlags,
    },
    CopyImageToBuffer {
        src: ViewTarget,
        src_rect: BlitRect,
        dst: CopyBuf,
        flags: BlitFlags,
    },
}

impl Command {
    /// Opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::WaitFence(_) => Opcode::WaitFence,
            Self::SignalFence { .. } => Opcode::SignalFence,
            Self::Barrier { .. } => Opcode::Barrier,
            Self::BindShaders { .. } => Opcode::BindShaders,
            Self::BindUniformBuffers { .. } => Opcode::BindUniformBuffers,
            Self::BindStorageBuffers { .. } => Opcode::BindStorageBuffers,
            Self::BindTextures { .. } => Opcode::BindTextures,
            Self::BindImages { .. } => Opcode::BindImages,
            Self::BindImageDescriptorSet { .. } => Opcode::BindImageDescriptorSet,
            Self::BindSamplerDescriptorSet { .. } => Opcode::BindSamplerDescriptorSet,
            Self::BindRenderTargets { .. } => Opcode::BindRenderTargets,
            Self::BindRasterizerState(_) => Opcode::BindRasterizerState,
            Self::BindDepthStencilState(_) => Opcode::BindDepthStencilState,
            Self::BindVtxAttribState(_) => Opcode::BindVtxAttribState,
            Self::BindVtxBufferState(_) => Opcode::BindVtxBufferState,
            Self::BindVtxBuffers { .. } => Opcode::BindVtxBuffers,
            Self::BindIdxBuffer { .. } => Opcode::BindIdxBuffer,
            Self::SetViewports { .. } => Opcode::SetViewports,
            Self::SetScissors { .. } => Opcode::SetScissors,
            Self::SetDepthBounds { .. } => Opcode::SetDepthBounds,
            Self::SetStencil { .. } => Opcode::SetStencil,
            Self::SetPrimitiveRestart { .. } => Opcode::SetPrimitiveRestart,
            Self::SetTileSize { .. } => Opcode::SetTileSize,
            Self::TiledCacheOp(_) => Opcode::TiledCacheOp,
            Self::ClearColor { .. } => Opcode::ClearColor,
            Self::ClearDepthStencil { .. } => Opcode::ClearDepthStencil,
            Self::DiscardColor { .. } => Opcode::DiscardColor,
            Self::DiscardDepthStencil => Opcode::DiscardDepthStencil,
            Self::Draw { .. } => Opcode::Draw,
            Self::DrawIndirect { .. } => Opcode::DrawIndirect,
            Self::DrawIndexed { .. } => Opcode::DrawIndexed,
            Self::DrawIndexedIndirect { .. } => Opcode::DrawIndexedIndirect,
            Self::Dispatch { .. } => Opcode::Dispatch,
            Self::DispatchIndirect { .. } => Opcode::DispatchIndirect,
            Self::PushData { .. } => Opcode::PushData,
            Self::PushConstants { .. } => Opcode::PushConstants,
            Self::CopyBuffer { .. } => Opcode::CopyBuffer,
            Self::CopyImage { .. } => Opcode::CopyImage,
            Self::BlitImage { .. } => Opcode::BlitImage,
            Self::ResolveImage { .. } => Opcode::ResolveImage,
            Self::CopyBufferToImage { .. } => Opcode::CopyBufferToImage,
            Self::CopyImageToBuffer { .. } => Opcode::CopyImageToBuffer,
        }
    }

    /// Append the encoded instruction (header and payload) to `out`.
    ///
    /// On error `out` is left unchanged.
    pub fn encode(&self, out: &mut Vec<u32>) -> Result<()> {
        let start = out.len();
        out.push(0);
        let mut w = WireWriter { out };
        self.encode_payload(&mut w);
        let payload = out.len() - start - 1;
        if payload > MAX_PAYLOAD_WORDS {
            out.truncate(start);
            return Err(Error::PayloadTooLarge(payload));
        }
        out[start] = self.opcode().raw() | ((payload as u32) << 16);
        Ok(())
    }

    fn encode_payload(&self, w: &mut WireWriter<'_>) {
        match self {
            Self::WaitFence(fence) => w.fence(fence),
            Self::SignalFence { fence, flush } => {
                w.fence(fence);
                w.bool(*flush);
            }
            Self::Barrier { mode, invalidate } => {
                w.u32(mode.raw());
                w.u32(invalidate.bits());
            }
            Self::BindShaders { mask, bindings } => {
                w.u32(mask.bits());
                for b in bindings {
                    w.u32(b.stage.raw());
                    w.bool(b.valid);
                    w.u64(b.code_addr);
                    w.u32(b.code_size);
                    w.u32(b.program_id);
                }
            }
            Self::BindUniformBuffers {
                stage,
                first_id,
                buffers,
            }
            | Self::BindStorageBuffers {
                stage,
                first_id,
                buffers,
            } => {
                w.u32(stage.raw());
                w.u32(*first_id);
                for b in buffers {
                    w.u64(b.addr);
                    w.u64(b.size);
                }
            }
            Self::BindTextures {
                stage,
                first_id,
                handles,
            }
            | Self::BindImages {
                stage,
                first_id,
                handles,
            } => {
                w.u32(stage.raw());
                w.u32(*first_id);
                w.words(handles);
            }
            Self::BindImageDescriptorSet {
                addr,
                num_descriptors,
            }
            | Self::BindSamplerDescriptorSet {
                addr,
                num_descriptors,
            } => {
                w.u64(*addr);
                w.u32(*num_descriptors);
            }
            Self::BindRenderTargets { colors, depth } => {
                w.u32(colors.len() as u32);
                w.bool(depth.is_some());
                for c in colors {
                    w.target(c);
                }
                if let Some(d) = depth {
                    w.target(d);
                }
            }
            Self::BindRasterizerState(s) => {
                let flags = u32::from(s.rasterizer_enable)
                    | u32::from(s.depth_clamp_enable) << 1
                    | u32::from(s.fill_rectangle_enable) << 2
                    | u32::from(s.polygon_smooth_enable) << 3
                    | u32::from(s.depth_bias_enable) << 4;
                w.u32(flags);
                w.u32(s.polygon_mode.raw());
                w.u32(s.cull_mode.raw());
                w.u32(s.front_face.raw());
                w.f32(s.line_width);
            }
            Self::BindDepthStencilState(s) => {
                let flags = u32::from(s.depth_test_enable)
                    | u32::from(s.depth_write_enable) << 1
                    | u32::from(s.stencil_test_enable) << 2;
                w.u32(flags);
                w.u32(s.depth_compare_op.raw());
                w.u32(s.stencil_front_fail_op.raw());
                w.u32(s.stencil_front_pass_op.raw());
                w.u32(s.stencil_front_depth_fail_op.raw());
                w.u32(s.stencil_front_compare_op.raw());
                w.u32(s.stencil_back_fail_op.raw());
                w.u32(s.stencil_back_pass_op.raw());
                w.u32(s.stencil_back_depth_fail_op.raw());
                w.u32(s.stencil_back_compare_op.raw());
            }
            Self::BindVtxAttribState(attribs) => {
                for a in attribs {
                    w.u32(a.buffer_id | u32::from(a.is_fixed) << 8 | u32::from(a.is_bgra) << 9);
                    w.u32(a.offset);
                    w.u32(a.size.raw());
                    w.u32(a.ty.raw());
                }
            }
            Self::BindVtxBufferState(buffers) => {
                for b in buffers {
                    w.u32(b.stride);
                    w.u32(b.divisor);
                }
            }
            Self::BindVtxBuffers { first_id, buffers } => {
                w.u32(*first_id);
                for b in buffers {
                    w.u64(b.addr);
                    w.u64(b.size);
                }
            }
            Self::BindIdxBuffer { format, addr } => {
                w.u32(format.raw());
                w.u64(*addr);
            }
            Self::SetViewports {
                first_id,
                viewports,
            } => {
                w.u32(*first_id);
                for v in viewports {
                    w.f32(v.x);
                    w.f32(v.y);
                    w.f32(v.width);
                    w.f32(v.height);
                    w.f32(v.near);
                    w.f32(v.far);
                }
            }
            Self::SetScissors { first_id, scissors } => {
                w.u32(*first_id);
                for s in scissors {
                    w.u32(s.x);
                    w.u32(s.y);
                    w.u32(s.width);
                    w.u32(s.height);
                }
            }
            Self::SetDepthBounds { enable, near, far } => {
                w.bool(*enable);
                w.f32(*near);
                w.f32(*far);
            }
            Self::SetStencil {
                face,
                mask,
                func_ref,
                func_mask,
            } => {
                w.u32(face.raw());
                w.u32(u32::from(*mask) | u32::from(*func_ref) << 8 | u32::from(*func_mask) << 16);
            }
            Self::SetPrimitiveRestart { enable, index } => {
                w.bool(*enable);
                w.u32(*index);
            }
            Self::SetTileSize { width, height } => {
                w.u32(*width);
                w.u32(*height);
            }
            Self::TiledCacheOp(op) => w.u32(op.raw()),
            Self::ClearColor {
                target_id,
                mask,
                data,
            } => {
                w.u32(*target_id);
                w.u32(mask.bits());
                w.words(data);
            }
            Self::ClearDepthStencil {
                clear_depth,
                depth,
                stencil_mask,
                stencil,
            } => {
                w.bool(*clear_depth);
                w.f32(*depth);
                w.u32(u32::from(*stencil_mask) | u32::from(*stencil) << 8);
            }
            Self::DiscardColor { target_id } => w.u32(*target_id),
            Self::DiscardDepthStencil => {}
            Self::Draw {
                prim,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                w.u32(prim.raw());
                w.u32(*vertex_count);
                w.u32(*instance_count);
                w.u32(*first_vertex);
                w.u32(*first_instance);
            }
            Self::DrawIndirect { prim, addr } | Self::DrawIndexedIndirect { prim, addr } => {
                w.u32(prim.raw());
                w.u64(*addr);
            }
            Self::DrawIndexed {
                prim,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                w.u32(prim.raw());
                w.u32(*index_count);
                w.u32(*instance_count);
                w.u32(*first_index);
                w.u32(*vertex_offset as u32);
                w.u32(*first_instance);
            }
            Self::Dispatch { x, y, z } => {
                w.u32(*x);
                w.u32(*y);
                w.u32(*z);
            }
            Self::DispatchIndirect { addr } => w.u64(*addr),
            Self::PushData { addr, data } => {
                w.u64(*addr);
                w.words(data);
            }
            Self::PushConstants {
                ubo_addr,
                ubo_size,
                offset,
                data,
            } => {
                w.u64(*ubo_addr);
                w.u32(*ubo_size);
                w.u32(*offset);
                w.words(data);
            }
            Self::CopyBuffer { src, dst, size } => {
                w.u64(*src);
                w.u64(*dst);
                w.u64(*size);
            }
            Self::CopyImage {
                src,
                src_rect,
                dst,
                dst_rect,
                flags,
            } => {
                w.target(src);
                w.rect(src_rect);
                w.target(dst);
                w.rect(dst_rect);
                w.u32(flags.bits());
            }
            Self::BlitImage {
                src,
                src_rect,
                dst,
                dst_rect,
                flags,
                factor,
            } => {
                w.target(src);
                w.rect(src_rect);
                w.target(dst);
                w.rect(dst_rect);
                w.u32(flags.bits());
                w.u32(*factor);
            }
            Self::ResolveImage { src, dst } => {
                w.target(src);
                w.target(dst);
            }
            Self::CopyBufferToImage {
                src,
                dst,
                dst_rect,
                flags,
            } => {
                w.copy_buf(src);
                w.target(dst);
                w.rect(dst_rect);
                w.u32(flags.bits());
            }
            Self::CopyImageToBuffer {
                src,
                src_rect,
                dst,
                flags,
            } => {
                w.target(src);
                w.rect(src_rect);
                w.copy_buf(dst);
                w.u32(flags.bits());
            }
        }
    }

    /// Decode the payload of one instruction.
    pub fn decode(op: Opcode, payload: &[u32]) -> Result<Self> {
        let mut r = WireReader::new(payload, op);
        let cmd = match op {
            Opcode::WaitFence => Self::WaitFence(r.fence()?),
            Opcode::SignalFence => Self::SignalFence {
                fence: r.fence()?,
                flush: r.bool()?,
            },
            Opcode::Barrier => Self::Barrier {
                mode: r.parse("barrier mode", Barrier::from_raw)?,
                invalidate: InvalidateFlags::from_bits_truncate(r.u32()?),
            },
            Opcode::BindShaders => {
                let mask = StageFlags::from_bits_truncate(r.u32()?);
                let mut bindings = Vec::new();
                while !r.is_empty() {
                    bindings.push(ShaderBinding {
                        stage: r.parse("stage", Stage::from_raw)?,
                        valid: r.bool()?,
                        code_addr: r.u64()?,
                        code_size: r.u32()?,
                        program_id: r.u32()?,
                    });
                }
                Self::BindShaders { mask, bindings }
            }
            Opcode::BindUniformBuffers | Opcode::BindStorageBuffers => {
                let stage = r.parse("stage", Stage::from_raw)?;
                let first_id = r.u32()?;
                let mut buffers = Vec::new();
                while !r.is_empty() {
                    buffers.push(r.extents()?);
                }
                if op == Opcode::BindUniformBuffers {
                    Self::BindUniformBuffers {
                        stage,
                        first_id,
                        buffers,
                    }
                } else {
                    Self::BindStorageBuffers {
                        stage,
                        first_id,
                        buffers,
                    }
                }
            }
            Opcode::BindTextures | Opcode::BindImages => {
                let stage = r.parse("stage", Stage::from_raw)?;
                let first_id = r.u32()?;
                let handles = r.rest().to_vec();
                if op == Opcode::BindTextures {
                    Self::BindTextures {
                        stage,
                        first_id,
                        handles,
                    }
                } else {
                    Self::BindImages {
                        stage,
                        first_id,
                        handles,
                    }
                }
            }
            Opcode::BindImageDescriptorSet => Self::BindImageDescriptorSet {
                addr: r.u64()?,
                num_descriptors: r.u32()?,
            },
            Opcode::BindSamplerDescriptorSet => Self::BindSamplerDescriptorSet {
                addr: r.u64()?,
                num_descriptors: r.u32()?,
            },
            Opcode::BindRenderTargets => {
                let count = r.u32()?;
                let has_depth = r.bool()?;
                let colors = (0..count)
                    .map(|_| r.target())
                    .collect::<Result<Vec<_>>>()?;
                let depth = if has_depth { Some(r.target()?) } else { None };
                Self::BindRenderTargets { colors, depth }
            }
            Opcode::BindRasterizerState => {
                let flags = r.u32()?;
                Self::BindRasterizerState(RasterizerState {
                    rasterizer_enable: flags & 1 != 0,
                    depth_clamp_enable: flags & 2 != 0,
                    fill_rectangle_enable: flags & 4 != 0,
                    polygon_smooth_enable: flags & 8 != 0,
                    depth_bias_enable: flags & 16 != 0,
                    polygon_mode: r.parse("polygon mode", PolygonMode::from_raw)?,
                    cull_mode: r.parse("cull mode", Face::from_raw)?,
                    front_face: r.parse("front face", FrontFace::from_raw)?,
                    line_width: r.f32()?,
                })
            }
            Opcode::BindDepthStencilState => {
                let flags = r.u32()?;
                Self::BindDepthStencilState(DepthStencilState {
                    depth_test_enable: flags & 1 != 0,
                    depth_write_enable: flags & 2 != 0,
                    stencil_test_enable: flags & 4 != 0,
                    depth_compare_op: r.parse("compare op", CompareOp::from_raw)?,
                    stencil_front_fail_op: r.parse("stencil op", StencilOp::from_raw)?,
                    stencil_front_pass_op: r.parse("stencil op", StencilOp::from_raw)?,
                    stencil_front_depth_fail_op: r.parse("stencil op", StencilOp::from_raw)?,
                    stencil_front_compare_op: r.parse("compare op", CompareOp::from_raw)?,
                    stencil_back_fail_op: r.parse("stencil op", StencilOp::from_raw)?,
                    stencil_back_pass_op: r.parse("stencil op", StencilOp::from_raw)?,
                    stencil_back_depth_fail_op: r.parse("stencil op", StencilOp::from_raw)?,
                    stencil_back_compare_op: r.parse("compare op", CompareOp::from_raw)?,
                })
            }
            Opcode::BindVtxAttribState => {
                let mut attribs = Vec::new();
                while !r.is_empty() {
                    let packed = r.u32()?;
                    attribs.push(VtxAttribState {
                        buffer_id: packed & 0xff,
                        is_fixed: packed & (1 << 8) != 0,
                        is_bgra: packed & (1 << 9) != 0,
                        offset: r.u32()?,
                        size: r.parse("vertex attribute size", VtxAttribSize::from_raw)?,
                        ty: r.parse("vertex attribute type", VtxAttribType::from_raw)?,
                    });
                }
                Self::BindVtxAttribState(attribs)
            }
            Opcode::BindVtxBufferState => {
                let mut buffers = Vec::new();
                while !r.is_empty() {
                    buffers.push(VtxBufferState {
                        stride: r.u32()?,
                        divisor: r.u32()?,
                    });
                }
                Self::BindVtxBufferState(buffers)
            }
            Opcode::BindVtxBuffers => {
                let first_id = r.u32()?;
                let mut buffers = Vec::new();
                while !r.is_empty() {
                    buffers.push(r.extents()?);
                }
                Self::BindVtxBuffers { first_id, buffers }
            }
            Opcode::BindIdxBuffer => Self::BindIdxBuffer {
                format: r.parse("index format", IdxFormat::from_raw)?,
                addr: r.u64()?,
            },
            Opcode::SetViewports => {
                let first_id = r.u32()?;
                let mut viewports = Vec::new();
                while !r.is_empty() {
                    viewports.push(Viewport {
                        x: r.f32()?,
                        y: r.f32()?,
                        width: r.f32()?,
                        height: r.f32()?,
                        near: r.f32()?,
                        far: r.f32()?,
                    });
                }
                Self::SetViewports {
                    first_id,
                    viewports,
                }
            }
            Opcode::SetScissors => {
                let first_id = r.u32()?;
                let mut scissors = Vec::new();
                while !r.is_empty() {
                    scissors.push(Scissor {
                        x: r.u32()?,
                        y: r.u32()?,
                        width: r.u32()?,
                        height: r.u32()?,
                    });
                }
                Self::SetScissors { first_id, scissors }
            }
            Opcode::SetDepthBounds => Self::SetDepthBounds {
                enable: r.bool()?,
                near: r.f32()?,
                far: r.f32()?,
            },
            Opcode::SetStencil => {
                let face = r.parse("face", Face::from_raw)?;
                let packed = r.u32()?;
                Self::SetStencil {
                    face,
                    mask: packed as u8,
                    func_ref: (packed >> 8) as u8,
                    func_mask: (packed >> 16) as u8,
                }
            }
            Opcode::SetPrimitiveRestart => Self::SetPrimitiveRestart {
                enable: r.bool()?,
                index: r.u32()?,
            },
            Opcode::SetTileSize => Self::SetTileSize {
                width: r.u32()?,
                height: r.u32()?,
            },
            Opcode::TiledCacheOp => {
                Self::TiledCacheOp(r.parse("tiled cache op", TiledCacheOp::from_raw)?)
            }
            Opcode::ClearColor => Self::ClearColor {
                target_id: r.u32()?,
                mask: ColorMask::from_bits_truncate(r.u32()?),
                data: [r.u32()?, r.u32()?, r.u32()?, r.u32()?],
            },
            Opcode::ClearDepthStencil => {
                let clear_depth = r.bool()?;
                let depth = r.f32()?;
                let packed = r.u32()?;
                Self::ClearDepthStencil {
                    clear_depth,
                    depth,
                    stencil_mask: packed as u8,
                    stencil: (packed >> 8) as u8,
                }
            }
            Opcode::DiscardColor => Self::DiscardColor {
                target_id: r.u32()?,
            },
            Opcode::DiscardDepthStencil => Self::DiscardDepthStencil,
            Opcode::Draw => Self::Draw {
                prim: r.parse("primitive", Primitive::from_raw)?,
                vertex_count: r.u32()?,
                instance_count: r.u32()?,
                first_vertex: r.u32()?,
                first_instance: r.u32()?,
            },
            Opcode::DrawIndirect => Self::DrawIndirect {
                prim: r.parse("primitive", Primitive::from_raw)?,
                addr: r.u64()?,
            },
            Opcode::DrawIndexed => Self::DrawIndexed {
                prim: r.parse("primitive", Primitive::from_raw)?,
                index_count: r.u32()?,
                instance_count: r.u32()?,
                first_index: r.u32()?,
                vertex_offset: r.u32()? as i32,
                first_instance: r.u32()?,
            },
            Opcode::DrawIndexedIndirect => Self::DrawIndexedIndirect {
                prim: r.parse("primitive", Primitive::from_raw)?,
                addr: r.u64()?,
            },
            Opcode::Dispatch => Self::Dispatch {
                x: r.u32()?,
                y: r.u32()?,
                z: r.u32()?,
            },
            Opcode::DispatchIndirect => Self::DispatchIndirect { addr: r.u64()? },
            Opcode::PushData => Self::PushData {
                addr: r.u64()?,
                data: r.rest().to_vec(),
            },
            Opcode::PushConstants => Self::PushConstants {
                ubo_addr: r.u64()?,
                ubo_size: r.u32()?,
                offset: r.u32()?,
                data: r.rest().to_vec(),
            },
            Opcode::CopyBuffer => Self::CopyBuffer {
                src: r.u64()?,
                dst: r.u64()?,
                size: r.u64()?,
            },
            Opcode::CopyImage => Self::CopyImage {
                src: r.target()?,
                src_rect: r.rect()?,
                dst: r.target()?,
                dst_rect: r.rect()?,
                flags: BlitFlags::from_bits_truncate(r.u32()?),
            },
            Opcode::BlitImage => Self::BlitImage {
                src: r.target()?,
                src_rect: r.rect()?,
                dst: r.target()?,
                dst_rect: r.rect()?,
                flags: BlitFlags::from_bits_truncate(r.u32()?),
                factor: r.u32()?,
            },
            Opcode::ResolveImage => Self::ResolveImage {
                src: r.target()?,
                dst: r.target()?,
            },
            Opcode::CopyBufferToImage => Self::CopyBufferToImage {
                src: r.copy_buf()?,
                dst: r.target()?,
                dst_rect: r.rect()?,
                flags: BlitFlags::from_bits_truncate(r.u32()?),
            },
            Opcode::CopyImageToBuffer => Self::CopyImageToBuffer {
                src: r.target()?,
                src_rect: r.rect()?,
                dst: r.copy_buf()?,
                flags: BlitFlags::from_bits_truncate(r.u32()?),
            },
        };
        r.finish()?;
        Ok(cmd)
    }
}

struct WireWriter<'a> {
    out: &'a mut Vec<u32>,
}

impl WireWriter<'_> {
    fn u32(&mut self, value: u32) {
        self.out.push(value);
    }

    fn u64(&mut self, value: u64) {
        self.out.push(value as u32);
        self.out.push((value >> 32) as u32);
    }

    fn f32(&mut self, value: f32) {
        self.out.push(value.to_bits());
    }

    fn bool(&mut self, value: bool) {
        self.out.push(u32::from(value));
    }

    fn words(&mut self, words: &[u32]) {
        self.out.extend_from_slice(words);
    }

    fn fence(&mut self, fence: &FenceRef) {
        self.u32(fence.index);
        self.u32(fence.generation);
        self.u64(fence.value);
    }

    fn target(&mut self, t: &ViewTarget) {
        self.u64(t.addr);
        self.u32(t.format.raw());
        self.u32(t.width);
        self.u32(t.height);
        self.u32(t.depth_or_layers);
        self.u32(t.samples);
        self.u32(t.row_pitch);
        self.u32(t.slice_stride);
    }

    fn rect(&mut self, r: &BlitRect) {
        self.words(bytemuck::cast_slice(std::slice::from_ref(r)));
    }

    fn copy_buf(&mut self, b: &CopyBuf) {
        self.u64(b.addr);
        self.u32(b.row_length);
        self.u32(b.image_height);
    }
}

struct WireReader<'a> {
    words: &'a [u32],
    pos: usize,
    what: &'static str,
}

impl<'a> WireReader<'a> {
    fn new(words: &'a [u32], op: Opcode) -> Self {
        Self {
            words,
            pos: 0,
            what: opcode_name(op),
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.words.len()
    }

    fn u32(&mut self) -> Result<u32> {
        let value = *self.words.get(self.pos).ok_or(Error::Truncated(self.what))?;
        self.pos += 1;
        Ok(value)
    }

    fn u64(&mut self) -> Result<u64> {
        let lo = self.u32()?;
        let hi = self.u32()?;
        Ok(u64::from(lo) | u64::from(hi) << 32)
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u32()? != 0)
    }

    fn parse<T>(&mut self, what: &'static str, from_raw: fn(u32) -> Option<T>) -> Result<T> {
        let raw = self.u32()?;
        from_raw(raw).ok_or(Error::InvalidValue { what, raw })
    }

    fn rest(&mut self) -> &'a [u32] {
        let rest = &self.words[self.pos.min(self.words.len())..];
        self.pos = self.words.len();
        rest
    }

    fn fence(&mut self) -> Result<FenceRef> {
        Ok(FenceRef {
            index: self.u32()?,
            generation: self.u32()?,
            value: self.u64()?,
        })
    }

    fn extents(&mut self) -> Result<BufExtents> {
        Ok(BufExtents {
            addr: self.u64()?,
            size: self.u64()?,
        })
    }

    fn target(&mut self) -> Result<ViewTarget> {
        Ok(ViewTarget {
            addr: self.u64()?,
            format: self.parse("image format", ImageFormat::from_raw)?,
            width: self.u32()?,
            height: self.u32()?,
            depth_or_layers: self.u32()?,
            samples: self.u32()?,
            row_pitch: self.u32()?,
            slice_stride: self.u32()?,
        })
    }

    fn rect(&mut self) -> Result<BlitRect> {
        Ok(BlitRect {
            x: self.u32()?,
            y: self.u32()?,
            z: self.u32()?,
            width: self.u32()?,
            height: self.u32()?,
            depth: self.u32()?,
        })
    }

    fn copy_buf(&mut self) -> Result<CopyBuf> {
        Ok(CopyBuf {
            addr: self.u64()?,
            row_length: self.u32()?,
            image_height: self.u32()?,
        })
    }

    fn finish(&self) -> Result<()> {
        match self.words.len().saturating_sub(self.pos) {
            0 => Ok(()),
            n => Err(Error::TrailingData(n)),
        }
    }
}

fn opcode_name(op: Opcode) -> &'static str {
    match op {
        Opcode::WaitFence | Opcode::SignalFence => "fence",
        Opcode::Barrier => "barrier",
        Opcode::BindShaders => "shader binding",
        Opcode::BindRenderTargets => "render targets",
        Opcode::BindRasterizerState => "rasterizer state",
        Opcode::BindDepthStencilState => "depth stencil state",
        Opcode::Draw | Opcode::DrawIndirect | Opcode::DrawIndexed | Opcode::DrawIndexedIndirect => {
            "draw"
        }
        Opcode::Dispatch | Opcode::DispatchIndirect => "dispatch",
        Opcode::PushData | Opcode::PushConstants => "inline data",
        Opcode::CopyBuffer
        | Opcode::CopyImage
        | Opcode::BlitImage
        | Opcode::ResolveImage
        | Opcode::CopyBufferToImage
        | Opcode::CopyImageToBuffer => "copy",
        _ => "state",
    }
}

/// Iterator over the instructions of an encoded word stream.
///
/// Stops after the first error.
pub struct CommandReader<'a> {
    words: &'a [u32],
    pos: usize,
    failed: bool,
}

impl<'a> CommandReader<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            pos: 0,
            failed: false,
        }
    }

    /// Word offset of the next instruction.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn next_command(&mut self) -> Result<Command> {
        let header = self.words[self.pos];
        let raw_op = header & 0xFFFF;
        let len = (header >> 16) as usize;
        let op = Opcode::from_raw(raw_op).ok_or(Error::UnknownOpcode(raw_op))?;
        let start = self.pos + 1;
        let payload = self
            .words
            .get(start..start + len)
            .ok_or(Error::Truncated("instruction payload"))?;
        let cmd = Command::decode(op, payload)?;
        self.pos = start + len;
        Ok(cmd)
    }
}

impl Iterator for CommandReader<'_> {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.words.len() {
            return None;
        }
        let result = self.next_command();
        self.failed = result.is_err();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(cmds: &[Command]) -> Vec<u32> {
        let mut words = Vec::new();
        for cmd in cmds {
            cmd.encode(&mut words).unwrap();
        }
        words
    }

    #[test]
    fn header_layout() {
        let mut words = Vec::new();
        Command::Dispatch { x: 1, y: 2, z: 3 }.encode(&mut words).unwrap();
        assert_eq!(words, vec![Opcode::Dispatch.raw() | 3 << 16, 1, 2, 3]);
    }

    #[test]
    fn stream_decodes_in_order() {
        let target = ViewTarget {
            addr: 0x1_0000_2000,
            format: ImageFormat::RGBA8Unorm,
            width: 16,
            height: 8,
            depth_or_layers: 1,
            samples: 1,
            row_pitch: 64,
            slice_stride: 512,
        };
        let cmds = vec![
            Command::BindRenderTargets {
                colors: vec![target],
                depth: None,
            },
            Command::ClearColor {
                target_id: 0,
                mask: ColorMask::RGBA,
                data: [1, 2, 3, 4],
            },
            Command::BindRasterizerState(RasterizerState::default().with_cull_mode(Face::None)),
            Command::DrawIndexed {
                prim: Primitive::Triangles,
                index_count: 6,
                instance_count: 1,
                first_index: 0,
                vertex_offset: -4,
                first_instance: 0,
            },
            Command::DiscardDepthStencil,
            Command::PushData {
                addr: 0x2000,
                data: vec![7; 5],
            },
        ];
        let words = encode_all(&cmds);
        let decoded: Vec<Command> = CommandReader::new(&words).collect::<Result<_>>().unwrap();
        assert_eq!(decoded, cmds);
    }

    #[test]
    fn unknown_opcode_stops_reader() {
        let mut words = encode_all(&[Command::DiscardDepthStencil]);
        words.push(0x7777);
        words.extend(encode_all(&[Command::DiscardDepthStencil]));

        let mut reader = CommandReader::new(&words);
        assert_eq!(reader.next(), Some(Ok(Command::DiscardDepthStencil)));
        assert_eq!(reader.next(), Some(Err(Error::UnknownOpcode(0x7777))));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn truncated_payload() {
        let mut words = encode_all(&[Command::CopyBuffer {
            src: 1,
            dst: 2,
            size: 3,
        }]);
        words.truncate(4);
        let mut reader = CommandReader::new(&words);
        assert!(matches!(reader.next(), Some(Err(Error::Truncated(_)))));
    }

    #[test]
    fn invalid_enum_value() {
        let words = [Opcode::TiledCacheOp.raw() | 1 << 16, 9];
        let err = CommandReader::new(&words).next().unwrap().unwrap_err();
        assert_eq!(
            err,
            Error::InvalidValue {
                what: "tiled cache op",
                raw: 9
            }
        );
    }

    #[test]
    fn trailing_payload_rejected() {
        let words = [Opcode::DiscardColor.raw() | 2 << 16, 0, 0];
        let err = CommandReader::new(&words).next().unwrap().unwrap_err();
        assert_eq!(err, Error::TrailingData(1));
    }

    #[test]
    fn oversized_payload() {
        let mut words = vec![42];
        let err = Command::PushData {
            addr: 0,
            data: vec![0; MAX_PAYLOAD_WORDS],
        }
        .encode(&mut words)
        .unwrap_err();
        assert_eq!(err, Error::PayloadTooLarge(MAX_PAYLOAD_WORDS + 2));
        assert_eq!(words, vec![42]);
    }

    #[test]
    fn view_target_offsets() {
        let target = ViewTarget {
            addr: 0,
            format: ImageFormat::RGBA8Unorm,
            width: 4,
            height: 4,
            depth_or_layers: 2,
            samples: 1,
            row_pitch: 64,
            slice_stride: 512,
        };
        assert_eq!(target.pixel_offset(1, 2, 1), 512 + 128 + 4);
        assert!(target.contains(&BlitRect::new(0, 0, 4, 4)));
        assert!(!target.contains(&BlitRect::new(1, 0, 4, 4)));
        assert_eq!(target.span(), 512 + 4 * 64);
    }
}
