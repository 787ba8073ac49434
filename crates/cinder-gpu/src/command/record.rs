//! Recording operations.
//!
//! Argument range errors are reported immediately. Everything else, such as
//! drawing without a vertex shader, is recorded as given and surfaces when the
//! queue executes the list.

use cinder_core::constants::{
    IMAGE_DESCRIPTOR_SIZE, MAX_PUSH_DATA_SIZE, MAX_RENDER_TARGETS, MAX_VERTEX_ATTRIBS,
    MAX_VERTEX_BUFFERS, NUM_IMAGE_BINDINGS, NUM_STORAGE_BUFS, NUM_TEXTURE_BINDINGS,
    NUM_UNIFORM_BUFS, NUM_VIEWPORTS, SAMPLER_DESCRIPTOR_SIZE, UNIFORM_BUF_ALIGNMENT,
    UNIFORM_BUF_MAX_SIZE,
};
use cinder_core::{
    Barrier, BlitFlags, BlitRect, BufExtents, ColorMask, Command, CopyBuf, DepthStencilState, Face,
    GpuAddr, IdxFormat, InvalidateFlags, Primitive, RasterizerState, Scissor, Stage, StageFlags,
    TiledCacheOp, ViewTarget, Viewport, VtxAttribState, VtxBufferState,
};

use super::CmdBuf;
use crate::descriptors::ResHandle;
use crate::error::{GpuError, Result};
use crate::image::ImageView;
use crate::shader::Shader;
use crate::sync::Fence;

fn invalid(msg: impl Into<String>) -> GpuError {
    GpuError::InvalidArgument(msg.into())
}

/// Check that `count` slots starting at `first_id` fit in `limit`.
fn check_slots(what: &str, first_id: u32, count: usize, limit: u32) -> Result<()> {
    if u64::from(first_id) + count as u64 > u64::from(limit) {
        return Err(invalid(format!(
            "{what} slots {first_id}+{count} exceed the limit of {limit}"
        )));
    }
    Ok(())
}

/// Pack bytes into words, requiring a multiple of four bytes.
fn to_words(what: &str, data: &[u8]) -> Result<Vec<u32>> {
    if data.len() % 4 != 0 {
        return Err(invalid(format!(
            "{what} length {} is not a multiple of 4",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn check_rect(what: &str, target: &ViewTarget, rect: &BlitRect) -> Result<()> {
    if rect.width == 0 || rect.height == 0 || rect.depth == 0 || !target.contains(rect) {
        return Err(invalid(format!(
            "{what} rect {rect:?} is empty or outside {}x{}x{}",
            target.width, target.height, target.depth_or_layers
        )));
    }
    Ok(())
}

impl CmdBuf {
    // Synchronization.

    /// Wait until `fence` reaches the value of its latest scheduled signal.
    pub fn wait_fence(&mut self, fence: &Fence) -> Result<()> {
        self.emit(&Command::WaitFence(fence.current_ref()))
    }

    /// Signal `fence` once all prior work in the list has completed.
    pub fn signal_fence(&mut self, fence: &Fence, flush: bool) -> Result<()> {
        let fence_ref = fence.next_ref();
        self.emit(&Command::SignalFence {
            fence: fence_ref,
            flush,
        })?;
        fence.arm(fence_ref.value);
        Ok(())
    }

    pub fn barrier(&mut self, mode: Barrier, invalidate: InvalidateFlags) -> Result<()> {
        self.emit(&Command::Barrier { mode, invalidate })
    }

    // Shaders.

    pub fn bind_shader(&mut self, shader: &Shader) -> Result<()> {
        self.bind_shaders(shader.stage().flag(), &[shader])
    }

    /// Bind `shaders` and unbind every other stage in `stage_mask`.
    pub fn bind_shaders(&mut self, stage_mask: StageFlags, shaders: &[&Shader]) -> Result<()> {
        if let Some(shader) = shaders
            .iter()
            .find(|s| !stage_mask.contains(s.stage().flag()))
        {
            return Err(invalid(format!(
                "{:?} shader is outside the stage mask {stage_mask:?}",
                shader.stage()
            )));
        }
        self.emit(&Command::BindShaders {
            mask: stage_mask,
            bindings: shaders.iter().map(|s| s.binding()).collect(),
        })
    }

    // Buffers.

    pub fn bind_uniform_buffer(&mut self, stage: Stage, id: u32, addr: GpuAddr, size: u32) -> Result<()> {
        self.bind_uniform_buffers(stage, id, &[BufExtents::new(addr, u64::from(size))])
    }

    pub fn bind_uniform_buffers(&mut self, stage: Stage, first_id: u32, buffers: &[BufExtents]) -> Result<()> {
        check_slots("uniform buffer", first_id, buffers.len(), NUM_UNIFORM_BUFS)?;
        for buf in buffers {
            if buf.addr % u64::from(UNIFORM_BUF_ALIGNMENT) != 0 {
                return Err(invalid(format!(
                    "uniform buffer address {:#x} is not aligned to {UNIFORM_BUF_ALIGNMENT:#x}",
                    buf.addr
                )));
            }
            if buf.size > u64::from(UNIFORM_BUF_MAX_SIZE) {
                return Err(invalid(format!(
                    "uniform buffer size {:#x} exceeds {UNIFORM_BUF_MAX_SIZE:#x}",
                    buf.size
                )));
            }
        }
        self.emit(&Command::BindUniformBuffers {
            stage,
            first_id,
            buffers: buffers.to_vec(),
        })
    }

    pub fn bind_storage_buffer(&mut self, stage: Stage, id: u32, addr: GpuAddr, size: u64) -> Result<()> {
        self.bind_storage_buffers(stage, id, &[BufExtents::new(addr, size)])
    }

    pub fn bind_storage_buffers(&mut self, stage: Stage, first_id: u32, buffers: &[BufExtents]) -> Result<()> {
        check_slots("storage buffer", first_id, buffers.len(), NUM_STORAGE_BUFS)?;
        self.emit(&Command::BindStorageBuffers {
            stage,
            first_id,
            buffers: buffers.to_vec(),
        })
    }

    // Textures and images.

    pub fn bind_texture(&mut self, stage: Stage, id: u32, handle: ResHandle) -> Result<()> {
        self.bind_textures(stage, id, &[handle])
    }

    pub fn bind_textures(&mut self, stage: Stage, first_id: u32, handles: &[ResHandle]) -> Result<()> {
        check_slots("texture", first_id, handles.len(), NUM_TEXTURE_BINDINGS)?;
        self.emit(&Command::BindTextures {
            stage,
            first_id,
            handles: handles.iter().map(|h| h.raw()).collect(),
        })
    }

    pub fn bind_image(&mut self, stage: Stage, id: u32, handle: ResHandle) -> Result<()> {
        self.bind_images(stage, id, &[handle])
    }

    pub fn bind_images(&mut self, stage: Stage, first_id: u32, handles: &[ResHandle]) -> Result<()> {
        check_slots("image", first_id, handles.len(), NUM_IMAGE_BINDINGS)?;
        self.emit(&Command::BindImages {
            stage,
            first_id,
            handles: handles.iter().map(|h| h.raw()).collect(),
        })
    }

    pub fn bind_image_descriptor_set(&mut self, addr: GpuAddr, num_descriptors: u32) -> Result<()> {
        if addr % u64::from(IMAGE_DESCRIPTOR_SIZE) != 0 {
            return Err(invalid(format!("image descriptor set {addr:#x} is misaligned")));
        }
        self.emit(&Command::BindImageDescriptorSet {
            addr,
            num_descriptors,
        })
    }

    pub fn bind_sampler_descriptor_set(&mut self, addr: GpuAddr, num_descriptors: u32) -> Result<()> {
        if addr % u64::from(SAMPLER_DESCRIPTOR_SIZE) != 0 {
            return Err(invalid(format!("sampler descriptor set {addr:#x} is misaligned")));
        }
        self.emit(&Command::BindSamplerDescriptorSet {
            addr,
            num_descriptors,
        })
    }

    // Render targets and fixed-function state.

    pub fn bind_render_targets(&mut self, colors: &[&ImageView<'_>], depth: Option<&ImageView<'_>>) -> Result<()> {
        check_slots("color target", 0, colors.len(), MAX_RENDER_TARGETS)?;
        let colors = colors
            .iter()
            .map(|view| {
                let target = view.target()?;
                if target.format.is_depth() {
                    return Err(invalid(format!("{:?} cannot be a color target", target.format)));
                }
                Ok(target)
            })
            .collect::<Result<Vec<_>>>()?;
        let depth = depth
            .map(|view| {
                let target = view.target()?;
                if !target.format.is_depth() {
                    return Err(invalid(format!("{:?} cannot be a depth target", target.format)));
                }
                Ok(target)
            })
            .transpose()?;
        self.emit(&Command::BindRenderTargets { colors, depth })
    }

    pub fn bind_rasterizer_state(&mut self, state: &RasterizerState) -> Result<()> {
        self.emit(&Command::BindRasterizerState(*state))
    }

    pub fn bind_depth_stencil_state(&mut self, state: &DepthStencilState) -> Result<()> {
        self.emit(&Command::BindDepthStencilState(*state))
    }

    // Vertex input.

    pub fn bind_vtx_attrib_state(&mut self, attribs: &[VtxAttribState]) -> Result<()> {
        check_slots("vertex attribute", 0, attribs.len(), MAX_VERTEX_ATTRIBS)?;
        if let Some(attrib) = attribs.iter().find(|a| a.buffer_id >= MAX_VERTEX_BUFFERS) {
            return Err(invalid(format!(
                "vertex attribute references buffer {}",
                attrib.buffer_id
            )));
        }
        self.emit(&Command::BindVtxAttribState(attribs.to_vec()))
    }

    pub fn bind_vtx_buffer_state(&mut self, buffers: &[VtxBufferState]) -> Result<()> {
        check_slots("vertex buffer", 0, buffers.len(), MAX_VERTEX_BUFFERS)?;
        self.emit(&Command::BindVtxBufferState(buffers.to_vec()))
    }

    pub fn bind_vtx_buffer(&mut self, id: u32, addr: GpuAddr, size: u64) -> Result<()> {
        self.bind_vtx_buffers(id, &[BufExtents::new(addr, size)])
    }

    pub fn bind_vtx_buffers(&mut self, first_id: u32, buffers: &[BufExtents]) -> Result<()> {
        check_slots("vertex buffer", first_id, buffers.len(), MAX_VERTEX_BUFFERS)?;
        self.emit(&Command::BindVtxBuffers {
            first_id,
            buffers: buffers.to_vec(),
        })
    }

    pub fn bind_idx_buffer(&mut self, format: IdxFormat, addr: GpuAddr) -> Result<()> {
        if addr % u64::from(format.size()) != 0 {
            return Err(invalid(format!(
                "index buffer {addr:#x} is not aligned to its {format:?} elements"
            )));
        }
        self.emit(&Command::BindIdxBuffer { format, addr })
    }

    // Dynamic state.

    pub fn set_viewport(&mut self, id: u32, viewport: Viewport) -> Result<()> {
        self.set_viewports(id, &[viewport])
    }

    pub fn set_viewports(&mut self, first_id: u32, viewports: &[Viewport]) -> Result<()> {
        check_slots("viewport", first_id, viewports.len(), NUM_VIEWPORTS)?;
        self.emit(&Command::SetViewports {
            first_id,
            viewports: viewports.to_vec(),
        })
    }

    pub fn set_scissor(&mut self, id: u32, scissor: Scissor) -> Result<()> {
        self.set_scissors(id, &[scissor])
    }

    pub fn set_scissors(&mut self, first_id: u32, scissors: &[Scissor]) -> Result<()> {
        check_slots("scissor", first_id, scissors.len(), NUM_VIEWPORTS)?;
        self.emit(&Command::SetScissors {
            first_id,
            scissors: scissors.to_vec(),
        })
    }

    pub fn set_depth_bounds(&mut self, enable: bool, near: f32, far: f32) -> Result<()> {
        self.emit(&Command::SetDepthBounds { enable, near, far })
    }

    pub fn set_stencil(&mut self, face: Face, mask: u8, func_ref: u8, func_mask: u8) -> Result<()> {
        self.emit(&Command::SetStencil {
            face,
            mask,
            func_ref,
            func_mask,
        })
    }

    pub fn set_primitive_restart(&mut self, enable: bool, index: u32) -> Result<()> {
        self.emit(&Command::SetPrimitiveRestart { enable, index })
    }

    pub fn set_tile_size(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(invalid("tile size must be non-zero"));
        }
        self.emit(&Command::SetTileSize { width, height })
    }

    pub fn tiled_cache_op(&mut self, op: TiledCacheOp) -> Result<()> {
        self.emit(&Command::TiledCacheOp(op))
    }

    // Clears and discards.

    /// Clear color target `target_id` with raw per-component data.
    pub fn clear_color(&mut self, target_id: u32, mask: ColorMask, data: [u32; 4]) -> Result<()> {
        check_slots("color target", target_id, 1, MAX_RENDER_TARGETS)?;
        self.emit(&Command::ClearColor {
            target_id,
            mask,
            data,
        })
    }

    pub fn clear_color_float(&mut self, target_id: u32, mask: ColorMask, color: [f32; 4]) -> Result<()> {
        self.clear_color(target_id, mask, color.map(f32::to_bits))
    }

    pub fn clear_color_uint(&mut self, target_id: u32, mask: ColorMask, color: [u32; 4]) -> Result<()> {
        self.clear_color(target_id, mask, color)
    }

    pub fn clear_depth_stencil(&mut self, clear_depth: bool, depth: f32, stencil_mask: u8, stencil: u8) -> Result<()> {
        self.emit(&Command::ClearDepthStencil {
            clear_depth,
            depth,
            stencil_mask,
            stencil,
        })
    }

    pub fn discard_color(&mut self, target_id: u32) -> Result<()> {
        check_slots("color target", target_id, 1, MAX_RENDER_TARGETS)?;
        self.emit(&Command::DiscardColor { target_id })
    }

    pub fn discard_depth_stencil(&mut self) -> Result<()> {
        self.emit(&Command::DiscardDepthStencil)
    }

    // Draws.

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn draw(
        &mut self,
        prim: Primitive,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.emit(&Command::Draw {
            prim,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    /// Draw with parameters read from a `DrawIndirectData` at `addr`.
    pub fn draw_indirect(&mut self, prim: Primitive, addr: GpuAddr) -> Result<()> {
        self.emit(&Command::DrawIndirect { prim, addr })
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn draw_indexed(
        &mut self,
        prim: Primitive,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.emit(&Command::DrawIndexed {
            prim,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    /// Draw with parameters read from a `DrawIndexedIndirectData` at `addr`.
    pub fn draw_indexed_indirect(&mut self, prim: Primitive, addr: GpuAddr) -> Result<()> {
        self.emit(&Command::DrawIndexedIndirect { prim, addr })
    }

    // Compute.

    /// Dispatch a compute grid. A zero in any dimension dispatches nothing.
    pub fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.emit(&Command::Dispatch { x, y, z })
    }

    /// Dispatch with group counts read from a `DispatchIndirectData` at `addr`.
    pub fn dispatch_compute_indirect(&mut self, addr: GpuAddr) -> Result<()> {
        self.emit(&Command::DispatchIndirect { addr })
    }

    // Inline data.

    /// Update `data.len()` bytes at `offset` of the uniform buffer at `ubo_addr`.
    pub fn push_constants(&mut self, ubo_addr: GpuAddr, ubo_size: u32, offset: u32, data: &[u8]) -> Result<()> {
        if ubo_addr % u64::from(UNIFORM_BUF_ALIGNMENT) != 0 || ubo_size > UNIFORM_BUF_MAX_SIZE {
            return Err(invalid(format!(
                "uniform buffer {ubo_addr:#x}+{ubo_size:#x} is misaligned or too large"
            )));
        }
        if offset % 4 != 0 || u64::from(offset) + data.len() as u64 > u64::from(ubo_size) {
            return Err(invalid(format!(
                "push constant range {offset:#x}+{:#x} is misaligned or outside the buffer",
                data.len()
            )));
        }
        let data = to_words("push constant data", data)?;
        self.emit(&Command::PushConstants {
            ubo_addr,
            ubo_size,
            offset,
            data,
        })
    }

    /// Write `data` to `addr` in stream order.
    pub fn push_data(&mut self, addr: GpuAddr, data: &[u8]) -> Result<()> {
        if addr % 4 != 0 {
            return Err(invalid(format!("push data address {addr:#x} is misaligned")));
        }
        if data.len() as u64 > u64::from(MAX_PUSH_DATA_SIZE) {
            return Err(invalid(format!(
                "push data of {:#x} bytes exceeds {MAX_PUSH_DATA_SIZE:#x}",
                data.len()
            )));
        }
        let data = to_words("push data", data)?;
        self.emit(&Command::PushData { addr, data })
    }

    // Copies.

    pub fn copy_buffer(&mut self, src: GpuAddr, dst: GpuAddr, size: u64) -> Result<()> {
        self.emit(&Command::CopyBuffer { src, dst, size })
    }

    /// Copy texels between views without conversion. Extents must match.
    pub fn copy_image(
        &mut self,
        src: &ImageView<'_>,
        src_rect: &BlitRect,
        dst: &ImageView<'_>,
        dst_rect: &BlitRect,
        flags: BlitFlags,
    ) -> Result<()> {
        let (src, dst) = (src.target()?, dst.target()?);
        check_rect("source", &src, src_rect)?;
        check_rect("destination", &dst, dst_rect)?;
        if (src_rect.width, src_rect.height, src_rect.depth)
            != (dst_rect.width, dst_rect.height, dst_rect.depth)
        {
            return Err(invalid("copy_image extents differ; use blit_image to scale"));
        }
        self.emit(&Command::CopyImage {
            src,
            src_rect: *src_rect,
            dst,
            dst_rect: *dst_rect,
            flags,
        })
    }

    /// Scaled copy. With `BlitFlags::MODE_BLEND`, `factor` (0..=255) weights
    /// the source against the existing destination.
    pub fn blit_image(
        &mut self,
        src: &ImageView<'_>,
        src_rect: &BlitRect,
        dst: &ImageView<'_>,
        dst_rect: &BlitRect,
        flags: BlitFlags,
        factor: u32,
    ) -> Result<()> {
        let (src, dst) = (src.target()?, dst.target()?);
        check_rect("source", &src, src_rect)?;
        check_rect("destination", &dst, dst_rect)?;
        self.emit(&Command::BlitImage {
            src,
            src_rect: *src_rect,
            dst,
            dst_rect: *dst_rect,
            flags,
            factor,
        })
    }

    pub fn resolve_image(&mut self, src: &ImageView<'_>, dst: &ImageView<'_>) -> Result<()> {
        let (src, dst) = (src.target()?, dst.target()?);
        if src.samples < 2 || dst.samples != 1 {
            return Err(invalid("resolve_image needs a multisampled source and a single-sampled destination"));
        }
        if (src.width, src.height) != (dst.width, dst.height) {
            return Err(invalid("resolve_image extents differ"));
        }
        self.emit(&Command::ResolveImage { src, dst })
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &CopyBuf,
        dst: &ImageView<'_>,
        dst_rect: &BlitRect,
        flags: BlitFlags,
    ) -> Result<()> {
        let dst = dst.target()?;
        check_rect("destination", &dst, dst_rect)?;
        self.emit(&Command::CopyBufferToImage {
            src: *src,
            dst,
            dst_rect: *dst_rect,
            flags,
        })
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &ImageView<'_>,
        src_rect: &BlitRect,
        dst: &CopyBuf,
        flags: BlitFlags,
    ) -> Result<()> {
        let src = src.target()?;
        check_rect("source", &src, src_rect)?;
        self.emit(&Command::CopyImageToBuffer {
            src,
            src_rect: *src_rect,
            dst: *dst,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CmdBufConfig;
    use crate::device::{Device, DeviceConfig};
    use crate::image::{Image, ImageLayout, ImageLayoutConfig};
    use crate::memory::{MemBlock, MemBlockConfig, MemBlockFlags};
    use cinder_core::{CommandReader, ImageFormat, ImageType, MsMode};

    struct Fixture {
        _device: Device,
        _block: MemBlock,
        cmdbuf: CmdBuf,
    }

    fn fixture() -> Fixture {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = MemBlock::new(&device, MemBlockConfig::new(0x4000)).unwrap();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        cmdbuf.add_memory(&block, 0, 0x4000).unwrap();
        Fixture {
            _device: device,
            _block: block,
            cmdbuf,
        }
    }

    fn recorded(cmdbuf: &mut CmdBuf) -> Vec<Command> {
        let list = cmdbuf.finish_list();
        let words = cmdbuf.read_list(&list).unwrap();
        CommandReader::new(&words)
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn slot_limits() {
        let mut f = fixture();
        let bufs = [BufExtents::new(0x1_0000_0000, 0x100); 2];
        assert!(f.cmdbuf.bind_uniform_buffers(Stage::Vertex, 14, &bufs).is_ok());
        assert!(f.cmdbuf.bind_uniform_buffers(Stage::Vertex, 15, &bufs).is_err());
        assert!(f.cmdbuf.bind_texture(Stage::Fragment, 32, ResHandle::texture(0, 0)).is_err());
        assert!(f.cmdbuf.bind_image(Stage::Compute, 7, ResHandle::image(0)).is_ok());
        assert!(f.cmdbuf.bind_image(Stage::Compute, 8, ResHandle::image(0)).is_err());
        assert!(f.cmdbuf.set_viewport(16, Viewport::default()).is_err());
        assert!(f.cmdbuf.clear_color(8, ColorMask::RGBA, [0; 4]).is_err());
    }

    #[test]
    fn uniform_buffer_alignment() {
        let mut f = fixture();
        assert!(f.cmdbuf.bind_uniform_buffer(Stage::Vertex, 0, 0x1_0000_0080, 0x100).is_err());
        assert!(f.cmdbuf.bind_uniform_buffer(Stage::Vertex, 0, 0x1_0000_0100, 0x1_0001).is_err());
        assert!(f.cmdbuf.bind_uniform_buffer(Stage::Vertex, 0, 0x1_0000_0100, 0x1_0000).is_ok());
    }

    #[test]
    fn push_constants_range() {
        let mut f = fixture();
        let ubo = 0x1_0000_0000;
        assert!(f.cmdbuf.push_constants(ubo, 0x40, 0x3c, &[0; 4]).is_ok());
        assert!(f.cmdbuf.push_constants(ubo, 0x40, 0x3c, &[0; 8]).is_err());
        assert!(f.cmdbuf.push_constants(ubo, 0x40, 2, &[0; 4]).is_err());
        assert!(f.cmdbuf.push_constants(ubo, 0x40, 0, &[0; 3]).is_err());
        assert!(f.cmdbuf.push_data(ubo + 2, &[0; 4]).is_err());
    }

    #[test]
    fn state_is_recorded_verbatim() {
        let mut f = fixture();
        let raster = RasterizerState::default().with_cull_mode(Face::None);
        f.cmdbuf.bind_rasterizer_state(&raster).unwrap();
        f.cmdbuf.set_scissors(2, &[Scissor::new(0, 0, 8, 8)]).unwrap();
        f.cmdbuf
            .clear_color_float(0, ColorMask::RGBA, [1.0, 0.5, 0.0, 1.0])
            .unwrap();
        f.cmdbuf.draw(Primitive::Triangles, 3, 1, 0, 0).unwrap();

        let cmds = recorded(&mut f.cmdbuf);
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[0], Command::BindRasterizerState(raster));
        assert_eq!(
            cmds[1],
            Command::SetScissors {
                first_id: 2,
                scissors: vec![Scissor::new(0, 0, 8, 8)]
            }
        );
        assert_eq!(
            cmds[2],
            Command::ClearColor {
                target_id: 0,
                mask: ColorMask::RGBA,
                data: [1.0f32.to_bits(), 0.5f32.to_bits(), 0, 1.0f32.to_bits()]
            }
        );
    }

    #[test]
    fn shader_must_match_mask() {
        let mut f = fixture();
        let shader = Shader::default();
        assert!(f.cmdbuf.bind_shaders(StageFlags::FRAGMENT, &[&shader]).is_err());
        f.cmdbuf.bind_shader(&shader).unwrap();
        let cmds = recorded(&mut f.cmdbuf);
        match &cmds[0] {
            Command::BindShaders { mask, bindings } => {
                assert_eq!(*mask, StageFlags::VERTEX);
                assert!(!bindings[0].valid);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn image_copies_check_extents() {
        let mut f = fixture();
        let device = f.cmdbuf.device().clone();
        let block = MemBlock::new(
            &device,
            MemBlockConfig::new(0x10000).with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE),
        )
        .unwrap();
        let layout = ImageLayout::new(&ImageLayoutConfig::new(
            ImageType::Tex2D,
            ImageFormat::RGBA8Unorm,
            [16, 16, 1],
        ))
        .unwrap();
        let ms_layout = ImageLayout::new(
            &ImageLayoutConfig::new(ImageType::Tex2DMS, ImageFormat::RGBA8Unorm, [16, 16, 1])
                .with_ms_mode(MsMode::X4),
        )
        .unwrap();
        let a = Image::new(&layout, &block, 0).unwrap();
        let b = Image::new(&layout, &block, 0x1000).unwrap();
        let ms = Image::new(&ms_layout, &block, 0x2000).unwrap();
        let (va, vb, vms) = (ImageView::new(&a), ImageView::new(&b), ImageView::new(&ms));

        let rect = BlitRect::new(0, 0, 16, 16);
        f.cmdbuf.copy_image(&va, &rect, &vb, &rect, BlitFlags::empty()).unwrap();
        let half = BlitRect::new(0, 0, 8, 8);
        assert!(f.cmdbuf.copy_image(&va, &rect, &vb, &half, BlitFlags::empty()).is_err());
        f.cmdbuf
            .blit_image(&va, &rect, &vb, &half, BlitFlags::FILTER_LINEAR, 0)
            .unwrap();
        let outside = BlitRect::new(8, 8, 16, 16);
        assert!(f.cmdbuf.blit_image(&va, &outside, &vb, &rect, BlitFlags::empty(), 0).is_err());

        f.cmdbuf.resolve_image(&vms, &va).unwrap();
        assert!(f.cmdbuf.resolve_image(&va, &vb).is_err());
        assert!(f.cmdbuf.bind_render_targets(&[&va], Some(&vb)).is_err());
    }
}
