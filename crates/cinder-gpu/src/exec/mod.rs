//! Software command executor.
//!
//! Each queue owns one executor on its worker thread. The executor decodes
//! command lists from GPU memory and applies them in order: state commands
//! update [`PipelineState`], memory commands read and write block storage and
//! fence commands complete or wait on fences. Draws and dispatches validate
//! the bound state and are counted; no shading is performed.

mod pixels;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use cinder_core::constants::{IMAGE_DESCRIPTOR_SIZE, SAMPLER_DESCRIPTOR_SIZE};
use cinder_core::{
    Command, CommandReader, DispatchIndirectData, DrawIndexedIndirectData, DrawIndirectData,
    GpuAddr, Stage,
};
use tracing::{error, trace};

use crate::command::CmdList;
use crate::descriptors::ResHandle;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::queue::QueueFlags;

use self::state::{bind_slots, DescriptorSet, PipelineState};

/// How often a blocked fence wait checks for queue shutdown.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counters accumulated by a queue's executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub lists: u64,
    pub commands: u64,
    pub draws: u64,
    pub vertices: u64,
    pub dispatches: u64,
    pub workgroups: u64,
    pub copies: u64,
    pub bytes_copied: u64,
    pub clears: u64,
    pub barriers: u64,
    pub fence_signals: u64,
    pub fence_waits: u64,
    pub presents: u64,
}

fn fault(msg: impl Into<String>) -> GpuError {
    GpuError::DeviceFault(msg.into())
}

pub(crate) struct Executor {
    device: Device,
    flags: QueueFlags,
    closing: Arc<AtomicBool>,
    state: PipelineState,
    stats: ExecStats,
}

impl Executor {
    pub(crate) fn new(device: Device, flags: QueueFlags, closing: Arc<AtomicBool>) -> Self {
        Self {
            device,
            flags,
            closing,
            state: PipelineState::default(),
            stats: ExecStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> &ExecStats {
        &self.stats
    }

    pub(crate) fn count_present(&mut self) {
        self.stats.presents += 1;
    }

    fn read_words(&self, list: &CmdList) -> Result<Vec<u32>> {
        match self.device.cmdbuf_epoch(list.owner) {
            Some(epoch) if epoch == list.epoch => {}
            _ => return Err(GpuError::StaleCommandList),
        }
        let mut words = vec![0u32; list.size as usize / 4];
        self.device
            .read_gpu(list.gpu_addr, bytemuck::cast_slice_mut(&mut words))?;
        Ok(words)
    }

    /// Execute every instruction of `list`.
    ///
    /// On the first failure the remaining instructions are drained: fences
    /// they would have signaled are failed instead.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn execute_list(&mut self, list: &CmdList) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }
        let words = self.read_words(list)?;
        self.stats.lists += 1;

        let mut reader = CommandReader::new(&words);
        while let Some(cmd) = reader.next() {
            let result = cmd.map_err(GpuError::from).and_then(|cmd| {
                trace!(opcode = ?cmd.opcode(), "Executing");
                self.execute(&cmd)
            });
            if let Err(err) = result {
                error!(
                    list = format_args!("{:#x}", list.gpu_addr),
                    word = reader.position(),
                    error = %err,
                    "Command list faulted"
                );
                fail_signals(&self.device, reader);
                return Err(err);
            }
            self.stats.commands += 1;
        }
        Ok(())
    }

    /// Skip `list` without executing it, failing the fences it would signal.
    pub(crate) fn drain_list(&self, list: &CmdList) {
        if let Ok(words) = self.read_words(list) {
            fail_signals(&self.device, CommandReader::new(&words));
        }
    }

    fn read_pod<T: Pod>(&self, addr: GpuAddr) -> Result<T> {
        let mut value = T::zeroed();
        self.device
            .read_gpu(addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    fn execute(&mut self, cmd: &Command) -> Result<()> {
        match cmd {
            Command::WaitFence(fence_ref) => {
                let fence = self
                    .device
                    .lookup_fence(fence_ref)
                    .ok_or_else(|| fault("wait on a destroyed fence"))?;
                loop {
                    match fence.wait_value(fence_ref.value, WAIT_POLL_INTERVAL) {
                        Some(true) => break,
                        Some(false) => return Err(fault("waited-on fence faulted")),
                        None if self.closing.load(Ordering::Acquire) => {
                            return Err(fault("queue shut down during a fence wait"));
                        }
                        None => {}
                    }
                }
                self.stats.fence_waits += 1;
            }
            Command::SignalFence { fence, .. } => {
                match self.device.lookup_fence(fence) {
                    Some(shared) => shared.complete(fence.value),
                    None => trace!(index = fence.index, "Signal for a destroyed fence dropped"),
                }
                self.stats.fence_signals += 1;
            }
            Command::Barrier { .. } => self.stats.barriers += 1,

            Command::BindShaders { mask, bindings } => {
                for stage in Stage::ALL {
                    if mask.contains(stage.flag()) {
                        self.state.stages[stage.index()].shader = None;
                    }
                }
                for binding in bindings {
                    self.state.stages[binding.stage.index()].shader = Some(*binding);
                }
            }
            Command::BindUniformBuffers {
                stage,
                first_id,
                buffers,
            } => bind_slots(
                &mut self.state.stages[stage.index()].uniform_buffers,
                *first_id,
                buffers,
                "uniform buffer",
            )?,
            Command::BindStorageBuffers {
                stage,
                first_id,
                buffers,
            } => bind_slots(
                &mut self.state.stages[stage.index()].storage_buffers,
                *first_id,
                buffers,
                "storage buffer",
            )?,
            Command::BindTextures {
                stage,
                first_id,
                handles,
            } => bind_slots(
                &mut self.state.stages[stage.index()].textures,
                *first_id,
                handles,
                "texture",
            )?,
            Command::BindImages {
                stage,
                first_id,
                handles,
            } => bind_slots(
                &mut self.state.stages[stage.index()].images,
                *first_id,
                handles,
                "image",
            )?,
            Command::BindImageDescriptorSet {
                addr,
                num_descriptors,
            } => {
                self.state.image_descriptors = Some(DescriptorSet {
                    addr: *addr,
                    count: *num_descriptors,
                });
            }
            Command::BindSamplerDescriptorSet {
                addr,
                num_descriptors,
            } => {
                self.state.sampler_descriptors = Some(DescriptorSet {
                    addr: *addr,
                    count: *num_descriptors,
                });
            }
            Command::BindRenderTargets { colors, depth } => {
                self.state.color_targets.clone_from(colors);
                self.state.depth_target = *depth;
            }
            Command::BindRasterizerState(state) => self.state.rasterizer = *state,
            Command::BindDepthStencilState(state) => self.state.depth_stencil = *state,
            Command::BindVtxAttribState(attribs) => self.state.vtx_attribs.clone_from(attribs),
            Command::BindVtxBufferState(buffers) => {
                self.state.vtx_buffer_state.clone_from(buffers);
            }
            Command::BindVtxBuffers { first_id, buffers } => bind_slots(
                &mut self.state.vtx_buffers,
                *first_id,
                buffers,
                "vertex buffer",
            )?,
            Command::BindIdxBuffer { format, addr } => {
                self.state.idx_buffer = Some((*format, *addr));
            }

            Command::SetViewports {
                first_id,
                viewports,
            } => {
                let first = *first_id as usize;
                let slots = self
                    .state
                    .viewports
                    .get_mut(first..first + viewports.len())
                    .ok_or_else(|| fault("viewport slots out of range"))?;
                slots.copy_from_slice(viewports);
            }
            Command::SetScissors { first_id, scissors } => bind_slots(
                &mut self.state.scissors,
                *first_id,
                scissors,
                "scissor",
            )?,
            Command::SetDepthBounds { enable, near, far } => {
                self.state.depth_bounds = enable.then_some((*near, *far));
            }
            // Stencil references only feed shading, which is not performed.
            Command::SetStencil { .. } => {}
            Command::SetPrimitiveRestart { enable, index } => {
                self.state.primitive_restart = enable.then_some(*index);
            }
            Command::SetTileSize { width, height } => self.state.tile_size = (*width, *height),
            Command::TiledCacheOp(op) => self.state.tiled_cache = *op,

            Command::ClearColor {
                target_id,
                mask,
                data,
            } => {
                let target = self
                    .state
                    .color_targets
                    .get(*target_id as usize)
                    .copied()
                    .ok_or_else(|| fault(format!("clear of unbound color target {target_id}")))?;
                pixels::clear_color(&self.device, &target, *mask, *data)?;
                self.stats.clears += 1;
            }
            Command::ClearDepthStencil {
                clear_depth,
                depth,
                stencil_mask,
                stencil,
            } => {
                let target = self
                    .state
                    .depth_target
                    .ok_or_else(|| fault("depth clear without a depth target"))?;
                pixels::clear_depth_stencil(
                    &self.device,
                    &target,
                    *clear_depth,
                    *depth,
                    *stencil_mask,
                    *stencil,
                )?;
                self.stats.clears += 1;
            }
            Command::DiscardColor { target_id } => {
                if self.state.color_targets.len() <= *target_id as usize {
                    return Err(fault(format!("discard of unbound color target {target_id}")));
                }
            }
            Command::DiscardDepthStencil => {
                if self.state.depth_target.is_none() {
                    return Err(fault("depth discard without a depth target"));
                }
            }

            Command::Draw {
                vertex_count,
                instance_count,
                ..
            } => self.draw(*vertex_count, *instance_count)?,
            Command::DrawIndirect { addr, .. } => {
                let params: DrawIndirectData = self.read_pod(*addr)?;
                self.draw(params.vertex_count, params.instance_count)?;
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                ..
            } => self.draw_indexed(*index_count, *instance_count, *first_index)?,
            Command::DrawIndexedIndirect { addr, .. } => {
                let params: DrawIndexedIndirectData = self.read_pod(*addr)?;
                self.draw_indexed(params.index_count, params.instance_count, params.first_index)?;
            }
            Command::Dispatch { x, y, z } => self.dispatch(*x, *y, *z)?,
            Command::DispatchIndirect { addr } => {
                let params: DispatchIndirectData = self.read_pod(*addr)?;
                self.dispatch(params.num_groups_x, params.num_groups_y, params.num_groups_z)?;
            }

            Command::PushData { addr, data } => {
                self.device.write_gpu(*addr, bytemuck::cast_slice(data))?;
            }
            Command::PushConstants {
                ubo_addr,
                ubo_size,
                offset,
                data,
            } => {
                let len = data.len() as u64 * 4;
                if u64::from(*offset) + len > u64::from(*ubo_size) {
                    return Err(fault("push constants outside the uniform buffer"));
                }
                self.device
                    .write_gpu(ubo_addr + u64::from(*offset), bytemuck::cast_slice(data))?;
            }

            Command::CopyBuffer { src, dst, size } => {
                let (Some(src_end), Some(dst_end)) = (src.checked_add(*size), dst.checked_add(*size))
                else {
                    return Err(fault(format!(
                        "buffer copy {src:#x} -> {dst:#x} ({size:#x} bytes) wraps the address space"
                    )));
                };
                // Both ranges must be mapped before the staging copy is allocated.
                self.device.resolve(*dst, *size)?;
                if *size > 0 && *src < dst_end && *dst < src_end {
                    return Err(fault(format!(
                        "overlapping buffer copy {src:#x} -> {dst:#x} ({size:#x} bytes)"
                    )));
                }
                let bytes = self.device.read_gpu_vec(*src, *size)?;
                self.device.write_gpu(*dst, &bytes)?;
                self.count_copy(*size);
            }
            Command::CopyImage {
                src,
                src_rect,
                dst,
                dst_rect,
                flags,
            } => {
                let bytes = pixels::copy_image(&self.device, src, src_rect, dst, dst_rect, *flags)?;
                self.count_copy(bytes);
            }
            Command::BlitImage {
                src,
                src_rect,
                dst,
                dst_rect,
                flags,
                factor,
            } => {
                let bytes = pixels::blit_image(
                    &self.device,
                    src,
                    src_rect,
                    dst,
                    dst_rect,
                    *flags,
                    *factor,
                )?;
                self.count_copy(bytes);
            }
            Command::ResolveImage { src, dst } => {
                let bytes = pixels::resolve_image(&self.device, src, dst)?;
                self.count_copy(bytes);
            }
            Command::CopyBufferToImage {
                src,
                dst,
                dst_rect,
                flags,
            } => {
                let bytes = pixels::copy_buffer_to_image(&self.device, src, dst, dst_rect, *flags)?;
                self.count_copy(bytes);
            }
            Command::CopyImageToBuffer {
                src,
                src_rect,
                dst,
                flags,
            } => {
                let bytes = pixels::copy_image_to_buffer(&self.device, src, src_rect, dst, *flags)?;
                self.count_copy(bytes);
            }
        }
        Ok(())
    }

    fn count_copy(&mut self, bytes: u64) {
        self.stats.copies += 1;
        self.stats.bytes_copied += bytes;
    }

    /// Validate the shader bound to `stage` and the resources it can reach.
    fn check_stage(&self, stage: Stage) -> Result<()> {
        let bindings = &self.state.stages[stage.index()];
        let Some(shader) = bindings.shader else {
            return Ok(());
        };
        if !shader.valid {
            return Err(fault(format!("invalid {stage:?} shader bound")));
        }
        self.device
            .resolve(shader.code_addr, u64::from(shader.code_size))?;

        let images = self.state.image_descriptors.map_or(0, |s| s.count);
        let samplers = self.state.sampler_descriptors.map_or(0, |s| s.count);
        let uses_images = bindings.textures.iter().chain(&bindings.images).any(Option::is_some);
        let uses_samplers = bindings.textures.iter().any(Option::is_some);
        if let Some(set) = self.state.image_descriptors.filter(|_| uses_images) {
            self.device.resolve(set.addr, set.span(IMAGE_DESCRIPTOR_SIZE))?;
        }
        if let Some(set) = self.state.sampler_descriptors.filter(|_| uses_samplers) {
            self.device.resolve(set.addr, set.span(SAMPLER_DESCRIPTOR_SIZE))?;
        }
        for raw in bindings.textures.iter().flatten() {
            let handle = ResHandle::from_raw(*raw);
            if handle.image_id() >= images || handle.sampler_id() >= samplers {
                return Err(fault(format!(
                    "{stage:?} texture handle {raw:#x} outside the bound descriptor sets"
                )));
            }
        }
        for raw in bindings.images.iter().flatten() {
            if ResHandle::from_raw(*raw).image_id() >= images {
                return Err(fault(format!(
                    "{stage:?} image handle {raw:#x} outside the bound descriptor set"
                )));
            }
        }
        Ok(())
    }

    fn check_draw_state(&self) -> Result<()> {
        if !self.flags.contains(QueueFlags::GRAPHICS) {
            return Err(fault("draw on a queue without graphics support"));
        }
        if !self.state.stages[Stage::Vertex.index()]
            .shader
            .is_some_and(|s| s.valid)
        {
            return Err(fault("draw without a valid vertex shader"));
        }
        for stage in Stage::ALL.into_iter().filter(|s| s.is_graphics()) {
            self.check_stage(stage)?;
        }
        for attrib in self.state.vtx_attribs.iter().filter(|a| !a.is_fixed) {
            let buffer = self
                .state
                .vtx_buffers
                .get(attrib.buffer_id as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    fault(format!("vertex attribute reads unbound buffer {}", attrib.buffer_id))
                })?;
            self.device.resolve(buffer.addr, buffer.size)?;
        }
        trace!(
            rasterizer = ?self.state.rasterizer,
            depth_stencil = ?self.state.depth_stencil,
            vtx_buffers = self.state.vtx_buffer_state.len(),
            viewport = ?self.state.viewports[0],
            depth_bounds = ?self.state.depth_bounds,
            primitive_restart = ?self.state.primitive_restart,
            tile_size = ?self.state.tile_size,
            tiled_cache = ?self.state.tiled_cache,
            "Draw state"
        );
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.check_draw_state()?;
        self.stats.draws += 1;
        self.stats.vertices += u64::from(vertex_count) * u64::from(instance_count);
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32) -> Result<()> {
        self.check_draw_state()?;
        let (format, addr) = self
            .state
            .idx_buffer
            .ok_or_else(|| fault("indexed draw without an index buffer"))?;
        if index_count > 0 {
            let size = u64::from(format.size());
            let start = addr
                .checked_add(u64::from(first_index) * size)
                .ok_or_else(|| fault("index buffer range wraps the address space"))?;
            self.device.resolve(start, u64::from(index_count) * size)?;
        }
        self.stats.draws += 1;
        self.stats.vertices += u64::from(index_count) * u64::from(instance_count);
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            return Ok(());
        }
        if !self.flags.contains(QueueFlags::COMPUTE) {
            return Err(fault("dispatch on a queue without compute support"));
        }
        if !self.state.stages[Stage::Compute.index()]
            .shader
            .is_some_and(|s| s.valid)
        {
            return Err(fault("dispatch without a valid compute shader"));
        }
        self.check_stage(Stage::Compute)?;
        self.stats.dispatches += 1;
        self.stats.workgroups += u64::from(x) * u64::from(y) * u64::from(z);
        Ok(())
    }
}

/// Fail every fence the remaining instructions would have signaled.
fn fail_signals(device: &Device, reader: CommandReader<'_>) {
    for cmd in reader.flatten() {
        if let Command::SignalFence { fence, .. } = cmd {
            if let Some(shared) = device.lookup_fence(&fence) {
                shared.fail(fence.value);
            }
        }
    }
}
