//! Bound pipeline state tracked by the executor.

use cinder_core::constants::{
    MAX_VERTEX_BUFFERS, NUM_IMAGE_BINDINGS, NUM_STAGES, NUM_STORAGE_BUFS, NUM_TEXTURE_BINDINGS,
    NUM_UNIFORM_BUFS, NUM_VIEWPORTS,
};
use cinder_core::{
    BufExtents, DepthStencilState, GpuAddr, IdxFormat, RasterizerState, Scissor, ShaderBinding,
    TiledCacheOp, ViewTarget, Viewport, VtxAttribState, VtxBufferState,
};

use crate::error::{GpuError, Result};

/// Resources bound to one shader stage.
#[derive(Debug, Clone)]
pub(crate) struct StageBindings {
    pub shader: Option<ShaderBinding>,
    pub uniform_buffers: [Option<BufExtents>; NUM_UNIFORM_BUFS as usize],
    pub storage_buffers: [Option<BufExtents>; NUM_STORAGE_BUFS as usize],
    pub textures: [Option<u32>; NUM_TEXTURE_BINDINGS as usize],
    pub images: [Option<u32>; NUM_IMAGE_BINDINGS as usize],
}

impl Default for StageBindings {
    fn default() -> Self {
        Self {
            shader: None,
            uniform_buffers: [None; NUM_UNIFORM_BUFS as usize],
            storage_buffers: [None; NUM_STORAGE_BUFS as usize],
            textures: [None; NUM_TEXTURE_BINDINGS as usize],
            images: [None; NUM_IMAGE_BINDINGS as usize],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DescriptorSet {
    pub addr: GpuAddr,
    pub count: u32,
}

impl DescriptorSet {
    /// Bytes covered by `count` descriptors of `size` bytes each.
    pub fn span(&self, size: u32) -> u64 {
        u64::from(self.count) * u64::from(size)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineState {
    pub stages: [StageBindings; NUM_STAGES],
    pub image_descriptors: Option<DescriptorSet>,
    pub sampler_descriptors: Option<DescriptorSet>,
    pub color_targets: Vec<ViewTarget>,
    pub depth_target: Option<ViewTarget>,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub vtx_attribs: Vec<VtxAttribState>,
    pub vtx_buffer_state: Vec<VtxBufferState>,
    pub vtx_buffers: [Option<BufExtents>; MAX_VERTEX_BUFFERS as usize],
    pub idx_buffer: Option<(IdxFormat, GpuAddr)>,
    pub viewports: [Viewport; NUM_VIEWPORTS as usize],
    pub scissors: [Option<Scissor>; NUM_VIEWPORTS as usize],
    pub depth_bounds: Option<(f32, f32)>,
    pub primitive_restart: Option<u32>,
    pub tile_size: (u32, u32),
    pub tiled_cache: TiledCacheOp,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            stages: Default::default(),
            image_descriptors: None,
            sampler_descriptors: None,
            color_targets: Vec::new(),
            depth_target: None,
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            vtx_attribs: Vec::new(),
            vtx_buffer_state: Vec::new(),
            vtx_buffers: [None; MAX_VERTEX_BUFFERS as usize],
            idx_buffer: None,
            viewports: [Viewport::default(); NUM_VIEWPORTS as usize],
            scissors: [None; NUM_VIEWPORTS as usize],
            depth_bounds: None,
            primitive_restart: None,
            tile_size: (128, 128),
            tiled_cache: TiledCacheOp::Disable,
        }
    }
}

/// Store `values` into `slots[first..]`, faulting if they do not fit.
pub(crate) fn bind_slots<T: Copy>(
    slots: &mut [Option<T>],
    first: u32,
    values: &[T],
    what: &str,
) -> Result<()> {
    let first = first as usize;
    let end = first + values.len();
    let Some(dst) = slots.get_mut(first..end) else {
        return Err(GpuError::DeviceFault(format!(
            "{what} slots {first}..{end} out of range"
        )));
    };
    for (slot, value) in dst.iter_mut().zip(values) {
        *slot = Some(*value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_bind_independently() {
        let mut slots = [None; 4];
        bind_slots(&mut slots, 1, &[7u32, 8], "test").unwrap();
        bind_slots(&mut slots, 3, &[9u32], "test").unwrap();
        assert_eq!(slots, [None, Some(7), Some(8), Some(9)]);
        assert!(bind_slots(&mut slots, 3, &[1u32, 2], "test").is_err());
    }

    #[test]
    fn fresh_state_has_no_shaders() {
        let state = PipelineState::default();
        assert!(state.stages.iter().all(|s| s.shader.is_none()));
        assert!(state.rasterizer.rasterizer_enable);
    }
}
