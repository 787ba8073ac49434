//! Pipeline state records.
//!
//! These are the values bound through a command buffer. They are plain data
//! with the same defaults a freshly reset pipeline has.

use bytemuck::{Pod, Zeroable};

use crate::types::{
    CompareOp, Face, FrontFace, PolygonMode, StencilOp, VtxAttribSize, VtxAttribType,
};
use crate::GpuAddr;

/// Address range of a bound buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct BufExtents {
    pub addr: GpuAddr,
    pub size: u64,
}

impl BufExtents {
    #[inline]
    pub const fn new(addr: GpuAddr, size: u64) -> Self {
        Self { addr, size }
    }

    /// One past the last byte of the range.
    #[inline]
    pub const fn end(&self) -> GpuAddr {
        self.addr + self.size
    }
}

/// Rasterizer configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizerState {
    pub rasterizer_enable: bool,
    pub depth_clamp_enable: bool,
    pub fill_rectangle_enable: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: Face,
    pub front_face: FrontFace,
    pub polygon_smooth_enable: bool,
    pub depth_bias_enable: bool,
    pub line_width: f32,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            rasterizer_enable: true,
            depth_clamp_enable: false,
            fill_rectangle_enable: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode: Face::Back,
            front_face: FrontFace::Ccw,
            polygon_smooth_enable: false,
            depth_bias_enable: false,
            line_width: 1.0,
        }
    }
}

impl RasterizerState {
    pub fn with_cull_mode(mut self, cull_mode: Face) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_front_face(mut self, front_face: FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn with_polygon_mode(mut self, polygon_mode: PolygonMode) -> Self {
        self.polygon_mode = polygon_mode;
        self
    }

    pub fn with_depth_clamp(mut self, enable: bool) -> Self {
        self.depth_clamp_enable = enable;
        self
    }

    pub fn with_line_width(mut self, line_width: f32) -> Self {
        self.line_width = line_width;
        self
    }
}

/// Depth and stencil test configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub stencil_test_enable: bool,
    pub depth_compare_op: CompareOp,
    pub stencil_front_fail_op: StencilOp,
    pub stencil_front_pass_op: StencilOp,
    pub stencil_front_depth_fail_op: StencilOp,
    pub stencil_front_compare_op: CompareOp,
    pub stencil_back_fail_op: StencilOp,
    pub stencil_back_pass_op: StencilOp,
    pub stencil_back_depth_fail_op: StencilOp,
    pub stencil_back_compare_op: CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            stencil_test_enable: false,
            depth_compare_op: CompareOp::Less,
            stencil_front_fail_op: StencilOp::Keep,
            stencil_front_pass_op: StencilOp::Replace,
            stencil_front_depth_fail_op: StencilOp::Keep,
            stencil_front_compare_op: CompareOp::Always,
            stencil_back_fail_op: StencilOp::Keep,
            stencil_back_pass_op: StencilOp::Replace,
            stencil_back_depth_fail_op: StencilOp::Keep,
            stencil_back_compare_op: CompareOp::Always,
        }
    }
}

impl DepthStencilState {
    pub fn with_depth_test(mut self, enable: bool) -> Self {
        self.depth_test_enable = enable;
        self
    }

    pub fn with_depth_write(mut self, enable: bool) -> Self {
        self.depth_write_enable = enable;
        self
    }

    pub fn with_depth_compare_op(mut self, op: CompareOp) -> Self {
        self.depth_compare_op = op;
        self
    }

    pub fn with_stencil_test(mut self, enable: bool) -> Self {
        self.stencil_test_enable = enable;
        self
    }
}

/// Layout of one vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VtxAttribState {
    pub buffer_id: u32,
    pub is_fixed: bool,
    pub offset: u32,
    pub size: VtxAttribSize,
    pub ty: VtxAttribType,
    pub is_bgra: bool,
}

impl VtxAttribState {
    pub const fn new(buffer_id: u32, offset: u32, size: VtxAttribSize, ty: VtxAttribType) -> Self {
        Self {
            buffer_id,
            is_fixed: false,
            offset,
            size,
            ty,
            is_bgra: false,
        }
    }
}

/// Stride and instancing divisor of one vertex buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VtxBufferState {
    pub stride: u32,
    pub divisor: u32,
}

/// Viewport transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            near: 0.0,
            far: 1.0,
        }
    }
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            ..Self::default()
        }
    }
}

/// Scissor rectangle.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Scissor {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Scissor {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Buffer side of a buffer/image copy.
///
/// A zero `row_length` or `image_height` means tightly packed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CopyBuf {
    pub addr: GpuAddr,
    pub row_length: u32,
    pub image_height: u32,
}

impl CopyBuf {
    pub const fn new(addr: GpuAddr) -> Self {
        Self {
            addr,
            row_length: 0,
            image_height: 0,
        }
    }
}

/// A box inside an image; `z` selects the slice or layer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BlitRect {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Default for BlitRect {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            width: 1,
            height: 1,
            depth: 1,
        }
    }
}

impl BlitRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            z: 0,
            width,
            height,
            depth: 1,
        }
    }

    /// Number of texels covered.
    pub const fn texels(&self) -> u64 {
        (self.width as u64 * self.height as u64).saturating_mul(self.depth as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn defaults_match_reset_pipeline() {
        let raster = RasterizerState::default();
        assert_eq!(raster.cull_mode, Face::Back);
        assert_eq!(raster.front_face, FrontFace::Ccw);
        assert_relative_eq!(raster.line_width, 1.0);

        let ds = DepthStencilState::default();
        assert!(ds.depth_test_enable);
        assert_eq!(ds.depth_compare_op, CompareOp::Less);
        assert_eq!(ds.stencil_back_compare_op, CompareOp::Always);
    }

    #[test]
    fn blit_rect_texels() {
        assert_eq!(BlitRect::new(0, 0, 4, 3).texels(), 12);
        assert_eq!(BlitRect::default().texels(), 1);
    }
}
