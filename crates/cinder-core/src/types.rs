//! Enumerations and flag sets shared by the encoder and the executor.

use bitflags::bitflags;

use crate::macros::raw_enum;

raw_enum! {
    /// Programmable pipeline stage.
    pub enum Stage {
        Vertex = 0,
        TessCtrl = 1,
        TessEval = 2,
        Geometry = 3,
        Fragment = 4,
        Compute = 5,
    }
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Vertex,
        Self::TessCtrl,
        Self::TessEval,
        Self::Geometry,
        Self::Fragment,
        Self::Compute,
    ];

    /// Index into per-stage tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The single-bit mask for this stage.
    #[inline]
    pub const fn flag(self) -> StageFlags {
        StageFlags::from_bits_truncate(1 << self as u32)
    }

    /// Returns true for stages that run as part of a draw.
    #[inline]
    pub const fn is_graphics(self) -> bool {
        !matches!(self, Self::Compute)
    }
}

bitflags! {
    /// Set of pipeline stages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageFlags: u32 {
        const VERTEX    = 1 << 0;
        const TESS_CTRL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY  = 1 << 3;
        const FRAGMENT  = 1 << 4;
        const COMPUTE   = 1 << 5;
        const GRAPHICS  = Self::VERTEX.bits()
            | Self::TESS_CTRL.bits()
            | Self::TESS_EVAL.bits()
            | Self::GEOMETRY.bits()
            | Self::FRAGMENT.bits();
    }
}

raw_enum! {
    /// Dimensionality and arrangement of an image.
    #[derive(Default)]
    pub enum ImageType {
        None = 0,
        Tex1D = 1,
        #[default]
        Tex2D = 2,
        Tex3D = 3,
        Tex1DArray = 4,
        Tex2DArray = 5,
        Tex2DMS = 6,
        Tex2DMSArray = 7,
        TexRectangle = 8,
        TexCubemap = 9,
        TexCubemapArray = 10,
        Buffer = 11,
    }
}

impl ImageType {
    /// Returns true if the third dimension counts array layers.
    pub const fn is_array(self) -> bool {
        matches!(
            self,
            Self::Tex1DArray | Self::Tex2DArray | Self::Tex2DMSArray | Self::TexCubemapArray
        )
    }

    /// Returns true for multisampled image types.
    pub const fn is_multisampled(self) -> bool {
        matches!(self, Self::Tex2DMS | Self::Tex2DMSArray)
    }

    /// Returns true for cubemap image types.
    pub const fn is_cubemap(self) -> bool {
        matches!(self, Self::TexCubemap | Self::TexCubemapArray)
    }

    /// Returns true for image types without a height.
    pub const fn is_1d(self) -> bool {
        matches!(self, Self::Tex1D | Self::Tex1DArray | Self::Buffer)
    }
}

/// Numeric interpretation of a format's components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Unorm,
    Snorm,
    Uint,
    Sint,
    Float,
    /// Depth (and optionally stencil) data.
    Depth,
}

raw_enum! {
    /// Texel formats.
    #[derive(Default)]
    pub enum ImageFormat {
        #[default]
        None = 0,
        R8Unorm = 1,
        R8Snorm = 2,
        R8Uint = 3,
        R8Sint = 4,
        R16Float = 5,
        R16Unorm = 6,
        R16Uint = 7,
        R16Sint = 8,
        R32Float = 9,
        R32Uint = 10,
        R32Sint = 11,
        RG8Unorm = 12,
        RG8Uint = 13,
        RG16Float = 14,
        RG16Unorm = 15,
        RG32Float = 16,
        RG32Uint = 17,
        RGBA8Unorm = 18,
        RGBA8Snorm = 19,
        RGBA8Uint = 20,
        RGBA8Sint = 21,
        RGBA8UnormSrgb = 22,
        BGRA8Unorm = 23,
        BGRA8UnormSrgb = 24,
        RGB10A2Unorm = 25,
        RGBA16Float = 26,
        RGBA16Unorm = 27,
        RGBA16Uint = 28,
        RGBA32Float = 29,
        RGBA32Uint = 30,
        RGBA32Sint = 31,
        Z16 = 32,
        Z24S8 = 33,
        Z32F = 34,
        Z32FS8 = 35,
    }
}

impl ImageFormat {
    /// Size of one texel (one sample) in bytes.
    pub const fn texel_size(self) -> u32 {
        match self {
            Self::None => 0,
            Self::R8Unorm | Self::R8Snorm | Self::R8Uint | Self::R8Sint => 1,
            Self::R16Float
            | Self::R16Unorm
            | Self::R16Uint
            | Self::R16Sint
            | Self::RG8Unorm
            | Self::RG8Uint
            | Self::Z16 => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::R32Sint
            | Self::RG16Float
            | Self::RG16Unorm
            | Self::RGBA8Unorm
            | Self::RGBA8Snorm
            | Self::RGBA8Uint
            | Self::RGBA8Sint
            | Self::RGBA8UnormSrgb
            | Self::BGRA8Unorm
            | Self::BGRA8UnormSrgb
            | Self::RGB10A2Unorm
            | Self::Z24S8
            | Self::Z32F => 4,
            Self::RG32Float
            | Self::RG32Uint
            | Self::RGBA16Float
            | Self::RGBA16Unorm
            | Self::RGBA16Uint
            | Self::Z32FS8 => 8,
            Self::RGBA32Float | Self::RGBA32Uint | Self::RGBA32Sint => 16,
        }
    }

    /// Number of color components, or 1 for depth formats.
    pub const fn component_count(self) -> u32 {
        match self {
            Self::None => 0,
            Self::R8Unorm
            | Self::R8Snorm
            | Self::R8Uint
            | Self::R8Sint
            | Self::R16Float
            | Self::R16Unorm
            | Self::R16Uint
            | Self::R16Sint
            | Self::R32Float
            | Self::R32Uint
            | Self::R32Sint
            | Self::Z16
            | Self::Z24S8
            | Self::Z32F
            | Self::Z32FS8 => 1,
            Self::RG8Unorm
            | Self::RG8Uint
            | Self::RG16Float
            | Self::RG16Unorm
            | Self::RG32Float
            | Self::RG32Uint => 2,
            _ => 4,
        }
    }

    /// Bits per component, or `None` for packed formats.
    pub const fn component_bits(self) -> Option<u32> {
        match self {
            Self::None | Self::RGB10A2Unorm | Self::Z24S8 | Self::Z32FS8 => None,
            _ => Some(self.texel_size() * 8 / self.component_count()),
        }
    }

    /// Numeric interpretation of the components.
    pub const fn kind(self) -> ComponentKind {
        match self {
            Self::R8Snorm | Self::RGBA8Snorm => ComponentKind::Snorm,
            Self::R8Uint
            | Self::R16Uint
            | Self::R32Uint
            | Self::RG8Uint
            | Self::RG32Uint
            | Self::RGBA8Uint
            | Self::RGBA16Uint
            | Self::RGBA32Uint => ComponentKind::Uint,
            Self::R8Sint | Self::R16Sint | Self::R32Sint | Self::RGBA8Sint | Self::RGBA32Sint => {
                ComponentKind::Sint
            }
            Self::R16Float
            | Self::R32Float
            | Self::RG16Float
            | Self::RG32Float
            | Self::RGBA16Float
            | Self::RGBA32Float => ComponentKind::Float,
            Self::Z16 | Self::Z24S8 | Self::Z32F | Self::Z32FS8 => ComponentKind::Depth,
            _ => ComponentKind::Unorm,
        }
    }

    /// Returns true if components are stored blue-first.
    pub const fn is_bgra(self) -> bool {
        matches!(self, Self::BGRA8Unorm | Self::BGRA8UnormSrgb)
    }

    /// Returns true if the color components are sRGB encoded.
    pub const fn is_srgb(self) -> bool {
        matches!(self, Self::RGBA8UnormSrgb | Self::BGRA8UnormSrgb)
    }

    /// Returns true for depth and depth-stencil formats.
    pub const fn is_depth(self) -> bool {
        matches!(self.kind(), ComponentKind::Depth)
    }

    /// Returns true if the format carries a stencil component.
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::Z24S8 | Self::Z32FS8)
    }
}

raw_enum! {
    /// Multisample mode.
    #[derive(Default)]
    pub enum MsMode {
        #[default]
        X1 = 0,
        X2 = 1,
        X4 = 2,
        X8 = 3,
    }
}

impl MsMode {
    /// Number of samples per pixel.
    pub const fn samples(self) -> u32 {
        1 << self as u32
    }

    /// Mode for a sample count, if supported.
    pub const fn from_samples(samples: u32) -> Option<Self> {
        match samples {
            1 => Some(Self::X1),
            2 => Some(Self::X2),
            4 => Some(Self::X4),
            8 => Some(Self::X8),
            _ => None,
        }
    }
}

raw_enum! {
    /// Primitive topology for draws.
    pub enum Primitive {
        Points = 0,
        Lines = 1,
        LineLoop = 2,
        LineStrip = 3,
        Triangles = 4,
        TriangleStrip = 5,
        TriangleFan = 6,
        Quads = 7,
        QuadStrip = 8,
        Polygon = 9,
        LinesAdjacency = 10,
        LineStripAdjacency = 11,
        TrianglesAdjacency = 12,
        TriangleStripAdjacency = 13,
        Patches = 14,
    }
}

raw_enum! {
    /// Index buffer element format.
    pub enum IdxFormat {
        Uint8 = 0,
        Uint16 = 1,
        Uint32 = 2,
    }
}

impl IdxFormat {
    /// Size of one index in bytes.
    pub const fn size(self) -> u32 {
        match self {
            Self::Uint8 => 1,
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

raw_enum! {
    /// Polygon face selector.
    pub enum Face {
        None = 0,
        Front = 1,
        Back = 2,
        FrontAndBack = 3,
    }
}

raw_enum! {
    /// Comparison function for depth, stencil and sampler compare.
    pub enum CompareOp {
        Never = 1,
        Less = 2,
        Equal = 3,
        Lequal = 4,
        Greater = 5,
        NotEqual = 6,
        Gequal = 7,
        Always = 8,
    }
}

raw_enum! {
    /// Stencil buffer update operation.
    pub enum StencilOp {
        Keep = 1,
        Zero = 2,
        Replace = 3,
        Incr = 4,
        Decr = 5,
        Invert = 6,
        IncrWrap = 7,
        DecrWrap = 8,
    }
}

raw_enum! {
    /// Polygon rasterization mode.
    pub enum PolygonMode {
        Point = 0,
        Line = 1,
        Fill = 2,
    }
}

raw_enum! {
    /// Winding order of front-facing polygons.
    pub enum FrontFace {
        Cw = 0,
        Ccw = 1,
    }
}

raw_enum! {
    /// Scope of an explicit barrier.
    pub enum Barrier {
        /// Only cache invalidation, no execution dependency.
        None = 0,
        /// Wait for tiles of the current render pass.
        Tiles = 1,
        /// Wait for all fragments.
        Fragments = 2,
        /// Wait for all primitives and compute jobs.
        Primitives = 3,
        /// Wait for everything before the barrier.
        Full = 4,
    }
}

bitflags! {
    /// Caches invalidated by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InvalidateFlags: u32 {
        const IMAGE       = 1 << 0;
        const SHADER      = 1 << 1;
        const DESCRIPTORS = 1 << 2;
        const ZCULL       = 1 << 3;
        const L2_CACHE    = 1 << 4;
    }
}

raw_enum! {
    /// Tiled cache control operation.
    pub enum TiledCacheOp {
        Disable = 0,
        Enable = 1,
        Flush = 2,
    }
}

raw_enum! {
    /// Texel filter.
    #[derive(Default)]
    pub enum Filter {
        #[default]
        Nearest = 0,
        Linear = 1,
    }
}

raw_enum! {
    /// Mipmap filter.
    #[derive(Default)]
    pub enum MipFilter {
        #[default]
        None = 0,
        Nearest = 1,
        Linear = 2,
    }
}

raw_enum! {
    /// Texture coordinate wrap mode.
    #[derive(Default)]
    pub enum WrapMode {
        #[default]
        Repeat = 0,
        MirroredRepeat = 1,
        ClampToEdge = 2,
        ClampToBorder = 3,
        Clamp = 4,
        MirrorClampToEdge = 5,
        MirrorClampToBorder = 6,
        MirrorClamp = 7,
    }
}

raw_enum! {
    /// Component source for an image view swizzle.
    pub enum Swizzle {
        Zero = 0,
        One = 1,
        Red = 2,
        Green = 3,
        Blue = 4,
        Alpha = 5,
    }
}

impl Swizzle {
    /// The identity swizzle.
    pub const IDENTITY: [Self; 4] = [Self::Red, Self::Green, Self::Blue, Self::Alpha];
}

raw_enum! {
    /// Which aspect of a depth-stencil image a view reads.
    #[derive(Default)]
    pub enum DsSource {
        #[default]
        Depth = 0,
        Stencil = 1,
    }
}

raw_enum! {
    /// Sampler reduction mode.
    #[derive(Default)]
    pub enum SamplerReduction {
        #[default]
        WeightedAverage = 0,
        Min = 1,
        Max = 2,
    }
}

raw_enum! {
    /// Size and arrangement of a vertex attribute.
    pub enum VtxAttribSize {
        Size1x32 = 0x12,
        Size2x32 = 0x04,
        Size3x32 = 0x02,
        Size4x32 = 0x01,
        Size1x16 = 0x1b,
        Size2x16 = 0x0f,
        Size3x16 = 0x05,
        Size4x16 = 0x03,
        Size1x8 = 0x1d,
        Size2x8 = 0x18,
        Size3x8 = 0x13,
        Size4x8 = 0x0a,
        Size10_10_10_2 = 0x30,
    }
}

raw_enum! {
    /// Numeric interpretation of a vertex attribute.
    pub enum VtxAttribType {
        None = 0,
        Snorm = 1,
        Unorm = 2,
        Sint = 3,
        Uint = 4,
        Sscaled = 5,
        Uscaled = 6,
        Float = 7,
    }
}

bitflags! {
    /// Options for image copies and blits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlitFlags: u32 {
        /// Sample the source with bilinear filtering when scaling.
        const FILTER_LINEAR = 1 << 0;
        /// Mirror the source horizontally.
        const FLIP_X        = 1 << 1;
        /// Mirror the source vertically.
        const FLIP_Y        = 1 << 2;
        /// Blend the source over the destination using the blit factor.
        const MODE_BLEND    = 1 << 3;
    }
}

bitflags! {
    /// Color components written by a clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ColorMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RGBA = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_raw(stage.raw()), Some(stage));
        }
        assert_eq!(ImageFormat::from_raw(999), None);
        assert_eq!(CompareOp::from_raw(0), None);
    }

    #[test]
    fn stage_flags() {
        assert_eq!(Stage::Fragment.flag(), StageFlags::FRAGMENT);
        assert!(StageFlags::GRAPHICS.contains(Stage::Geometry.flag()));
        assert!(!StageFlags::GRAPHICS.contains(Stage::Compute.flag()));
    }

    #[test]
    fn format_sizes() {
        assert_eq!(ImageFormat::RGBA8Unorm.texel_size(), 4);
        assert_eq!(ImageFormat::RGBA8Unorm.component_bits(), Some(8));
        assert_eq!(ImageFormat::RGBA16Float.component_bits(), Some(16));
        assert_eq!(ImageFormat::RGBA32Float.texel_size(), 16);
        assert_eq!(ImageFormat::Z24S8.component_bits(), None);
        assert!(ImageFormat::Z32FS8.has_stencil());
        assert!(ImageFormat::BGRA8UnormSrgb.is_srgb());
        assert_eq!(ImageFormat::R32Uint.kind(), ComponentKind::Uint);
    }

    #[test]
    fn ms_mode_samples() {
        assert_eq!(MsMode::X4.samples(), 4);
        assert_eq!(MsMode::from_samples(8), Some(MsMode::X8));
        assert_eq!(MsMode::from_samples(3), None);
    }
}
