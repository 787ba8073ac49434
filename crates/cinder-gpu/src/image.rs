//! Images, image layouts and image views.
//!
//! Layouts use a linear arrangement: every array layer holds its full mip
//! chain, rows are padded to 64 bytes (or the explicit pitch for
//! pitch-linear images) and levels are padded to 512 bytes.

use bitflags::bitflags;
use cinder_core::constants::MAX_MIP_LEVELS;
use cinder_core::{DsSource, GpuAddr, ImageFormat, ImageType, MsMode, Swizzle, ViewTarget};

use crate::error::{GpuError, Result};
use crate::memory::{MemBlock, MemBlockFlags};

const ROW_ALIGNMENT: u32 = 64;
const PITCH_ALIGNMENT: u32 = 32;
const LEVEL_ALIGNMENT: u64 = 512;

bitflags! {
    /// Image usage and arrangement flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageFlags: u32 {
        /// Rows are stored with an explicit pitch and no mip chain.
        const PITCH_LINEAR     = 1 << 0;
        const USAGE_RENDER     = 1 << 1;
        const USAGE_LOAD_STORE = 1 << 2;
        const USAGE_PRESENT    = 1 << 3;
        const USAGE_COPY       = 1 << 4;
    }
}

/// Parameters an [`ImageLayout`] is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayoutConfig {
    pub ty: ImageType,
    pub flags: ImageFlags,
    pub format: ImageFormat,
    pub ms_mode: MsMode,
    /// Width, height and depth. Array types count layers in the last
    /// dimension they do not otherwise use.
    pub dimensions: [u32; 3],
    pub mip_levels: u32,
    /// Row pitch of pitch-linear images; 0 picks the smallest valid pitch.
    pub pitch_stride: u32,
}

impl Default for ImageLayoutConfig {
    fn default() -> Self {
        Self {
            ty: ImageType::Tex2D,
            flags: ImageFlags::empty(),
            format: ImageFormat::RGBA8Unorm,
            ms_mode: MsMode::X1,
            dimensions: [1, 1, 1],
            mip_levels: 1,
            pitch_stride: 0,
        }
    }
}

impl ImageLayoutConfig {
    pub fn new(ty: ImageType, format: ImageFormat, dimensions: [u32; 3]) -> Self {
        Self {
            ty,
            format,
            dimensions,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: ImageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ms_mode(mut self, ms_mode: MsMode) -> Self {
        self.ms_mode = ms_mode;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_pitch_stride(mut self, pitch_stride: u32) -> Self {
        self.pitch_stride = pitch_stride;
        self
    }
}

/// Placement of one mip level within a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MipLevel {
    /// Offset from the start of the layer.
    pub offset: u64,
    pub row_pitch: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub size: u64,
}

/// Immutable memory layout of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    ty: ImageType,
    flags: ImageFlags,
    format: ImageFormat,
    ms_mode: MsMode,
    width: u32,
    height: u32,
    depth: u32,
    layers: u32,
    mip_levels: u32,
    levels: [MipLevel; MAX_MIP_LEVELS],
    layer_stride: u64,
    size: u64,
    alignment: u32,
}

fn invalid(msg: impl Into<String>) -> GpuError {
    GpuError::InvalidArgument(msg.into())
}

fn too_large() -> GpuError {
    invalid("image does not fit in a memory block")
}

fn fit_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| too_large())
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl ImageLayout {
    /// Compute the layout for `config`.
    ///
    /// Fails with [`GpuError::InvalidArgument`] when the dimensions do not
    /// suit the image type or the image would not fit in a memory block.
    pub fn new(config: &ImageLayoutConfig) -> Result<Self> {
        let texel_size = config.format.texel_size();
        if texel_size == 0 {
            return Err(invalid("image format has no texel size"));
        }
        let [width, height, depth] = config.dimensions;
        if width == 0 || height == 0 || depth == 0 {
            return Err(invalid("image dimensions must be non-zero"));
        }

        // (height, 3D depth, layers)
        let (height, depth3d, layers) = match config.ty {
            ImageType::None => return Err(invalid("image type must be set")),
            ImageType::Tex1D | ImageType::Buffer if height == 1 && depth == 1 => (1, 1, 1),
            ImageType::Tex1DArray if depth == 1 => (1, 1, height),
            ImageType::Tex2D | ImageType::TexRectangle | ImageType::Tex2DMS if depth == 1 => {
                (height, 1, 1)
            }
            ImageType::Tex2DArray | ImageType::Tex2DMSArray => (height, 1, depth),
            ImageType::Tex3D => (height, depth, 1),
            ImageType::TexCubemap if width == height && depth == 1 => (height, 1, 6),
            ImageType::TexCubemapArray if width == height && depth % 6 == 0 => {
                (height, 1, depth)
            }
            ty => {
                return Err(invalid(format!(
                    "dimensions {width}x{height}x{depth} are not valid for {ty:?}"
                )))
            }
        };

        let multisampled = config.ty.is_multisampled();
        if !multisampled && config.ms_mode != MsMode::X1 {
            return Err(invalid(format!(
                "{:?} images cannot be multisampled",
                config.ty
            )));
        }

        let largest = width.max(height).max(depth3d);
        let max_levels = (32 - largest.leading_zeros()).min(MAX_MIP_LEVELS as u32);
        let single_level_only = multisampled
            || matches!(config.ty, ImageType::TexRectangle | ImageType::Buffer)
            || config.flags.contains(ImageFlags::PITCH_LINEAR);
        if config.mip_levels == 0
            || config.mip_levels > max_levels
            || (single_level_only && config.mip_levels != 1)
        {
            return Err(invalid(format!(
                "{} mip levels are not valid for this image",
                config.mip_levels
            )));
        }

        let samples = config.ms_mode.samples();
        let pitch_linear = config.flags.contains(ImageFlags::PITCH_LINEAR);
        let pitch = if pitch_linear {
            if !matches!(config.ty, ImageType::Tex2D | ImageType::TexRectangle) {
                return Err(invalid("pitch-linear images must be 2D"));
            }
            let min_pitch = width.checked_mul(texel_size).ok_or_else(too_large)?;
            match config.pitch_stride {
                0 => fit_u32(align_up(u64::from(min_pitch), u64::from(PITCH_ALIGNMENT)))?,
                p if p % PITCH_ALIGNMENT == 0 && p >= min_pitch => p,
                p => {
                    return Err(invalid(format!(
                        "pitch stride {p} must be a multiple of {PITCH_ALIGNMENT} and at least {min_pitch}"
                    )))
                }
            }
        } else {
            0
        };

        let mut levels = [MipLevel::default(); MAX_MIP_LEVELS];
        let mut offset = 0u64;
        for (i, level) in levels.iter_mut().take(config.mip_levels as usize).enumerate() {
            let w = (width >> i).max(1);
            let h = (height >> i).max(1);
            let d = (depth3d >> i).max(1);
            let row_pitch = if pitch_linear {
                pitch
            } else {
                let row = u64::from(w) * u64::from(texel_size) * u64::from(samples);
                fit_u32(align_up(row, u64::from(ROW_ALIGNMENT)))?
            };
            let raw_size = u64::from(fit_u32(u64::from(row_pitch) * u64::from(h))?)
                .checked_mul(u64::from(d))
                .ok_or_else(too_large)?;
            fit_u32(raw_size)?;
            let size = if pitch_linear {
                raw_size
            } else {
                align_up(raw_size, LEVEL_ALIGNMENT)
            };
            *level = MipLevel {
                offset,
                row_pitch,
                width: w,
                height: h,
                depth: d,
                size,
            };
            offset = offset.checked_add(size).ok_or_else(too_large)?;
        }
        let size = offset.checked_mul(u64::from(layers)).ok_or_else(too_large)?;
        // Images live in memory blocks, whose sizes are 32-bit.
        fit_u32(size)?;

        Ok(Self {
            ty: config.ty,
            flags: config.flags,
            format: config.format,
            ms_mode: config.ms_mode,
            width,
            height,
            depth: depth3d,
            layers,
            mip_levels: config.mip_levels,
            levels,
            layer_stride: offset,
            size,
            alignment: if pitch_linear {
                PITCH_ALIGNMENT
            } else {
                LEVEL_ALIGNMENT as u32
            },
        })
    }

    pub const fn image_type(&self) -> ImageType {
        self.ty
    }

    pub const fn flags(&self) -> ImageFlags {
        self.flags
    }

    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    pub const fn ms_mode(&self) -> MsMode {
        self.ms_mode
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Depth of 3D images, 1 otherwise.
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    pub const fn layers(&self) -> u32 {
        self.layers
    }

    pub const fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Placement of a mip level, if it exists.
    pub fn level(&self, level: u32) -> Option<&MipLevel> {
        self.levels[..self.mip_levels as usize].get(level as usize)
    }

    /// Distance between consecutive array layers.
    pub const fn layer_stride(&self) -> u64 {
        self.layer_stride
    }

    /// Total size in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Required alignment of the image's offset in its memory block.
    pub const fn alignment(&self) -> u32 {
        self.alignment
    }
}

/// An image placed in a memory block.
///
/// The image does not keep its memory block alive. Accessing an image whose
/// block was dropped faults on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Image {
    gpu_addr: GpuAddr,
    layout: ImageLayout,
}

impl Image {
    /// Place an image at `offset` inside `block`.
    pub fn new(layout: &ImageLayout, block: &MemBlock, offset: u32) -> Result<Self> {
        if offset % layout.alignment() != 0 {
            return Err(invalid(format!(
                "image offset {offset:#x} is not aligned to {:#x}",
                layout.alignment()
            )));
        }
        if u64::from(offset) + layout.size() > u64::from(block.size()) {
            return Err(invalid(format!(
                "image of {:#x} bytes at {offset:#x} exceeds block size {:#x}",
                layout.size(),
                block.size()
            )));
        }
        if !layout.flags().contains(ImageFlags::PITCH_LINEAR)
            && !block.flags().contains(MemBlockFlags::IMAGE)
        {
            return Err(invalid("memory block was not created with the IMAGE flag"));
        }
        Ok(Self {
            gpu_addr: block.gpu_addr() + u64::from(offset),
            layout: *layout,
        })
    }

    pub const fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    pub const fn layout(&self) -> &ImageLayout {
        &self.layout
    }
}

/// A view selecting a subresource of an image and how it is interpreted.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    image: &'a Image,
    ty: Option<ImageType>,
    format: Option<ImageFormat>,
    swizzle: [Swizzle; 4],
    ds_source: DsSource,
    layer_offset: u32,
    layer_count: u32,
    mip_level_offset: u32,
    mip_level_count: u32,
}

impl<'a> ImageView<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            ty: None,
            format: None,
            swizzle: Swizzle::IDENTITY,
            ds_source: DsSource::Depth,
            layer_offset: 0,
            layer_count: 0,
            mip_level_offset: 0,
            mip_level_count: 0,
        }
    }

    pub fn with_type(mut self, ty: ImageType) -> Self {
        self.ty = Some(ty);
        self
    }

    /// Reinterpret texels with a format of the same texel size.
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_swizzle(mut self, swizzle: [Swizzle; 4]) -> Self {
        self.swizzle = swizzle;
        self
    }

    pub fn with_ds_source(mut self, ds_source: DsSource) -> Self {
        self.ds_source = ds_source;
        self
    }

    /// Select layers; a count of 0 selects all remaining layers.
    pub fn with_layers(mut self, offset: u32, count: u32) -> Self {
        self.layer_offset = offset;
        self.layer_count = count;
        self
    }

    /// Select mip levels; a count of 0 selects all remaining levels.
    pub fn with_mip_levels(mut self, offset: u32, count: u32) -> Self {
        self.mip_level_offset = offset;
        self.mip_level_count = count;
        self
    }

    pub const fn image(&self) -> &'a Image {
        self.image
    }

    pub fn image_type(&self) -> ImageType {
        self.ty.unwrap_or(self.image.layout.ty)
    }

    pub fn format(&self) -> ImageFormat {
        self.format.unwrap_or(self.image.layout.format)
    }

    pub const fn swizzle(&self) -> [Swizzle; 4] {
        self.swizzle
    }

    pub const fn ds_source(&self) -> DsSource {
        self.ds_source
    }

    /// Resolved `(offset, count)` of the selected layers.
    pub fn layers(&self) -> Result<(u32, u32)> {
        Self::resolve_range(self.layer_offset, self.layer_count, self.image.layout.layers, "layer")
    }

    /// Resolved `(offset, count)` of the selected mip levels.
    pub fn mip_levels(&self) -> Result<(u32, u32)> {
        Self::resolve_range(
            self.mip_level_offset,
            self.mip_level_count,
            self.image.layout.mip_levels,
            "mip level",
        )
    }

    fn resolve_range(offset: u32, count: u32, total: u32, what: &str) -> Result<(u32, u32)> {
        let count = if count == 0 {
            total.saturating_sub(offset)
        } else {
            count
        };
        if count == 0 || u64::from(offset) + u64::from(count) > u64::from(total) {
            return Err(invalid(format!(
                "{what} range {offset}+{count} exceeds the image's {total}"
            )));
        }
        Ok((offset, count))
    }

    /// The subresource at the first selected mip level and layer.
    pub fn target(&self) -> Result<ViewTarget> {
        let layout = &self.image.layout;
        let (layer_offset, layer_count) = self.layers()?;
        let (mip, _) = self.mip_levels()?;
        let format = self.format();
        if format.texel_size() != layout.format.texel_size() {
            return Err(invalid(format!(
                "view format {format:?} is not size-compatible with {:?}",
                layout.format
            )));
        }
        let level = layout.levels[mip as usize];
        let (depth_or_layers, slice_stride) = if layout.ty == ImageType::Tex3D {
            (level.depth, u64::from(level.row_pitch) * u64::from(level.height))
        } else {
            (layer_count, layout.layer_stride)
        };
        let slice_stride = u32::try_from(slice_stride)
            .map_err(|_| invalid("image slices are too large to address"))?;
        Ok(ViewTarget {
            addr: self.image.gpu_addr
                + u64::from(layer_offset) * layout.layer_stride
                + level.offset,
            format,
            width: level.width,
            height: level.height,
            depth_or_layers,
            samples: layout.ms_mode.samples(),
            row_pitch: level.row_pitch,
            slice_stride,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::memory::MemBlockConfig;

    fn image_block(device: &Device, size: u32) -> MemBlock {
        let config = MemBlockConfig::new(size)
            .with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE);
        MemBlock::new(device, config).unwrap()
    }

    #[test]
    fn mip_chain_layout() {
        let config = ImageLayoutConfig::new(ImageType::Tex2D, ImageFormat::RGBA8Unorm, [64, 64, 1])
            .with_mip_levels(7);
        let layout = ImageLayout::new(&config).unwrap();
        let level0 = layout.level(0).unwrap();
        assert_eq!(level0.row_pitch, 256);
        assert_eq!(level0.size, 16384);
        let level3 = layout.level(3).unwrap();
        assert_eq!((level3.width, level3.row_pitch, level3.size), (8, 64, 512));
        assert_eq!(layout.size(), 16384 + 4096 + 1024 + 4 * 512);
        assert!(layout.level(7).is_none());
    }

    #[test]
    fn oversized_layouts_rejected() {
        let wide =
            ImageLayoutConfig::new(ImageType::Tex2D, ImageFormat::RGBA8Unorm, [0x4000_0000, 1, 1]);
        assert!(matches!(ImageLayout::new(&wide), Err(GpuError::InvalidArgument(_))));
        let deep =
            ImageLayoutConfig::new(ImageType::Tex3D, ImageFormat::RGBA32Float, [4096, 4096, 4096]);
        assert!(matches!(ImageLayout::new(&deep), Err(GpuError::InvalidArgument(_))));
        let pitched = wide.with_flags(ImageFlags::PITCH_LINEAR);
        assert!(matches!(ImageLayout::new(&pitched), Err(GpuError::InvalidArgument(_))));
    }

    #[test]
    fn too_many_mips_rejected() {
        let config = ImageLayoutConfig::new(ImageType::Tex2D, ImageFormat::R8Unorm, [16, 16, 1])
            .with_mip_levels(6);
        assert!(ImageLayout::new(&config).is_err());
    }

    #[test]
    fn multisample_rules() {
        let ms = ImageLayoutConfig::new(ImageType::Tex2DMS, ImageFormat::RGBA8Unorm, [8, 8, 1])
            .with_ms_mode(MsMode::X4);
        let layout = ImageLayout::new(&ms).unwrap();
        assert_eq!(layout.level(0).unwrap().row_pitch, 128);

        let bad = ImageLayoutConfig::new(ImageType::Tex2D, ImageFormat::RGBA8Unorm, [8, 8, 1])
            .with_ms_mode(MsMode::X4);
        assert!(ImageLayout::new(&bad).is_err());
    }

    #[test]
    fn pitch_linear_layout() {
        let config = ImageLayoutConfig::new(ImageType::Tex2D, ImageFormat::RGBA8Unorm, [10, 4, 1])
            .with_flags(ImageFlags::PITCH_LINEAR);
        let layout = ImageLayout::new(&config).unwrap();
        assert_eq!(layout.level(0).unwrap().row_pitch, 64);
        assert_eq!(layout.size(), 256);
        assert_eq!(layout.alignment(), 32);

        let odd = config.with_pitch_stride(48);
        assert!(ImageLayout::new(&odd).is_err());
    }

    #[test]
    fn cubemap_needs_square_faces() {
        let config = ImageLayoutConfig::new(ImageType::TexCubemap, ImageFormat::RGBA8Unorm, [16, 8, 1]);
        assert!(ImageLayout::new(&config).is_err());
        let square = ImageLayoutConfig::new(ImageType::TexCubemap, ImageFormat::RGBA8Unorm, [16, 16, 1]);
        assert_eq!(ImageLayout::new(&square).unwrap().layers(), 6);
    }

    #[test]
    fn image_placement_checks() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = image_block(&device, 0x4000);
        let layout = ImageLayout::new(&ImageLayoutConfig::new(
            ImageType::Tex2D,
            ImageFormat::RGBA8Unorm,
            [32, 32, 1],
        ))
        .unwrap();

        assert!(Image::new(&layout, &block, 0x100).is_err());
        assert!(Image::new(&layout, &block, 0x3200).is_err());
        assert!(Image::new(&layout, &block, 0x3000).is_ok());
        let image = Image::new(&layout, &block, 0x1000).unwrap();
        assert_eq!(image.gpu_addr(), block.gpu_addr() + 0x1000);

        let plain = MemBlock::new(&device, MemBlockConfig::new(0x4000)).unwrap();
        assert!(Image::new(&layout, &plain, 0).is_err());
    }

    #[test]
    fn view_target_selects_layer_and_level() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = image_block(&device, 0x10000);
        let config = ImageLayoutConfig::new(ImageType::Tex2DArray, ImageFormat::RGBA8Unorm, [16, 16, 4])
            .with_mip_levels(2);
        let layout = ImageLayout::new(&config).unwrap();
        let image = Image::new(&layout, &block, 0).unwrap();

        let target = ImageView::new(&image)
            .with_layers(2, 0)
            .with_mip_levels(1, 1)
            .target()
            .unwrap();
        let level1 = layout.level(1).unwrap();
        assert_eq!(
            target.addr,
            image.gpu_addr() + 2 * layout.layer_stride() + level1.offset
        );
        assert_eq!((target.width, target.height, target.depth_or_layers), (8, 8, 2));

        assert!(ImageView::new(&image).with_layers(4, 0).target().is_err());
        assert!(ImageView::new(&image)
            .with_format(ImageFormat::RGBA16Float)
            .target()
            .is_err());
    }
}
