//! Image and sampler descriptors.
//!
//! Both descriptor kinds are 32-byte records the client writes into a memory
//! block and binds with `bind_image_descriptor_set` /
//! `bind_sampler_descriptor_set`. Shaders index them through [`ResHandle`]s.

use bytemuck::{Pod, Zeroable};
use cinder_core::constants::{IMAGE_DESCRIPTOR_SIZE, SAMPLER_DESCRIPTOR_SIZE};
use cinder_core::{
    CompareOp, DsSource, Filter, GpuAddr, ImageFormat, ImageType, MipFilter, MsMode,
    SamplerReduction, Swizzle, WrapMode,
};

use crate::error::{GpuError, Result};
use crate::image::ImageView;

const ADDR_HI_MASK: u32 = 0xFFFF;
const LOAD_STORE_BIT: u32 = 1 << 20;
const DECAY_MS_BIT: u32 = 1 << 21;
const DS_STENCIL_BIT: u32 = 1 << 22;
/// Layer counts are stored minus one in 16 bits.
const MAX_DESCRIPTOR_LAYERS: u32 = 0x1_0000;

/// Reference to a descriptor pair used by texture and image bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResHandle(u32);

impl ResHandle {
    const IMAGE_ID_BITS: u32 = 20;
    const IMAGE_ID_MASK: u32 = (1 << Self::IMAGE_ID_BITS) - 1;

    /// Combined image and sampler descriptor indices.
    pub const fn texture(image_id: u32, sampler_id: u32) -> Self {
        Self((image_id & Self::IMAGE_ID_MASK) | (sampler_id << Self::IMAGE_ID_BITS))
    }

    /// Image descriptor index for load/store access.
    pub const fn image(image_id: u32) -> Self {
        Self(image_id & Self::IMAGE_ID_MASK)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn image_id(self) -> u32 {
        self.0 & Self::IMAGE_ID_MASK
    }

    pub const fn sampler_id(self) -> u32 {
        self.0 >> Self::IMAGE_ID_BITS
    }
}

/// Binary image descriptor.
///
/// Word layout: `[addr_lo, addr_hi | type << 16 | samples_log2 << 24,
/// format | swizzle << 8 | flags, width - 1, height - 1, depth_or_layers - 1
/// | mip_count << 16 | base_mip << 24, row_pitch, slice_stride]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageDescriptor {
    words: [u32; 8],
}

impl ImageDescriptor {
    /// Describe the subresource selected by `view`.
    pub fn new(view: &ImageView<'_>, uses_load_or_store: bool, decay_ms: bool) -> Result<Self> {
        let target = view.target()?;
        if target.depth_or_layers > MAX_DESCRIPTOR_LAYERS {
            return Err(GpuError::InvalidArgument(format!(
                "{} layers exceed the descriptor limit of {MAX_DESCRIPTOR_LAYERS}",
                target.depth_or_layers
            )));
        }
        let (base_mip, mip_count) = view.mip_levels()?;
        let layout = view.image().layout();
        let mut ty = view.image_type();
        let mut samples = layout.ms_mode().raw();
        if decay_ms && ty.is_multisampled() {
            ty = if ty == ImageType::Tex2DMSArray {
                ImageType::Tex2DArray
            } else {
                ImageType::Tex2D
            };
            samples = 0;
        }

        let swizzle = view
            .swizzle()
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, s)| acc | (s.raw() << (i * 3)));
        let mut flags = 0;
        if uses_load_or_store {
            flags |= LOAD_STORE_BIT;
        }
        if decay_ms {
            flags |= DECAY_MS_BIT;
        }
        if view.ds_source() == DsSource::Stencil {
            flags |= DS_STENCIL_BIT;
        }

        Ok(Self {
            words: [
                target.addr as u32,
                ((target.addr >> 32) as u32 & ADDR_HI_MASK) | (ty.raw() << 16) | (samples << 24),
                target.format.raw() | (swizzle << 8) | flags,
                target.width - 1,
                target.height - 1,
                (target.depth_or_layers - 1) | (mip_count << 16) | (base_mip << 24),
                target.row_pitch,
                target.slice_stride,
            ],
        })
    }

    /// Parse a descriptor from its binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IMAGE_DESCRIPTOR_SIZE as usize {
            return Err(GpuError::InvalidArgument(format!(
                "image descriptor must be {IMAGE_DESCRIPTOR_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let desc: Self = bytemuck::pod_read_unaligned(bytes);
        if desc.ms_mode().is_none() {
            return Err(GpuError::InvalidArgument(format!(
                "image descriptor sample code {} is not a valid MS mode",
                desc.words[1] >> 24
            )));
        }
        Ok(desc)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub const fn gpu_addr(&self) -> GpuAddr {
        self.words[0] as u64 | (((self.words[1] & ADDR_HI_MASK) as u64) << 32)
    }

    pub const fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_raw(self.words[2] & 0xFF)
    }

    pub const fn image_type(&self) -> Option<ImageType> {
        ImageType::from_raw((self.words[1] >> 16) & 0xFF)
    }

    pub const fn ms_mode(&self) -> Option<MsMode> {
        MsMode::from_raw(self.words[1] >> 24)
    }

    /// Samples per pixel, or 0 if the sample code is unknown.
    pub const fn samples(&self) -> u32 {
        match self.ms_mode() {
            Some(mode) => mode.samples(),
            None => 0,
        }
    }

    pub fn swizzle(&self) -> [Option<Swizzle>; 4] {
        let packed = (self.words[2] >> 8) & 0xFFF;
        std::array::from_fn(|i| Swizzle::from_raw((packed >> (i * 3)) & 0x7))
    }

    pub const fn uses_load_or_store(&self) -> bool {
        self.words[2] & LOAD_STORE_BIT != 0
    }

    pub const fn width(&self) -> u32 {
        self.words[3] + 1
    }

    pub const fn height(&self) -> u32 {
        self.words[4] + 1
    }

    pub const fn depth_or_layers(&self) -> u32 {
        (self.words[5] & 0xFFFF) + 1
    }

    pub const fn mip_levels(&self) -> u32 {
        (self.words[5] >> 16) & 0xFF
    }

    pub const fn row_pitch(&self) -> u32 {
        self.words[6]
    }

    pub const fn slice_stride(&self) -> u32 {
        self.words[7]
    }
}

/// Sampler configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: MipFilter,
    pub wrap_mode: [WrapMode; 3],
    pub lod_clamp: (f32, f32),
    pub lod_bias: f32,
    pub lod_snap: f32,
    pub compare_enable: bool,
    pub compare_op: CompareOp,
    pub border_color: [u32; 4],
    pub max_anisotropy: f32,
    pub reduction_mode: SamplerReduction,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            min_filter: Filter::Nearest,
            mag_filter: Filter::Nearest,
            mip_filter: MipFilter::None,
            wrap_mode: [WrapMode::Repeat; 3],
            lod_clamp: (0.0, 1000.0),
            lod_bias: 0.0,
            lod_snap: 0.0,
            compare_enable: false,
            compare_op: CompareOp::Less,
            border_color: [0; 4],
            max_anisotropy: 1.0,
            reduction_mode: SamplerReduction::WeightedAverage,
        }
    }
}

impl Sampler {
    pub fn with_filter(mut self, min: Filter, mag: Filter, mip: MipFilter) -> Self {
        self.min_filter = min;
        self.mag_filter = mag;
        self.mip_filter = mip;
        self
    }

    pub fn with_wrap_mode(mut self, u: WrapMode, v: WrapMode, p: WrapMode) -> Self {
        self.wrap_mode = [u, v, p];
        self
    }

    pub fn with_lod_clamp(mut self, min: f32, max: f32) -> Self {
        self.lod_clamp = (min, max);
        self
    }

    pub fn with_lod_bias(mut self, bias: f32) -> Self {
        self.lod_bias = bias;
        self
    }

    pub fn with_lod_snap(mut self, snap: f32) -> Self {
        self.lod_snap = snap;
        self
    }

    pub fn with_depth_compare(mut self, enable: bool, op: CompareOp) -> Self {
        self.compare_enable = enable;
        self.compare_op = op;
        self
    }

    pub fn with_border_color_float(mut self, color: [f32; 4]) -> Self {
        self.border_color = color.map(f32::to_bits);
        self
    }

    pub fn with_border_color_uint(mut self, color: [u32; 4]) -> Self {
        self.border_color = color;
        self
    }

    pub fn with_max_anisotropy(mut self, anisotropy: f32) -> Self {
        self.max_anisotropy = anisotropy;
        self
    }

    pub fn with_reduction_mode(mut self, mode: SamplerReduction) -> Self {
        self.reduction_mode = mode;
        self
    }
}

/// Unsigned 4.8 fixed point, saturating.
fn to_ufixed_4_8(value: f32) -> u32 {
    (value.clamp(0.0, 15.0) * 256.0).round() as u32
}

/// Signed 5.8 fixed point in 13 bits, saturating.
fn to_sfixed_5_8(value: f32) -> u32 {
    ((value.clamp(-16.0, 15.996) * 256.0).round() as i32 as u32) & 0x1FFF
}

fn from_sfixed_5_8(raw: u32) -> f32 {
    // Sign-extend from 13 bits.
    (((raw << 19) as i32) >> 19) as f32 / 256.0
}

/// Binary sampler descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SamplerDescriptor {
    words: [u32; 8],
}

impl SamplerDescriptor {
    pub fn new(sampler: &Sampler) -> Self {
        let w0 = sampler.min_filter.raw()
            | sampler.mag_filter.raw() << 2
            | sampler.mip_filter.raw() << 4
            | sampler.wrap_mode[0].raw() << 8
            | sampler.wrap_mode[1].raw() << 12
            | sampler.wrap_mode[2].raw() << 16
            | u32::from(sampler.compare_enable) << 20
            | sampler.compare_op.raw() << 21
            | sampler.reduction_mode.raw() << 25;
        let w1 = to_ufixed_4_8(sampler.lod_clamp.0) | to_ufixed_4_8(sampler.lod_clamp.1) << 12;
        let w2 = to_sfixed_5_8(sampler.lod_bias) | to_ufixed_4_8(sampler.lod_snap.min(1.0)) << 16;
        let w3 = sampler.max_anisotropy.clamp(1.0, 16.0) as u32;
        let [b0, b1, b2, b3] = sampler.border_color;
        Self {
            words: [w0, w1, w2, w3, b0, b1, b2, b3],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SAMPLER_DESCRIPTOR_SIZE as usize {
            return Err(GpuError::InvalidArgument(format!(
                "sampler descriptor must be {SAMPLER_DESCRIPTOR_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub const fn min_filter(&self) -> Option<Filter> {
        Filter::from_raw(self.words[0] & 0x3)
    }

    pub const fn mag_filter(&self) -> Option<Filter> {
        Filter::from_raw((self.words[0] >> 2) & 0x3)
    }

    pub const fn mip_filter(&self) -> Option<MipFilter> {
        MipFilter::from_raw((self.words[0] >> 4) & 0x3)
    }

    pub fn wrap_mode(&self) -> [Option<WrapMode>; 3] {
        std::array::from_fn(|i| WrapMode::from_raw((self.words[0] >> (8 + i * 4)) & 0xF))
    }

    pub const fn compare(&self) -> (bool, Option<CompareOp>) {
        (
            self.words[0] & (1 << 20) != 0,
            CompareOp::from_raw((self.words[0] >> 21) & 0xF),
        )
    }

    pub fn lod_clamp(&self) -> (f32, f32) {
        (
            (self.words[1] & 0xFFF) as f32 / 256.0,
            ((self.words[1] >> 12) & 0xFFF) as f32 / 256.0,
        )
    }

    pub fn lod_bias(&self) -> f32 {
        from_sfixed_5_8(self.words[2] & 0x1FFF)
    }

    pub const fn max_anisotropy(&self) -> u32 {
        self.words[3]
    }

    pub const fn border_color(&self) -> [u32; 4] {
        [self.words[4], self.words[5], self.words[6], self.words[7]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::image::{Image, ImageLayout, ImageLayoutConfig};
    use crate::memory::{MemBlock, MemBlockConfig, MemBlockFlags};
    use approx::assert_relative_eq;

    #[test]
    fn res_handle_packing() {
        let handle = ResHandle::texture(5, 3);
        assert_eq!(handle.image_id(), 5);
        assert_eq!(handle.sampler_id(), 3);
        assert_eq!(ResHandle::image(9).sampler_id(), 0);
    }

    #[test]
    fn image_descriptor_preserves_address_and_format() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = MemBlock::new(
            &device,
            MemBlockConfig::new(0x10000).with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE),
        )
        .unwrap();
        let layout = ImageLayout::new(&ImageLayoutConfig::new(
            ImageType::Tex2D,
            ImageFormat::BGRA8UnormSrgb,
            [40, 20, 1],
        ))
        .unwrap();
        let image = Image::new(&layout, &block, 0x2000).unwrap();
        let view = ImageView::new(&image).with_swizzle([
            Swizzle::Blue,
            Swizzle::Green,
            Swizzle::Red,
            Swizzle::One,
        ]);

        let desc = ImageDescriptor::new(&view, true, false).unwrap();
        block.write_range(0, &[desc]).unwrap();

        let mut bytes = [0u8; 32];
        block.read_bytes(0, &mut bytes).unwrap();
        let read = ImageDescriptor::from_bytes(&bytes).unwrap();
        assert_eq!(read, desc);
        assert_eq!(read.gpu_addr(), image.gpu_addr());
        assert_eq!(read.format(), Some(ImageFormat::BGRA8UnormSrgb));
        assert_eq!(read.image_type(), Some(ImageType::Tex2D));
        assert_eq!((read.width(), read.height()), (40, 20));
        assert_eq!(read.swizzle()[3], Some(Swizzle::One));
        assert!(read.uses_load_or_store());
        assert!(ImageDescriptor::from_bytes(&bytes[..16]).is_err());
        assert_eq!(read.samples(), 1);

        // Sample codes past the largest MS mode are rejected.
        bytes[7] = 40;
        assert!(matches!(
            ImageDescriptor::from_bytes(&bytes),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn descriptor_layer_limit() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = MemBlock::new(
            &device,
            MemBlockConfig::new(0x200_1000)
                .with_flags(MemBlockFlags::default() | MemBlockFlags::IMAGE),
        )
        .unwrap();
        let layout = ImageLayout::new(&ImageLayoutConfig::new(
            ImageType::Tex2DArray,
            ImageFormat::R8Unorm,
            [1, 1, MAX_DESCRIPTOR_LAYERS + 1],
        ))
        .unwrap();
        let image = Image::new(&layout, &block, 0).unwrap();
        let view = ImageView::new(&image);
        assert!(matches!(
            ImageDescriptor::new(&view, false, false),
            Err(GpuError::InvalidArgument(_))
        ));

        let within = view.with_layers(0, MAX_DESCRIPTOR_LAYERS);
        let desc = ImageDescriptor::new(&within, false, false).unwrap();
        assert_eq!(desc.depth_or_layers(), MAX_DESCRIPTOR_LAYERS);
    }

    #[test]
    fn sampler_descriptor_fields() {
        let sampler = Sampler::default()
            .with_filter(Filter::Linear, Filter::Nearest, MipFilter::Linear)
            .with_wrap_mode(WrapMode::ClampToEdge, WrapMode::Repeat, WrapMode::MirroredRepeat)
            .with_lod_clamp(0.5, 8.0)
            .with_lod_bias(-1.25)
            .with_depth_compare(true, CompareOp::Gequal)
            .with_border_color_float([1.0, 0.0, 0.0, 1.0]);
        let desc = SamplerDescriptor::new(&sampler);
        let read = SamplerDescriptor::from_bytes(desc.as_bytes()).unwrap();

        assert_eq!(read.min_filter(), Some(Filter::Linear));
        assert_eq!(read.mip_filter(), Some(MipFilter::Linear));
        assert_eq!(read.wrap_mode()[0], Some(WrapMode::ClampToEdge));
        assert_eq!(read.wrap_mode()[2], Some(WrapMode::MirroredRepeat));
        assert_eq!(read.compare(), (true, Some(CompareOp::Gequal)));
        let (min, max) = read.lod_clamp();
        assert_relative_eq!(min, 0.5);
        assert_relative_eq!(max, 8.0);
        assert_relative_eq!(read.lod_bias(), -1.25);
        assert_eq!(read.border_color()[0], 1.0f32.to_bits());
        assert_eq!(read.max_anisotropy(), 1);
    }
}
