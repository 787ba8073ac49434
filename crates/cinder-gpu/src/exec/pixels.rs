//! Texel access for clears, copies, blits and resolves.
//!
//! Texels are decoded to `[f64; 4]` in the format's numeric domain: normalized
//! formats map to `0..=1` (or `-1..=1`), integer formats keep their integer
//! value and float formats their float value. Missing components read as
//! `(0, 0, 0, 1)`.

use cinder_core::{BlitFlags, BlitRect, ColorMask, ComponentKind, CopyBuf, ImageFormat, ViewTarget};

use crate::device::Device;
use crate::error::{GpuError, Result};

fn fault(msg: impl Into<String>) -> GpuError {
    GpuError::DeviceFault(msg.into())
}

/// A view target loaded into host memory.
pub(crate) struct Surface {
    target: ViewTarget,
    bytes: Vec<u8>,
}

impl Surface {
    pub(crate) fn load(device: &Device, target: &ViewTarget) -> Result<Self> {
        let bytes = device.read_gpu_vec(target.addr, target.span())?;
        Ok(Self {
            target: *target,
            bytes,
        })
    }

    pub(crate) fn store(&self, device: &Device) -> Result<()> {
        device.write_gpu(self.target.addr, &self.bytes)
    }

    fn sample_offset(&self, x: u32, y: u32, z: u32, sample: u32) -> usize {
        (self.target.pixel_offset(x, y, z) + u64::from(sample * self.target.format.texel_size()))
            as usize
    }

    fn pixel(&self, x: u32, y: u32, z: u32) -> &[u8] {
        let start = self.sample_offset(x, y, z, 0);
        &self.bytes[start..start + self.target.pixel_size() as usize]
    }

    fn pixel_mut(&mut self, x: u32, y: u32, z: u32) -> &mut [u8] {
        let start = self.sample_offset(x, y, z, 0);
        let len = self.target.pixel_size() as usize;
        &mut self.bytes[start..start + len]
    }

    fn read(&self, x: u32, y: u32, z: u32, sample: u32) -> [f64; 4] {
        let start = self.sample_offset(x, y, z, sample);
        let size = self.target.format.texel_size() as usize;
        decode(self.target.format, &self.bytes[start..start + size])
    }

    fn write(&mut self, x: u32, y: u32, z: u32, sample: u32, value: [f64; 4]) {
        let start = self.sample_offset(x, y, z, sample);
        let size = self.target.format.texel_size() as usize;
        encode(self.target.format, value, &mut self.bytes[start..start + size]);
    }

    /// Write `value` to every sample of a pixel.
    fn write_pixel(&mut self, x: u32, y: u32, z: u32, value: [f64; 4]) {
        for s in 0..self.target.samples {
            self.write(x, y, z, s, value);
        }
    }

    /// Bilinear sample of sample 0 at continuous texel coordinates.
    fn sample_linear(&self, u: f64, v: f64, z: u32) -> [f64; 4] {
        let max_x = f64::from(self.target.width - 1);
        let max_y = f64::from(self.target.height - 1);
        let u = (u - 0.5).clamp(0.0, max_x);
        let v = (v - 0.5).clamp(0.0, max_y);
        let (x0, y0) = (u.floor() as u32, v.floor() as u32);
        let (x1, y1) = ((x0 + 1).min(max_x as u32), (y0 + 1).min(max_y as u32));
        let (fx, fy) = (u.fract(), v.fract());
        let lerp = |a: [f64; 4], b: [f64; 4], t: f64| -> [f64; 4] {
            std::array::from_fn(|i| a[i] + (b[i] - a[i]) * t)
        };
        let top = lerp(self.read(x0, y0, z, 0), self.read(x1, y0, z, 0), fx);
        let bottom = lerp(self.read(x0, y1, z, 0), self.read(x1, y1, z, 0), fx);
        lerp(top, bottom, fy)
    }
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1F);
    let mant = u32::from(bits & 0x3FF);
    let out = match (exp, mant) {
        (0, 0) => sign,
        (0, m) => {
            // Subnormal: renormalize.
            let shift = m.leading_zeros() - 21;
            sign | ((113 - shift) << 23) | ((m << (shift + 13)) & 0x7F_FFFF)
        }
        (0x1F, m) => sign | 0x7F80_0000 | (m << 13),
        (e, m) => sign | ((e + 112) << 23) | (m << 13),
    };
    f32::from_bits(out)
}

fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mant = bits & 0x7F_FFFF;
    if exp == 0xFF {
        return sign | 0x7C00 | if mant != 0 { 0x200 } else { 0 };
    }
    let e = exp - 112;
    if e >= 0x1F {
        sign | 0x7C00
    } else if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = (mant | 0x80_0000) >> (1 - e);
        sign | ((m + 0x1000) >> 13) as u16
    } else {
        let rounded = ((e as u32) << 10 | (mant >> 13)) + ((mant >> 12) & 1);
        sign | rounded as u16
    }
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f64) -> f64 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn read_uint(bytes: &[u8], bits: u32, index: usize) -> u64 {
    let size = (bits / 8) as usize;
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&bytes[index * size..(index + 1) * size]);
    u64::from_le_bytes(buf)
}

fn write_uint(bytes: &mut [u8], bits: u32, index: usize, value: u64) {
    let size = (bits / 8) as usize;
    bytes[index * size..(index + 1) * size].copy_from_slice(&value.to_le_bytes()[..size]);
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Decode one texel sample.
pub(crate) fn decode(format: ImageFormat, bytes: &[u8]) -> [f64; 4] {
    let mut out = [0.0, 0.0, 0.0, 1.0];
    match format {
        ImageFormat::None => {}
        ImageFormat::RGB10A2Unorm => {
            let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out = [
                f64::from(raw & 0x3FF) / 1023.0,
                f64::from((raw >> 10) & 0x3FF) / 1023.0,
                f64::from((raw >> 20) & 0x3FF) / 1023.0,
                f64::from(raw >> 30) / 3.0,
            ];
        }
        ImageFormat::Z16 => out[0] = read_uint(bytes, 16, 0) as f64 / 65535.0,
        ImageFormat::Z24S8 => {
            let raw = read_uint(bytes, 32, 0);
            out[0] = (raw & 0xFF_FFFF) as f64 / f64::from(0xFF_FFFF);
            out[1] = (raw >> 24) as f64;
        }
        ImageFormat::Z32F => out[0] = f64::from(f32::from_bits(read_uint(bytes, 32, 0) as u32)),
        ImageFormat::Z32FS8 => {
            out[0] = f64::from(f32::from_bits(read_uint(bytes, 32, 0) as u32));
            out[1] = f64::from(bytes[4]);
        }
        _ => {
            let bits = format.component_bits().unwrap_or(8);
            let kind = format.kind();
            for (i, slot) in out.iter_mut().take(format.component_count() as usize).enumerate() {
                let raw = read_uint(bytes, bits, i);
                let max = ((1u64 << (bits - 1)) - 1) as f64;
                *slot = match kind {
                    ComponentKind::Unorm => raw as f64 / ((1u64 << bits) - 1) as f64,
                    ComponentKind::Snorm => (sign_extend(raw, bits) as f64 / max).max(-1.0),
                    ComponentKind::Uint => raw as f64,
                    ComponentKind::Sint => sign_extend(raw, bits) as f64,
                    ComponentKind::Float if bits == 16 => f64::from(f16_to_f32(raw as u16)),
                    ComponentKind::Float => f64::from(f32::from_bits(raw as u32)),
                    ComponentKind::Depth => raw as f64,
                };
            }
            if format.is_bgra() {
                out.swap(0, 2);
            }
            if format.is_srgb() {
                for c in &mut out[..3] {
                    *c = srgb_to_linear(*c);
                }
            }
        }
    }
    out
}

/// Encode one texel sample.
pub(crate) fn encode(format: ImageFormat, mut value: [f64; 4], bytes: &mut [u8]) {
    match format {
        ImageFormat::None => {}
        ImageFormat::RGB10A2Unorm => {
            let q = |c: f64, max: f64| (c.clamp(0.0, 1.0) * max).round() as u32;
            let raw = q(value[0], 1023.0)
                | q(value[1], 1023.0) << 10
                | q(value[2], 1023.0) << 20
                | q(value[3], 3.0) << 30;
            bytes[..4].copy_from_slice(&raw.to_le_bytes());
        }
        ImageFormat::Z16 => write_uint(bytes, 16, 0, (value[0].clamp(0.0, 1.0) * 65535.0).round() as u64),
        ImageFormat::Z24S8 => {
            let depth = (value[0].clamp(0.0, 1.0) * f64::from(0xFF_FFFF)).round() as u64;
            let stencil = value[1].clamp(0.0, 255.0) as u64;
            write_uint(bytes, 32, 0, depth | stencil << 24);
        }
        ImageFormat::Z32F => write_uint(bytes, 32, 0, u64::from((value[0] as f32).to_bits())),
        ImageFormat::Z32FS8 => {
            write_uint(bytes, 32, 0, u64::from((value[0] as f32).to_bits()));
            bytes[4] = value[1].clamp(0.0, 255.0) as u8;
            bytes[5..8].fill(0);
        }
        _ => {
            if format.is_srgb() {
                for c in &mut value[..3] {
                    *c = linear_to_srgb(c.clamp(0.0, 1.0));
                }
            }
            if format.is_bgra() {
                value.swap(0, 2);
            }
            let bits = format.component_bits().unwrap_or(8);
            let kind = format.kind();
            let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
            for (i, c) in value.iter().take(format.component_count() as usize).enumerate() {
                let max_unsigned = ((1u64 << bits) - 1) as f64;
                let max_signed = ((1u64 << (bits - 1)) - 1) as f64;
                let raw = match kind {
                    ComponentKind::Unorm => (c.clamp(0.0, 1.0) * max_unsigned).round() as u64,
                    ComponentKind::Snorm => {
                        ((c.clamp(-1.0, 1.0) * max_signed).round() as i64) as u64 & mask
                    }
                    ComponentKind::Uint => c.clamp(0.0, max_unsigned) as u64,
                    ComponentKind::Sint => {
                        (c.clamp(-max_signed - 1.0, max_signed) as i64) as u64 & mask
                    }
                    ComponentKind::Float if bits == 16 => u64::from(f32_to_f16(*c as f32)),
                    ComponentKind::Float => u64::from((*c as f32).to_bits()),
                    ComponentKind::Depth => 0,
                };
                write_uint(bytes, bits, i, raw);
            }
        }
    }
}

/// Interpret raw clear words in the numeric domain of `format`.
fn clear_value(format: ImageFormat, data: [u32; 4]) -> [f64; 4] {
    match format.kind() {
        ComponentKind::Uint => data.map(f64::from),
        ComponentKind::Sint => data.map(|w| f64::from(w as i32)),
        _ => data.map(|w| f64::from(f32::from_bits(w))),
    }
}

pub(crate) fn clear_color(device: &Device, target: &ViewTarget, mask: ColorMask, data: [u32; 4]) -> Result<()> {
    if target.format.is_depth() {
        return Err(fault("color clear on a depth target"));
    }
    let mut surface = Surface::load(device, target)?;
    let value = clear_value(target.format, data);
    let full = mask.contains(ColorMask::RGBA);
    for z in 0..target.depth_or_layers {
        for y in 0..target.height {
            for x in 0..target.width {
                for s in 0..target.samples {
                    let texel = if full {
                        value
                    } else {
                        let old = surface.read(x, y, z, s);
                        std::array::from_fn(|i| {
                            if mask.bits() & (1 << i) != 0 {
                                value[i]
                            } else {
                                old[i]
                            }
                        })
                    };
                    surface.write(x, y, z, s, texel);
                }
            }
        }
    }
    surface.store(device)
}

pub(crate) fn clear_depth_stencil(
    device: &Device,
    target: &ViewTarget,
    clear_depth: bool,
    depth: f32,
    stencil_mask: u8,
    stencil: u8,
) -> Result<()> {
    if !target.format.is_depth() {
        return Err(fault("depth clear on a color target"));
    }
    let mut surface = Surface::load(device, target)?;
    for z in 0..target.depth_or_layers {
        for y in 0..target.height {
            for x in 0..target.width {
                for s in 0..target.samples {
                    let mut texel = surface.read(x, y, z, s);
                    if clear_depth {
                        texel[0] = f64::from(depth);
                    }
                    let old = texel[1] as u8;
                    texel[1] = f64::from((old & !stencil_mask) | (stencil & stencil_mask));
                    surface.write(x, y, z, s, texel);
                }
            }
        }
    }
    surface.store(device)
}

fn flip(coord: u32, extent: u32, flipped: bool) -> u32 {
    if flipped {
        extent - 1 - coord
    } else {
        coord
    }
}

fn check_rect(target: &ViewTarget, rect: &BlitRect) -> Result<()> {
    if rect.width == 0 || rect.height == 0 || rect.depth == 0 || !target.contains(rect) {
        return Err(fault(format!("rect {rect:?} outside image")));
    }
    Ok(())
}

/// True if the memory spans of two targets intersect.
fn spans_overlap(a: &ViewTarget, b: &ViewTarget) -> bool {
    a.addr < b.addr.saturating_add(b.span()) && b.addr < a.addr.saturating_add(a.span())
}

/// True if both targets address the same texels the same way.
fn same_surface(a: &ViewTarget, b: &ViewTarget) -> bool {
    (a.addr, a.format, a.samples, a.row_pitch, a.slice_stride)
        == (b.addr, b.format, b.samples, b.row_pitch, b.slice_stride)
}

fn boxes_intersect(a: &BlitRect, b: &BlitRect) -> bool {
    let axis = |a0: u32, a_len: u32, b0: u32, b_len: u32| {
        let (a0, a_len, b0, b_len) = (u64::from(a0), u64::from(a_len), u64::from(b0), u64::from(b_len));
        a0 < b0 + b_len && b0 < a0 + a_len
    };
    axis(a.x, a.width, b.x, b.width)
        && axis(a.y, a.height, b.y, b.height)
        && axis(a.z, a.depth, b.z, b.depth)
}

/// Texel-exact copy. Returns the number of bytes copied.
pub(crate) fn copy_image(
    device: &Device,
    src: &ViewTarget,
    src_rect: &BlitRect,
    dst: &ViewTarget,
    dst_rect: &BlitRect,
    flags: BlitFlags,
) -> Result<u64> {
    check_rect(src, src_rect)?;
    check_rect(dst, dst_rect)?;
    if src.pixel_size() != dst.pixel_size() {
        return Err(fault("copy between images of different pixel sizes"));
    }
    // Disjoint regions of one surface may be copied; any other aliasing faults.
    if spans_overlap(src, dst) && (!same_surface(src, dst) || boxes_intersect(src_rect, dst_rect)) {
        return Err(fault(format!(
            "overlapping image copy {src_rect:?} -> {dst_rect:?} at {:#x}",
            dst.addr
        )));
    }
    let source = Surface::load(device, src)?;
    let mut dest = Surface::load(device, dst)?;
    let (w, h, d) = (
        dst_rect.width.min(src_rect.width),
        dst_rect.height.min(src_rect.height),
        dst_rect.depth.min(src_rect.depth),
    );
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let sx = src_rect.x + flip(x, w, flags.contains(BlitFlags::FLIP_X));
                let sy = src_rect.y + flip(y, h, flags.contains(BlitFlags::FLIP_Y));
                let texel = source.pixel(sx, sy, src_rect.z + z).to_vec();
                dest.pixel_mut(dst_rect.x + x, dst_rect.y + y, dst_rect.z + z)
                    .copy_from_slice(&texel);
            }
        }
    }
    dest.store(device)?;
    Ok(u64::from(w) * u64::from(h) * u64::from(d) * u64::from(dst.pixel_size()))
}

/// Scaled copy with optional filtering and blending.
pub(crate) fn blit_image(
    device: &Device,
    src: &ViewTarget,
    src_rect: &BlitRect,
    dst: &ViewTarget,
    dst_rect: &BlitRect,
    flags: BlitFlags,
    factor: u32,
) -> Result<u64> {
    check_rect(src, src_rect)?;
    check_rect(dst, dst_rect)?;
    let source = Surface::load(device, src)?;
    let mut dest = Surface::load(device, dst)?;
    let scale_x = f64::from(src_rect.width) / f64::from(dst_rect.width);
    let scale_y = f64::from(src_rect.height) / f64::from(dst_rect.height);
    let blend = flags
        .contains(BlitFlags::MODE_BLEND)
        .then(|| f64::from(factor & 0xFF) / 255.0);

    for z in 0..dst_rect.depth {
        let sz = src_rect.z
            + (u64::from(z) * u64::from(src_rect.depth) / u64::from(dst_rect.depth)) as u32;
        for y in 0..dst_rect.height {
            let fy = flip(y, dst_rect.height, flags.contains(BlitFlags::FLIP_Y));
            let v = f64::from(src_rect.y) + (f64::from(fy) + 0.5) * scale_y;
            for x in 0..dst_rect.width {
                let fx = flip(x, dst_rect.width, flags.contains(BlitFlags::FLIP_X));
                let u = f64::from(src_rect.x) + (f64::from(fx) + 0.5) * scale_x;
                let mut texel = if flags.contains(BlitFlags::FILTER_LINEAR) {
                    source.sample_linear(u, v, sz)
                } else {
                    let sx = (u.floor() as u32).min(src_rect.x + src_rect.width - 1);
                    let sy = (v.floor() as u32).min(src_rect.y + src_rect.height - 1);
                    source.read(sx, sy, sz, 0)
                };
                let (dx, dy, dz) = (dst_rect.x + x, dst_rect.y + y, dst_rect.z + z);
                if let Some(f) = blend {
                    let old = dest.read(dx, dy, dz, 0);
                    texel = std::array::from_fn(|i| texel[i] * f + old[i] * (1.0 - f));
                }
                dest.write_pixel(dx, dy, dz, texel);
            }
        }
    }
    dest.store(device)?;
    Ok(dst_rect.texels() * u64::from(dst.pixel_size()))
}

/// Average the samples of `src` into single-sampled `dst`.
pub(crate) fn resolve_image(device: &Device, src: &ViewTarget, dst: &ViewTarget) -> Result<u64> {
    if src.samples < 2 || dst.samples != 1 {
        return Err(fault("resolve needs a multisampled source and single-sampled destination"));
    }
    if spans_overlap(src, dst) {
        return Err(fault("resolve source and destination overlap"));
    }
    let source = Surface::load(device, src)?;
    let mut dest = Surface::load(device, dst)?;
    let (w, h) = (src.width.min(dst.width), src.height.min(dst.height));
    let layers = src.depth_or_layers.min(dst.depth_or_layers);
    let integer = matches!(src.format.kind(), ComponentKind::Uint | ComponentKind::Sint);
    for z in 0..layers {
        for y in 0..h {
            for x in 0..w {
                let texel = if integer {
                    source.read(x, y, z, 0)
                } else {
                    let mut sum = [0.0; 4];
                    for s in 0..src.samples {
                        let t = source.read(x, y, z, s);
                        for i in 0..4 {
                            sum[i] += t[i];
                        }
                    }
                    sum.map(|c| c / f64::from(src.samples))
                };
                dest.write(x, y, z, 0, texel);
            }
        }
    }
    dest.store(device)?;
    Ok(u64::from(w) * u64::from(h) * u64::from(layers) * u64::from(dst.pixel_size()))
}

/// Byte offset of a texel in a linear buffer described by `buf`.
fn buffer_offset(buf: &CopyBuf, rect: &BlitRect, pixel_size: u32, x: u32, y: u32, z: u32) -> u64 {
    let row_length = if buf.row_length == 0 { rect.width } else { buf.row_length };
    let image_height = if buf.image_height == 0 { rect.height } else { buf.image_height };
    ((u64::from(z) * u64::from(image_height) + u64::from(y)) * u64::from(row_length) + u64::from(x))
        * u64::from(pixel_size)
}

/// Bytes from the buffer start to the end of the last texel, or `None` on overflow.
/// Offsets of texels inside `rect` never exceed it.
fn buffer_span(buf: &CopyBuf, rect: &BlitRect, pixel_size: u32) -> Option<u64> {
    let row_length = if buf.row_length == 0 { rect.width } else { buf.row_length };
    let image_height = if buf.image_height == 0 { rect.height } else { buf.image_height };
    u64::from(rect.depth.checked_sub(1)?)
        .checked_mul(u64::from(image_height))?
        .checked_add(u64::from(rect.height.checked_sub(1)?))?
        .checked_mul(u64::from(row_length))?
        .checked_add(u64::from(rect.width.checked_sub(1)?))?
        .checked_add(1)?
        .checked_mul(u64::from(pixel_size))
}

fn checked_buffer_span(buf: &CopyBuf, rect: &BlitRect, pixel_size: u32) -> Result<u64> {
    buffer_span(buf, rect, pixel_size).ok_or_else(|| {
        fault(format!(
            "buffer layout {}x{} for rect {rect:?} overflows",
            buf.row_length, buf.image_height
        ))
    })
}

pub(crate) fn copy_buffer_to_image(
    device: &Device,
    src: &CopyBuf,
    dst: &ViewTarget,
    dst_rect: &BlitRect,
    flags: BlitFlags,
) -> Result<u64> {
    check_rect(dst, dst_rect)?;
    let pixel_size = dst.pixel_size();
    let staging = device.read_gpu_vec(src.addr, checked_buffer_span(src, dst_rect, pixel_size)?)?;
    let mut dest = Surface::load(device, dst)?;
    for z in 0..dst_rect.depth {
        for y in 0..dst_rect.height {
            for x in 0..dst_rect.width {
                let bx = flip(x, dst_rect.width, flags.contains(BlitFlags::FLIP_X));
                let by = flip(y, dst_rect.height, flags.contains(BlitFlags::FLIP_Y));
                let offset = buffer_offset(src, dst_rect, pixel_size, bx, by, z) as usize;
                dest.pixel_mut(dst_rect.x + x, dst_rect.y + y, dst_rect.z + z)
                    .copy_from_slice(&staging[offset..offset + pixel_size as usize]);
            }
        }
    }
    dest.store(device)?;
    Ok(dst_rect.texels() * u64::from(pixel_size))
}

pub(crate) fn copy_image_to_buffer(
    device: &Device,
    src: &ViewTarget,
    src_rect: &BlitRect,
    dst: &CopyBuf,
    flags: BlitFlags,
) -> Result<u64> {
    check_rect(src, src_rect)?;
    let pixel_size = src.pixel_size();
    let source = Surface::load(device, src)?;
    // Preserve bytes between rows when the buffer pitch is wider than the rect.
    let mut staging =
        device.read_gpu_vec(dst.addr, checked_buffer_span(dst, src_rect, pixel_size)?)?;
    for z in 0..src_rect.depth {
        for y in 0..src_rect.height {
            for x in 0..src_rect.width {
                let bx = flip(x, src_rect.width, flags.contains(BlitFlags::FLIP_X));
                let by = flip(y, src_rect.height, flags.contains(BlitFlags::FLIP_Y));
                let offset = buffer_offset(dst, src_rect, pixel_size, bx, by, z) as usize;
                staging[offset..offset + pixel_size as usize]
                    .copy_from_slice(source.pixel(src_rect.x + x, src_rect.y + y, src_rect.z + z));
            }
        }
    }
    device.write_gpu(dst.addr, &staging)?;
    Ok(src_rect.texels() * u64::from(pixel_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn round_trip(format: ImageFormat, value: [f64; 4]) -> [f64; 4] {
        let mut bytes = vec![0u8; format.texel_size() as usize];
        encode(format, value, &mut bytes);
        decode(format, &bytes)
    }

    #[test]
    fn bgra_swaps_red_and_blue() {
        let mut bytes = [0u8; 4];
        encode(ImageFormat::BGRA8Unorm, [1.0, 0.0, 0.0, 1.0], &mut bytes);
        assert_eq!(bytes, [0, 0, 255, 255]);
    }

    #[test]
    fn srgb_encoding() {
        let mut bytes = [0u8; 4];
        encode(ImageFormat::RGBA8UnormSrgb, [0.5, 0.0, 1.0, 0.5], &mut bytes);
        assert_eq!(bytes, [188, 0, 255, 128]);
        let back = decode(ImageFormat::RGBA8UnormSrgb, &bytes);
        assert_relative_eq!(back[0], 0.5, epsilon = 0.01);
    }

    #[test]
    fn half_floats() {
        for v in [0.0f32, 1.0, -2.5, 0.333, 65504.0, 6.0e-5] {
            let back = f16_to_f32(f32_to_f16(v));
            assert_relative_eq!(back, v, max_relative = 1e-3);
        }
        assert_eq!(f32_to_f16(1.0), 0x3C00);
        assert!(f16_to_f32(f32_to_f16(1.0e6)).is_infinite());
    }

    #[test]
    fn integer_and_signed_formats() {
        assert_eq!(round_trip(ImageFormat::R8Sint, [-5.0, 0.0, 0.0, 1.0])[0], -5.0);
        assert_eq!(round_trip(ImageFormat::RGBA8Uint, [300.0, 7.0, 0.0, 1.0])[..2], [255.0, 7.0]);
        assert_relative_eq!(round_trip(ImageFormat::R8Snorm, [-1.0, 0.0, 0.0, 1.0])[0], -1.0);
        let missing = round_trip(ImageFormat::RG8Unorm, [1.0, 0.0, 0.5, 0.5]);
        assert_eq!(missing[2..], [0.0, 1.0]);
    }

    #[test]
    fn depth_stencil_packing() {
        let texel = round_trip(ImageFormat::Z24S8, [0.5, 42.0, 0.0, 1.0]);
        assert_relative_eq!(texel[0], 0.5, epsilon = 1e-6);
        assert_eq!(texel[1], 42.0);
        let texel = round_trip(ImageFormat::Z32FS8, [0.25, 7.0, 0.0, 1.0]);
        assert_eq!(texel[..2], [0.25, 7.0]);
    }

    #[test]
    fn buffer_addressing() {
        let rect = BlitRect::new(0, 0, 4, 2);
        let packed = CopyBuf::new(0);
        assert_eq!(buffer_offset(&packed, &rect, 4, 1, 1, 0), 20);
        assert_eq!(buffer_span(&packed, &rect, 4), Some(32));
        let pitched = CopyBuf {
            row_length: 8,
            ..packed
        };
        assert_eq!(buffer_offset(&pitched, &rect, 4, 1, 1, 0), 36);
        assert_eq!(buffer_span(&pitched, &rect, 4), Some(48));
    }

    #[test]
    fn oversized_buffer_layouts_overflow() {
        let rect = BlitRect {
            depth: u32::MAX,
            ..BlitRect::new(0, 0, u32::MAX, u32::MAX)
        };
        let buf = CopyBuf {
            row_length: u32::MAX,
            image_height: u32::MAX,
            ..CopyBuf::new(0)
        };
        assert_eq!(buffer_span(&buf, &rect, 16), None);
        assert!(checked_buffer_span(&buf, &rect, 16).is_err());
        let empty = BlitRect::new(0, 0, 0, 1);
        assert_eq!(buffer_span(&CopyBuf::new(0), &empty, 4), None);
    }
}
