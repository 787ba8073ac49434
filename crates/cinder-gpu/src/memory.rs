//! Memory blocks.
//!
//! A memory block is the substrate every other object lives in. The GPU side
//! sees the block's backing store directly. Blocks created with
//! [`MemBlockFlags::CPU_CACHED`] give the CPU a private copy that has to be
//! flushed before the GPU observes CPU writes, and invalidated before the CPU
//! observes GPU writes.

use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::Pod;
use cinder_core::constants::MEMBLOCK_ALIGNMENT;
use cinder_core::GpuAddr;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::device::{Device, MemoryProvider};
use crate::error::{GpuError, Result};

bitflags! {
    /// Memory block placement and caching flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemBlockFlags: u32 {
        const CPU_UNCACHED   = 1 << 0;
        const CPU_CACHED     = 1 << 1;
        const GPU_UNCACHED   = 1 << 2;
        const GPU_CACHED     = 1 << 3;
        /// The block may hold shader code.
        const CODE           = 1 << 4;
        /// The block may hold images.
        const IMAGE          = 1 << 5;
        /// Clear the block to zero on creation.
        const ZERO_FILL_INIT = 1 << 6;
    }
}

impl Default for MemBlockFlags {
    fn default() -> Self {
        Self::CPU_UNCACHED | Self::GPU_CACHED
    }
}

impl MemBlockFlags {
    pub const fn has_cpu_access(self) -> bool {
        self.intersects(Self::CPU_UNCACHED.union(Self::CPU_CACHED))
    }
}

/// Memory block configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemBlockConfig {
    /// Size in bytes; a non-zero multiple of `MEMBLOCK_ALIGNMENT`.
    pub size: u32,
    pub flags: MemBlockFlags,
}

impl Default for MemBlockConfig {
    fn default() -> Self {
        Self {
            size: MEMBLOCK_ALIGNMENT,
            flags: MemBlockFlags::default(),
        }
    }
}

impl MemBlockConfig {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: MemBlockFlags) -> Self {
        self.flags = flags;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size % MEMBLOCK_ALIGNMENT != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "memory block size {:#x} is not a non-zero multiple of {MEMBLOCK_ALIGNMENT:#x}",
                self.size
            )));
        }
        if self
            .flags
            .contains(MemBlockFlags::CPU_UNCACHED | MemBlockFlags::CPU_CACHED)
        {
            return Err(GpuError::InvalidArgument(
                "CPU_UNCACHED and CPU_CACHED are mutually exclusive".to_string(),
            ));
        }
        if self
            .flags
            .contains(MemBlockFlags::GPU_UNCACHED | MemBlockFlags::GPU_CACHED)
        {
            return Err(GpuError::InvalidArgument(
                "GPU_UNCACHED and GPU_CACHED are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backing store of a memory block, shared with the executor.
pub(crate) struct BlockStorage {
    gpu_addr: GpuAddr,
    size: usize,
    flags: MemBlockFlags,
    data: RwLock<Box<[u8]>>,
    cpu_cache: Option<Mutex<Box<[u8]>>>,
    provider: Arc<dyn MemoryProvider>,
}

impl BlockStorage {
    pub(crate) const fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }

    pub(crate) const fn flags(&self) -> MemBlockFlags {
        self.flags
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(GpuError::InvalidArgument(format!(
                "range {offset:#x}+{len:#x} exceeds block size {size:#x}"
            )));
        }
        Ok(())
    }

    pub(crate) fn gpu_read(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.data.read()[offset..offset + out.len()]);
    }

    pub(crate) fn gpu_write(&self, offset: usize, data: &[u8]) {
        self.data.write()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub(crate) fn cpu_read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if !self.flags.has_cpu_access() {
            return Err(GpuError::NoCpuAccess);
        }
        self.check_range(offset, out.len())?;
        match &self.cpu_cache {
            Some(cache) => out.copy_from_slice(&cache.lock()[offset..offset + out.len()]),
            None => self.gpu_read(offset, out),
        }
        Ok(())
    }

    pub(crate) fn cpu_write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if !self.flags.has_cpu_access() {
            return Err(GpuError::NoCpuAccess);
        }
        self.check_range(offset, data.len())?;
        match &self.cpu_cache {
            Some(cache) => cache.lock()[offset..offset + data.len()].copy_from_slice(data),
            None => self.gpu_write(offset, data),
        }
        Ok(())
    }

    /// Make CPU writes in the range visible to the GPU.
    pub(crate) fn flush(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        if let Some(cache) = &self.cpu_cache {
            let cache = cache.lock();
            self.data.write()[offset..offset + len].copy_from_slice(&cache[offset..offset + len]);
        }
        Ok(())
    }

    /// Make GPU writes in the range visible to the CPU.
    pub(crate) fn invalidate(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        if let Some(cache) = &self.cpu_cache {
            let data = self.data.read();
            cache.lock()[offset..offset + len].copy_from_slice(&data[offset..offset + len]);
        }
        Ok(())
    }
}

impl Drop for BlockStorage {
    fn drop(&mut self) {
        self.provider.release(std::mem::take(self.data.get_mut()));
        if let Some(cache) = self.cpu_cache.take() {
            self.provider.release(cache.into_inner());
        }
    }
}

/// A block of CPU- and/or GPU-visible memory.
///
/// The GPU address stays fixed for the lifetime of the block and is never
/// handed out again by the same device. Dropping the block unmaps it; work
/// still referencing its range faults.
pub struct MemBlock {
    device: Device,
    storage: Arc<BlockStorage>,
}

impl MemBlock {
    /// Allocate and map a memory block.
    pub fn new(device: &Device, config: MemBlockConfig) -> Result<Self> {
        config.validate()?;

        let size = config.size as usize;
        let provider = Arc::clone(device.provider());
        let mut data = provider
            .allocate(size)
            .ok_or(GpuError::OutOfDeviceMemory {
                requested: u64::from(config.size),
            })?;
        if config.flags.contains(MemBlockFlags::ZERO_FILL_INIT) {
            data.fill(0);
        }

        let cpu_cache = if config.flags.contains(MemBlockFlags::CPU_CACHED) {
            let Some(mut cache) = provider.allocate(size) else {
                provider.release(data);
                return Err(GpuError::OutOfDeviceMemory {
                    requested: u64::from(config.size),
                });
            };
            cache.copy_from_slice(&data);
            Some(Mutex::new(cache))
        } else {
            None
        };

        let storage = device.map_block(config.size, |gpu_addr| BlockStorage {
            gpu_addr,
            size,
            flags: config.flags,
            data: RwLock::new(data),
            cpu_cache,
            provider,
        });

        debug!(
            device = device.id(),
            gpu_addr = format_args!("{:#x}", storage.gpu_addr()),
            size = config.size,
            flags = ?config.flags,
            "Created memory block"
        );

        Ok(Self {
            device: device.clone(),
            storage,
        })
    }

    pub fn gpu_addr(&self) -> GpuAddr {
        self.storage.gpu_addr()
    }

    pub fn size(&self) -> u32 {
        self.storage.size() as u32
    }

    pub fn flags(&self) -> MemBlockFlags {
        self.storage.flags()
    }

    pub fn has_cpu_access(&self) -> bool {
        self.flags().has_cpu_access()
    }

    pub(crate) fn storage(&self) -> &Arc<BlockStorage> {
        &self.storage
    }

    /// Write data at the start of the block.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write_range(0, data)
    }

    /// Write raw bytes at the given offset.
    pub fn write_bytes(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.storage.cpu_write(offset as usize, data)
    }

    /// Write typed data at the given offset.
    pub fn write_range<T: Pod>(&self, offset: u32, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read raw bytes at the given offset.
    pub fn read_bytes(&self, offset: u32, out: &mut [u8]) -> Result<()> {
        self.storage.cpu_read(offset as usize, out)
    }

    /// Read `count` values of `T` at the given offset.
    pub fn read_range<T: Pod>(&self, offset: u32, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.read_bytes(offset, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Make CPU writes in `[offset, offset + size)` visible to the GPU.
    pub fn flush_cpu_cache(&self, offset: u32, size: u32) -> Result<()> {
        self.storage.flush(offset as usize, size as usize)
    }

    /// Make GPU writes in `[offset, offset + size)` visible to the CPU.
    pub fn invalidate_cpu_cache(&self, offset: u32, size: u32) -> Result<()> {
        self.storage.invalidate(offset as usize, size as usize)
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        self.device.unmap_block(self.gpu_addr());
        debug!(
            gpu_addr = format_args!("{:#x}", self.gpu_addr()),
            "Destroyed memory block"
        );
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("gpu_addr", &format_args!("{:#x}", self.gpu_addr()))
            .field("size", &self.size())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;

    fn device() -> Device {
        Device::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn rejects_unaligned_size() {
        let device = device();
        assert!(matches!(
            MemBlock::new(&device, MemBlockConfig::new(0)),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            MemBlock::new(&device, MemBlockConfig::new(0x1800)),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_conflicting_flags() {
        let config = MemBlockConfig::new(0x1000)
            .with_flags(MemBlockFlags::CPU_CACHED | MemBlockFlags::CPU_UNCACHED);
        assert!(MemBlock::new(&device(), config).is_err());
    }

    #[test]
    fn uncached_write_read() {
        let block = MemBlock::new(&device(), MemBlockConfig::new(0x1000)).unwrap();
        block.write_range(16, &[1u32, 2, 3]).unwrap();
        assert_eq!(block.read_range::<u32>(16, 3).unwrap(), vec![1, 2, 3]);
        assert!(block.write_bytes(0xffc, &[0; 8]).is_err());
    }

    #[test]
    fn cached_block_needs_flush() {
        let config = MemBlockConfig::new(0x1000)
            .with_flags(MemBlockFlags::CPU_CACHED | MemBlockFlags::GPU_CACHED);
        let block = MemBlock::new(&device(), config).unwrap();
        block.write(&[0xAAu8; 4]).unwrap();

        let mut gpu_view = [0u8; 4];
        block.storage().gpu_read(0, &mut gpu_view);
        assert_eq!(gpu_view, [0; 4]);

        block.flush_cpu_cache(0, 4).unwrap();
        block.storage().gpu_read(0, &mut gpu_view);
        assert_eq!(gpu_view, [0xAA; 4]);

        block.storage().gpu_write(8, &[7; 4]);
        assert_eq!(block.read_range::<u8>(8, 4).unwrap(), vec![0; 4]);
        block.invalidate_cpu_cache(0, 0x1000).unwrap();
        assert_eq!(block.read_range::<u8>(8, 4).unwrap(), vec![7; 4]);
    }

    #[test]
    fn cache_ops_check_range() {
        let block = MemBlock::new(&device(), MemBlockConfig::new(0x1000)).unwrap();
        assert!(block.flush_cpu_cache(0, 0x1000).is_ok());
        assert!(matches!(
            block.flush_cpu_cache(0x800, 0x801),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(block.invalidate_cpu_cache(0x1000, 1).is_err());
    }

    #[test]
    fn gpu_only_block_has_no_cpu_access() {
        let config = MemBlockConfig::new(0x1000).with_flags(MemBlockFlags::GPU_CACHED);
        let block = MemBlock::new(&device(), config).unwrap();
        assert!(!block.has_cpu_access());
        assert!(matches!(block.write(&[1u32]), Err(GpuError::NoCpuAccess)));
    }
}
