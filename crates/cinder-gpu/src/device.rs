//! Device: the root object owning the GPU address space.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cinder_core::constants::MEMBLOCK_ALIGNMENT;
use cinder_core::{FenceRef, GpuAddr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::error::{GpuError, Result};
use crate::handle::{Handle, HandleTable};
use crate::memory::BlockStorage;
use crate::sync::FenceShared;

/// First address handed out to memory blocks.
const GPU_VA_BASE: GpuAddr = 0x1_0000_0000;

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(0);

/// Callback invoked with a context string on unrecoverable conditions.
pub type ErrorCallback = Arc<dyn Fn(&str, &GpuError) + Send + Sync>;

/// Source of host storage for memory blocks and queue command memory.
pub trait MemoryProvider: Send + Sync {
    /// Allocate `size` bytes, or `None` if the request cannot be satisfied.
    fn allocate(&self, size: usize) -> Option<Box<[u8]>>;

    /// Return storage obtained from [`MemoryProvider::allocate`].
    fn release(&self, storage: Box<[u8]>);
}

/// Heap-backed provider with an optional byte budget.
#[derive(Debug, Default)]
pub struct SystemMemory {
    budget: Option<u64>,
    used: AtomicU64,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse allocations once `bytes` are outstanding.
    pub fn with_budget(bytes: u64) -> Self {
        Self {
            budget: Some(bytes),
            used: AtomicU64::new(0),
        }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

impl MemoryProvider for SystemMemory {
    fn allocate(&self, size: usize) -> Option<Box<[u8]>> {
        let size64 = size as u64;
        let prev = self.used.fetch_add(size64, Ordering::AcqRel);
        if let Some(budget) = self.budget {
            if prev + size64 > budget {
                self.used.fetch_sub(size64, Ordering::AcqRel);
                return None;
            }
        }
        Some(vec![0u8; size].into_boxed_slice())
    }

    fn release(&self, storage: Box<[u8]>) {
        self.used.fetch_sub(storage.len() as u64, Ordering::AcqRel);
    }
}

/// Device configuration.
#[derive(Clone, Default)]
pub struct DeviceConfig {
    provider: Option<Arc<dyn MemoryProvider>>,
    on_error: Option<ErrorCallback>,
    memory_budget: Option<u64>,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route all host allocations through `provider`.
    pub fn with_memory_provider(mut self, provider: Arc<dyn MemoryProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Install the callback invoked on queue faults.
    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &GpuError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Budget for the default provider. Ignored when a provider is set.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

/// Bookkeeping for a live command buffer.
pub(crate) struct CmdBufSlot {
    pub(crate) epoch: u32,
}

pub(crate) type CmdBufHandle = Handle<CmdBufSlot>;
pub(crate) type FenceHandle = Handle<Weak<FenceShared>>;

struct AddressSpace {
    next: GpuAddr,
    blocks: BTreeMap<GpuAddr, Arc<BlockStorage>>,
}

struct DeviceShared {
    id: u32,
    provider: Arc<dyn MemoryProvider>,
    on_error: ErrorCallback,
    address_space: RwLock<AddressSpace>,
    fences: Mutex<HandleTable<Weak<FenceShared>>>,
    cmdbufs: Mutex<HandleTable<CmdBufSlot>>,
}

/// Handle to a device. Cloning is cheap and shares the device.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Create a device.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let provider = config.provider.unwrap_or_else(|| match config.memory_budget {
            Some(bytes) => Arc::new(SystemMemory::with_budget(bytes)),
            None => Arc::new(SystemMemory::new()),
        });
        let on_error = config.on_error.unwrap_or_else(|| {
            Arc::new(|context: &str, err: &GpuError| {
                error!(context, error = %err, "Unrecoverable GPU error");
            })
        });

        debug!(device = id, "Created device");

        Ok(Self {
            shared: Arc::new(DeviceShared {
                id,
                provider,
                on_error,
                address_space: RwLock::new(AddressSpace {
                    next: GPU_VA_BASE,
                    blocks: BTreeMap::new(),
                }),
                fences: Mutex::new(HandleTable::new()),
                cmdbufs: Mutex::new(HandleTable::new()),
            }),
        })
    }

    /// Process-unique device id, used in logs and thread names.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Number of memory blocks currently mapped.
    pub fn mapped_block_count(&self) -> usize {
        self.shared.address_space.read().blocks.len()
    }

    pub(crate) fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.shared.provider
    }

    /// Forward an unrecoverable condition to the client's error callback.
    pub(crate) fn report_error(&self, context: &str, err: &GpuError) {
        (self.shared.on_error)(context, err);
    }

    /// Assign a fresh address range and map the storage built for it.
    pub(crate) fn map_block<F>(&self, size: u32, build: F) -> Arc<BlockStorage>
    where
        F: FnOnce(GpuAddr) -> BlockStorage,
    {
        let mut space = self.shared.address_space.write();
        let addr = space.next;
        // Addresses are never reused; a guard page separates neighbours.
        space.next += u64::from(size) + u64::from(MEMBLOCK_ALIGNMENT);
        let storage = Arc::new(build(addr));
        space.blocks.insert(addr, Arc::clone(&storage));
        storage
    }

    pub(crate) fn unmap_block(&self, addr: GpuAddr) {
        self.shared.address_space.write().blocks.remove(&addr);
    }

    /// Find the block backing `[addr, addr + len)`.
    pub(crate) fn resolve(&self, addr: GpuAddr, len: u64) -> Result<(Arc<BlockStorage>, usize)> {
        let space = self.shared.address_space.read();
        let unmapped = || GpuError::DeviceFault(format!("access to unmapped range {addr:#x}+{len:#x}"));
        let (&base, storage) = space.blocks.range(..=addr).next_back().ok_or_else(unmapped)?;
        let offset = addr - base;
        if offset.checked_add(len).map_or(true, |end| end > storage.size() as u64) {
            return Err(unmapped());
        }
        Ok((Arc::clone(storage), offset as usize))
    }

    /// Read through the GPU view of memory.
    pub(crate) fn read_gpu(&self, addr: GpuAddr, out: &mut [u8]) -> Result<()> {
        let (storage, offset) = self.resolve(addr, out.len() as u64)?;
        storage.gpu_read(offset, out);
        Ok(())
    }

    /// Read `len` bytes through the GPU view of memory into a new buffer.
    /// The range is resolved before anything is allocated.
    pub(crate) fn read_gpu_vec(&self, addr: GpuAddr, len: u64) -> Result<Vec<u8>> {
        let (storage, offset) = self.resolve(addr, len)?;
        let mut out = vec![0u8; len as usize];
        storage.gpu_read(offset, &mut out);
        Ok(out)
    }

    /// Write through the GPU view of memory.
    pub(crate) fn write_gpu(&self, addr: GpuAddr, data: &[u8]) -> Result<()> {
        let (storage, offset) = self.resolve(addr, data.len() as u64)?;
        storage.gpu_write(offset, data);
        Ok(())
    }

    pub(crate) fn register_fence(&self, fence: Weak<FenceShared>) -> FenceHandle {
        self.shared.fences.lock().insert(fence)
    }

    pub(crate) fn unregister_fence(&self, handle: FenceHandle) {
        self.shared.fences.lock().remove(handle);
    }

    /// Look up a fence referenced from the command stream.
    pub(crate) fn lookup_fence(&self, fence: &FenceRef) -> Option<Arc<FenceShared>> {
        let handle = FenceHandle::from_raw(fence.index, fence.generation);
        self.shared.fences.lock().get(handle).and_then(Weak::upgrade)
    }

    pub(crate) fn register_cmdbuf(&self) -> CmdBufHandle {
        self.shared.cmdbufs.lock().insert(CmdBufSlot { epoch: 0 })
    }

    pub(crate) fn unregister_cmdbuf(&self, handle: CmdBufHandle) {
        self.shared.cmdbufs.lock().remove(handle);
    }

    pub(crate) fn set_cmdbuf_epoch(&self, handle: CmdBufHandle, epoch: u32) {
        if let Some(slot) = self.shared.cmdbufs.lock().get_mut(handle) {
            slot.epoch = epoch;
        }
    }

    /// Current epoch of a command buffer, or `None` once it was dropped.
    pub(crate) fn cmdbuf_epoch(&self, handle: CmdBufHandle) -> Option<u32> {
        self.shared.cmdbufs.lock().get(handle).map(|slot| slot.epoch)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("id", &self.shared.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemBlock, MemBlockConfig};

    #[test]
    fn system_memory_budget() {
        let mem = SystemMemory::with_budget(0x2000);
        let a = mem.allocate(0x1000).unwrap();
        let b = mem.allocate(0x1000).unwrap();
        assert!(mem.allocate(1).is_none());
        assert_eq!(mem.used(), 0x2000);
        mem.release(a);
        mem.release(b);
        assert_eq!(mem.used(), 0);
    }

    #[test]
    fn addresses_are_never_reused() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let first = MemBlock::new(&device, MemBlockConfig::new(0x1000)).unwrap();
        let first_addr = first.gpu_addr();
        drop(first);
        let second = MemBlock::new(&device, MemBlockConfig::new(0x1000)).unwrap();
        assert!(second.gpu_addr() > first_addr);
        assert_eq!(device.mapped_block_count(), 1);
    }

    #[test]
    fn resolve_checks_bounds() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = MemBlock::new(&device, MemBlockConfig::new(0x1000)).unwrap();
        assert!(device.resolve(block.gpu_addr() + 0xff0, 0x10).is_ok());
        assert!(matches!(
            device.resolve(block.gpu_addr() + 0xff0, 0x11),
            Err(GpuError::DeviceFault(_))
        ));
        assert!(device.resolve(GPU_VA_BASE - 4, 4).is_err());
    }

    #[test]
    fn huge_reads_fail_before_allocating() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = MemBlock::new(&device, MemBlockConfig::new(0x1000)).unwrap();
        assert_eq!(device.read_gpu_vec(block.gpu_addr(), 0x10).unwrap().len(), 0x10);
        assert!(device.read_gpu_vec(block.gpu_addr(), 1 << 40).is_err());
        assert!(device.read_gpu_vec(block.gpu_addr() + 8, u64::MAX).is_err());
    }

    #[test]
    fn budget_exhaustion_reports_out_of_memory() {
        let device = Device::new(DeviceConfig::new().with_memory_budget(0x1000)).unwrap();
        let _block = MemBlock::new(&device, MemBlockConfig::new(0x1000)).unwrap();
        assert!(matches!(
            MemBlock::new(&device, MemBlockConfig::new(0x1000)),
            Err(GpuError::OutOfDeviceMemory { requested: 0x1000 })
        ));
    }
}
