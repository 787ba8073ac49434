//! Command buffers and command lists.
//!
//! A command buffer encodes instructions into memory ranges the client
//! attaches with [`CmdBuf::add_memory`]. Everything recorded since the last
//! [`CmdBuf::finish_list`] forms the unsealed segment; finishing seals it into
//! a [`CmdList`] that queues can execute. A segment always lives in a single
//! range: when recording moves on to another range the segment moves with it.

mod record;

use std::sync::Arc;

use cinder_core::constants::CMDMEM_ALIGNMENT;
use cinder_core::{Command, GpuAddr};
use tracing::{debug, trace, warn};

use crate::device::{CmdBufHandle, Device};
use crate::error::{GpuError, Result};
use crate::memory::{BlockStorage, MemBlock};

/// Callback asked to attach at least the given number of bytes.
pub type GrowCallback = Box<dyn FnMut(&mut CmdBuf, u32) + Send>;

/// Command buffer configuration.
#[derive(Default)]
pub struct CmdBufConfig {
    on_grow: Option<GrowCallback>,
}

impl CmdBufConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the callback invoked when attached memory runs out.
    pub fn with_grow_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut CmdBuf, u32) + Send + 'static,
    {
        self.on_grow = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for CmdBufConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdBufConfig")
            .field("on_grow", &self.on_grow.is_some())
            .finish()
    }
}

/// A sealed, contiguous run of encoded instructions.
///
/// The list stays valid until its command buffer is cleared or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdList {
    pub(crate) owner: CmdBufHandle,
    pub(crate) epoch: u32,
    pub(crate) gpu_addr: GpuAddr,
    pub(crate) size: u32,
}

impl CmdList {
    pub const fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Encoded size in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

struct CmdRange {
    storage: Arc<BlockStorage>,
    offset: u32,
    size: u32,
}

impl CmdRange {
    fn gpu_addr(&self) -> GpuAddr {
        self.storage.gpu_addr() + u64::from(self.offset)
    }
}

/// Instruction encoder.
pub struct CmdBuf {
    device: Device,
    handle: CmdBufHandle,
    epoch: u32,
    ranges: Vec<CmdRange>,
    /// Index of the range being recorded into.
    current: usize,
    /// Bytes used in the current range.
    cursor: u32,
    /// Start of the unsealed segment in the current range.
    segment_start: u32,
    needs_memory: bool,
    on_grow: Option<GrowCallback>,
    scratch: Vec<u32>,
}

impl CmdBuf {
    /// Create a command buffer with no memory attached.
    pub fn new(device: &Device, config: CmdBufConfig) -> Result<Self> {
        let handle = device.register_cmdbuf();
        debug!(cmdbuf = ?handle, "Created command buffer");
        Ok(Self {
            device: device.clone(),
            handle,
            epoch: 0,
            ranges: Vec::new(),
            current: 0,
            cursor: 0,
            segment_start: 0,
            needs_memory: false,
            on_grow: config.on_grow,
            scratch: Vec::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Attach `[offset, offset + size)` of `block` as recording memory.
    ///
    /// The buffer does not keep `block` alive; the client must keep it until
    /// every list recorded into it has executed.
    pub fn add_memory(&mut self, block: &MemBlock, offset: u32, size: u32) -> Result<()> {
        if offset % CMDMEM_ALIGNMENT != 0 || size % CMDMEM_ALIGNMENT != 0 || size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "command memory {offset:#x}+{size:#x} must be non-empty and {CMDMEM_ALIGNMENT}-byte aligned"
            )));
        }
        if u64::from(offset) + u64::from(size) > u64::from(block.size()) {
            return Err(GpuError::InvalidArgument(format!(
                "command memory {offset:#x}+{size:#x} exceeds block size {:#x}",
                block.size()
            )));
        }
        if !block.has_cpu_access() {
            return Err(GpuError::NoCpuAccess);
        }

        let start = block.gpu_addr() + u64::from(offset);
        let end = start + u64::from(size);
        if self
            .ranges
            .iter()
            .any(|r| start < r.gpu_addr() + u64::from(r.size) && r.gpu_addr() < end)
        {
            return Err(GpuError::InvalidArgument(format!(
                "command memory {start:#x}..{end:#x} overlaps an attached range"
            )));
        }

        self.ranges.push(CmdRange {
            storage: Arc::clone(block.storage()),
            offset,
            size,
        });
        self.needs_memory = false;
        trace!(cmdbuf = ?self.handle, addr = format_args!("{start:#x}"), size, "Attached command memory");
        Ok(())
    }

    /// Seal everything recorded since the previous finish.
    pub fn finish_list(&mut self) -> CmdList {
        let gpu_addr = self
            .ranges
            .get(self.current)
            .map_or(0, |r| r.gpu_addr() + u64::from(self.segment_start));
        let list = CmdList {
            owner: self.handle,
            epoch: self.epoch,
            gpu_addr,
            size: self.cursor - self.segment_start,
        };
        self.segment_start = self.cursor;
        list
    }

    /// Rewind to the start of the first range. Lists finished so far become
    /// invalid.
    pub fn clear(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.device.set_cmdbuf_epoch(self.handle, self.epoch);
        self.current = 0;
        self.cursor = 0;
        self.segment_start = 0;
        self.needs_memory = false;
    }

    /// Total bytes attached.
    pub fn capacity(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.size)).sum()
    }

    /// Bytes consumed by recording, including range tails skipped over.
    pub fn consumed(&self) -> u64 {
        let before: u64 = self
            .ranges
            .iter()
            .take(self.current)
            .map(|r| u64::from(r.size))
            .sum();
        before + u64::from(self.cursor)
    }

    /// Bytes still available for recording.
    pub fn available(&self) -> u64 {
        self.capacity() - self.consumed()
    }

    /// True after a recording call failed for lack of memory.
    pub fn needs_memory(&self) -> bool {
        self.needs_memory
    }

    pub fn is_list_valid(&self, list: &CmdList) -> bool {
        list.owner == self.handle && list.epoch == self.epoch
    }

    /// Read back the encoded words of a list.
    pub fn read_list(&self, list: &CmdList) -> Result<Vec<u32>> {
        if !self.is_list_valid(list) {
            return Err(GpuError::StaleCommandList);
        }
        let mut words = vec![0u32; list.size as usize / 4];
        self.device
            .read_gpu(list.gpu_addr, bytemuck::cast_slice_mut(&mut words))?;
        Ok(words)
    }

    fn segment_len(&self) -> u32 {
        self.cursor - self.segment_start
    }

    fn fits_current(&self, bytes: u32) -> bool {
        self.ranges
            .get(self.current)
            .is_some_and(|r| r.size - self.cursor >= bytes)
    }

    /// Move the unsealed segment to the first later range that can hold it
    /// plus `bytes`.
    fn relocate(&mut self, bytes: u32) -> Result<bool> {
        let len = self.segment_len();
        let needed = u64::from(len) + u64::from(bytes);
        let first = if self.ranges.is_empty() {
            0
        } else {
            self.current + 1
        };
        let Some(target) = (first..self.ranges.len())
            .find(|&i| u64::from(self.ranges[i].size) >= needed)
        else {
            return Ok(false);
        };

        if len > 0 {
            let src = &self.ranges[self.current];
            let mut words = vec![0u8; len as usize];
            src.storage
                .gpu_read((src.offset + self.segment_start) as usize, &mut words);
            let dst = &self.ranges[target];
            dst.storage.cpu_write(dst.offset as usize, &words)?;
            dst.storage.flush(dst.offset as usize, len as usize)?;
        }
        trace!(cmdbuf = ?self.handle, from = self.current, to = target, len, "Moved unsealed segment");

        self.current = target;
        self.segment_start = 0;
        self.cursor = len;
        Ok(true)
    }

    /// Make room for `bytes` in the current range.
    fn reserve(&mut self, bytes: u32) -> Result<()> {
        if self.fits_current(bytes) || self.relocate(bytes)? {
            return Ok(());
        }

        if let Some(mut grow) = self.on_grow.take() {
            let requested = self.segment_len() + bytes;
            trace!(cmdbuf = ?self.handle, requested, "Requesting command memory");
            grow(self, requested);
            if self.on_grow.is_none() {
                self.on_grow = Some(grow);
            }
            if self.fits_current(bytes) || self.relocate(bytes)? {
                return Ok(());
            }
        }

        self.needs_memory = true;
        warn!(
            cmdbuf = ?self.handle,
            requested = bytes,
            available = self.available(),
            "Command buffer out of memory"
        );
        Err(GpuError::OutOfCommandMemory { requested: bytes })
    }

    /// Encode `cmd` at the cursor.
    pub(crate) fn emit(&mut self, cmd: &Command) -> Result<()> {
        let mut words = std::mem::take(&mut self.scratch);
        words.clear();
        let result = self.emit_words(cmd, &mut words);
        self.scratch = words;
        result
    }

    fn emit_words(&mut self, cmd: &Command, words: &mut Vec<u32>) -> Result<()> {
        cmd.encode(words)?;
        let bytes = u32::try_from(words.len() * 4)
            .map_err(|_| GpuError::InvalidArgument("instruction too large".to_string()))?;
        self.reserve(bytes)?;

        let range = &self.ranges[self.current];
        let offset = (range.offset + self.cursor) as usize;
        range.storage.cpu_write(offset, bytemuck::cast_slice(words))?;
        range.storage.flush(offset, bytes as usize)?;
        self.cursor += bytes;
        Ok(())
    }
}

impl Drop for CmdBuf {
    fn drop(&mut self) {
        self.device.unregister_cmdbuf(self.handle);
        debug!(cmdbuf = ?self.handle, "Destroyed command buffer");
    }
}

impl std::fmt::Debug for CmdBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdBuf")
            .field("handle", &self.handle)
            .field("epoch", &self.epoch)
            .field("ranges", &self.ranges.len())
            .field("consumed", &self.consumed())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::memory::MemBlockConfig;
    use crate::sync::Fence;
    use cinder_core::{Barrier, InvalidateFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Device, MemBlock) {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = MemBlock::new(&device, MemBlockConfig::new(0x4000)).unwrap();
        (device, block)
    }

    #[test]
    fn capacity_accounting() {
        let (device, block) = setup();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        assert_eq!(cmdbuf.available(), 0);

        cmdbuf.add_memory(&block, 0, 0x1000).unwrap();
        cmdbuf.add_memory(&block, 0x2000, 0x800).unwrap();
        assert_eq!(cmdbuf.capacity(), 0x1800);

        cmdbuf.barrier(Barrier::Full, InvalidateFlags::empty()).unwrap();
        let used = cmdbuf.consumed();
        assert!(used > 0);
        assert_eq!(cmdbuf.available(), 0x1800 - used);
    }

    #[test]
    fn add_memory_validates_range() {
        let (device, block) = setup();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        assert!(cmdbuf.add_memory(&block, 2, 0x100).is_err());
        assert!(cmdbuf.add_memory(&block, 0x3f00, 0x200).is_err());
        cmdbuf.add_memory(&block, 0, 0x1000).unwrap();
        assert!(cmdbuf.add_memory(&block, 0x800, 0x1000).is_err());

        let gpu_only = MemBlock::new(
            &device,
            MemBlockConfig::new(0x1000).with_flags(crate::memory::MemBlockFlags::GPU_CACHED),
        )
        .unwrap();
        assert!(matches!(
            cmdbuf.add_memory(&gpu_only, 0, 0x1000),
            Err(GpuError::NoCpuAccess)
        ));
    }

    #[test]
    fn finish_seals_segments() {
        let (device, block) = setup();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        cmdbuf.add_memory(&block, 0, 0x1000).unwrap();

        cmdbuf.barrier(Barrier::Full, InvalidateFlags::empty()).unwrap();
        let first = cmdbuf.finish_list();
        assert!(!first.is_empty());
        assert!(cmdbuf.finish_list().is_empty());

        cmdbuf.dispatch_compute(1, 1, 1).unwrap();
        let second = cmdbuf.finish_list();
        assert_eq!(second.gpu_addr(), first.gpu_addr() + u64::from(first.size()));

        let words = cmdbuf.read_list(&first).unwrap();
        let cmds: Vec<_> = cinder_core::CommandReader::new(&words)
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(
            cmds,
            vec![Command::Barrier {
                mode: Barrier::Full,
                invalidate: InvalidateFlags::empty()
            }]
        );
    }

    #[test]
    fn clear_invalidates_lists() {
        let (device, block) = setup();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        cmdbuf.add_memory(&block, 0, 0x1000).unwrap();
        cmdbuf.barrier(Barrier::Full, InvalidateFlags::empty()).unwrap();
        let list = cmdbuf.finish_list();
        assert!(cmdbuf.is_list_valid(&list));

        cmdbuf.clear();
        assert!(!cmdbuf.is_list_valid(&list));
        assert!(matches!(cmdbuf.read_list(&list), Err(GpuError::StaleCommandList)));
        assert_eq!(cmdbuf.consumed(), 0);
    }

    #[test]
    fn segment_moves_to_next_range() {
        let (device, block) = setup();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        cmdbuf.add_memory(&block, 0, 0x100).unwrap();
        cmdbuf.add_memory(&block, 0x1000, 0x1000).unwrap();

        let data = [7u8; 96];
        cmdbuf.push_data(0x1_0000, &data).unwrap();
        cmdbuf.push_data(0x1_0000, &data).unwrap();
        cmdbuf.push_data(0x1_0000, &data).unwrap();
        let list = cmdbuf.finish_list();
        assert_eq!(list.gpu_addr(), block.gpu_addr() + 0x1000);

        let words = cmdbuf.read_list(&list).unwrap();
        assert_eq!(cinder_core::CommandReader::new(&words).count(), 3);
    }

    #[test]
    fn exhaustion_without_callback_sets_flag() {
        let (device, block) = setup();
        let mut cmdbuf = CmdBuf::new(&device, CmdBufConfig::default()).unwrap();
        cmdbuf.add_memory(&block, 0, 0x40).unwrap();
        let err = cmdbuf.push_data(0x1_0000, &[0u8; 128]).unwrap_err();
        assert!(matches!(err, GpuError::OutOfCommandMemory { .. }));
        assert!(cmdbuf.needs_memory());

        cmdbuf.add_memory(&block, 0x1000, 0x1000).unwrap();
        assert!(!cmdbuf.needs_memory());
        cmdbuf.push_data(0x1_0000, &[0u8; 128]).unwrap();
    }

    #[test]
    fn grow_callback_attaches_memory() {
        let (device, _) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let blocks = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let config = {
            let calls = Arc::clone(&calls);
            let blocks = Arc::clone(&blocks);
            CmdBufConfig::new().with_grow_callback(move |cmdbuf: &mut CmdBuf, min: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                let size = min.next_multiple_of(0x1000);
                let block = MemBlock::new(cmdbuf.device(), MemBlockConfig::new(size)).unwrap();
                cmdbuf.add_memory(&block, 0, size).unwrap();
                blocks.lock().push(block);
            })
        };
        let mut cmdbuf = CmdBuf::new(&device, config).unwrap();
        let fence = Fence::new(&device).unwrap();
        cmdbuf.signal_fence(&fence, false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(blocks.lock().len(), 1);
    }
}
