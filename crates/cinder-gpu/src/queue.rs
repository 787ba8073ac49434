//! Queues.
//!
//! A queue collects submitted command lists into a pending batch and hands
//! batches to a worker thread that executes them in FIFO order. Queue-level
//! fence operations are recorded into a small command buffer the queue owns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use cinder_core::constants::{MEMBLOCK_ALIGNMENT, QUEUE_MIN_CMDMEM_SIZE};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::command::{CmdBuf, CmdBufConfig, CmdList};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::exec::{ExecStats, Executor};
use crate::memory::{MemBlock, MemBlockConfig};
use crate::swapchain::{Swapchain, SwapchainShared};
use crate::sync::Fence;

/// Granularity of the per-warp scratch memory size.
const SCRATCH_MEM_ALIGNMENT: u32 = 0x200;
/// Depth of the channel between a queue and its worker.
const WORKER_RING_SIZE: usize = 64;

/// How often `wait_idle` checks that the worker is still running.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

static NEXT_QUEUE_ID: AtomicU32 = AtomicU32::new(0);

bitflags! {
    /// Queue capabilities and scheduling priority.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        const GRAPHICS      = 1 << 0;
        const COMPUTE       = 1 << 1;
        const TRANSFER      = 1 << 2;
        const LOW_PRIORITY  = 1 << 3;
        const HIGH_PRIORITY = 1 << 4;
    }
}

impl Default for QueueFlags {
    fn default() -> Self {
        Self::GRAPHICS | Self::COMPUTE | Self::TRANSFER
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub flags: QueueFlags,
    /// Size of the memory backing queue-level fence operations.
    pub command_memory_size: u32,
    /// Pending command bytes that trigger an automatic flush.
    pub flush_threshold: u32,
    pub per_warp_scratch_memory_size: u32,
    pub max_concurrent_compute_jobs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flags: QueueFlags::default(),
            command_memory_size: QUEUE_MIN_CMDMEM_SIZE,
            flush_threshold: QUEUE_MIN_CMDMEM_SIZE / 8,
            per_warp_scratch_memory_size: 4 * SCRATCH_MEM_ALIGNMENT,
            max_concurrent_compute_jobs: 128,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: QueueFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_command_memory_size(mut self, size: u32) -> Self {
        self.command_memory_size = size;
        self
    }

    pub fn with_flush_threshold(mut self, bytes: u32) -> Self {
        self.flush_threshold = bytes;
        self
    }

    pub fn with_per_warp_scratch_memory_size(mut self, size: u32) -> Self {
        self.per_warp_scratch_memory_size = size;
        self
    }

    pub fn with_max_concurrent_compute_jobs(mut self, jobs: u32) -> Self {
        self.max_concurrent_compute_jobs = jobs;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(GpuError::InvalidArgument(msg));
        if self
            .flags
            .contains(QueueFlags::LOW_PRIORITY | QueueFlags::HIGH_PRIORITY)
        {
            return invalid("a queue cannot be both low and high priority".to_string());
        }
        if !self
            .flags
            .intersects(QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER)
        {
            return invalid("a queue needs at least one capability".to_string());
        }
        if self.command_memory_size < QUEUE_MIN_CMDMEM_SIZE
            || self.command_memory_size % MEMBLOCK_ALIGNMENT != 0
        {
            return invalid(format!(
                "command memory size {:#x} must be at least {QUEUE_MIN_CMDMEM_SIZE:#x} and a multiple of {MEMBLOCK_ALIGNMENT:#x}",
                self.command_memory_size
            ));
        }
        if self.per_warp_scratch_memory_size % SCRATCH_MEM_ALIGNMENT != 0 {
            return invalid(format!(
                "per-warp scratch size {:#x} is not a multiple of {SCRATCH_MEM_ALIGNMENT:#x}",
                self.per_warp_scratch_memory_size
            ));
        }
        if self.max_concurrent_compute_jobs == 0 {
            return invalid("max_concurrent_compute_jobs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Work sent to the queue worker.
enum QueueOp {
    Execute(CmdList),
    Present {
        swapchain: Arc<SwapchainShared>,
        slot: usize,
    },
    /// Reply once everything before it has retired.
    Idle(Sender<()>),
    Shutdown,
}

struct QueueShared {
    faulted: AtomicBool,
    closing: Arc<AtomicBool>,
    stats: Mutex<ExecStats>,
}

/// A FIFO execution queue with its own worker thread.
pub struct Queue {
    device: Device,
    id: u32,
    config: QueueConfig,
    shared: Arc<QueueShared>,
    sender: Sender<QueueOp>,
    worker: Option<JoinHandle<()>>,
    cmdbuf: CmdBuf,
    _cmd_mem: MemBlock,
    pending: Vec<QueueOp>,
    pending_bytes: u64,
}

impl Queue {
    /// Create a queue and start its worker.
    pub fn new(device: &Device, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);

        let cmd_mem = MemBlock::new(device, MemBlockConfig::new(config.command_memory_size))?;
        let mut cmdbuf = CmdBuf::new(device, CmdBufConfig::default())?;
        cmdbuf.add_memory(&cmd_mem, 0, config.command_memory_size)?;

        let shared = Arc::new(QueueShared {
            faulted: AtomicBool::new(false),
            closing: Arc::new(AtomicBool::new(false)),
            stats: Mutex::new(ExecStats::default()),
        });

        let (sender, receiver) = channel::bounded::<QueueOp>(WORKER_RING_SIZE);
        let executor = Executor::new(device.clone(), config.flags, Arc::clone(&shared.closing));
        let worker = {
            let shared = Arc::clone(&shared);
            let device = device.clone();
            thread::Builder::new()
                .name(format!("cinder-queue-{id}"))
                .spawn(move || Self::worker_loop(id, device, executor, receiver, shared))
                .map_err(|e| GpuError::InvalidState(format!("failed to spawn queue worker: {e}")))?
        };

        info!(queue = id, flags = ?config.flags, "Created queue");

        Ok(Self {
            device: device.clone(),
            id,
            config,
            shared,
            sender,
            worker: Some(worker),
            cmdbuf,
            _cmd_mem: cmd_mem,
            pending: Vec::new(),
            pending_bytes: 0,
        })
    }

    fn worker_loop(
        id: u32,
        device: Device,
        mut executor: Executor,
        receiver: Receiver<QueueOp>,
        shared: Arc<QueueShared>,
    ) {
        while let Ok(op) = receiver.recv() {
            match op {
                QueueOp::Execute(list) => {
                    if shared.faulted.load(Ordering::Acquire) {
                        executor.drain_list(&list);
                        continue;
                    }
                    if let Err(err) = run_guarded(|| executor.execute_list(&list)) {
                        if matches!(err, GpuError::WorkerPanicked(_)) {
                            executor.drain_list(&list);
                        }
                        shared.faulted.store(true, Ordering::Release);
                        error!(queue = id, error = %err, "Queue entered error state");
                        device.report_error(&format!("queue {id}"), &err);
                    }
                    shared.stats.lock().clone_from(executor.stats());
                }
                QueueOp::Present { swapchain, slot } => {
                    if shared.faulted.load(Ordering::Acquire) {
                        swapchain.abandon(slot);
                    } else {
                        executor.count_present();
                        shared.stats.lock().clone_from(executor.stats());
                        swapchain.on_present(slot);
                    }
                }
                QueueOp::Idle(done) => {
                    let _ = done.send(());
                }
                QueueOp::Shutdown => break,
            }
        }
        debug!(queue = id, "Queue worker stopped");
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// True once a submission faulted. The queue rejects further work.
    pub fn is_in_error_state(&self) -> bool {
        self.shared.faulted.load(Ordering::Acquire)
    }

    /// Snapshot of the executor counters.
    pub fn stats(&self) -> ExecStats {
        self.shared.stats.lock().clone()
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_in_error_state() {
            return Err(GpuError::QueueFaulted);
        }
        Ok(())
    }

    fn enqueue(&mut self, op: QueueOp, bytes: u64) -> Result<()> {
        self.pending.push(op);
        self.pending_bytes += bytes;
        if self.pending_bytes >= u64::from(self.config.flush_threshold) {
            self.flush()?;
        }
        Ok(())
    }

    /// Schedule `list` after everything submitted before it.
    pub fn submit_commands(&mut self, list: &CmdList) -> Result<()> {
        self.check_usable()?;
        match self.device.cmdbuf_epoch(list.owner) {
            Some(epoch) if epoch == list.epoch => {}
            Some(_) => return Err(GpuError::StaleCommandList),
            None => return Err(GpuError::InvalidHandle),
        }
        if list.is_empty() {
            return Ok(());
        }
        trace!(queue = self.id, addr = format_args!("{:#x}", list.gpu_addr), size = list.size, "Submitted command list");
        self.enqueue(QueueOp::Execute(*list), u64::from(list.size))
    }

    /// Record a queue-level operation, recycling the internal buffer when full.
    fn record_internal<F>(&mut self, mut record: F) -> Result<()>
    where
        F: FnMut(&mut CmdBuf) -> Result<()>,
    {
        self.check_usable()?;
        match record(&mut self.cmdbuf) {
            Err(GpuError::OutOfCommandMemory { .. }) => {
                debug!(queue = self.id, "Recycling queue command memory");
                self.wait_idle()?;
                self.cmdbuf.clear();
                record(&mut self.cmdbuf)?;
            }
            other => other?,
        }
        let list = self.cmdbuf.finish_list();
        self.enqueue(QueueOp::Execute(list), u64::from(list.size))
    }

    /// Make later submissions wait for `fence`.
    pub fn wait_fence(&mut self, fence: &Fence) -> Result<()> {
        self.record_internal(|cmdbuf| cmdbuf.wait_fence(fence))
    }

    /// Signal `fence` once everything submitted so far has completed.
    pub fn signal_fence(&mut self, fence: &Fence, flush: bool) -> Result<()> {
        self.record_internal(|cmdbuf| cmdbuf.signal_fence(fence, flush))?;
        if flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Hand the pending batch to the worker.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        trace!(queue = self.id, ops = self.pending.len(), bytes = self.pending_bytes, "Flushing queue");
        self.pending_bytes = 0;
        for op in std::mem::take(&mut self.pending) {
            if self.sender.send(op).is_err() {
                return Err(self.worker_lost());
            }
        }
        Ok(())
    }

    /// Block until everything submitted so far has retired.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&mut self) -> Result<()> {
        self.flush()?;
        let (done_tx, done_rx) = channel::bounded(1);
        if self.sender.send(QueueOp::Idle(done_tx)).is_err() {
            return Err(self.worker_lost());
        }
        loop {
            match done_rx.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) if !self.worker_finished() => {}
                Err(_) => return Err(self.worker_lost()),
            }
        }
        self.check_usable()
    }

    fn worker_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Put the queue in its error state after the worker stopped unexpectedly.
    fn worker_lost(&self) -> GpuError {
        if !self.shared.faulted.swap(true, Ordering::AcqRel) {
            error!(queue = self.id, "Queue worker stopped unexpectedly");
            self.device
                .report_error(&format!("queue {}", self.id), &GpuError::QueueFaulted);
        }
        GpuError::QueueFaulted
    }

    /// Acquire a free swapchain image; later submissions wait for its
    /// retirement fence.
    pub fn acquire_image(&mut self, swapchain: &Swapchain) -> Result<usize> {
        self.check_usable()?;
        let (slot, fence) = swapchain.acquire_image()?;
        self.wait_fence(fence)?;
        Ok(slot)
    }

    /// Present an acquired image after everything submitted so far.
    pub fn present_image(&mut self, swapchain: &Swapchain, slot: usize) -> Result<()> {
        self.check_usable()?;
        swapchain.begin_present(slot)?;
        self.pending.push(QueueOp::Present {
            swapchain: Arc::clone(swapchain.shared()),
            slot,
        });
        self.flush()
    }
}

/// Run `f`, turning a panic into [`GpuError::WorkerPanicked`].
fn run_guarded<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(GpuError::WorkerPanicked(message))
    })
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Err(err) = self.flush() {
            self.device.report_error(&format!("queue {} shutdown", self.id), &err);
        }
        let _ = self.sender.send(QueueOp::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(queue = self.id, "Queue worker panicked");
            }
        }
        debug!(queue = self.id, "Destroyed queue");
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("flags", &self.config.flags)
            .field("faulted", &self.is_in_error_state())
            .field("pending", &self.pending.len())
            .finish()
    }
}
