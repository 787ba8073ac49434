//! Fences.
//!
//! A fence tracks two counters: the value the last scheduled signal will
//! write (`target`) and the value the executor has written (`completed`).
//! A fence is signaled once `completed` reaches `target`. A fence that was
//! never scheduled has `target == 0` and stays unsignaled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_core::FenceRef;
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::device::{Device, FenceHandle};
use crate::error::{GpuError, Result};

/// Outcome of [`Fence::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
    /// The work that would have signaled the fence faulted.
    DeviceError,
}

impl FenceStatus {
    /// Map the status to `Ok(())` for `Signaled` and an error otherwise.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Signaled => Ok(()),
            Self::TimedOut => Err(GpuError::Timeout),
            Self::DeviceError => Err(GpuError::DeviceFault(
                "fence signal source faulted".to_string(),
            )),
        }
    }
}

#[derive(Debug, Default)]
struct FenceState {
    target: u64,
    completed: u64,
    faulted: bool,
}

impl FenceState {
    const fn wait_value(&self) -> u64 {
        if self.target == 0 {
            1
        } else {
            self.target
        }
    }
}

/// State shared between a fence and the executor that signals it.
#[derive(Debug, Default)]
pub(crate) struct FenceShared {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl FenceShared {
    /// Record that the executor reached `value`.
    pub(crate) fn complete(&self, value: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(value);
        self.cond.notify_all();
    }

    /// Record that the signal for `value` will never happen.
    pub(crate) fn fail(&self, value: u64) {
        let mut state = self.state.lock();
        state.faulted = true;
        state.completed = state.completed.max(value);
        self.cond.notify_all();
    }

    /// Returns `Some(true)` once `value` was reached, `Some(false)` if the
    /// fence faulted, `None` while still pending.
    pub(crate) fn poll(&self, value: u64) -> Option<bool> {
        let state = self.state.lock();
        if state.faulted {
            Some(false)
        } else if state.completed >= value {
            Some(true)
        } else {
            None
        }
    }

    /// Block for at most `timeout` waiting for `value`.
    pub(crate) fn wait_value(&self, value: u64, timeout: Duration) -> Option<bool> {
        let mut state = self.state.lock();
        if !state.faulted && state.completed < value {
            let _ = self.cond.wait_for(&mut state, timeout);
        }
        drop(state);
        self.poll(value)
    }
}

/// CPU-waitable completion token.
pub struct Fence {
    device: Device,
    handle: FenceHandle,
    shared: Arc<FenceShared>,
}

impl Fence {
    /// Create an unsignaled fence.
    pub fn new(device: &Device) -> Result<Self> {
        let shared = Arc::new(FenceShared::default());
        let handle = device.register_fence(Arc::downgrade(&shared));
        trace!(fence = ?handle, "Created fence");
        Ok(Self {
            device: device.clone(),
            handle,
            shared,
        })
    }

    /// Block until the fence signals, faults or `timeout` elapses.
    ///
    /// `None` waits without limit.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout: Option<Duration>) -> FenceStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if state.faulted {
                return FenceStatus::DeviceError;
            }
            if state.completed >= state.wait_value() {
                return FenceStatus::Signaled;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return if state.faulted {
                            FenceStatus::DeviceError
                        } else if state.completed >= state.wait_value() {
                            FenceStatus::Signaled
                        } else {
                            FenceStatus::TimedOut
                        };
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }

    /// Returns true if the last scheduled signal has been reached.
    pub fn is_signaled(&self) -> bool {
        let state = self.shared.state.lock();
        !state.faulted && state.completed >= state.wait_value()
    }

    /// Reference to the value a wait recorded now has to observe.
    pub(crate) fn current_ref(&self) -> FenceRef {
        let value = self.shared.state.lock().wait_value();
        self.make_ref(value)
    }

    /// Reference for the next signal, without scheduling it.
    pub(crate) fn next_ref(&self) -> FenceRef {
        let value = self.shared.state.lock().target + 1;
        self.make_ref(value)
    }

    /// Schedule a signal that will write `value`.
    pub(crate) fn arm(&self, value: u64) {
        let mut state = self.shared.state.lock();
        if state.completed < state.target && !state.faulted {
            warn!(
                fence = ?self.handle,
                pending = state.target,
                "Fence re-armed while a signal is still pending"
            );
        }
        state.target = state.target.max(value);
        state.faulted = false;
    }

    /// Schedule the next signal and return its reference.
    pub(crate) fn schedule(&self) -> FenceRef {
        let fence = self.next_ref();
        self.arm(fence.value);
        fence
    }

    pub(crate) fn shared(&self) -> &Arc<FenceShared> {
        &self.shared
    }

    fn make_ref(&self, value: u64) -> FenceRef {
        let (index, generation) = self.handle.into_raw();
        FenceRef {
            index,
            generation,
            value,
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.unregister_fence(self.handle);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("target", &state.target)
            .field("completed", &state.completed)
            .field("faulted", &state.faulted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use std::thread;

    fn device() -> Device {
        Device::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn never_signaled_fence_times_out() {
        let fence = Fence::new(&device()).unwrap();
        assert_eq!(fence.wait(Some(Duration::ZERO)), FenceStatus::TimedOut);
        assert_eq!(
            fence.wait(Some(Duration::from_millis(5))),
            FenceStatus::TimedOut
        );
        assert!(!fence.is_signaled());
    }

    #[test]
    fn signaled_fence_returns_immediately() {
        let fence = Fence::new(&device()).unwrap();
        let r = fence.schedule();
        fence.shared().complete(r.value);
        assert_eq!(fence.wait(Some(Duration::ZERO)), FenceStatus::Signaled);
        assert_eq!(fence.wait(None), FenceStatus::Signaled);
    }

    #[test]
    fn rescheduling_unsignals() {
        let fence = Fence::new(&device()).unwrap();
        let first = fence.schedule();
        fence.shared().complete(first.value);
        assert!(fence.is_signaled());
        let second = fence.schedule();
        assert_eq!(second.value, first.value + 1);
        assert!(!fence.is_signaled());
    }

    #[test]
    fn wait_wakes_on_completion() {
        let device = device();
        let fence = Fence::new(&device).unwrap();
        let r = fence.schedule();
        let shared = Arc::clone(fence.shared());
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            shared.complete(r.value);
        });
        assert_eq!(fence.wait(Some(Duration::from_secs(5))), FenceStatus::Signaled);
        signaler.join().unwrap();
    }

    #[test]
    fn failed_signal_reports_device_error() {
        let fence = Fence::new(&device()).unwrap();
        let r = fence.schedule();
        fence.shared().fail(r.value);
        assert_eq!(fence.wait(None), FenceStatus::DeviceError);
        assert!(fence.wait(None).into_result().is_err());
    }

    #[test]
    fn dropped_fence_is_unregistered() {
        let device = device();
        let fence = Fence::new(&device).unwrap();
        let r = fence.current_ref();
        assert!(device.lookup_fence(&r).is_some());
        drop(fence);
        assert!(device.lookup_fence(&r).is_none());
    }
}
