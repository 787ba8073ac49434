//! GPU error types.

use thiserror::Error;

/// Errors raised by the command layer.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A command buffer ran out of attached memory and growth did not help.
    #[error("Out of command memory: {requested} bytes needed")]
    OutOfCommandMemory { requested: u32 },

    /// The memory provider refused an allocation.
    #[error("Out of device memory: {requested} bytes requested")]
    OutOfDeviceMemory { requested: u64 },

    /// An argument is outside the range the call accepts.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A wait elapsed before its condition was met.
    #[error("Timed out")]
    Timeout,

    /// The executor hit an unrecoverable condition.
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// The executor panicked while running a command list.
    #[error("Queue worker panicked: {0}")]
    WorkerPanicked(String),

    /// The queue is in error state and rejects further work.
    #[error("Queue is in error state")]
    QueueFaulted,

    /// The command list was finished before its buffer was cleared.
    #[error("Stale command list")]
    StaleCommandList,

    /// A handle refers to an object that no longer exists, such as the
    /// command buffer of a submitted list.
    #[error("Invalid handle")]
    InvalidHandle,

    /// The object is not in a state that permits the call.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The memory block was created without CPU access.
    #[error("Memory block has no CPU access")]
    NoCpuAccess,

    /// A command stream failed to decode.
    #[error("Command stream error: {0}")]
    Stream(#[from] cinder_core::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
