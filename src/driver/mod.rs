//! Device backend contract.
//!
//! The core drives any accelerator backend able to satisfy this small
//! capability surface: device enumeration and properties, bulk memory, host
//! memory registration, streams and events, asynchronous copies in both
//! directions, and optional peer access. Handles are opaque newtypes; the
//! scheduler never interprets them.
//!
//! Kernel launches are deliberately absent from the contract: they go through
//! each task's submit callback, which receives the driver, the target stream
//! and the staged replicas and may use whatever launch mechanism the backend
//! provides.

#[cfg(any(test, feature = "mock-driver"))]
pub mod mock;

use std::{
    error::Error,
    fmt::{Display, Formatter},
};

/// Raw address inside one device's memory space.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device address.
    pub const NULL: Self = Self(0);

    /// Returns the address advanced by `bytes`.
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Host address handed across the driver boundary for asynchronous copies.
///
/// Sharing the raw pointer is sound because the coherence protocol allows at
/// most one transfer to touch a given host replica at a time.
#[derive(Clone, Copy, Debug)]
pub struct HostPtr(pub *mut u8);

unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// Opaque handle to one asynchronous execution lane.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StreamHandle(pub u64);

/// Opaque handle to a pollable completion marker.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventHandle(pub u64);

/// Result of a non-blocking event query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventStatus {
    Ready,
    NotReady,
}

/// Static properties of one physical device.
#[derive(Clone, Debug)]
pub struct DeviceProperties {
    pub name: String,

    /// Compute capability, major digit.
    pub major: u32,

    /// Compute capability, minor digit.
    pub minor: u32,

    pub multiprocessor_count: u32,
    pub clock_rate_khz: u32,
    pub concurrent_kernels: bool,
    pub compute_mode: u32,
}

/// Capability contract required of any device backend.
///
/// Every call is short and synchronous except the `copy_*_async` pair, which
/// enqueue work on a stream and return immediately. Backends must be callable
/// from any thread; per-device serialization is the scheduler's job.
pub trait Driver: Send + Sync {
    /// Number of physical devices the backend exposes.
    fn device_count(&self) -> Result<usize, DriverError>;

    fn device_properties(&self, device: usize) -> Result<DeviceProperties, DriverError>;

    /// Makes `device` current for the calling thread.
    fn set_device(&self, device: usize) -> Result<(), DriverError>;

    /// Returns `(free, total)` device memory in bytes.
    fn memory_info(&self, device: usize) -> Result<(u64, u64), DriverError>;

    /// Allocates one bulk block of device memory.
    fn allocate(&self, device: usize, size: u64) -> Result<DevicePtr, DriverError>;

    fn free(&self, device: usize, ptr: DevicePtr) -> Result<(), DriverError>;

    /// Registers (pins) host memory for asynchronous transfer, portably
    /// across all devices.
    fn register_host(&self, ptr: HostPtr, len: usize) -> Result<(), DriverError>;

    fn unregister_host(&self, ptr: HostPtr) -> Result<(), DriverError>;

    fn create_stream(&self, device: usize) -> Result<StreamHandle, DriverError>;

    fn destroy_stream(&self, device: usize, stream: StreamHandle) -> Result<(), DriverError>;

    fn create_event(&self, device: usize) -> Result<EventHandle, DriverError>;

    fn destroy_event(&self, device: usize, event: EventHandle) -> Result<(), DriverError>;

    /// Records `event` at the current tail of `stream`.
    fn record_event(
        &self,
        device: usize,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<(), DriverError>;

    /// Non-blocking completion query.
    fn query_event(&self, device: usize, event: EventHandle) -> Result<EventStatus, DriverError>;

    /// Enqueues an asynchronous host→device copy on `stream`.
    fn copy_to_device_async(
        &self,
        device: usize,
        dst: DevicePtr,
        src: HostPtr,
        len: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError>;

    /// Enqueues an asynchronous device→host copy on `stream`.
    fn copy_to_host_async(
        &self,
        device: usize,
        dst: HostPtr,
        src: DevicePtr,
        len: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError>;

    /// Whether `device` can map `peer`'s memory directly.
    fn can_access_peer(&self, device: usize, peer: usize) -> Result<bool, DriverError>;

    fn enable_peer_access(&self, device: usize, peer: usize) -> Result<(), DriverError>;
}

/// Describes the general category of failures a backend may report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverError {
    /// The input data, or referenced data, is not valid for the current state.
    InvalidData,

    /// The requested feature, or input configuration, is not supported for the
    /// current state.
    Unsupported,

    /// The device has run out of physical memory.
    ///
    /// Many drivers return this value for generic or unhandled error
    /// conditions.
    OutOfMemory,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for DriverError {}
