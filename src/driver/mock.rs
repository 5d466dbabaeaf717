//! In-memory driver backend used by the test suite.
//!
//! Copies execute eagerly at enqueue time, so stream order equals submission
//! order by construction. Events report ready only after `latency` queries,
//! which exercises the scheduler's not-ready paths without real hardware.

use {
    super::{
        DevicePtr, DeviceProperties, Driver, DriverError, EventHandle, EventStatus, HostPtr,
        StreamHandle,
    },
    derive_builder::{Builder, UninitializedFieldError},
    log::warn,
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        ops::DerefMut,
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Description of one simulated device.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "MockDeviceInfoBuilderError"),
    derive(Debug),
    pattern = "owned"
)]
pub struct MockDeviceInfo {
    #[builder(setter(into), default = "\"Mock Device\".to_owned()")]
    pub name: String,

    /// Compute capability, major digit.
    #[builder(default = "3")]
    pub major: u32,

    /// Compute capability, minor digit.
    #[builder(default = "5")]
    pub minor: u32,

    #[builder(default = "8")]
    pub multiprocessor_count: u32,

    #[builder(default = "1_000_000")]
    pub clock_rate_khz: u32,

    #[builder(default = "true")]
    pub concurrent_kernels: bool,

    #[builder(default)]
    pub compute_mode: u32,

    /// Total simulated device memory in bytes.
    #[builder(default = "1 << 20")]
    pub total_memory: u64,
}

impl MockDeviceInfo {
    pub fn to_builder(self) -> MockDeviceInfoBuilder {
        MockDeviceInfoBuilder {
            name: Some(self.name),
            major: Some(self.major),
            minor: Some(self.minor),
            multiprocessor_count: Some(self.multiprocessor_count),
            clock_rate_khz: Some(self.clock_rate_khz),
            concurrent_kernels: Some(self.concurrent_kernels),
            compute_mode: Some(self.compute_mode),
            total_memory: Some(self.total_memory),
        }
    }
}

impl Default for MockDeviceInfo {
    fn default() -> Self {
        MockDeviceInfoBuilder::default().build()
    }
}

impl MockDeviceInfoBuilder {
    /// Builds a new `MockDeviceInfo`.
    pub fn build(self) -> MockDeviceInfo {
        match self.fallible_build() {
            Err(MockDeviceInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<MockDeviceInfoBuilder> for MockDeviceInfo {
    fn from(info: MockDeviceInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct MockDeviceInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for MockDeviceInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

struct MockEvent {
    recorded: bool,
    remaining: u32,
}

struct MockDevice {
    props: DeviceProperties,
    total_memory: u64,
    used: u64,
    next_addr: u64,
    allocations: BTreeMap<u64, Vec<u8>>,
    streams: HashSet<u64>,
    next_stream: u64,
    events: HashMap<u64, MockEvent>,
    next_event: u64,
    peers: u32,
    poisoned: bool,
    fail_next: Option<String>,
}

impl MockDevice {
    fn new(info: MockDeviceInfo) -> Self {
        Self {
            props: DeviceProperties {
                name: info.name,
                major: info.major,
                minor: info.minor,
                multiprocessor_count: info.multiprocessor_count,
                clock_rate_khz: info.clock_rate_khz,
                concurrent_kernels: info.concurrent_kernels,
                compute_mode: info.compute_mode,
            },
            total_memory: info.total_memory,
            used: 0,
            next_addr: 0x1000,
            allocations: BTreeMap::new(),
            streams: HashSet::new(),
            next_stream: 1,
            events: HashMap::new(),
            next_event: 1,
            peers: 0,
            poisoned: false,
            fail_next: None,
        }
    }

    /// Fails `call` once when an injected fault names it.
    fn check_fault(&mut self, call: &str) -> Result<(), DriverError> {
        if self.fail_next.as_deref() == Some(call) {
            self.fail_next = None;

            return Err(DriverError::InvalidData);
        }

        Ok(())
    }

    /// Finds the allocation covering `ptr..ptr + len`.
    fn resolve(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DriverError> {
        let (base, buf) = self
            .allocations
            .range_mut(..=ptr.0)
            .next_back()
            .ok_or(DriverError::InvalidData)?;
        let offset = (ptr.0 - base) as usize;
        if offset + len > buf.len() {
            return Err(DriverError::InvalidData);
        }

        Ok(&mut buf[offset..offset + len])
    }
}

/// Driver backend simulated entirely in host memory.
pub struct MockDriver {
    devices: Vec<Mutex<MockDevice>>,
    latency: u32,
    registered: Mutex<HashMap<usize, usize>>,
}

impl MockDriver {
    pub fn new(devices: Vec<MockDeviceInfo>) -> Self {
        Self::with_latency(devices, 0)
    }

    /// Events become ready only after `latency` queries.
    pub fn with_latency(devices: Vec<MockDeviceInfo>, latency: u32) -> Self {
        Self {
            devices: devices.into_iter().map(|info| Mutex::new(MockDevice::new(info))).collect(),
            latency,
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// `count` identical default devices.
    pub fn uniform(count: usize) -> Self {
        Self::new((0..count).map(|_| MockDeviceInfo::default()).collect())
    }

    fn device(&self, device: usize) -> Result<impl DerefMut<Target = MockDevice> + '_, DriverError> {
        let device = self.devices.get(device).ok_or(DriverError::InvalidData)?;

        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut guard = device.lock();

        #[cfg(not(feature = "parking_lot"))]
        let guard = guard.unwrap();

        if guard.poisoned {
            return Err(DriverError::InvalidData);
        }

        Ok(guard)
    }

    /// Makes the next `call` (named after the `Driver` method) against
    /// `device` fail exactly once, simulating a fault confined to a single
    /// driver operation on an otherwise healthy device.
    pub fn fail_next(&self, device: usize, call: &str) {
        if let Some(device) = self.devices.get(device) {
            #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
            let mut guard = device.lock();

            #[cfg(not(feature = "parking_lot"))]
            let mut guard = guard.unwrap();

            guard.fail_next = Some(call.to_owned());
        }
    }

    /// Makes every subsequent call against `device` fail, simulating a fatal
    /// device error.
    pub fn poison(&self, device: usize) {
        if let Some(device) = self.devices.get(device) {
            #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
            let mut guard = device.lock();

            #[cfg(not(feature = "parking_lot"))]
            let mut guard = guard.unwrap();

            guard.poisoned = true;
        }
    }

    /// Reads `len` bytes of simulated device memory; panics on a bad address.
    pub fn read(&self, device: usize, ptr: DevicePtr, len: usize) -> Vec<u8> {
        let mut device = self.device(device).expect("unknown mock device");

        device.resolve(ptr, len).expect("bad mock device address").to_vec()
    }

    /// Writes `data` to simulated device memory; panics on a bad address.
    pub fn write(&self, device: usize, ptr: DevicePtr, data: &[u8]) {
        let mut device = self.device(device).expect("unknown mock device");

        device
            .resolve(ptr, data.len())
            .expect("bad mock device address")
            .copy_from_slice(data);
    }

    /// Number of host regions currently registered.
    pub fn registered_regions(&self) -> usize {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut registered = self.registered.lock();

        #[cfg(not(feature = "parking_lot"))]
        let registered = registered.unwrap();

        registered.len()
    }
}

impl Driver for MockDriver {
    fn device_count(&self) -> Result<usize, DriverError> {
        Ok(self.devices.len())
    }

    fn device_properties(&self, device: usize) -> Result<DeviceProperties, DriverError> {
        Ok(self.device(device)?.props.clone())
    }

    fn set_device(&self, device: usize) -> Result<(), DriverError> {
        self.device(device).map(|_| ())
    }

    fn memory_info(&self, device: usize) -> Result<(u64, u64), DriverError> {
        let device = self.device(device)?;

        Ok((device.total_memory - device.used, device.total_memory))
    }

    fn allocate(&self, device: usize, size: u64) -> Result<DevicePtr, DriverError> {
        let mut device = self.device(device)?;
        device.check_fault("allocate")?;
        if device.used + size > device.total_memory {
            warn!("mock device out of memory: {size} bytes requested");

            return Err(DriverError::OutOfMemory);
        }

        let addr = device.next_addr;
        device.next_addr += size.max(1).next_multiple_of(256);
        device.allocations.insert(addr, vec![0; size as usize]);
        device.used += size;

        Ok(DevicePtr(addr))
    }

    fn free(&self, device: usize, ptr: DevicePtr) -> Result<(), DriverError> {
        let mut device = self.device(device)?;
        let buf = device.allocations.remove(&ptr.0).ok_or(DriverError::InvalidData)?;
        device.used -= buf.len() as u64;

        Ok(())
    }

    fn register_host(&self, ptr: HostPtr, len: usize) -> Result<(), DriverError> {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut registered = self.registered.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut registered = registered.unwrap();

        registered.insert(ptr.0 as usize, len);

        Ok(())
    }

    fn unregister_host(&self, ptr: HostPtr) -> Result<(), DriverError> {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut registered = self.registered.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut registered = registered.unwrap();

        registered.remove(&(ptr.0 as usize));

        Ok(())
    }

    fn create_stream(&self, device: usize) -> Result<StreamHandle, DriverError> {
        let mut device = self.device(device)?;
        let id = device.next_stream;
        device.next_stream += 1;
        device.streams.insert(id);

        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, device: usize, stream: StreamHandle) -> Result<(), DriverError> {
        let mut device = self.device(device)?;
        if device.streams.remove(&stream.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidData)
        }
    }

    fn create_event(&self, device: usize) -> Result<EventHandle, DriverError> {
        let mut device = self.device(device)?;
        let id = device.next_event;
        device.next_event += 1;
        device.events.insert(
            id,
            MockEvent {
                recorded: false,
                remaining: 0,
            },
        );

        Ok(EventHandle(id))
    }

    fn destroy_event(&self, device: usize, event: EventHandle) -> Result<(), DriverError> {
        let mut device = self.device(device)?;
        if device.events.remove(&event.0).is_some() {
            Ok(())
        } else {
            Err(DriverError::InvalidData)
        }
    }

    fn record_event(
        &self,
        device: usize,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<(), DriverError> {
        let mut device = self.device(device)?;
        device.check_fault("record_event")?;
        if !device.streams.contains(&stream.0) {
            return Err(DriverError::InvalidData);
        }

        let latency = self.latency;
        let event = device.events.get_mut(&event.0).ok_or(DriverError::InvalidData)?;
        event.recorded = true;
        event.remaining = latency;

        Ok(())
    }

    fn query_event(&self, device: usize, event: EventHandle) -> Result<EventStatus, DriverError> {
        let mut device = self.device(device)?;
        device.check_fault("query_event")?;
        let event = device.events.get_mut(&event.0).ok_or(DriverError::InvalidData)?;
        if !event.recorded {
            return Ok(EventStatus::NotReady);
        }

        if event.remaining > 0 {
            event.remaining -= 1;

            return Ok(EventStatus::NotReady);
        }

        Ok(EventStatus::Ready)
    }

    fn copy_to_device_async(
        &self,
        device: usize,
        dst: DevicePtr,
        src: HostPtr,
        len: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError> {
        let mut device = self.device(device)?;
        device.check_fault("copy_to_device_async")?;
        if !device.streams.contains(&stream.0) {
            return Err(DriverError::InvalidData);
        }

        let dst = device.resolve(dst, len)?;
        dst.copy_from_slice(unsafe { std::slice::from_raw_parts(src.0, len) });

        Ok(())
    }

    fn copy_to_host_async(
        &self,
        device: usize,
        dst: HostPtr,
        src: DevicePtr,
        len: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError> {
        let mut device = self.device(device)?;
        device.check_fault("copy_to_host_async")?;
        if !device.streams.contains(&stream.0) {
            return Err(DriverError::InvalidData);
        }

        let src = device.resolve(src, len)?;
        unsafe { std::slice::from_raw_parts_mut(dst.0, len) }.copy_from_slice(src);

        Ok(())
    }

    fn can_access_peer(&self, device: usize, peer: usize) -> Result<bool, DriverError> {
        Ok(device != peer && device < self.devices.len() && peer < self.devices.len())
    }

    fn enable_peer_access(&self, device: usize, peer: usize) -> Result<(), DriverError> {
        if peer >= self.devices.len() {
            return Err(DriverError::InvalidData);
        }

        self.device(device)?.peers |= 1 << peer;

        Ok(())
    }
}
