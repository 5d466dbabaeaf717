//! Device table entries and the bounded per-device memory pool.

use {
    crate::{
        config::Config,
        data::Coherency,
        driver::{DevicePtr, DeviceProperties, Driver, DriverError},
        error::SchedError,
        lru::{ListId, LruList, ReplicaArena},
        stream::{ExecStream, MAX_EVENTS_PER_STREAM},
        task::GpuTask,
        zone::ZoneAllocator,
    },
    crossbeam::queue::SegQueue,
    derive_builder::{Builder, UninitializedFieldError},
    log::{debug, warn},
    std::{
        ops::DerefMut,
        sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        sync::Arc,
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Streams per device: index 0 stages in, index 1 stages out, the remainder
/// execute kernels.
pub const MAX_STREAMS: usize = 4;

/// How many times single precision outruns double, per major generation.
const STOD_RATE: [f32; 3] = [8.0, 2.0, 3.0];

/// Memory pool sizing, from config or built directly.
#[derive(Builder, Clone, Copy, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "PoolInfoBuilderError"),
    derive(Debug),
    pattern = "owned"
)]
pub struct PoolInfo {
    /// Element size of pool blocks in bytes.
    #[builder(default = "32 * 1024")]
    pub block_size: usize,

    /// Percent of free device memory to reserve.
    #[builder(default = "95")]
    pub memory_use: u32,

    /// Exact block count, overriding `memory_use`.
    #[builder(default)]
    pub block_count: Option<usize>,
}

impl Default for PoolInfo {
    fn default() -> Self {
        PoolInfoBuilder::default().build()
    }
}

impl From<&Config> for PoolInfo {
    fn from(config: &Config) -> Self {
        Self {
            block_size: config.memory_block_size(),
            memory_use: config.memory_use(),
            block_count: config.memory_number_of_blocks(),
        }
    }
}

impl PoolInfoBuilder {
    /// Builds a new `PoolInfo`.
    pub fn build(self) -> PoolInfo {
        match self.fallible_build() {
            Err(PoolInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<PoolInfoBuilder> for PoolInfo {
    fn from(info: PoolInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct PoolInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for PoolInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// Transfer accounting for one device.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceStats {
    pub required_data_in: u64,
    pub transferred_data_in: u64,
    pub required_data_out: u64,
    pub transferred_data_out: u64,
}

/// Per-device state mutable only under the device lease.
pub struct DeviceCore {
    pub(crate) index: usize,
    pub(crate) ordinal: usize,
    pub(crate) zone: ZoneAllocator,
    pub(crate) arena: ReplicaArena,
    pub(crate) free_lru: LruList,
    pub(crate) owned_lru: LruList,
    pub(crate) stats: DeviceStats,
}

impl DeviceCore {
    /// Removes `slot` from whichever ring currently holds it.
    pub(crate) fn unlist(&mut self, slot: u32) {
        if !self.free_lru.chop(&mut self.arena, slot) {
            self.owned_lru.chop(&mut self.arena, slot);
        }
    }
}

pub(crate) struct DeviceState {
    pub streams: Vec<ExecStream>,
    pub core: DeviceCore,
}

/// One enabled accelerator.
pub struct Device {
    index: usize,
    ordinal: usize,
    name: String,
    major: u32,
    minor: u32,
    concurrent_kernels: bool,
    compute_mode: u32,
    multiprocessor_count: u32,
    clock_rate_khz: u32,
    sweight: f32,
    dweight: f32,
    peer_access_mask: AtomicU32,

    /// Outstanding-envelope counter doubling as the lease: the worker
    /// observing the 0→1 transition owns the device until it falls back to 0.
    mutex: AtomicU32,

    pub(crate) pending: SegQueue<Box<GpuTask>>,
    executed_tasks: AtomicU64,
    dead: AtomicBool,
    pub(crate) state: Mutex<DeviceState>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn init(
        driver: &Arc<dyn Driver>,
        index: usize,
        ordinal: usize,
        props: DeviceProperties,
        pool: PoolInfo,
    ) -> Result<Self, SchedError> {
        let cores = cores_per_multiprocessor(props.major, props.minor).ok_or_else(|| {
            debug!("unsupported device capability {}.{}, skipping", props.major, props.minor);

            SchedError::NotFound
        })?;
        let sweight = props.multiprocessor_count as f32
            * cores as f32
            * props.clock_rate_khz as f32
            * 2.0
            / 1_000_000.0;
        let dweight = sweight / STOD_RATE[(props.major.saturating_sub(1) as usize).min(2)];

        driver.set_device(ordinal)?;
        let zone = reserve_memory(driver, ordinal, &props.name, pool)?;

        let mut streams = Vec::with_capacity(MAX_STREAMS);
        for _ in 0..MAX_STREAMS {
            let handle = driver.create_stream(ordinal)?;
            let mut events = Vec::with_capacity(MAX_EVENTS_PER_STREAM);
            for _ in 0..MAX_EVENTS_PER_STREAM {
                events.push(driver.create_event(ordinal)?);
            }

            streams.push(ExecStream::new(handle, events));
        }

        Ok(Self {
            index,
            ordinal,
            name: props.name,
            major: props.major,
            minor: props.minor,
            concurrent_kernels: props.concurrent_kernels,
            compute_mode: props.compute_mode,
            multiprocessor_count: props.multiprocessor_count,
            clock_rate_khz: props.clock_rate_khz,
            sweight,
            dweight,
            peer_access_mask: AtomicU32::new(0),
            mutex: AtomicU32::new(0),
            pending: SegQueue::new(),
            executed_tasks: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                streams,
                core: DeviceCore {
                    index,
                    ordinal,
                    zone,
                    arena: ReplicaArena::new(),
                    free_lru: LruList::new(ListId::Free),
                    owned_lru: LruList::new(ListId::Owned),
                    stats: DeviceStats::default(),
                },
            }),
        })
    }

    /// Global device index (accelerators start at 2).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Backend ordinal.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compute capability as `(major, minor)`.
    pub fn capability(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    pub fn concurrent_kernels(&self) -> bool {
        self.concurrent_kernels
    }

    pub fn compute_mode(&self) -> u32 {
        self.compute_mode
    }

    pub fn multiprocessor_count(&self) -> u32 {
        self.multiprocessor_count
    }

    pub fn clock_rate_khz(&self) -> u32 {
        self.clock_rate_khz
    }

    /// Single-precision GFLOPS proxy used by the selector.
    pub fn sweight(&self) -> f32 {
        self.sweight
    }

    /// Double-precision weight derived by the per-generation ratio.
    pub fn dweight(&self) -> f32 {
        self.dweight
    }

    pub fn peer_access_mask(&self) -> u32 {
        self.peer_access_mask.load(Ordering::Acquire)
    }

    pub(crate) fn add_peer(&self, ordinal: usize) {
        self.peer_access_mask.fetch_or(1 << ordinal, Ordering::AcqRel);
    }

    /// Envelopes currently outstanding on this device.
    pub fn outstanding(&self) -> u32 {
        self.mutex.load(Ordering::Acquire)
    }

    pub fn executed_tasks(&self) -> u64 {
        self.executed_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn count_executed(&self) {
        self.executed_tasks.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether a fatal driver error disabled this device.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Increments the lease counter, returning the previous value; the caller
    /// observing 0 owns the device.
    pub(crate) fn lease_enter(&self) -> u32 {
        self.mutex.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the lease counter, returning the previous value.
    pub(crate) fn lease_leave(&self) -> u32 {
        self.mutex.fetch_sub(1, Ordering::AcqRel)
    }

    /// Releases an idle lease held with exactly one count.
    pub(crate) fn lease_release_idle(&self) -> bool {
        self.mutex.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub(crate) fn lock_state(&self) -> impl DerefMut<Target = DeviceState> + '_ {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut state = self.state.lock();

        #[cfg(not(feature = "parking_lot"))]
        let state = state.unwrap();

        state
    }

    /// Transfer accounting snapshot.
    pub fn stats(&self) -> DeviceStats {
        self.lock_state().core.stats
    }

    /// Unallocated pool blocks right now.
    pub fn pool_free_blocks(&self) -> usize {
        self.lock_state().core.zone.free_units()
    }

    /// Replicas resident on this device.
    pub fn resident_replicas(&self) -> usize {
        self.lock_state().core.arena.len()
    }

    /// `(free_lru, owned_lru)` lengths.
    pub fn lru_lens(&self) -> (usize, usize) {
        let state = self.lock_state();

        (state.core.free_lru.len(), state.core.owned_lru.len())
    }

    /// Logs ring occupancy and both LRU rings.
    pub fn dump_state(&self) {
        let state = self.lock_state();
        for (idx, stream) in state.streams.iter().enumerate() {
            debug!(
                "gpu{}: stream {idx} occupancy {} executed {}",
                self.index,
                stream.occupancy(),
                stream.executed()
            );
        }

        debug!(
            "gpu{}: {} resident replicas, free lru {}, owned lru {}, {} free blocks",
            self.index,
            state.core.arena.len(),
            state.core.free_lru.len(),
            state.core.owned_lru.len(),
            state.core.zone.free_units()
        );
    }

    /// Returns every replica and the pool block to the driver at
    /// teardown. Dirty replicas are discarded with a warning.
    pub(crate) fn release(&self, driver: &Arc<dyn Driver>) -> Result<(), DriverError> {
        driver.set_device(self.ordinal)?;

        let mut state = self.lock_state();
        let DeviceState { streams, core } = &mut *state;

        for list in [&mut core.free_lru, &mut core.owned_lru] {
            while let Some(slot) = list.pop_fifo(&mut core.arena) {
                let Some(entry) = core.arena.remove(slot) else {
                    continue;
                };
                if entry.copy.coherency() == Coherency::Owned {
                    warn!(
                        "gpu{} still owns the master copy of datum {:#x} and is discarding it",
                        self.index,
                        entry.data.key()
                    );
                }

                entry.data.detach(self.index);
                core.zone.free(entry.copy.ptr());
            }
        }

        for stream in streams.iter_mut() {
            if let Some(workspace) = stream.take_workspace() {
                for &block in workspace.blocks() {
                    core.zone.free(block);
                }
            }

            for &event in stream.events() {
                driver.destroy_event(self.ordinal, event)?;
            }

            driver.destroy_stream(self.ordinal, stream.handle)?;
        }

        let zone = std::mem::replace(&mut core.zone, ZoneAllocator::new(DevicePtr::NULL, 0, 1));
        let base = zone.into_base();
        if !base.is_null() {
            driver.free(self.ordinal, base)?;
        }

        Ok(())
    }
}

fn reserve_memory(
    driver: &Arc<dyn Driver>,
    ordinal: usize,
    name: &str,
    pool: PoolInfo,
) -> Result<ZoneAllocator, SchedError> {
    let (free, _total) = driver.memory_info(ordinal)?;
    let eltsize = pool.block_size as u64;
    let mut how_much = match pool.block_count {
        Some(0) => {
            warn!("invalid argument: requesting zero bytes of pool memory on device {name}");

            return Err(SchedError::OutOfResource);
        }
        Some(blocks) => blocks as u64 * eltsize,
        None => pool.memory_use as u64 * free / 100,
    };
    if how_much > free {
        warn!(
            "requested {how_much} bytes on device {name} but only {free} are available, \
             reducing the reservation to what fits"
        );
        how_much = free;
    }

    if how_much < eltsize {
        warn!("cannot reserve even one {eltsize} byte block on device {name}");

        return Err(SchedError::OutOfResource);
    }

    let nb_units = how_much.div_ceil(eltsize);
    let base = driver.allocate(ordinal, nb_units * eltsize).map_err(|err| {
        warn!("allocating the memory pool on device {name} failed: {err}");

        SchedError::from(err)
    })?;
    debug!("allocated {nb_units} blocks of {eltsize} bytes on device {name}");

    Ok(ZoneAllocator::new(base, nb_units as usize, pool.block_size))
}

fn cores_per_multiprocessor(major: u32, minor: u32) -> Option<u32> {
    match (major, minor) {
        (1, _) => Some(8),
        (2, 0) => Some(32),
        (2, 1) => Some(48),
        (3, _) => Some(192),
        _ => None,
    }
}
