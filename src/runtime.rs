//! Process-scoped runtime: device discovery, the load vector, and the core
//! entry points.

use {
    crate::{
        config::Config,
        data::{DataDesc, FIRST_ACCEL_DEVICE},
        device::{Device, PoolInfo},
        driver::Driver,
        error::SchedError,
        kernel::{self, KernelResolver, LibraryResolver, TaskHandle},
        sched::{self, SubmitOutcome},
        task::{GpuTask, TaskStatus},
    },
    crossbeam::atomic::AtomicCell,
    log::{info, warn},
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Selector weight of the host entry; an accelerator wins whenever one is
/// enabled.
const HOST_WEIGHT: f32 = 1.0e30;

/// The device table and everything shared across workers.
///
/// Created once at init, passed explicitly into every core entry, destroyed
/// at fini.
pub struct Runtime {
    driver: Arc<dyn Driver>,
    devices: Vec<Arc<Device>>,

    /// Provisional load per global device index (0 = host, 1 = reserved).
    load: Vec<AtomicCell<u32>>,

    resolver: Arc<dyn KernelResolver>,
    task_ids: AtomicU64,
    released: AtomicBool,
}

impl Runtime {
    /// Discovers and initializes the enabled devices.
    pub fn init(driver: Arc<dyn Driver>, config: &Config) -> Result<Self, SchedError> {
        let resolver: Arc<dyn KernelResolver> = Arc::new(LibraryResolver::new(config.path()));

        Self::with_resolver(driver, config, resolver)
    }

    /// Same, with an injected kernel resolver.
    pub fn with_resolver(
        driver: Arc<dyn Driver>,
        config: &Config,
        resolver: Arc<dyn KernelResolver>,
    ) -> Result<Self, SchedError> {
        let mut devices = Vec::new();
        let use_count = config.enabled();
        if use_count == 0 {
            info!("device core disabled by configuration");
        } else {
            let available = driver.device_count()?;
            let ndevices = if available < use_count {
                warn!(
                    "user requested {use_count} devices, but only {available} are available in \
                     this machine; enabling all of them"
                );

                available
            } else {
                use_count
            };
            let pool = PoolInfo::from(config);
            let mask = config.mask();
            for ordinal in 0..ndevices {
                // allow fine grain selection of the devices
                if mask & (1 << ordinal) == 0 {
                    continue;
                }

                let props = match driver.device_properties(ordinal) {
                    Ok(props) => props,
                    Err(err) => {
                        warn!("skipping device {ordinal}: {err}");
                        continue;
                    }
                };
                let index = FIRST_ACCEL_DEVICE + devices.len();
                match Device::init(&driver, index, ordinal, props, pool) {
                    Ok(device) => {
                        let device = Arc::new(device);
                        if config.show_caps() {
                            log_capabilities(&device);
                        }

                        devices.push(device);
                    }
                    Err(err) => warn!("skipping device {ordinal}: {err}"),
                }
            }

            // probe and enable peer access between enabled device pairs
            for source in &devices {
                for target in &devices {
                    if source.ordinal() == target.ordinal() {
                        continue;
                    }

                    let can = driver
                        .can_access_peer(source.ordinal(), target.ordinal())
                        .unwrap_or(false);
                    if can && driver.enable_peer_access(source.ordinal(), target.ordinal()).is_ok()
                    {
                        source.add_peer(target.ordinal());
                    }
                }
            }
        }

        let load = (0..FIRST_ACCEL_DEVICE + devices.len())
            .map(|_| AtomicCell::new(0.0f32.to_bits()))
            .collect();

        Ok(Self {
            driver,
            devices,
            load,
            resolver,
            task_ids: AtomicU64::new(1),
            released: AtomicBool::new(false),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Enabled accelerators, in device-table order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Looks up an accelerator by global device index.
    pub fn device(&self, index: usize) -> Option<&Arc<Device>> {
        self.devices.get(index.checked_sub(FIRST_ACCEL_DEVICE)?)
    }

    pub(crate) fn load(&self, index: usize) -> f32 {
        self.load
            .get(index)
            .map_or(0.0, |cell| f32::from_bits(cell.load()))
    }

    /// Provisional load currently charged against a device.
    pub fn device_load(&self, index: usize) -> f32 {
        self.load(index)
    }

    pub(crate) fn sweight(&self, index: usize) -> f32 {
        self.device(index).map_or(HOST_WEIGHT, |device| device.sweight())
    }

    pub(crate) fn charge_load(&self, index: usize, amount: f32) {
        if let Some(load) = self.load.get(index) {
            let _ = load.fetch_update(|bits| Some((f32::from_bits(bits) + amount).to_bits()));
        }
    }

    pub(crate) fn release_load(&self, index: usize, amount: f32) {
        if let Some(load) = self.load.get(index) {
            let _ = load.fetch_update(|bits| Some((f32::from_bits(bits) - amount).to_bits()));
        }
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.task_ids.fetch_add(1, Ordering::AcqRel)
    }

    /// Core entry: enqueues `task` for `device_index` and drives the
    /// progress loop when this call wins the device lease.
    #[profiling::function]
    pub fn submit(&self, mut task: Box<GpuTask>, device_index: usize) -> SubmitOutcome {
        let Some(device) = self.device(device_index) else {
            warn!("submit to unknown device {device_index}");
            if let Some(complete) = task.on_complete.take() {
                complete(TaskStatus::Rerouted);
            }

            return SubmitOutcome::Disable;
        };

        sched::submit_to_device(self, device, task)
    }

    /// Drives `device_index`'s pipelines to quiescence without new work.
    pub fn progress(&self, device_index: usize) -> SubmitOutcome {
        let Some(device) = self.device(device_index) else {
            return SubmitOutcome::Disable;
        };

        sched::poke_device(self, device)
    }

    /// Chooses the executing device for `task` based on load and per-device
    /// weight, charging the winner provisionally.
    pub fn select_device(&self, task: &mut GpuTask, ratio: f64) -> usize {
        sched::best_device(self, task, ratio)
    }

    /// Registers (pins) host memory once per descriptor; repeated calls are
    /// no-ops.
    pub fn register_host_memory(&self, desc: &DataDesc) -> Result<(), SchedError> {
        if !desc.begin_register() {
            return Ok(());
        }

        self.driver.register_host(desc.base(), desc.len()).map_err(|err| {
            desc.cancel_register();

            SchedError::from(err)
        })
    }

    /// Unregisters host memory; a no-op unless currently registered.
    pub fn unregister_host_memory(&self, desc: &DataDesc) -> Result<(), SchedError> {
        if !desc.begin_unregister() {
            return Ok(());
        }

        Ok(self.driver.unregister_host(desc.base())?)
    }

    /// Resolves kernels for every enabled device; succeeds when at least one
    /// device can run the handle.
    pub fn register_handle(&self, handle: &TaskHandle) -> Result<(), SchedError> {
        let mut rc = Err(SchedError::NotFound);
        for device in &self.devices {
            let (major, minor) = device.capability();
            if kernel::register_handle(
                self.resolver.as_ref(),
                handle,
                device.index(),
                device.ordinal(),
                major,
                minor,
            )
            .is_ok()
            {
                rc = Ok(());
            }
        }

        rc
    }

    /// Releases every device pool and stream.
    pub fn fini(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        for device in &self.devices {
            if let Err(err) = device.release(&self.driver) {
                warn!("releasing device {} failed: {err}", device.index());
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.fini();
    }
}

fn log_capabilities(device: &Device) {
    let (major, minor) = device.capability();
    info!(
        "Device {} (capability {major}.{minor}): {}\n\
         \tSM                 : {}\n\
         \tclockRate          : {}\n\
         \tconcurrency        : {}\n\
         \tcomputeMode        : {}\n\
         \tFlops capacity     : single {:.4}, double {:.4}",
        device.index(),
        device.name(),
        device.multiprocessor_count(),
        device.clock_rate_khz(),
        if device.concurrent_kernels() { "yes" } else { "no" },
        device.compute_mode(),
        device.sweight(),
        device.dweight(),
    );
}
