//! Multi-stream GPU task scheduler and data-movement engine for task-graph
//! runtimes.
//!
//! The core accepts ready tasks from an upstream dataflow engine and drives
//! their execution across accelerator devices: it decides which device runs
//! which task, stages input data in, overlaps staging with computation over
//! multiple asynchronous streams, stages results out, and manages a bounded
//! pool of device memory as a coherent cache of host data.
//!
//! # Pieces
//!
//! - [`Runtime`] owns the device table; [`Runtime::submit`] is the single
//!   entry through which workers hand over ready [`GpuTask`] envelopes.
//! - [`Data`] and [`DataCopy`] track replicas of each datum across the host
//!   and devices with MESI-style coherency states and a version counter.
//! - Each [`Device`] carries a bounded memory pool managed as an LRU cache,
//!   four streams (stage-in, stage-out, two compute lanes), and an
//!   outstanding-envelope counter doubling as an exclusive lease: any worker
//!   may submit to any device, but only one worker at a time progresses it.
//! - The [`Driver`] trait is the complete backend contract; anything able to
//!   enumerate devices, move bytes asynchronously and record pollable events
//!   can sit below the scheduler.
//!
//! There are no suspension points: the progress loop never blocks on device
//! work, all copies are asynchronous, and stream events are polled.

pub mod config;
pub mod data;
pub mod device;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod runtime;
pub mod task;

mod lru;
mod sched;
mod stage;
mod stream;
mod zone;

pub use self::{
    config::Config,
    data::{Coherency, Data, DataCopy, DataDesc, TransferStatus, FIRST_ACCEL_DEVICE, HOST_DEVICE},
    device::{Device, DeviceStats, PoolInfo, PoolInfoBuilder, MAX_STREAMS},
    driver::{
        DevicePtr, DeviceProperties, Driver, DriverError, EventHandle, EventStatus, HostPtr,
        StreamHandle,
    },
    error::SchedError,
    kernel::{KernelResolver, KernelSymbol, LibraryResolver, TaskClass, TaskHandle},
    runtime::Runtime,
    sched::{SubmitOutcome, MAX_DRAIN},
    stream::{MAX_EVENTS_PER_STREAM, MAX_WORKSPACE},
    task::{AccessFlags, Flow, GpuTask, LaunchContext, TaskStatus, TaskType},
};

use log::info;

/// Only required when you are not running a full runtime but still using
/// other engine types and you want debugging setup.
pub fn init_debug() {
    pretty_env_logger::init();

    info!("Streamline v0.1.0");
}
