//! Task envelopes and their data flows.

use {
    crate::{
        data::{Data, DataCopy},
        device::DeviceCore,
        driver::{DevicePtr, Driver, StreamHandle},
        error::SchedError,
        stream::{pop_workspace, push_workspace, ExecStream},
    },
    bitflags::bitflags,
    std::{
        fmt::{Debug, Formatter},
        sync::Arc,
    },
};

bitflags! {
    /// Access mode bits of one task flow.
    ///
    /// An empty value marks a pure control dependency carrying no data.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl AccessFlags {
    /// Control-only flows carry no data.
    pub fn is_ctl(self) -> bool {
        self.is_empty()
    }
}

/// Distinguishes user submissions from synthesized write-back envelopes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskType {
    User,

    /// Bulk device→host write-back created when the device is otherwise idle.
    DrainOut,
}

/// Terminal state reported to the upstream engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    /// Stage-out finished; results are in the host replicas.
    Done,

    /// The task failed for the named reason; the device continues.
    Failed(SchedError),

    /// The device was disabled before the task ran; submit it elsewhere.
    Rerouted,
}

/// One named data dependency of a task.
pub struct Flow {
    pub name: String,
    pub access: AccessFlags,

    /// The datum this flow reads or writes.
    pub data: Arc<Data>,

    /// Input replica chosen by the upstream engine (the host replica here).
    pub data_in: Option<Arc<DataCopy>>,

    /// Replica the task actually touches; filled in during reservation and
    /// rewritten to the host replica at completion so downstream consumers
    /// see a host address.
    pub data_out: Option<Arc<DataCopy>>,

    /// Forces write-back to the host replica at task end.
    pub pushout: bool,

    /// Whether stage-in already accounted this flow (readers, pin).
    pub(crate) staged: bool,
}

impl Flow {
    fn new(name: impl Into<String>, access: AccessFlags, data: &Arc<Data>) -> Self {
        Self {
            name: name.into(),
            access,
            data: Arc::clone(data),
            data_in: Some(data.host_copy()),
            data_out: None,
            pushout: false,
            staged: false,
        }
    }

    /// A read-only flow staged from the host replica.
    pub fn read(name: impl Into<String>, data: &Arc<Data>) -> Self {
        Self::new(name, AccessFlags::READ, data)
    }

    /// A write flow, pushed back to the host at task end.
    pub fn write(name: impl Into<String>, data: &Arc<Data>) -> Self {
        let mut flow = Self::new(name, AccessFlags::WRITE, data);
        flow.pushout = true;

        flow
    }

    /// A read-modify-write flow, pushed back to the host at task end.
    pub fn read_write(name: impl Into<String>, data: &Arc<Data>) -> Self {
        let mut flow = Self::new(name, AccessFlags::READ | AccessFlags::WRITE, data);
        flow.pushout = true;

        flow
    }

    /// A pure control dependency.
    pub fn ctl(name: impl Into<String>, data: &Arc<Data>) -> Self {
        let mut flow = Self::new(name, AccessFlags::empty(), data);
        flow.data_in = None;

        flow
    }

    /// Overrides the write-back behavior; without pushout the device replica
    /// stays authoritative until an idle drain moves it back.
    pub fn with_pushout(mut self, pushout: bool) -> Self {
        self.pushout = pushout;

        self
    }
}

/// Everything a submit callback may touch while launching device work.
pub struct LaunchContext<'a> {
    /// Global device index (0 = host, accelerators from 2).
    pub device_index: usize,

    /// Backend ordinal of the executing device.
    pub device_ordinal: usize,

    /// The compute stream the launch must target.
    pub stream: StreamHandle,

    pub driver: &'a Arc<dyn Driver>,

    pub(crate) core: &'a mut DeviceCore,
    pub(crate) exec: &'a mut ExecStream,
}

impl LaunchContext<'_> {
    /// Pops one scratch block from the stream workspace.
    pub fn pop_workspace(&mut self, size: usize) -> Result<DevicePtr, SchedError> {
        pop_workspace(self.core, self.exec, size)
    }

    /// Returns the most recently popped scratch block.
    pub fn push_workspace(&mut self) {
        push_workspace(self.exec);
    }
}

/// Device-specific launch routine supplied by the upstream engine.
pub type SubmitFn =
    Box<dyn FnMut(&mut LaunchContext<'_>, &mut GpuTask) -> Result<(), SchedError> + Send>;

/// Invoked exactly once when the scheduler is done with a task.
pub type CompleteFn = Box<dyn FnOnce(TaskStatus) + Send>;

/// The scheduler's view of one ready task.
pub struct GpuTask {
    pub(crate) id: u64,
    pub task_type: TaskType,
    pub priority: i32,
    pub flows: Vec<Flow>,
    pub submit: Option<SubmitFn>,
    pub on_complete: Option<CompleteFn>,

    /// Load charged by the selector, released at completion.
    pub(crate) load: f32,
}

impl GpuTask {
    pub fn new(flows: Vec<Flow>) -> Self {
        Self {
            id: 0,
            task_type: TaskType::User,
            priority: 0,
            flows,
            submit: None,
            on_complete: None,
            load: 0.0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;

        self
    }

    pub fn with_submit(
        mut self,
        submit: impl FnMut(&mut LaunchContext<'_>, &mut GpuTask) -> Result<(), SchedError>
            + Send
            + 'static,
    ) -> Self {
        self.submit = Some(Box::new(submit));

        self
    }

    pub fn on_complete(mut self, complete: impl FnOnce(TaskStatus) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(complete));

        self
    }
}

impl Debug for GpuTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} ({:?}, priority {}, {} flows)",
            self.id,
            self.task_type,
            self.priority,
            self.flows.len()
        )
    }
}
