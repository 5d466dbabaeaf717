//! Multi-stream pipeline: event rings, pending FIFOs, scratch workspace.
//!
//! Each stream owns a ring of `max_events` completion events paired with task
//! slots, a priority-ordered FIFO of envelopes waiting for a ring slot, and a
//! lazily allocated stack of scratch blocks for kernels. Synchronization on a
//! stream is purely event based: submission order equals completion order and
//! every query is non-blocking.

use {
    crate::{
        data::TransferStatus,
        device::DeviceCore,
        driver::{DevicePtr, Driver, EventHandle, EventStatus, StreamHandle},
        error::SchedError,
        stage,
        task::{GpuTask, LaunchContext},
    },
    log::{debug, warn},
    std::{collections::VecDeque, sync::Arc},
};

/// Completion events tracked per stream.
pub const MAX_EVENTS_PER_STREAM: usize = 4;

/// Scratch blocks per stream workspace.
pub const MAX_WORKSPACE: usize = 2;

/// Pipeline step a stream progression is driving.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Stage {
    In,
    Exec,
    Out,
}

pub(crate) struct Workspace {
    blocks: Vec<DevicePtr>,
    stack_head: usize,
}

/// One asynchronous execution lane on a device.
pub struct ExecStream {
    pub(crate) handle: StreamHandle,
    events: Vec<EventHandle>,
    tasks: Vec<Option<Box<GpuTask>>>,
    start: usize,
    end: usize,
    executed: u64,
    pending: VecDeque<Box<GpuTask>>,
    workspace: Option<Workspace>,
}

impl ExecStream {
    pub(crate) fn new(handle: StreamHandle, events: Vec<EventHandle>) -> Self {
        let max_events = events.len();

        Self {
            handle,
            events,
            tasks: (0..max_events).map(|_| None).collect(),
            start: 0,
            end: 0,
            executed: 0,
            pending: VecDeque::new(),
            workspace: None,
        }
    }

    /// Envelopes completed on this stream so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub(crate) fn events(&self) -> &[EventHandle] {
        &self.events
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.tasks[self.start].is_none()
    }

    pub(crate) fn ring_is_empty(&self) -> bool {
        self.tasks.iter().all(Option::is_none)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.ring_is_empty() && self.pending.is_empty()
    }

    /// Outstanding ring occupancy, `0..=max_events`.
    pub(crate) fn occupancy(&self) -> usize {
        self.tasks.iter().filter(|task| task.is_some()).count()
    }

    pub(crate) fn pending_mut(&mut self) -> &mut VecDeque<Box<GpuTask>> {
        &mut self.pending
    }

    /// Priority-ordered insert, descending and stable.
    pub(crate) fn push_pending(&mut self, task: Box<GpuTask>) {
        let pos = self
            .pending
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }

    pub(crate) fn take_workspace(&mut self) -> Option<Workspace> {
        self.workspace.take()
    }

    /// Removes every envelope queued or in flight on this stream, for the
    /// disable sweep.
    pub(crate) fn drain_envelopes(&mut self) -> Vec<Box<GpuTask>> {
        let mut envelopes: Vec<_> = self.pending.drain(..).collect();
        for slot in &mut self.tasks {
            if let Some(task) = slot.take() {
                envelopes.push(task);
            }
        }

        self.start = 0;
        self.end = 0;

        envelopes
    }
}

impl Workspace {
    pub(crate) fn blocks(&self) -> &[DevicePtr] {
        &self.blocks
    }
}

/// What one stream progression produced.
pub(crate) struct StreamOutcome {
    /// Envelope whose event at the ring tail fired.
    pub completed: Option<Box<GpuTask>>,

    /// Envelope whose launch failed in a task-fatal way, with the reason.
    pub failed: Option<(Box<GpuTask>, SchedError)>,
}

/// Advances one stream: optionally enqueue `new_task`, submit the best
/// pending envelope when a ring slot is free, then poll the oldest
/// outstanding event. A completion frees a ring slot, so a second submit is
/// attempted before returning.
pub(crate) fn progress_stream(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: &mut ExecStream,
    stage: Stage,
    new_task: Option<Box<GpuTask>>,
) -> Result<StreamOutcome, SchedError> {
    if let Some(task) = new_task {
        stream.push_pending(task);
    }

    let mut failed = try_submit(driver, core, stream, stage)?;
    let completed = try_poll(driver, core, stream, stage)?;
    if completed.is_some() && failed.is_none() {
        failed = try_submit(driver, core, stream, stage)?;
    }

    Ok(StreamOutcome { completed, failed })
}

type Failed = Option<(Box<GpuTask>, SchedError)>;

fn try_submit(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: &mut ExecStream,
    stage: Stage,
) -> Result<Failed, SchedError> {
    if !stream.has_free_slot() {
        return Ok(None);
    }

    let Some(mut task) = stream.pending.pop_front() else {
        return Ok(None);
    };

    match launch(driver, core, stream, stage, &mut task) {
        Ok(()) => {
            let slot = stream.start;
            if let Err(err) =
                driver.record_event(core.ordinal, stream.events[slot], stream.handle)
            {
                // keep the envelope reachable for the disable sweep
                stream.pending.push_front(task);

                return Err(err.into());
            }

            stream.tasks[slot] = Some(task);
            stream.start = (slot + 1) % stream.events.len();

            Ok(None)
        }
        Err(SchedError::Reschedule) => {
            debug!(
                "gpu{}: reschedule task {} (no room available on the device for data)",
                core.index, task.id
            );
            stream.pending.push_front(task);

            Ok(None)
        }
        Err(SchedError::DeviceFault) => {
            stream.pending.push_front(task);

            Err(SchedError::DeviceFault)
        }
        Err(err) => Ok(Some((task, err))),
    }
}

fn launch(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: &mut ExecStream,
    stage: Stage,
    task: &mut Box<GpuTask>,
) -> Result<(), SchedError> {
    match stage {
        Stage::In => stage::kernel_push(driver, core, stream.handle, task),
        Stage::Exec => {
            #[cfg(debug_assertions)]
            for flow in &task.flows {
                if let Some(out) = &flow.data_out {
                    debug_assert_eq!(out.transfer_status(), TransferStatus::Complete);
                }
            }

            let Some(mut submit) = task.submit.take() else {
                warn!("gpu{}: task {} has no launch routine", core.index, task.id);

                return Err(SchedError::NotFound);
            };
            let result = {
                let mut context = LaunchContext {
                    device_index: core.index,
                    device_ordinal: core.ordinal,
                    stream: stream.handle,
                    driver,
                    core,
                    exec: stream,
                };

                submit(&mut context, task)
            };
            task.submit = Some(submit);

            result
        }
        Stage::Out => stage::kernel_pop(driver, core, stream.handle, task),
    }
}

fn try_poll(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: &mut ExecStream,
    stage: Stage,
) -> Result<Option<Box<GpuTask>>, SchedError> {
    let end = stream.end;
    if stream.tasks[end].is_none() {
        return Ok(None);
    }

    if driver.query_event(core.ordinal, stream.events[end])? == EventStatus::NotReady {
        return Ok(None);
    }

    if stage == Stage::In {
        // The event says this envelope's copies are done, but a flow staged by
        // an earlier envelope is only marked complete when that envelope is
        // polled. Same-stream FIFO ordering makes any other state a bug.
        if let Some(task) = stream.tasks[end].as_ref() {
            for flow in &task.flows {
                if flow.access.is_ctl() {
                    continue;
                }

                let Some(out) = &flow.data_out else {
                    continue;
                };
                if out.push_task() == task.id {
                    out.set_transfer_status(TransferStatus::Complete);
                    out.set_push_task(0);
                } else if out.transfer_status() != TransferStatus::Complete {
                    debug_assert!(false, "stage-in event fired with a foreign transfer pending");
                    warn!(
                        "gpu{}: stage-in event fired for task {} but flow {} is still under transfer",
                        core.index, task.id, flow.name
                    );

                    return Ok(None);
                }
            }
        }
    }

    let Some(task) = stream.tasks[end].take() else {
        return Ok(None);
    };
    stream.end = (end + 1) % stream.events.len();
    stream.executed += 1;

    Ok(Some(task))
}

/// Pops one scratch block from the stream workspace, allocating the stack on
/// first use.
pub(crate) fn pop_workspace(
    core: &mut DeviceCore,
    stream: &mut ExecStream,
    size: usize,
) -> Result<DevicePtr, SchedError> {
    if stream.workspace.is_none() {
        let mut blocks = Vec::with_capacity(MAX_WORKSPACE);
        for _ in 0..MAX_WORKSPACE {
            match core.zone.alloc(size) {
                Some(block) => blocks.push(block),
                None => {
                    for block in blocks {
                        core.zone.free(block);
                    }

                    return Err(SchedError::OutOfResource);
                }
            }
        }

        stream.workspace = Some(Workspace {
            blocks,
            stack_head: MAX_WORKSPACE,
        });
    }

    let Some(workspace) = stream.workspace.as_mut() else {
        return Err(SchedError::OutOfResource);
    };
    if workspace.stack_head == 0 {
        return Err(SchedError::OutOfResource);
    }

    workspace.stack_head -= 1;

    Ok(workspace.blocks[workspace.stack_head])
}

/// Returns the most recently popped scratch block.
pub(crate) fn push_workspace(stream: &mut ExecStream) {
    if let Some(workspace) = stream.workspace.as_mut() {
        debug_assert!(workspace.stack_head < MAX_WORKSPACE);

        workspace.stack_head += 1;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::DeviceCore,
            driver::mock::{MockDeviceInfo, MockDriver},
            lru::{ListId, LruList, ReplicaArena},
            task::TaskType,
            zone::ZoneAllocator,
        },
    };

    fn test_core(driver: &MockDriver) -> DeviceCore {
        let base = driver.allocate(0, 4 * 1024).unwrap();

        DeviceCore {
            index: 2,
            ordinal: 0,
            zone: ZoneAllocator::new(base, 4, 1024),
            arena: ReplicaArena::new(),
            free_lru: LruList::new(ListId::Free),
            owned_lru: LruList::new(ListId::Owned),
            stats: Default::default(),
        }
    }

    fn test_stream(driver: &MockDriver) -> ExecStream {
        let handle = driver.create_stream(0).unwrap();
        let events = (0..MAX_EVENTS_PER_STREAM)
            .map(|_| driver.create_event(0).unwrap())
            .collect();

        ExecStream::new(handle, events)
    }

    fn noop_task(priority: i32) -> Box<GpuTask> {
        let mut task = GpuTask::new(Vec::new())
            .with_priority(priority)
            .with_submit(|_, _| Ok(()));
        task.task_type = TaskType::User;

        Box::new(task)
    }

    #[test]
    fn ring_occupancy_stays_bounded() {
        let mock = MockDriver::with_latency(vec![MockDeviceInfo::default()], 1_000);
        let mut core = test_core(&mock);
        let mut stream = test_stream(&mock);
        let driver: Arc<dyn Driver> = Arc::new(mock);

        // events never fire, so the ring fills up and the rest queues
        for i in 0..10 {
            let outcome =
                progress_stream(&driver, &mut core, &mut stream, Stage::Exec, Some(noop_task(i)))
                    .unwrap();

            assert!(outcome.completed.is_none());
            assert!(outcome.failed.is_none());
            assert!(stream.occupancy() <= MAX_EVENTS_PER_STREAM);
        }

        assert_eq!(stream.occupancy(), MAX_EVENTS_PER_STREAM);
        assert!(!stream.has_free_slot());
        assert_eq!(stream.pending.len(), 10 - MAX_EVENTS_PER_STREAM);
    }

    #[test]
    fn completions_come_back_in_submission_order() {
        let mock = MockDriver::uniform(1);
        let mut core = test_core(&mock);
        let mut stream = test_stream(&mock);
        let driver: Arc<dyn Driver> = Arc::new(mock);

        let mut task = noop_task(0);
        task.id = 7;
        let outcome =
            progress_stream(&driver, &mut core, &mut stream, Stage::Exec, Some(task)).unwrap();

        assert_eq!(outcome.completed.map(|task| task.id), Some(7));
        assert_eq!(stream.executed(), 1);
        assert!(stream.ring_is_empty());
    }

    #[test]
    fn priority_orders_the_pending_queue() {
        let mock = MockDriver::with_latency(vec![MockDeviceInfo::default()], 1_000);
        let mut core = test_core(&mock);
        let mut stream = test_stream(&mock);
        let driver: Arc<dyn Driver> = Arc::new(mock);

        // fill the ring so everything else queues
        for _ in 0..MAX_EVENTS_PER_STREAM {
            progress_stream(&driver, &mut core, &mut stream, Stage::Exec, Some(noop_task(0)))
                .unwrap();
        }

        for (id, priority) in [(1, 1), (2, 9), (3, 5)] {
            let mut task = noop_task(priority);
            task.id = id;
            progress_stream(&driver, &mut core, &mut stream, Stage::Exec, Some(task)).unwrap();
        }

        let order: Vec<_> = stream.pending.iter().map(|task| task.id).collect();

        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn workspace_is_a_stack() {
        let mock = MockDriver::uniform(1);
        let mut core = test_core(&mock);
        let mut stream = test_stream(&mock);

        let a = pop_workspace(&mut core, &mut stream, 1024).unwrap();
        let b = pop_workspace(&mut core, &mut stream, 1024).unwrap();

        assert_ne!(a, b);
        assert!(pop_workspace(&mut core, &mut stream, 1024).is_err());

        push_workspace(&mut stream);

        assert_eq!(pop_workspace(&mut core, &mut stream, 1024).unwrap(), b);
    }
}
