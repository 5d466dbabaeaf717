//! Device selection, the per-device progress loop, and idle drain synthesis.
//!
//! The pipeline is built on four streams: one for transfers into the device,
//! two for kernel execution and one for transfers back to main memory. Each
//! stream tracks completion with pollable events and keeps a pending FIFO of
//! envelopes waiting for a ring slot. Whichever worker wins the device lease
//! pumps all three steps until the outstanding-envelope counter returns to
//! zero; everyone else enqueues and returns immediately.

use {
    crate::{
        data::{FIRST_ACCEL_DEVICE, NO_SLOT},
        device::{Device, DeviceCore, DeviceState},
        error::SchedError,
        runtime::Runtime,
        stage,
        stream::{progress_stream, ExecStream, Stage},
        task::{AccessFlags, Flow, GpuTask, TaskStatus, TaskType},
    },
    log::{debug, warn},
    std::sync::Arc,
};

/// Replicas moved per synthesized write-back envelope.
pub const MAX_DRAIN: usize = 4;

/// Entries of the stage-in queue reordered per idle pass.
const NB_SORT: usize = 10;

/// Outcome of a submit call at the core boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    /// The envelope was queued behind another worker's lease; completion is
    /// reported through the task callback.
    Async,

    /// This call won the lease and drove the device to quiescence; every
    /// outstanding envelope completed before it returned.
    Done,

    /// The device is disabled; the upstream engine must re-route.
    Disable,
}

/// Core entry: enqueue `task` on `device` and run the progress loop if
/// this call wins the lease.
pub(crate) fn submit_to_device(
    rt: &Runtime,
    device: &Arc<Device>,
    mut task: Box<GpuTask>,
) -> SubmitOutcome {
    if device.is_dead() {
        reroute(rt, device, task);

        return SubmitOutcome::Disable;
    }

    task.id = rt.next_task_id();
    let prev = device.lease_enter();
    if prev != 0 {
        // another worker holds the lease and will drain the queue
        device.pending.push(task);

        return SubmitOutcome::Async;
    }

    let mut slot = Some(task);
    match run_progress_loop(rt, device, &mut slot, false) {
        Ok(()) => SubmitOutcome::Done,
        Err(err) => {
            disable_device(rt, device, err);
            if let Some(task) = slot.take() {
                reroute(rt, device, task);
            }

            SubmitOutcome::Disable
        }
    }
}

/// Task-less progress poke: drives outstanding work to quiescence.
pub(crate) fn poke_device(rt: &Runtime, device: &Arc<Device>) -> SubmitOutcome {
    if device.is_dead() {
        return SubmitOutcome::Disable;
    }

    let prev = device.lease_enter();
    if prev != 0 {
        device.lease_leave();

        return SubmitOutcome::Async;
    }

    let mut slot = None;
    match run_progress_loop(rt, device, &mut slot, true) {
        Ok(()) => SubmitOutcome::Done,
        Err(err) => {
            disable_device(rt, device, err);

            SubmitOutcome::Disable
        }
    }
}

fn run_progress_loop(
    rt: &Runtime,
    device: &Arc<Device>,
    task: &mut Option<Box<GpuTask>>,
    poke: bool,
) -> Result<(), SchedError> {
    let driver = rt.driver();
    driver.set_device(device.ordinal())?;

    let mut guard = device.lock_state();
    let DeviceState { streams, core } = &mut *guard;
    let mut exec_cursor = 0;

    loop {
        // stage-in step
        let outcome = progress_stream(driver, core, &mut streams[0], Stage::In, task.take())?;
        let pushed = outcome.completed.is_some();
        if let Some((failed, err)) = outcome.failed {
            if fail_task(rt, device, core, failed, err) {
                return Ok(());
            }
        }

        // execute step, round-robin over the compute streams
        let nb_exec = streams.len() - 2;
        exec_cursor = (exec_cursor + 1) % nb_exec;
        let outcome = progress_stream(
            driver,
            core,
            &mut streams[2 + exec_cursor],
            Stage::Exec,
            outcome.completed,
        )?;
        let submitted = outcome.completed.is_some();
        if let Some((failed, err)) = outcome.failed {
            if fail_task(rt, device, core, failed, err) {
                return Ok(());
            }
        }

        // nothing moved forward: see if dirty replicas can be written back
        let mut to_out = outcome.completed;
        if !pushed && !submitted && to_out.is_none() {
            to_out = create_drain_task(rt, core);
        }

        // stage-out step
        let outcome = progress_stream(driver, core, &mut streams[1], Stage::Out, to_out)?;
        let popped = outcome.completed.is_some();
        if let Some((failed, err)) = outcome.failed {
            if fail_task(rt, device, core, failed, err) {
                return Ok(());
            }
        }

        if let Some(mut done) = outcome.completed {
            match done.task_type {
                TaskType::DrainOut => {
                    debug!("gpu{}: drained {} replicas to the host", core.index, done.flows.len());
                    stage::drain_epilog(core, &mut done);
                    // synthesized envelopes are not counted on the lease
                }
                TaskType::User => {
                    stage::kernel_epilog(core, &mut done);
                    rt.release_load(device.index(), done.load);
                    device.count_executed();
                    if let Some(complete) = done.on_complete.take() {
                        complete(TaskStatus::Done);
                    }

                    if device.lease_leave() == 1 {
                        // every outstanding envelope has retired
                        return Ok(());
                    }
                }
            }
        }

        // fetch more work from the shared queue
        if task.is_none() {
            if !submitted && !popped {
                sort_pending(core, &mut streams[0]);
            }

            *task = device.pending.pop();
            if let Some(task) = task.as_ref() {
                debug!("gpu{}: picked task {} from the shared queue", core.index, task.id);
            }
        }

        // a poke holds one extra count, released only once fully idle
        if poke
            && task.is_none()
            && device.pending.is_empty()
            && streams.iter().all(ExecStream::is_idle)
            && device.lease_release_idle()
        {
            return Ok(());
        }
    }
}

/// Fails one envelope back to the upstream engine; true when the lease
/// dropped to zero and the loop must exit.
fn fail_task(
    rt: &Runtime,
    device: &Arc<Device>,
    core: &mut DeviceCore,
    mut task: Box<GpuTask>,
    err: SchedError,
) -> bool {
    warn!("gpu{}: task {} failed: {err}", core.index, task.id);

    if task.task_type == TaskType::DrainOut {
        // synthesized envelopes never counted on the lease; unpin their
        // replicas back into the dirty ring for a later attempt
        unpin_drain(core, &task);

        return false;
    }

    stage::cleanup_failed(core, &mut task);
    rt.release_load(device.index(), task.load);
    if let Some(complete) = task.on_complete.take() {
        complete(TaskStatus::Failed(err));
    }

    device.lease_leave() == 1
}

/// Hands a task back for CPU fallback after its device died.
fn reroute(rt: &Runtime, device: &Arc<Device>, mut task: Box<GpuTask>) {
    rt.release_load(device.index(), task.load);
    if let Some(complete) = task.on_complete.take() {
        complete(TaskStatus::Rerouted);
    }
}

/// Returns a dead drain envelope's pinned replicas to the dirty ring.
fn unpin_drain(core: &mut DeviceCore, task: &GpuTask) {
    for flow in &task.flows {
        if let Some(copy) = &flow.data_out {
            copy.release_reader();
            let slot = copy.arena_slot();
            if slot != NO_SLOT {
                core.owned_lru.push_fifo(&mut core.arena, slot);
            }
        }
    }
}

/// Disables the device after a fatal driver error: every envelope still
/// queued or in flight is returned to the upstream scheduler with its staged
/// state rolled back, and the lease stays held for good.
fn disable_device(rt: &Runtime, device: &Arc<Device>, err: SchedError) {
    warn!(
        "gpu{}: critical issue related to the device discovered: {err}; giving up on it",
        device.index()
    );
    device.mark_dead();
    while let Some(task) = device.pending.pop() {
        reroute(rt, device, task);
    }

    // envelopes already inside the pipeline are handed back as well
    let mut guard = device.lock_state();
    let DeviceState { streams, core } = &mut *guard;
    for stream in streams.iter_mut() {
        for mut task in stream.drain_envelopes() {
            match task.task_type {
                TaskType::DrainOut => unpin_drain(core, &task),
                TaskType::User => {
                    stage::cleanup_failed(core, &mut task);
                    reroute(rt, device, task);
                }
            }
        }
    }
}

/// Walks the dirty ring for replicas safe to write back and pins them into a
/// synthesized envelope.
fn create_drain_task(rt: &Runtime, core: &mut DeviceCore) -> Option<Box<GpuTask>> {
    let mut flows = Vec::new();
    let mut cursor = core.owned_lru.first();

    while let Some(slot) = cursor {
        if flows.len() >= MAX_DRAIN {
            break;
        }

        cursor = core.owned_lru.next(&core.arena, slot);

        let Some(entry) = core.arena.get(slot) else {
            continue;
        };
        if entry.copy.readers() != 0 || entry.data.host_copy().readers() != 0 {
            continue;
        }

        let data = Arc::clone(&entry.data);
        let copy = Arc::clone(&entry.copy);

        debug_assert!(core.owned_lru.contains(&core.arena, slot));

        core.owned_lru.chop(&mut core.arena, slot);
        copy.add_reader();
        flows.push(Flow {
            name: "drain".to_owned(),
            access: AccessFlags::WRITE,
            data,
            data_in: None,
            data_out: Some(copy),
            pushout: true,
            staged: false,
        });
    }

    if flows.is_empty() {
        return None;
    }

    debug!("gpu{}: synthesizing a write-back for {} dirty replicas", core.index, flows.len());

    let mut task = GpuTask::new(flows).with_priority(i32::MAX);
    task.task_type = TaskType::DrainOut;
    task.id = rt.next_task_id();

    Some(Box::new(task))
}

/// Reorders the head of the stage-in queue so envelopes needing the least new
/// device space run first.
fn sort_pending(core: &DeviceCore, stream: &mut ExecStream) {
    let pending = stream.pending_mut();
    let n = pending.len().min(NB_SORT);
    if n < 2 {
        return;
    }

    for i in 0..n {
        let mut min = i;
        let mut min_space = space_needed(core, &pending[min]);
        for j in i + 1..n {
            let space = space_needed(core, &pending[j]);
            if space < min_space {
                min = j;
                min_space = space;
            }
        }

        if min != i {
            if let Some(task) = pending.remove(min) {
                pending.insert(i, task);
            }
        }
    }
}

/// Number of read flows lacking a resident replica.
fn space_needed(core: &DeviceCore, task: &GpuTask) -> usize {
    task.flows
        .iter()
        .filter(|flow| {
            !flow.access.is_ctl()
                && flow.access.contains(AccessFlags::READ)
                && flow.data.copy(core.index).is_none()
        })
        .count()
}

/// Chooses the executing device for `task` and charges the chosen
/// accelerator's load provisionally.
#[profiling::function]
pub(crate) fn best_device(rt: &Runtime, task: &mut GpuTask, ratio: f64) -> usize {
    // locality first: a written datum already owned by an accelerator stays
    // there regardless of load
    for flow in &task.flows {
        if flow.access.contains(AccessFlags::WRITE) {
            let owner = flow.data.owner_device();
            if owner >= FIRST_ACCEL_DEVICE as i32 {
                let owner = owner as usize;
                if rt.device(owner).map_or(false, |device| !device.is_dead()) {
                    return owner;
                }
            }
        }
    }

    let mut best = 0;
    let mut best_weight = rt.load(0) + ratio as f32 * rt.sweight(0);
    for device in rt.devices() {
        if device.is_dead() {
            continue;
        }

        let weight = rt.load(device.index()) + ratio as f32 * device.sweight();
        if best_weight > weight {
            best = device.index();
            best_weight = weight;
        }
    }

    if best != 0 {
        let charge = ratio as f32 * rt.sweight(best);
        rt.charge_load(best, charge);
        task.load = charge;
    }

    best
}
