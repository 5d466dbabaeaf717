//! Stage-in / stage-out engine: space reservation, host↔device movement, and
//! the completion epilog.

use {
    crate::{
        data::{DataCopy, TransferStatus, HOST_DEVICE, NO_SLOT},
        device::DeviceCore,
        driver::{Driver, StreamHandle},
        error::SchedError,
        lru::ArenaEntry,
        task::{AccessFlags, Flow, GpuTask, TaskType},
    },
    log::{debug, warn},
    std::sync::Arc,
};

/// Ensures every non-CTL flow has a resident replica, evicting victims when
/// the pool is full.
///
/// On failure every replica popped during the search is pushed back to the
/// head of the free ring, so repeated `Reschedule` calls neither leak nor
/// duplicate replicas.
#[profiling::function]
pub(crate) fn reserve_device_space(
    core: &mut DeviceCore,
    task: &mut GpuTask,
) -> Result<(), SchedError> {
    let device = core.index;
    let mut popped = Vec::new();
    let mut result = Ok(());

    'flows: for i in 0..task.flows.len() {
        if task.flows[i].access.is_ctl() {
            continue;
        }

        let master = Arc::clone(&task.flows[i].data);
        if let Some(copy) = master.copy(device) {
            task.flows[i].data_out = Some(copy);
            continue;
        }

        let ptr = loop {
            if let Some(ptr) = core.zone.alloc(master.len()) {
                break ptr;
            }

            let Some(victim) = core.free_lru.pop_fifo(&mut core.arena) else {
                warn!(
                    "gpu{device}: request for space failed for {} of {} flows",
                    task.flows.len() - i,
                    task.flows.len()
                );
                result = Err(SchedError::Reschedule);
                break 'flows;
            };
            let Some(entry) = core.arena.get(victim) else {
                continue;
            };
            if entry.copy.readers() > 0 {
                // a reader appeared concurrently; skip it and keep popping
                popped.push(victim);
                continue;
            }

            debug_assert!(!Arc::ptr_eq(&entry.data, &master));

            if task
                .flows
                .iter()
                .any(|flow| !flow.access.is_ctl() && Arc::ptr_eq(&flow.data, &entry.data))
            {
                // one of this task's own inputs; it re-enters a ring when the
                // task retires
                popped.push(victim);
                continue;
            }

            let Some(entry) = core.arena.remove(victim) else {
                continue;
            };
            debug!(
                "gpu{device}: repurpose the replica of datum {:#x} for datum {:#x}",
                entry.data.key(),
                master.key()
            );
            entry.data.detach(device);
            core.zone.free(entry.copy.ptr());
        };

        let copy = DataCopy::new(device, ptr);
        let slot = core.arena.insert(ArenaEntry {
            data: Arc::clone(&master),
            copy: Arc::clone(&copy),
        });
        master.attach(Arc::clone(&copy), device);
        core.free_lru.push_fifo(&mut core.arena, slot);
        task.flows[i].data_out = Some(copy);
    }

    for slot in popped.into_iter().rev() {
        core.free_lru.push_lifo(&mut core.arena, slot);
    }

    result
}

/// Schedules the host→device movement of every input.
#[profiling::function]
pub(crate) fn kernel_push(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: StreamHandle,
    task: &mut GpuTask,
) -> Result<(), SchedError> {
    reserve_device_space(core, task)?;

    let task_id = task.id;
    for flow in &mut task.flows {
        if flow.access.is_ctl() {
            continue;
        }

        stage_in(driver, core, stream, task_id, flow)?;
    }

    Ok(())
}

/// Stages one flow's data in, if the resident replica is stale.
fn stage_in(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: StreamHandle,
    task_id: u64,
    flow: &mut Flow,
) -> Result<(), SchedError> {
    let device = core.index;
    let Some(target) = flow.data_out.clone() else {
        return Ok(());
    };

    if flow.access.contains(AccessFlags::WRITE) && target.readers() > 0 {
        warn!(
            "gpu{device}: write access to datum {:#x} with active readers; add a control \
             dependency to serialize them",
            flow.data.key()
        );

        return Err(SchedError::AntiDependency);
    }

    // pin the replica out of the rings for the task's lifetime
    let slot = target.arena_slot();
    if slot != NO_SLOT {
        core.unlist(slot);
    }

    core.stats.required_data_in += flow.data.len() as u64;

    let source = flow.data.transfer_ownership_to_copy(&target, flow.access);
    flow.staged = true;
    let Some(source) = source else {
        // nothing to move: a write-only access overwrites the bytes anyway
        if target.transfer_status() == TransferStatus::NotTransferred {
            target.set_transfer_status(TransferStatus::Complete);
        }

        debug_assert!(matches!(
            target.transfer_status(),
            TransferStatus::Complete | TransferStatus::UnderTransfer
        ));

        return Ok(());
    };

    debug_assert_eq!(source, HOST_DEVICE);

    let host = flow.data.host_copy();
    debug!(
        "gpu{device}: move {} bytes of datum {:#x} to the device",
        flow.data.len(),
        flow.data.key()
    );
    driver
        .copy_to_device_async(core.ordinal, target.ptr(), flow.data.host_ptr(), flow.data.len(), stream)
        .map_err(|err| {
            warn!("gpu{device}: stage-in copy of datum {:#x} rejected: {err}", flow.data.key());

            SchedError::TransferFailed
        })?;
    core.stats.transferred_data_in += flow.data.len() as u64;

    target.set_version(host.version());
    target.set_transfer_status(TransferStatus::UnderTransfer);
    target.set_push_task(task_id);

    Ok(())
}

/// Schedules the device→host movement of modified data and releases read
/// pins.
#[profiling::function]
pub(crate) fn kernel_pop(
    driver: &Arc<dyn Driver>,
    core: &mut DeviceCore,
    stream: StreamHandle,
    task: &mut GpuTask,
) -> Result<(), SchedError> {
    let device = core.index;

    if task.task_type == TaskType::DrainOut {
        for flow in &task.flows {
            let Some(copy) = &flow.data_out else {
                continue;
            };
            core.stats.required_data_out += flow.data.len() as u64;
            driver
                .copy_to_host_async(core.ordinal, flow.data.host_ptr(), copy.ptr(), flow.data.len(), stream)
                .map_err(|err| {
                    warn!(
                        "gpu{device}: write-back copy of datum {:#x} rejected: {err}",
                        flow.data.key()
                    );

                    SchedError::TransferFailed
                })?;
            core.stats.transferred_data_out += flow.data.len() as u64;
        }

        return Ok(());
    }

    for flow in &mut task.flows {
        let Some(copy) = flow.data_out.clone() else {
            continue;
        };
        if copy.device() != device {
            continue;
        }

        if !flow.access.contains(AccessFlags::WRITE) {
            // downstream consumers must see a host address
            flow.data_out = Some(flow.data.host_copy());
        }

        if flow.access.contains(AccessFlags::READ) {
            let readers = copy.release_reader();

            debug_assert!(readers >= 0);

            if readers == 0 && !flow.access.contains(AccessFlags::WRITE) {
                let slot = copy.arena_slot();
                if slot != NO_SLOT {
                    core.unlist(slot);
                    core.free_lru.push_fifo(&mut core.arena, slot);
                }

                continue;
            }
        }

        if flow.access.contains(AccessFlags::WRITE) {
            core.stats.required_data_out += flow.data.len() as u64;
            if flow.pushout {
                debug!("gpu{device}: move datum {:#x} back to the host", flow.data.key());
                driver
                    .copy_to_host_async(
                        core.ordinal,
                        flow.data.host_ptr(),
                        copy.ptr(),
                        flow.data.len(),
                        stream,
                    )
                    .map_err(|err| {
                        warn!(
                            "gpu{device}: stage-out copy of datum {:#x} rejected: {err}",
                            flow.data.key()
                        );

                        SchedError::TransferFailed
                    })?;
                core.stats.transferred_data_out += flow.data.len() as u64;
            }
        }
    }

    Ok(())
}

/// Returns every written replica to the rings and publishes the new versions
/// at task completion.
pub(crate) fn kernel_epilog(core: &mut DeviceCore, task: &mut GpuTask) {
    for flow in &mut task.flows {
        if !flow.access.contains(AccessFlags::WRITE) {
            continue;
        }

        let Some(copy) = flow.data_out.clone() else {
            continue;
        };
        let version = flow.data.finalize_write(&copy, flow.pushout);
        debug!(
            "gpu{}: datum {:#x} now at version {version}",
            core.index,
            flow.data.key()
        );

        let slot = copy.arena_slot();
        if slot != NO_SLOT {
            if flow.pushout {
                core.free_lru.push_fifo(&mut core.arena, slot);
            } else {
                core.owned_lru.push_fifo(&mut core.arena, slot);
            }
        }

        flow.data_out = Some(flow.data.host_copy());
    }
}

/// Completes a synthesized write-back envelope: both sides become SHARED and
/// the replicas return to the free ring.
pub(crate) fn drain_epilog(core: &mut DeviceCore, task: &mut GpuTask) {
    for flow in &task.flows {
        let Some(copy) = &flow.data_out else {
            continue;
        };
        flow.data.finalize_drain(copy);
        let readers = copy.release_reader();

        debug_assert_eq!(readers, 0);

        let slot = copy.arena_slot();
        if slot != NO_SLOT {
            core.free_lru.push_fifo(&mut core.arena, slot);
        }
    }
}

/// Releases whatever a failed task had already pinned and rolls back its
/// staged coherence effects so the device cache stays usable.
pub(crate) fn cleanup_failed(core: &mut DeviceCore, task: &mut GpuTask) {
    let task_id = task.id;
    for flow in &mut task.flows {
        if !flow.staged {
            continue;
        }

        flow.staged = false;

        let Some(copy) = flow.data_out.clone() else {
            continue;
        };
        if copy.device() != core.index {
            continue;
        }

        flow.data.abort_access(&copy, flow.access, task_id);

        if copy.readers() == 0 && copy.arena_slot() != NO_SLOT {
            core.unlist(copy.arena_slot());
            core.free_lru.push_fifo(&mut core.arena, copy.arena_slot());
        }
    }
}
