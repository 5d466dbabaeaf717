//! End-to-end scheduler scenarios against the mock backend.

use {
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    streamline::{
        driver::mock::{MockDeviceInfo, MockDriver},
        Coherency, Config, Data, Driver, Flow, GpuTask, Runtime, SubmitOutcome, TaskStatus,
        TransferStatus,
    },
};

const BLOCK: usize = 1024;

fn runtime(devices: usize, blocks: usize, latency: u32) -> (Arc<MockDriver>, Runtime) {
    let driver = Arc::new(MockDriver::with_latency(
        (0..devices).map(|_| MockDeviceInfo::default()).collect(),
        latency,
    ));
    let config = Config::parse(&format!(
        "enabled = {devices}\nmemory_block_size = {BLOCK}\nmemory_number_of_blocks = {blocks}\n"
    ));
    let rt = Runtime::init(Arc::clone(&driver) as Arc<dyn Driver>, &config).unwrap();

    (driver, rt)
}

/// Submit callback computing `out[i] = a[i] + b[i]` in mock device memory.
fn add_kernel(
    driver: &Arc<MockDriver>,
) -> impl FnMut(
    &mut streamline::LaunchContext<'_>,
    &mut GpuTask,
) -> Result<(), streamline::SchedError>
       + Send
       + 'static {
    let driver = Arc::clone(driver);

    move |cx, task| {
        let len = task.flows[0].data.len();
        let a = driver.read(cx.device_ordinal, task.flows[0].data_out.as_ref().unwrap().ptr(), len);
        let b = driver.read(cx.device_ordinal, task.flows[1].data_out.as_ref().unwrap().ptr(), len);
        let out: Vec<u8> = a.iter().zip(&b).map(|(a, b)| a.wrapping_add(*b)).collect();
        driver.write(cx.device_ordinal, task.flows[2].data_out.as_ref().unwrap().ptr(), &out);

        Ok(())
    }
}

#[test]
fn three_flow_pipeline_round_trip() {
    let (driver, rt) = runtime(1, 4, 0);
    let a = Data::new(0xA, BLOCK);
    let b = Data::new(0xB, BLOCK);
    let c = Data::new(0xC, BLOCK);
    a.write_host(&[1; BLOCK]);
    b.write_host(&[2; BLOCK]);

    let completed = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&completed);
    let task = GpuTask::new(vec![
        Flow::read("a", &a),
        Flow::read("b", &b),
        Flow::write("c", &c),
    ])
    .with_submit(add_kernel(&driver))
    .on_complete(move |status| {
        assert_eq!(status, TaskStatus::Done);
        count.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Done);
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    let device = rt.device(2).unwrap();

    // three blocks allocated out of four
    assert_eq!(device.pool_free_blocks(), 1);
    assert_eq!(device.resident_replicas(), 3);

    // only the two inputs moved host→device; the output moved back
    let stats = device.stats();

    assert_eq!(stats.transferred_data_in, 2 * BLOCK as u64);
    assert_eq!(stats.transferred_data_out, BLOCK as u64);

    assert_eq!(c.version(), 1);
    c.with_host(|bytes| assert!(bytes.iter().all(|&byte| byte == 3)));
    assert_eq!(device.executed_tasks(), 1);
}

#[test]
fn pipeline_progresses_with_slow_events() {
    // non-zero event latency forces the not-ready paths
    let (driver, rt) = runtime(1, 4, 3);
    let a = Data::new(0xA, BLOCK);
    let b = Data::new(0xB, BLOCK);
    let c = Data::new(0xC, BLOCK);
    a.write_host(&[5; BLOCK]);
    b.write_host(&[6; BLOCK]);

    let task = GpuTask::new(vec![
        Flow::read("a", &a),
        Flow::read("b", &b),
        Flow::write("c", &c),
    ])
    .with_submit(add_kernel(&driver));

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Done);

    c.with_host(|bytes| assert!(bytes.iter().all(|&byte| byte == 11)));
}

#[test]
fn chained_tasks_share_a_two_block_pool() {
    let (driver, rt) = runtime(1, 2, 0);
    let a = Data::new(0xA, BLOCK);
    let b = Data::new(0xB, BLOCK);
    let c = Data::new(0xC, BLOCK);
    let d = Data::new(0xD, BLOCK);
    a.write_host(&[1; BLOCK]);

    let order = Arc::new(Mutex::new(Vec::new()));
    let device = rt.device(2).unwrap();
    let chain = [(&a, &b), (&b, &c), (&c, &d)];
    for (src, dst) in chain {
        let driver = Arc::clone(&driver);
        let order = Arc::clone(&order);
        let key = dst.key();
        let task = GpuTask::new(vec![Flow::read("src", src), Flow::write("dst", dst)])
            .with_submit(move |cx, task| {
                let len = task.flows[0].data.len();
                let src =
                    driver.read(cx.device_ordinal, task.flows[0].data_out.as_ref().unwrap().ptr(), len);
                let out: Vec<u8> = src.iter().map(|byte| byte.wrapping_add(1)).collect();
                driver.write(cx.device_ordinal, task.flows[1].data_out.as_ref().unwrap().ptr(), &out);

                Ok(())
            })
            .on_complete(move |status| {
                assert_eq!(status, TaskStatus::Done);
                order.lock().unwrap().push(key);
            });

        // each ready task is handed over once its input is in host memory
        assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Done);

        // never more than the pool's two blocks resident
        assert!(device.resident_replicas() <= 2);
    }

    assert_eq!(order.lock().unwrap().clone(), vec![0xB, 0xC, 0xD]);
    b.with_host(|bytes| assert!(bytes.iter().all(|&byte| byte == 2)));
    c.with_host(|bytes| assert!(bytes.iter().all(|&byte| byte == 3)));
    d.with_host(|bytes| assert!(bytes.iter().all(|&byte| byte == 4)));
    assert_eq!(device.executed_tasks(), 3);
}

#[test]
fn selector_honors_write_locality() {
    let (driver, rt) = runtime(2, 4, 0);
    let owned = Data::new(0x10, BLOCK);

    // a write without pushout leaves device 2 owning the datum
    let writer = GpuTask::new(vec![Flow::write("out", &owned).with_pushout(false)])
        .with_submit({
            let driver = Arc::clone(&driver);
            move |cx, task| {
                driver.write(
                    cx.device_ordinal,
                    task.flows[0].data_out.as_ref().unwrap().ptr(),
                    &[9; BLOCK],
                );

                Ok(())
            }
        });
    assert_eq!(rt.submit(Box::new(writer), 2), SubmitOutcome::Done);
    assert_eq!(owned.owner_device(), 2);

    // pile load onto device 2 so the argmin would prefer device 3
    let mut decoy = GpuTask::new(vec![Flow::read("in", &Data::new(0x11, BLOCK))]);
    assert_eq!(rt.select_device(&mut decoy, 1.0), 2);

    let mut task = GpuTask::new(vec![Flow::write("out", &owned)]);

    // locality wins regardless of load
    assert_eq!(rt.select_device(&mut task, 1.0), 2);
}

#[test]
fn selector_balances_idle_devices() {
    let (driver, rt) = runtime(2, 4, 0);
    let mut picks = Vec::new();
    let mut tasks = Vec::new();
    for key in 0..4u64 {
        let data = Data::new(key, BLOCK);
        let driver = Arc::clone(&driver);
        let mut task = GpuTask::new(vec![Flow::write("out", &data)]).with_submit(move |cx, task| {
            driver.write(
                cx.device_ordinal,
                task.flows[0].data_out.as_ref().unwrap().ptr(),
                &[1; BLOCK],
            );

            Ok(())
        });
        picks.push(rt.select_device(&mut task, 1.0));
        tasks.push((task, *picks.last().unwrap()));
    }

    // two tasks per device, alternating via the provisional load charge
    assert_eq!(picks, vec![2, 3, 2, 3]);

    for (task, device) in tasks {
        assert_eq!(rt.submit(Box::new(task), device), SubmitOutcome::Done);
    }

    // completions released every provisional charge
    assert_eq!(rt.device_load(2), 0.0);
    assert_eq!(rt.device_load(3), 0.0);
    assert_eq!(rt.device(2).unwrap().executed_tasks(), 2);
    assert_eq!(rt.device(3).unwrap().executed_tasks(), 2);
}

#[test]
fn concurrent_submissions_keep_the_lease_exclusive() {
    const WORKERS: usize = 8;
    const TASKS_PER_WORKER: usize = 100;

    let (_driver, rt) = runtime(1, 8, 0);
    let completed = Arc::new(AtomicUsize::new(0));
    let in_exec = Arc::new(AtomicUsize::new(0));
    let max_in_exec = Arc::new(AtomicUsize::new(0));
    let data: Vec<_> = (0..WORKERS).map(|worker| Data::new(worker as u64, BLOCK)).collect();

    std::thread::scope(|scope| {
        for datum in data.iter().take(WORKERS) {
            let rt = &rt;
            let completed = Arc::clone(&completed);
            let in_exec = Arc::clone(&in_exec);
            let max_in_exec = Arc::clone(&max_in_exec);
            let datum = Arc::clone(datum);
            scope.spawn(move || {
                for _ in 0..TASKS_PER_WORKER {
                    let in_exec = Arc::clone(&in_exec);
                    let max_in_exec = Arc::clone(&max_in_exec);
                    let completed = Arc::clone(&completed);
                    let task = GpuTask::new(vec![Flow::read("in", &datum)])
                        .with_submit(move |_, _| {
                            let now = in_exec.fetch_add(1, Ordering::SeqCst) + 1;
                            max_in_exec.fetch_max(now, Ordering::SeqCst);
                            in_exec.fetch_sub(1, Ordering::SeqCst);

                            Ok(())
                        })
                        .on_complete(move |status| {
                            assert_eq!(status, TaskStatus::Done);
                            completed.fetch_add(1, Ordering::SeqCst);
                        });
                    let outcome = rt.submit(Box::new(task), 2);

                    assert_ne!(outcome, SubmitOutcome::Disable);
                }
            });
        }
    });

    // someone must drain whatever the last leases left behind
    rt.progress(2);

    let device = rt.device(2).unwrap();

    // no task lost, none duplicated, and only one worker ever launched work
    assert_eq!(completed.load(Ordering::SeqCst), WORKERS * TASKS_PER_WORKER);
    assert_eq!(device.executed_tasks(), (WORKERS * TASKS_PER_WORKER) as u64);
    assert_eq!(max_in_exec.load(Ordering::SeqCst), 1);
    assert_eq!(device.outstanding(), 0);
}

#[test]
fn idle_pressure_synthesizes_a_drain() {
    let (driver, rt) = runtime(1, 4, 0);
    let device = rt.device(2).unwrap();

    // fill the whole pool with dirty replicas the host has never seen
    let dirty: Vec<_> = (0..4u64).map(|key| Data::new(key, BLOCK)).collect();
    for datum in &dirty {
        let driver = Arc::clone(&driver);
        let fill = datum.key() as u8 + 1;
        let task = GpuTask::new(vec![Flow::write("out", datum).with_pushout(false)]).with_submit(
            move |cx, task| {
                driver.write(
                    cx.device_ordinal,
                    task.flows[0].data_out.as_ref().unwrap().ptr(),
                    &[fill; BLOCK],
                );

                Ok(())
            },
        );

        assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Done);
    }

    assert_eq!(device.lru_lens(), (0, 4));
    for datum in &dirty {
        assert_eq!(datum.owner_device(), 2);
        assert!(datum.host_copy().version() < datum.version());
    }

    // a new task has nowhere to put its input; the stall drains the dirty
    // replicas and the task then completes
    let fresh = Data::new(0x99, BLOCK);
    let task = GpuTask::new(vec![Flow::read("in", &fresh)]).with_submit(|_, _| Ok(()));

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Done);

    let (free, owned) = device.lru_lens();

    assert_eq!(owned, 0);
    assert_eq!(free, 4);

    // the host replicas caught up with the drained versions and bytes
    for datum in &dirty {
        assert_eq!(datum.host_copy().version(), datum.version());
        let fill = datum.key() as u8 + 1;
        datum.with_host(|bytes| assert!(bytes.iter().all(|&byte| byte == fill)));
    }
}

#[test]
fn undersized_pool_disables_the_device() {
    let driver = Arc::new(MockDriver::uniform(1));
    let config = Config::parse("enabled = 1\nmemory_use = 0\n");
    let rt = Runtime::init(Arc::clone(&driver) as Arc<dyn Driver>, &config).unwrap();

    assert!(rt.devices().is_empty());

    let rerouted = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&rerouted);
    let task = GpuTask::new(vec![Flow::read("in", &Data::new(1, BLOCK))])
        .on_complete(move |status| {
            assert_eq!(status, TaskStatus::Rerouted);
            count.fetch_add(1, Ordering::SeqCst);
        });

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Disable);
    assert_eq!(rerouted.load(Ordering::SeqCst), 1);
}

#[test]
fn fault_after_staging_hands_the_in_flight_task_back() {
    let (driver, rt) = runtime(1, 4, 0);

    // the stage-in copy succeeds, then recording its completion event fails;
    // by that point the envelope has left the submit slot
    driver.fail_next(0, "record_event");

    let status = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&status);
    let data = Data::new(0x7, BLOCK);
    let task = GpuTask::new(vec![Flow::read("in", &data)])
        .with_submit(|_, _| Ok(()))
        .on_complete(move |status| {
            *seen.lock().unwrap() = Some(status);
        });

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Disable);

    // the half-staged envelope was handed back, not lost
    assert_eq!(*status.lock().unwrap(), Some(TaskStatus::Rerouted));

    let device = rt.device(2).unwrap();

    assert!(device.is_dead());

    // the aborted stage-in rolled back cleanly: no reader pin, no dangling
    // transfer, and the replica is back in the free ring
    assert_eq!(device.lru_lens(), (1, 0));

    let copy = data.copy(2).unwrap();

    assert_eq!(copy.readers(), 0);
    assert_eq!(copy.transfer_status(), TransferStatus::NotTransferred);
    assert_eq!(copy.push_task(), 0);
    assert_eq!(copy.coherency(), Coherency::Invalid);
}

#[test]
fn fatal_driver_error_reroutes_the_task() {
    let (driver, rt) = runtime(1, 4, 0);
    driver.poison(0);

    let status = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&status);
    let task = GpuTask::new(vec![Flow::read("in", &Data::new(1, BLOCK))])
        .with_submit(|_, _| Ok(()))
        .on_complete(move |status| {
            *seen.lock().unwrap() = Some(status);
        });

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Disable);
    assert_eq!(*status.lock().unwrap(), Some(TaskStatus::Rerouted));
    assert!(rt.device(2).unwrap().is_dead());

    // subsequent submissions bounce immediately
    let task = GpuTask::new(vec![Flow::read("in", &Data::new(2, BLOCK))]);

    assert_eq!(rt.submit(Box::new(task), 2), SubmitOutcome::Disable);
}
