//! Data registry: datums, replicas, and the coherence protocol.
//!
//! A [`Data`] is one logical unit of application data; a [`DataCopy`] is its
//! materialization on the host (slot 0) or on one device. Replica scalar
//! state lives in lock-free cells so a writer can invalidate peer replicas
//! without taking another device's lease; datum-level fields sit behind a
//! short mutex.

use {
    crate::{
        driver::{DevicePtr, HostPtr},
        task::AccessFlags,
    },
    crossbeam::atomic::AtomicCell,
    std::sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Host slot index inside a datum's replica table.
pub const HOST_DEVICE: usize = 0;

/// First accelerator slot; index 1 is reserved for the recursive
/// pseudo-device and never populated.
pub const FIRST_ACCEL_DEVICE: usize = 2;

/// Marks a replica as detached from any device arena.
pub(crate) const NO_SLOT: u32 = u32::MAX;

/// Coherency state of one replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Coherency {
    /// The bytes are stale; a transfer is required before use.
    Invalid,

    /// The bytes match the current datum version; other replicas may too.
    Shared,

    /// This replica is the single authoritative version.
    Owned,
}

/// Progress of the asynchronous stage-in filling a replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    NotTransferred,
    UnderTransfer,
    Complete,
}

/// One materialization of a datum on the host or a device.
pub struct DataCopy {
    device: usize,
    ptr: AtomicCell<DevicePtr>,
    version: AtomicU64,
    coherency: AtomicCell<Coherency>,
    transfer: AtomicCell<TransferStatus>,
    readers: AtomicI32,

    /// Id of the envelope performing the pending stage-in; zero when none.
    push_task: AtomicU64,

    /// Slot in the owning device's replica arena.
    pub(crate) arena_slot: AtomicU32,
}

impl DataCopy {
    pub fn new(device: usize, ptr: DevicePtr) -> Arc<Self> {
        Arc::new(Self {
            device,
            ptr: AtomicCell::new(ptr),
            version: AtomicU64::new(0),
            coherency: AtomicCell::new(Coherency::Invalid),
            transfer: AtomicCell::new(TransferStatus::NotTransferred),
            readers: AtomicI32::new(0),
            push_task: AtomicU64::new(0),
            arena_slot: AtomicU32::new(NO_SLOT),
        })
    }

    /// Global device index of the replica's home (0 = host).
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr.load()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    pub fn coherency(&self) -> Coherency {
        self.coherency.load()
    }

    pub(crate) fn set_coherency(&self, coherency: Coherency) {
        self.coherency.store(coherency);
    }

    pub fn transfer_status(&self) -> TransferStatus {
        self.transfer.load()
    }

    pub(crate) fn set_transfer_status(&self, status: TransferStatus) {
        self.transfer.store(status);
    }

    /// Number of in-flight tasks reading this replica.
    pub fn readers(&self) -> i32 {
        self.readers.load(Ordering::Acquire)
    }

    pub(crate) fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reader count, returning the new value.
    pub(crate) fn release_reader(&self) -> i32 {
        self.readers.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Id of the envelope whose stage-in event will complete this transfer.
    pub fn push_task(&self) -> u64 {
        self.push_task.load(Ordering::Acquire)
    }

    pub(crate) fn set_push_task(&self, task: u64) {
        self.push_task.store(task, Ordering::Release);
    }

    pub(crate) fn arena_slot(&self) -> u32 {
        self.arena_slot.load(Ordering::Acquire)
    }
}

/// Registration status of an external data-collection descriptor.
///
/// The flag makes host memory registration idempotent per descriptor no
/// matter how many threads race on it.
pub struct DataDesc {
    base: HostPtr,
    len: usize,
    registered: AtomicBool,
}

impl DataDesc {
    pub fn new(base: HostPtr, len: usize) -> Arc<Self> {
        Arc::new(Self {
            base,
            len,
            registered: AtomicBool::new(false),
        })
    }

    pub fn base(&self) -> HostPtr {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True exactly once per registered → unregistered cycle.
    pub(crate) fn begin_register(&self) -> bool {
        !self.registered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn begin_unregister(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn cancel_register(&self) {
        self.registered.store(false, Ordering::Release);
    }
}

struct Inner {
    version: u64,
    owner_device: i32,
    copies: Vec<Option<Arc<DataCopy>>>,

    /// Backing storage of the host replica; the box never moves, so the raw
    /// pointer shared with the driver stays valid.
    #[allow(dead_code)]
    host_store: Box<[u8]>,
}

/// A logical unit of application data identified by a stable key.
pub struct Data {
    key: u64,
    nb_elts: usize,
    host_ptr: HostPtr,
    host: Arc<DataCopy>,
    desc: Option<Arc<DataDesc>>,
    inner: Mutex<Inner>,
}

impl Data {
    /// Creates a datum of `nb_elts` bytes with a zeroed host replica.
    pub fn new(key: u64, nb_elts: usize) -> Arc<Self> {
        Self::create(key, nb_elts, None)
    }

    /// Same, linked to its external data-collection descriptor.
    pub fn with_desc(key: u64, nb_elts: usize, desc: &Arc<DataDesc>) -> Arc<Self> {
        Self::create(key, nb_elts, Some(Arc::clone(desc)))
    }

    fn create(key: u64, nb_elts: usize, desc: Option<Arc<DataDesc>>) -> Arc<Self> {
        let mut host_store = vec![0; nb_elts].into_boxed_slice();
        let host_ptr = HostPtr(host_store.as_mut_ptr());
        let host = DataCopy::new(HOST_DEVICE, DevicePtr(host_ptr.0 as u64));
        host.set_coherency(Coherency::Shared);
        host.set_transfer_status(TransferStatus::Complete);

        let mut copies = vec![None; FIRST_ACCEL_DEVICE];
        copies[HOST_DEVICE] = Some(Arc::clone(&host));

        Arc::new(Self {
            key,
            nb_elts,
            host_ptr,
            host,
            desc,
            inner: Mutex::new(Inner {
                version: 0,
                owner_device: HOST_DEVICE as i32,
                copies,
                host_store,
            }),
        })
    }

    fn inner(&self) -> impl std::ops::DerefMut<Target = Inner> + '_ {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut inner = self.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let inner = inner.unwrap();

        inner
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Byte size of the datum.
    pub fn len(&self) -> usize {
        self.nb_elts
    }

    pub fn is_empty(&self) -> bool {
        self.nb_elts == 0
    }

    pub fn desc(&self) -> Option<&Arc<DataDesc>> {
        self.desc.as_ref()
    }

    /// Current datum version: the maximum of any replica's version.
    pub fn version(&self) -> u64 {
        self.inner().version
    }

    /// Device whose replica is authoritative (0 = host, −1 = none).
    pub fn owner_device(&self) -> i32 {
        self.inner().owner_device
    }

    pub fn host_copy(&self) -> Arc<DataCopy> {
        Arc::clone(&self.host)
    }

    pub(crate) fn host_ptr(&self) -> HostPtr {
        self.host_ptr
    }

    /// Runs `f` over the host replica bytes.
    pub fn with_host<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner().host_store)
    }

    /// Overwrites the host replica bytes; only safe while the datum is not
    /// under transfer.
    pub fn write_host(&self, bytes: &[u8]) {
        let mut inner = self.inner();
        let len = bytes.len().min(inner.host_store.len());
        inner.host_store[..len].copy_from_slice(&bytes[..len]);
    }

    /// Returns the replica on `device`, if any.
    pub fn copy(&self, device: usize) -> Option<Arc<DataCopy>> {
        self.inner().copies.get(device).and_then(Clone::clone)
    }

    /// Attaches a replica to the given device slot.
    pub fn attach(&self, copy: Arc<DataCopy>, device: usize) {
        debug_assert_eq!(copy.device(), device);

        let mut inner = self.inner();
        while inner.copies.len() <= device {
            inner.copies.push(None);
        }

        debug_assert!(inner.copies[device].is_none());

        inner.copies[device] = Some(copy);
    }

    /// Detaches and returns the replica on `device`.
    pub fn detach(&self, device: usize) -> Option<Arc<DataCopy>> {
        self.inner().copies.get_mut(device).and_then(Option::take)
    }

    /// Coherence decision point: prepares `copy` for an access of the given
    /// mode and returns the device to transfer from, or `None` when no copy
    /// is needed.
    ///
    /// For writes the target becomes OWNED and every peer replica (host
    /// included) is invalidated; for reads the target is upgraded to SHARED
    /// and its reader count pinned. A transfer is required only when the
    /// access actually reads data the replica does not currently hold.
    pub fn transfer_ownership_to_copy(
        &self,
        copy: &Arc<DataCopy>,
        access: AccessFlags,
    ) -> Option<usize> {
        let mut inner = self.inner();
        let device = copy.device();
        let up_to_date = copy.version() == inner.version && copy.coherency() != Coherency::Invalid;

        if access.contains(AccessFlags::WRITE) {
            inner.owner_device = device as i32;
            for (idx, other) in inner.copies.iter().enumerate() {
                if idx != device {
                    if let Some(other) = other {
                        other.set_coherency(Coherency::Invalid);
                    }
                }
            }

            copy.set_coherency(Coherency::Owned);
        } else if copy.coherency() == Coherency::Invalid {
            copy.set_coherency(Coherency::Shared);
        }

        if access.contains(AccessFlags::READ) {
            copy.add_reader();
        }

        if up_to_date || !access.contains(AccessFlags::READ) {
            None
        } else {
            Some(HOST_DEVICE)
        }
    }

    /// Publishes a completed write: bumps the replica version
    /// and, on pushout, mirrors it to the host replica in SHARED state.
    ///
    /// Without pushout the replica stays OWNED and authoritative; the host
    /// replica keeps its stale version so the ownership invariant holds.
    pub(crate) fn finalize_write(&self, copy: &Arc<DataCopy>, pushout: bool) -> u64 {
        let mut inner = self.inner();

        debug_assert_eq!(copy.coherency(), Coherency::Owned);

        let version = inner.version + 1;
        copy.set_version(version);
        inner.version = version;

        if pushout {
            copy.set_coherency(Coherency::Shared);
            self.host.set_coherency(Coherency::Shared);
            self.host.set_version(version);
            inner.owner_device = HOST_DEVICE as i32;
        }

        version
    }

    /// Reverts the coherence effects of a failed access: the reader pin is
    /// dropped, a transfer left dangling by the dead envelope is annulled,
    /// and a never-performed write hands authority back to the host replica
    /// while its bytes are still current.
    pub(crate) fn abort_access(&self, copy: &Arc<DataCopy>, access: AccessFlags, task: u64) {
        let mut inner = self.inner();

        if access.contains(AccessFlags::READ) {
            copy.release_reader();
        }

        if copy.push_task() == task {
            copy.set_transfer_status(TransferStatus::NotTransferred);
            copy.set_push_task(0);
            copy.set_coherency(Coherency::Invalid);
        }

        if access.contains(AccessFlags::WRITE) && inner.owner_device == copy.device() as i32 {
            copy.set_coherency(Coherency::Invalid);
            if self.host.version() == inner.version {
                self.host.set_coherency(Coherency::Shared);
                inner.owner_device = HOST_DEVICE as i32;
            } else {
                inner.owner_device = -1;
            }
        }
    }

    /// Publishes a completed idle write-back: both sides become SHARED
    /// at the replica's version and ownership returns to the host.
    pub(crate) fn finalize_drain(&self, copy: &Arc<DataCopy>) {
        let mut inner = self.inner();

        copy.set_coherency(Coherency::Shared);
        self.host.set_coherency(Coherency::Shared);
        self.host.set_version(copy.version());
        inner.version = inner.version.max(copy.version());
        inner.owner_device = HOST_DEVICE as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach_copy(data: &Arc<Data>, device: usize) -> Arc<DataCopy> {
        let copy = DataCopy::new(device, DevicePtr(0x1000 * device as u64));
        data.attach(Arc::clone(&copy), device);

        copy
    }

    #[test]
    fn read_pulls_from_host_once() {
        let data = Data::new(1, 64);
        let copy = attach_copy(&data, 2);

        assert_eq!(data.transfer_ownership_to_copy(&copy, AccessFlags::READ), Some(HOST_DEVICE));
        assert_eq!(copy.coherency(), Coherency::Shared);
        assert_eq!(copy.readers(), 1);

        // the replica now matches the datum version, no second transfer
        assert_eq!(data.transfer_ownership_to_copy(&copy, AccessFlags::READ), None);
        assert_eq!(copy.readers(), 2);
    }

    #[test]
    fn write_invalidates_peers_and_takes_ownership() {
        let data = Data::new(2, 64);
        let gpu2 = attach_copy(&data, 2);
        let gpu3 = attach_copy(&data, 3);
        data.transfer_ownership_to_copy(&gpu3, AccessFlags::READ);

        data.transfer_ownership_to_copy(&gpu2, AccessFlags::WRITE);

        assert_eq!(data.owner_device(), 2);
        assert_eq!(gpu2.coherency(), Coherency::Owned);
        assert_eq!(gpu3.coherency(), Coherency::Invalid);
        assert_eq!(data.host_copy().coherency(), Coherency::Invalid);
    }

    #[test]
    fn at_most_one_owned_replica() {
        let data = Data::new(3, 64);
        let gpu2 = attach_copy(&data, 2);
        let gpu3 = attach_copy(&data, 3);

        data.transfer_ownership_to_copy(&gpu2, AccessFlags::WRITE);
        data.transfer_ownership_to_copy(&gpu3, AccessFlags::WRITE);

        let owned = [&gpu2, &gpu3, &data.host_copy()]
            .iter()
            .filter(|copy| copy.coherency() == Coherency::Owned)
            .count();

        assert_eq!(owned, 1);
        assert_eq!(data.owner_device(), 3);
    }

    #[test]
    fn finalize_write_with_pushout_mirrors_host() {
        let data = Data::new(4, 64);
        let copy = attach_copy(&data, 2);
        data.transfer_ownership_to_copy(&copy, AccessFlags::WRITE);

        let version = data.finalize_write(&copy, true);

        assert_eq!(version, 1);
        assert_eq!(data.version(), 1);
        assert_eq!(data.host_copy().version(), 1);
        assert_eq!(copy.coherency(), Coherency::Shared);
        assert_eq!(data.host_copy().coherency(), Coherency::Shared);
        assert_eq!(data.owner_device(), HOST_DEVICE as i32);
    }

    #[test]
    fn finalize_write_without_pushout_keeps_ownership() {
        let data = Data::new(5, 64);
        let copy = attach_copy(&data, 2);
        data.transfer_ownership_to_copy(&copy, AccessFlags::WRITE);

        let version = data.finalize_write(&copy, false);

        assert_eq!(version, 1);
        assert_eq!(data.version(), 1);
        assert_eq!(copy.coherency(), Coherency::Owned);
        assert_eq!(data.owner_device(), 2);

        // the stale host replica must not claim the new version
        assert!(data.host_copy().version() < data.version());
        assert_eq!(data.host_copy().coherency(), Coherency::Invalid);
    }

    #[test]
    fn drain_returns_ownership_to_host() {
        let data = Data::new(6, 64);
        let copy = attach_copy(&data, 2);
        data.transfer_ownership_to_copy(&copy, AccessFlags::WRITE);
        data.finalize_write(&copy, false);

        data.finalize_drain(&copy);

        assert_eq!(copy.coherency(), Coherency::Shared);
        assert_eq!(data.host_copy().coherency(), Coherency::Shared);
        assert_eq!(data.host_copy().version(), copy.version());
        assert_eq!(data.owner_device(), HOST_DEVICE as i32);
    }

    #[test]
    fn aborted_write_restores_host_authority() {
        let data = Data::new(7, 64);
        let copy = attach_copy(&data, 2);
        data.transfer_ownership_to_copy(&copy, AccessFlags::WRITE);

        assert_eq!(data.owner_device(), 2);

        data.abort_access(&copy, AccessFlags::WRITE, 0);

        assert_eq!(copy.coherency(), Coherency::Invalid);
        assert_eq!(data.host_copy().coherency(), Coherency::Shared);
        assert_eq!(data.owner_device(), HOST_DEVICE as i32);
    }

    #[test]
    fn aborted_stage_in_annuls_the_transfer() {
        let data = Data::new(8, 64);
        let copy = attach_copy(&data, 2);
        data.transfer_ownership_to_copy(&copy, AccessFlags::READ);
        copy.set_transfer_status(TransferStatus::UnderTransfer);
        copy.set_push_task(42);

        data.abort_access(&copy, AccessFlags::READ, 42);

        assert_eq!(copy.readers(), 0);
        assert_eq!(copy.transfer_status(), TransferStatus::NotTransferred);
        assert_eq!(copy.push_task(), 0);
        assert_eq!(copy.coherency(), Coherency::Invalid);
    }

    #[test]
    fn descriptor_registration_latches() {
        let mut bytes = [0u8; 16];
        let desc = DataDesc::new(HostPtr(bytes.as_mut_ptr()), bytes.len());

        assert!(desc.begin_register());
        assert!(!desc.begin_register());
        assert!(desc.begin_unregister());
        assert!(!desc.begin_unregister());
    }
}
