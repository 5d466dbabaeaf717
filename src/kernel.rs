//! Dynamic kernel resolution and task-class registration.
//!
//! For each per-device kernel name the core walks an ordered list of library
//! search paths, trying the capability-suffixed symbol first and stepping
//! down through the known capabilities, then the bare name, then the
//! process's own symbol table. Resolved pointers are stored per device in the
//! task class's incarnation table.

use {
    crate::error::SchedError,
    libloading::Library,
    log::{debug, warn},
    std::{
        env,
        path::{Path, PathBuf},
        sync::atomic::{AtomicU32, Ordering},
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Environment variable overriding the kernel library search path.
pub const LIB_PATH_ENV: &str = "STREAMLINE_CUCORES_LIB";

/// Compute capabilities with known device binaries, oldest first.
pub const LEGAL_CAPABILITIES: [u32; 8] = [10, 11, 12, 13, 20, 21, 30, 35];

/// Resolved device function pointer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KernelSymbol(pub *const ());

unsafe impl Send for KernelSymbol {}
unsafe impl Sync for KernelSymbol {}

/// Symbol lookup capability injected into handle registration.
///
/// The default implementation probes shared objects; unit tests substitute a
/// table.
pub trait KernelResolver: Send + Sync {
    /// Looks up `symbol` in a binary targeting `capability`; zero selects the
    /// suffix-less fallback library.
    fn resolve(&self, capability: u32, symbol: &str) -> Option<KernelSymbol>;
}

/// Resolver probing `;`-separated directories or shared-object files, then
/// the process's own symbol table.
pub struct LibraryResolver {
    targets: Vec<PathBuf>,

    /// Libraries stay loaded so resolved symbols remain valid.
    loaded: Mutex<Vec<Library>>,
}

impl LibraryResolver {
    /// Builds the search list from `STREAMLINE_CUCORES_LIB`, else the
    /// configured path.
    pub fn new(config_path: &str) -> Self {
        let spec = env::var(LIB_PATH_ENV).unwrap_or_else(|_| config_path.to_owned());

        Self {
            targets: spec.split(';').filter(|s| !s.is_empty()).map(PathBuf::from).collect(),
            loaded: Mutex::new(Vec::new()),
        }
    }

    fn library_for(target: &Path, capability: u32) -> PathBuf {
        if target.is_dir() {
            if capability > 0 {
                target.join(format!("libstreamline_cucores_sm{capability}.so"))
            } else {
                target.join("libstreamline_cores_cuda.so")
            }
        } else {
            target.to_owned()
        }
    }

    fn keep_loaded(&self, lib: Library) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut loaded = self.loaded.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut loaded = loaded.unwrap();

        loaded.push(lib);
    }
}

impl KernelResolver for LibraryResolver {
    fn resolve(&self, capability: u32, symbol: &str) -> Option<KernelSymbol> {
        for target in &self.targets {
            if !target.exists() {
                debug!("could not stat the {} path", target.display());
                continue;
            }

            let library_name = Self::library_for(target, capability);
            let lib = match unsafe { Library::new(&library_name) } {
                Ok(lib) => lib,
                Err(err) => {
                    debug!("could not find the {} dynamic library ({err})", library_name.display());
                    continue;
                }
            };
            let found = unsafe { lib.get::<unsafe extern "C" fn()>(symbol.as_bytes()) }
                .map(|sym| KernelSymbol(*sym as *const ()))
                .ok();
            if let Some(sym) = found {
                debug!("function {symbol} found in shared object {}", library_name.display());
                self.keep_loaded(lib);

                return Some(sym);
            }
        }

        // nothing in the named libraries, try the compile time linked in
        #[cfg(unix)]
        {
            let this = libloading::os::unix::Library::this();
            let found = unsafe { this.get::<unsafe extern "C" fn()>(symbol.as_bytes()) }
                .map(|sym| KernelSymbol(*sym as *const ()))
                .ok();
            std::mem::forget(this);
            if found.is_some() {
                debug!("function {symbol} found in the application object");

                return found;
            }
        }

        None
    }
}

/// Walks capability-suffixed symbol names from the device's capability down,
/// then the plain name.
pub fn solve_handle_dependencies(
    resolver: &dyn KernelResolver,
    major: u32,
    minor: u32,
    fname: &str,
) -> Option<KernelSymbol> {
    let capability = major * 10 + minor;
    let mut index = LEGAL_CAPABILITIES.iter().position(|&cap| cap == capability)?;

    loop {
        let cap = LEGAL_CAPABILITIES[index];
        if let Some(sym) = resolver.resolve(cap, &format!("{fname}_SM{cap}")) {
            return Some(sym);
        }

        if index == 0 {
            break;
        }

        index -= 1;
    }

    resolver.resolve(0, fname)
}

/// One task class and its per-device kernel incarnations.
pub struct TaskClass {
    pub name: String,

    /// Dynamic symbol family name; `None` means statically linked.
    pub dyld: Option<String>,

    incarnations: Mutex<Vec<Option<KernelSymbol>>>,
}

impl TaskClass {
    pub fn new(name: impl Into<String>, dyld: Option<&str>) -> Self {
        Self {
            name: name.into(),
            dyld: dyld.map(str::to_owned),
            incarnations: Mutex::new(Vec::new()),
        }
    }

    /// The kernel resolved for `ordinal`, if registration found one.
    pub fn incarnation(&self, ordinal: usize) -> Option<KernelSymbol> {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut incarnations = self.incarnations.lock();

        #[cfg(not(feature = "parking_lot"))]
        let incarnations = incarnations.unwrap();

        incarnations.get(ordinal).copied().flatten()
    }

    fn set_incarnation(&self, ordinal: usize, symbol: KernelSymbol) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut incarnations = self.incarnations.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut incarnations = incarnations.unwrap();

        while incarnations.len() <= ordinal {
            incarnations.push(None);
        }

        incarnations[ordinal] = Some(symbol);
    }
}

/// A registered task-graph program: its task classes plus the devices allowed
/// to run them.
pub struct TaskHandle {
    devices_mask: AtomicU32,
    pub classes: Vec<TaskClass>,
}

impl TaskHandle {
    pub fn new(classes: Vec<TaskClass>) -> Self {
        Self {
            devices_mask: AtomicU32::new(u32::MAX),
            classes,
        }
    }

    pub fn devices_mask(&self) -> u32 {
        self.devices_mask.load(Ordering::Acquire)
    }

    pub fn allows_device(&self, index: usize) -> bool {
        self.devices_mask() & (1 << index) != 0
    }

    pub(crate) fn remove_device(&self, index: usize) {
        self.devices_mask.fetch_and(!(1 << index), Ordering::AcqRel);
    }
}

/// Resolves every class of `handle` for one device. A device without a single
/// usable incarnation is removed from the handle's device mask.
pub fn register_handle(
    resolver: &dyn KernelResolver,
    handle: &TaskHandle,
    device_index: usize,
    ordinal: usize,
    major: u32,
    minor: u32,
) -> Result<(), SchedError> {
    let mut rc = Err(SchedError::NotFound);
    for class in &handle.classes {
        match &class.dyld {
            None => {
                // no dynamic load for this kernel
                rc = Ok(());
            }
            Some(fname) => {
                if let Some(symbol) = solve_handle_dependencies(resolver, major, minor, fname) {
                    class.set_incarnation(ordinal, symbol);
                    rc = Ok(());
                } else {
                    debug!("no function {fname} found for device {device_index}");
                }
            }
        }
    }

    if rc.is_err() {
        warn!("device {device_index} removed from the handle: no kernel incarnation found");
        handle.remove_device(device_index);
    }

    rc
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashMap};

    struct StubResolver {
        symbols: HashMap<(u32, String), KernelSymbol>,
    }

    impl StubResolver {
        fn new(entries: &[(u32, &str)]) -> Self {
            Self {
                symbols: entries
                    .iter()
                    .enumerate()
                    .map(|(i, (cap, name))| {
                        ((*cap, (*name).to_owned()), KernelSymbol((i + 1) as *const ()))
                    })
                    .collect(),
            }
        }
    }

    impl KernelResolver for StubResolver {
        fn resolve(&self, capability: u32, symbol: &str) -> Option<KernelSymbol> {
            self.symbols.get(&(capability, symbol.to_owned())).copied()
        }
    }

    #[test]
    fn exact_capability_wins() {
        let resolver = StubResolver::new(&[(35, "gemm_SM35"), (30, "gemm_SM30")]);

        assert_eq!(
            solve_handle_dependencies(&resolver, 3, 5, "gemm"),
            resolver.resolve(35, "gemm_SM35")
        );
    }

    #[test]
    fn steps_down_to_lesser_capability() {
        let resolver = StubResolver::new(&[(20, "gemm_SM20")]);

        assert_eq!(
            solve_handle_dependencies(&resolver, 3, 5, "gemm"),
            resolver.resolve(20, "gemm_SM20")
        );
    }

    #[test]
    fn falls_back_to_plain_name() {
        let resolver = StubResolver::new(&[(0, "gemm")]);

        assert_eq!(
            solve_handle_dependencies(&resolver, 3, 5, "gemm"),
            resolver.resolve(0, "gemm")
        );
    }

    #[test]
    fn unknown_capability_resolves_nothing() {
        let resolver = StubResolver::new(&[(35, "gemm_SM35")]);

        assert_eq!(solve_handle_dependencies(&resolver, 9, 9, "gemm"), None);
    }

    #[test]
    fn registration_fills_the_incarnation_table() {
        let resolver = StubResolver::new(&[(35, "gemm_SM35")]);
        let handle = TaskHandle::new(vec![TaskClass::new("gemm", Some("gemm"))]);

        register_handle(&resolver, &handle, 2, 0, 3, 5).unwrap();

        assert!(handle.classes[0].incarnation(0).is_some());
        assert!(handle.classes[0].incarnation(1).is_none());
        assert!(handle.allows_device(2));
    }

    #[test]
    fn missing_kernel_removes_the_device() {
        let resolver = StubResolver::new(&[]);
        let handle = TaskHandle::new(vec![TaskClass::new("gemm", Some("gemm"))]);

        assert_eq!(
            register_handle(&resolver, &handle, 2, 0, 3, 5).unwrap_err(),
            SchedError::NotFound
        );
        assert!(!handle.allows_device(2));
        assert!(handle.allows_device(3));
    }

    #[test]
    fn statically_linked_classes_need_no_resolution() {
        let resolver = StubResolver::new(&[]);
        let handle = TaskHandle::new(vec![TaskClass::new("memset", None)]);

        register_handle(&resolver, &handle, 2, 0, 3, 5).unwrap();

        assert!(handle.allows_device(2));
    }
}
