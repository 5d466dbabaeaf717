use {
    crate::driver::DriverError,
    std::{
        error::Error,
        fmt::{Display, Formatter},
    },
};

/// Classifies every fallible core operation.
///
/// `Reschedule` is transient control flow rather than a failure: the progress
/// loop absorbs it by re-queueing the envelope and trying again once device
/// memory frees up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedError {
    /// A kernel symbol or library file could not be located.
    NotFound,

    /// Device memory or a host resource was exhausted.
    OutOfResource,

    /// An asynchronous copy was rejected by the driver.
    TransferFailed,

    /// The driver returned non-success on a critical call; the device is
    /// disabled.
    DeviceFault,

    /// The task cannot make progress right now and must be re-queued.
    Reschedule,

    /// A write request collided with active readers; the upstream dependency
    /// graph is missing a control dependency.
    AntiDependency,
}

impl SchedError {
    pub(crate) fn kind(self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::OutOfResource => "out-of-resource",
            Self::TransferFailed => "transfer-failed",
            Self::DeviceFault => "device-fault",
            Self::Reschedule => "reschedule",
            Self::AntiDependency => "anti-dependency",
        }
    }
}

impl Display for SchedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

impl Error for SchedError {}

impl From<DriverError> for SchedError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::OutOfMemory => Self::OutOfResource,
            DriverError::InvalidData | DriverError::Unsupported => Self::DeviceFault,
        }
    }
}
