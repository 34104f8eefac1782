use crate::wddm::gdi::NtStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NeoError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DRM ioctl {request} failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("WDDM call {call} failed with status {status}")]
    Ddi { call: &'static str, status: NtStatus },

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("Out of GPU virtual address space")]
    OutOfVirtualAddressSpace,

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("GPU hang detected")]
    GpuHang,

    #[error("Invalid root device index: {0}")]
    InvalidRootDevice(u32),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("General Error: {0}")]
    General(String),
}

impl NeoError {
    /// Maps an errno reported by a memory-related ioctl onto the error taxonomy.
    ///
    /// `ENOMEM` and `ENOSPC` are resource exhaustion, everything else is a driver failure.
    #[must_use]
    pub fn from_ioctl(request: &'static str, source: std::io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::ENOMEM | libc::ENOSPC) => Self::OutOfMemory,
            _ => Self::Ioctl { request, source },
        }
    }

    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

// A convenient alias
pub type NeoResult<T> = Result<T, NeoError>;

/// Aborts on conditions that can only be reached through a driver bug
/// (double free, foreign allocation, destroyed context).
#[macro_export]
macro_rules! unrecoverable_if {
    ($cond:expr) => {
        if $cond {
            panic!("unrecoverable driver state: {}", stringify!($cond));
        }
    };
}
