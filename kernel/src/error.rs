//! Kernel-wide error type.
//!
//! Every fallible kernel operation returns [`KernelError`]. The variants
//! carry the stable negative integer codes surfaced at the syscall
//! boundary, so user programs see the same numbers regardless of which
//! subsystem produced the failure.

use core::fmt;

/// Kernel error kinds.
///
/// `code()` maps each kind to the negative value placed in `a0` when a
/// syscall fails. The mapping is ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Malformed argument or request.
    Invalid,
    /// Out of physical pages or heap memory.
    NoMemory,
    /// Operation not supported by this object.
    NotSupported,
    /// Resource busy, or name already exists.
    BusyOrExists,
    /// Descriptor number out of range or not open.
    BadDescriptor,
    /// Descriptor or open-file table full.
    TooManyOpen,
    /// Named object does not exist.
    NotFound,
    /// Device or backing-store failure.
    IoError,
    /// Page present but lacks the required permission bits.
    AccessDenied,
    /// Pipe write with no readers left.
    BrokenPipe,
    /// Recognized container with unusable contents (e.g. wrong ELF class).
    BadFormat,
    /// Thread table full.
    TooManyThreads,
}

impl KernelError {
    /// Stable negative integer code for the syscall ABI.
    pub const fn code(self) -> i64 {
        match self {
            KernelError::Invalid => -1,
            KernelError::NoMemory => -2,
            KernelError::NotSupported => -3,
            KernelError::BusyOrExists => -4,
            KernelError::BadDescriptor => -5,
            KernelError::TooManyOpen => -6,
            KernelError::NotFound => -7,
            KernelError::IoError => -8,
            KernelError::AccessDenied => -9,
            KernelError::BrokenPipe => -10,
            KernelError::BadFormat => -11,
            KernelError::TooManyThreads => -12,
        }
    }

    /// Inverse of [`code`](Self::code); `None` for unknown codes.
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -1 => KernelError::Invalid,
            -2 => KernelError::NoMemory,
            -3 => KernelError::NotSupported,
            -4 => KernelError::BusyOrExists,
            -5 => KernelError::BadDescriptor,
            -6 => KernelError::TooManyOpen,
            -7 => KernelError::NotFound,
            -8 => KernelError::IoError,
            -9 => KernelError::AccessDenied,
            -10 => KernelError::BrokenPipe,
            -11 => KernelError::BadFormat,
            -12 => KernelError::TooManyThreads,
            _ => return None,
        })
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelError::Invalid => "invalid argument",
            KernelError::NoMemory => "out of memory",
            KernelError::NotSupported => "operation not supported",
            KernelError::BusyOrExists => "busy or already exists",
            KernelError::BadDescriptor => "bad descriptor",
            KernelError::TooManyOpen => "too many open files",
            KernelError::NotFound => "not found",
            KernelError::IoError => "I/O error",
            KernelError::AccessDenied => "access denied",
            KernelError::BrokenPipe => "broken pipe",
            KernelError::BadFormat => "bad format",
            KernelError::TooManyThreads => "too many threads",
        };
        write!(f, "{}", name)
    }
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        let kinds = [
            KernelError::Invalid,
            KernelError::NoMemory,
            KernelError::NotSupported,
            KernelError::BusyOrExists,
            KernelError::BadDescriptor,
            KernelError::TooManyOpen,
            KernelError::NotFound,
            KernelError::IoError,
            KernelError::AccessDenied,
            KernelError::BrokenPipe,
            KernelError::BadFormat,
            KernelError::TooManyThreads,
        ];
        for kind in kinds {
            assert!(kind.code() < 0);
            assert_eq!(KernelError::from_code(kind.code()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert_eq!(KernelError::from_code(0), None);
        assert_eq!(KernelError::from_code(-100), None);
    }
}
