//! Unified kernel error type
//!
//! `KernelError` uses `#[repr(i32)]` with discriminants equal to errno
//! values, so conversion to a C-style return code is simple negation.
//! Every fallible operation in this core returns `Result`; there is no
//! global "last error" cell.

/// Kernel error type with errno values as discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// Operation not permitted (EPERM)
    NotPermitted = 1,
    /// No such task (ESRCH)
    NoProcess = 3,
    /// Out of memory (ENOMEM)
    OutOfMemory = 12,
    /// Device or resource busy (EBUSY)
    Busy = 16,
    /// Resource already in use (EEXIST)
    AlreadyExists = 17,
    /// Invalid argument (EINVAL)
    InvalidArgument = 22,
    /// Timer expired (ETIME)
    TimedOut = 62,
}

impl KernelError {
    /// The errno value of this error.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Negated errno, the form a syscall-style ABI returns.
    pub fn to_return_value(self) -> i32 {
        -(self as i32)
    }
}

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_discriminants() {
        assert_eq!(KernelError::OutOfMemory.code(), 12);
        assert_eq!(KernelError::InvalidArgument.code(), 22);
        assert_eq!(KernelError::Busy.to_return_value(), -16);
    }
}
