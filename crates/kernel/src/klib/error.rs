// Kernel error handling and errno definitions

/// POSIX-style error numbers surfaced at the character/block boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    ESRCH = 3,       // No such process
    EINTR = 4,       // Interrupted system call
    EIO = 5,         // I/O error
    ENXIO = 6,       // No such device or address
    EBADF = 9,       // Bad file descriptor
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EACCES = 13,     // Permission denied
    EFAULT = 14,     // Bad address
    EBUSY = 16,      // Device or resource busy
    ENODEV = 19,     // No such device
    EINVAL = 22,     // Invalid argument
    ENOTTY = 25,     // Not a typewriter
    ENOSPC = 28,     // No space left on device
    ESPIPE = 29,     // Illegal seek
    EPIPE = 32,      // Broken pipe
    ERANGE = 34,     // Math result not representable
    ENOMEDIUM = 123, // No medium found
    ERESTARTSYS = 512, // Interrupted, restartable (kernel-internal)
}

pub type Result<T> = core::result::Result<T, Errno>;

/// Internal kernel error classes, mapped to errno at the entry-point
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    IoError,
    Interrupted,
    WouldBlock,
    Busy,
    NotSupported,
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EACCES,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::IoError => Errno::EIO,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::Busy => Errno::EBUSY,
            KernelError::NotSupported => Errno::ENODEV,
        }
    }
}

impl Errno {
    /// Signed return-value encoding used by entry points that return a
    /// byte count or a negative errno.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }
}
