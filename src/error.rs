//! Typed error taxonomy shared by every component of the runtime.
//!
//! Contract violations (misuse of the API) are kept separate from OS-level failures so callers
//! can tell "you called this wrong" apart from "the kernel said no".

use std::io;

/// The error type returned by fallible operations across the crate.
#[derive(Debug, thiserror::Error)]
pub enum WeaveError {
    #[error("fiber is already terminated")]
    FiberAlreadyTerminated,

    #[error("no scheduler is running on the current thread")]
    NoCurrentScheduler,

    #[error("no fiber is running on the current thread")]
    NoCurrentFiber,

    #[error("event already armed for this descriptor/kind")]
    EventAlreadyArmed,

    #[error("event was not armed")]
    EventNotArmed,

    #[error("operation not supported on this platform")]
    OperationNotSupported,

    #[error("operation was cancelled")]
    OperationAborted,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("operation timed out")]
    TimedOut,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("host is down")]
    HostDown,

    #[error("network is down")]
    NetworkDown,

    #[error("network is unreachable")]
    NetworkUnreachable,

    #[error("address already in use")]
    AddressInUse,

    #[error("file not found")]
    FileNotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("bad handle")]
    BadHandle,

    #[error("is a directory")]
    IsDirectory,

    #[error("out of disk space")]
    OutOfDiskSpace,

    #[error("invalid unicode")]
    InvalidUnicode,

    #[error("native error {0}")]
    NativeError(i32),
}

impl From<io::Error> for WeaveError {
    fn from(err: io::Error) -> WeaveError {
        match err.kind() {
            io::ErrorKind::NotFound => WeaveError::FileNotFound,
            io::ErrorKind::PermissionDenied => WeaveError::AccessDenied,
            io::ErrorKind::ConnectionReset => WeaveError::ConnectionReset,
            io::ErrorKind::ConnectionRefused => WeaveError::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => WeaveError::ConnectionAborted,
            io::ErrorKind::NotConnected => WeaveError::BrokenPipe,
            io::ErrorKind::AddrInUse => WeaveError::AddressInUse,
            io::ErrorKind::BrokenPipe => WeaveError::BrokenPipe,
            io::ErrorKind::TimedOut => WeaveError::TimedOut,
            io::ErrorKind::Interrupted => WeaveError::OperationAborted,
            _ => match err.raw_os_error() {
                Some(code) => WeaveError::NativeError(code),
                None => WeaveError::NativeError(-1),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;
