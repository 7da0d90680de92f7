//! Platform I/O managers: a [`crate::scheduler::Scheduler`] paired with a kernel readiness or
//! completion object, selected at compile time via [`cfg_if`].

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod poll;
        pub use poll::{Event, EventGuard, PollIoManager as IoManager};
    } else if #[cfg(windows)] {
        mod iocp;
        pub use iocp::{AsyncEvent, IocpIoManager as IoManager};
    } else {
        compile_error!("weave::io requires a Unix (epoll/kqueue) or Windows (IOCP) target");
    }
}
