//! Platform-specific stack switching.
//!
//! Every backend exposes the same small surface: create a fiber from a boxed thunk, resume it on
//! the calling thread, yield back to the resumer, and report the id of whatever is currently
//! running. The rest of the crate is written entirely in terms of this surface.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub use self::windows::*;
    } else if #[cfg(unix)] {
        mod unix;
        pub use self::unix::*;
    } else {
        compile_error!("fiber: unsupported platform, only unix and windows backends exist");
    }
}
