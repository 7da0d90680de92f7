//! BSD/macOS backend for the readiness reactor, implemented on top of `kqueue(2)`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{CLOSE, READ, WRITE};

pub(super) fn create() -> io::Result<RawFd> {
    let fd = unsafe { libc::kqueue() };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

fn apply(kq: RawFd, changes: &[libc::kevent]) -> io::Result<()> {
    let result = unsafe {
        libc::kevent(kq, changes.as_ptr(), changes.len() as i32, std::ptr::null_mut(), 0, std::ptr::null())
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Adds or replaces interest for `fd`. kqueue has no "modify" distinct from "add"; re-adding a
/// filter that's already registered just updates it, and we always reconcile both filters.
pub(super) fn add(kq: RawFd, fd: RawFd, mask: u8) -> io::Result<()> {
    modify(kq, fd, mask)
}

pub(super) fn modify(kq: RawFd, fd: RawFd, mask: u8) -> io::Result<()> {
    let mut changes = Vec::with_capacity(2);
    changes.push(change(fd, libc::EVFILT_READ, if mask & READ != 0 { libc::EV_ADD | libc::EV_CLEAR } else { libc::EV_DELETE }));
    changes.push(change(fd, libc::EVFILT_WRITE, if mask & WRITE != 0 { libc::EV_ADD | libc::EV_CLEAR } else { libc::EV_DELETE }));
    // Deleting a filter that was never added returns ENOENT; that's an expected no-op here.
    for c in &changes {
        let _ = apply(kq, std::slice::from_ref(c));
    }
    Ok(())
}

pub(super) fn remove(kq: RawFd, fd: RawFd) -> io::Result<()> {
    let _ = apply(kq, &[change(fd, libc::EVFILT_READ, libc::EV_DELETE)]);
    let _ = apply(kq, &[change(fd, libc::EVFILT_WRITE, libc::EV_DELETE)]);
    Ok(())
}

pub(super) fn wait(kq: RawFd, timeout: Option<Duration>, out: &mut Vec<(RawFd, u8)>) -> io::Result<()> {
    out.clear();
    let mut events: [libc::kevent; 64] = unsafe { std::mem::zeroed() };
    let ts = timeout.map(|d| libc::timespec { tv_sec: d.as_secs() as libc::time_t, tv_nsec: d.subsec_nanos() as libc::c_long });
    let ts_ptr = ts.as_ref().map(|t| t as *const libc::timespec).unwrap_or(std::ptr::null());

    let n = unsafe { libc::kevent(kq, std::ptr::null(), 0, events.as_mut_ptr(), events.len() as i32, ts_ptr) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(err);
    }

    for event in &events[..n as usize] {
        let fd = event.ident as RawFd;
        let mut mask = 0u8;
        if event.filter == libc::EVFILT_READ {
            mask |= READ;
        }
        if event.filter == libc::EVFILT_WRITE {
            mask |= WRITE;
        }
        if event.flags & libc::EV_EOF != 0 {
            mask |= CLOSE;
        }
        out.push((fd, mask));
    }
    Ok(())
}
