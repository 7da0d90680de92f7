//! Linux backend for the readiness reactor, implemented on top of `epoll(7)`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{CLOSE, READ, WRITE};

pub(super) fn create() -> io::Result<RawFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn to_epoll_events(mask: u8) -> u32 {
    let mut events = 0u32;
    if mask & READ != 0 {
        events |= libc::EPOLLIN as u32;
    }
    if mask & WRITE != 0 {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

pub(super) fn add(epfd: RawFd, fd: RawFd, mask: u8) -> io::Result<()> {
    ctl(epfd, fd, mask, libc::EPOLL_CTL_ADD)
}

pub(super) fn modify(epfd: RawFd, fd: RawFd, mask: u8) -> io::Result<()> {
    ctl(epfd, fd, mask, libc::EPOLL_CTL_MOD)
}

pub(super) fn remove(epfd: RawFd, fd: RawFd) -> io::Result<()> {
    let result = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ctl(epfd: RawFd, fd: RawFd, mask: u8, op: libc::c_int) -> io::Result<()> {
    let mut event = libc::epoll_event { events: to_epoll_events(mask) | libc::EPOLLRDHUP as u32, u64: fd as u64 };
    let result = unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn wait(epfd: RawFd, timeout: Option<Duration>, out: &mut Vec<(RawFd, u8)>) -> io::Result<()> {
    out.clear();
    let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
    let timeout_ms = match timeout {
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    };

    let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(err);
    }

    for event in &events[..n as usize] {
        let fd = event.u64 as RawFd;
        let mut mask = 0u8;
        if event.events & (libc::EPOLLIN as u32) != 0 {
            mask |= READ;
        }
        if event.events & (libc::EPOLLOUT as u32) != 0 {
            mask |= WRITE;
        }
        if event.events & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32 | libc::EPOLLRDHUP as u32) != 0 {
            mask |= CLOSE;
        }
        out.push((fd, mask));
    }
    Ok(())
}
