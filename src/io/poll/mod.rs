//! Readiness-poll I/O manager: a [`Scheduler`] paired with a kernel readiness object (`epoll` on
//! Linux, `kqueue` on BSD/macOS) and a self-pipe used to wake an idle worker.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, WeaveError};
use crate::log::{weave_log, Level};
use crate::scheduler::{current, current_handle, yield_to_scheduler, IdleBackend, Runnable, Scheduler, Thunk};
use crate::timer::TimerManager;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        use epoll as backend;
    } else {
        mod kqueue;
        use kqueue as backend;
    }
}

const READ: u8 = 0b001;
const WRITE: u8 = 0b010;
const CLOSE: u8 = 0b100;

/// Which direction of a file descriptor a registration concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
    Close,
}

impl Event {
    fn bit(self) -> u8 {
        match self {
            Event::Read => READ,
            Event::Write => WRITE,
            Event::Close => CLOSE,
        }
    }
}

struct EventContext {
    scheduler: Arc<Scheduler>,
    runnable: Runnable,
    cancelled: Arc<AtomicBool>,
}

/// Returned by [`PollIoManager::register_event`]; the caller suspends and, on resume, consults
/// [`EventGuard::is_cancelled`] to distinguish a real firing from a cancellation.
pub struct EventGuard {
    cancelled: Arc<AtomicBool>,
}

impl EventGuard {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FdState {
    read: Option<EventContext>,
    write: Option<EventContext>,
    close: Option<EventContext>,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut Option<EventContext> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
            Event::Close => &mut self.close,
        }
    }

    fn mask(&self) -> u8 {
        let mut mask = 0;
        if self.read.is_some() {
            mask |= READ;
        }
        if self.write.is_some() {
            mask |= WRITE;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none() && self.close.is_none()
    }
}

struct FireResult {
    fired: Vec<(Arc<Scheduler>, Runnable)>,
    remove_from_kernel: bool,
    mask: u8,
}

/// A scheduler whose idle worker blocks on a readiness object instead of a plain condvar.
pub struct PollIoManager {
    pub scheduler: Arc<Scheduler>,
    timers: TimerManager,
    reactor_fd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    states: Mutex<HashMap<RawFd, FdState>>,
    pending_event_count: AtomicUsize,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn make_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    Ok((fds[0], fds[1]))
}

fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

impl PollIoManager {
    /// Creates the manager and its worker pool. Mirrors [`Scheduler::new`]'s constructor
    /// arguments; the manager installs itself as the scheduler's idle backend.
    pub fn new(thread_count: usize, hijack_caller: bool, batch_size: usize) -> io::Result<Arc<PollIoManager>> {
        let scheduler = Scheduler::new(thread_count, hijack_caller, batch_size);
        let reactor_fd = backend::create()?;
        let (tickle_read, tickle_write) = make_pipe()?;
        backend::add(reactor_fd, tickle_read, READ)?;

        let manager = Arc::new(PollIoManager {
            scheduler: scheduler.clone(),
            timers: TimerManager::new(),
            reactor_fd,
            tickle_read,
            tickle_write,
            states: Mutex::new(HashMap::new()),
            pending_event_count: AtomicUsize::new(0),
        });

        scheduler.set_backend(manager.clone());
        let hook_target = manager.clone();
        manager.timers.on_timer_inserted_at_front(Box::new(move || hook_target.tickle()));

        Ok(manager)
    }

    pub fn start(self: &Arc<Self>) {
        self.scheduler.start();
    }

    pub fn dispatch(self: &Arc<Self>) {
        self.scheduler.dispatch();
    }

    pub fn stop(self: &Arc<Self>) {
        self.scheduler.stop();
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Arms an event on `fd`, attaching either the provided thunk or (if `None`) the currently
    /// running fiber. The caller is expected to suspend (typically via [`yield_to_scheduler`])
    /// after this returns when registering for its own fiber; see [`PollIoManager::wait_event`].
    pub fn register_event(&self, fd: RawFd, event: Event, thunk: Option<Thunk>) -> Result<EventGuard> {
        let scheduler = current().ok_or(WeaveError::NoCurrentScheduler)?;
        let runnable = match thunk {
            Some(thunk) => Runnable::Thunk(thunk),
            None => Runnable::Handle(current_handle().ok_or(WeaveError::NoCurrentFiber)?),
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        let context = EventContext { scheduler, runnable, cancelled: cancelled.clone() };

        let (existed, mask) = {
            let mut states = self.states.lock().expect("io manager lock poisoned");
            let existed = states.contains_key(&fd);
            let state = states.entry(fd).or_default();
            if state.slot(event).is_some() {
                return Err(WeaveError::EventAlreadyArmed);
            }
            *state.slot(event) = Some(context);
            (existed, state.mask())
        };

        if event != Event::Close {
            let result = if existed { backend::modify(self.reactor_fd, fd, mask) } else { backend::add(self.reactor_fd, fd, mask) };
            result?;
        }

        self.pending_event_count.fetch_add(1, Ordering::SeqCst);
        Ok(EventGuard { cancelled })
    }

    /// Registers the current fiber for `event` on `fd`, suspends, and turns a cancellation into
    /// [`WeaveError::OperationAborted`].
    pub fn wait_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let guard = self.register_event(fd, event, None)?;
        yield_to_scheduler();
        if guard.is_cancelled() {
            Err(WeaveError::OperationAborted)
        } else {
            Ok(())
        }
    }

    /// Removes an armed event without firing it. Returns whether anything was armed.
    pub fn unregister_event(&self, fd: RawFd, event: Event) -> bool {
        let (removed, remove_from_kernel, mask) = {
            let mut states = self.states.lock().expect("io manager lock poisoned");
            match states.get_mut(&fd) {
                Some(state) => {
                    let removed = state.slot(event).take().is_some();
                    let mask = state.mask();
                    let now_empty = state.is_empty();
                    if now_empty {
                        states.remove(&fd);
                    }
                    (removed, now_empty, mask)
                }
                None => (false, false, 0),
            }
        };

        if removed {
            if remove_from_kernel {
                let _ = backend::remove(self.reactor_fd, fd);
            } else if event != Event::Close {
                let _ = backend::modify(self.reactor_fd, fd, mask);
            }
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Fires an armed event immediately with a cancellation marker. The waiter's
    /// [`EventGuard::is_cancelled`] observes `true` once rescheduled.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let (context, remove_from_kernel, mask) = {
            let mut states = self.states.lock().expect("io manager lock poisoned");
            match states.get_mut(&fd) {
                Some(state) => {
                    let context = state.slot(event).take();
                    let mask = state.mask();
                    let now_empty = state.is_empty();
                    if now_empty {
                        states.remove(&fd);
                    }
                    (context, now_empty, mask)
                }
                None => (None, false, 0),
            }
        };

        match context {
            Some(context) => {
                context.cancelled.store(true, Ordering::SeqCst);
                if remove_from_kernel {
                    let _ = backend::remove(self.reactor_fd, fd);
                } else if event != Event::Close {
                    let _ = backend::modify(self.reactor_fd, fd, mask);
                }
                context.scheduler.schedule_raw(context.runnable, None);
                self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn take_fired(&self, fd: RawFd, mask: u8) -> FireResult {
        let mut states = self.states.lock().expect("io manager lock poisoned");
        match states.get_mut(&fd) {
            Some(state) => {
                let mut fired = Vec::new();
                for event in [Event::Read, Event::Write, Event::Close] {
                    if mask & event.bit() != 0 {
                        if let Some(context) = state.slot(event).take() {
                            fired.push((context.scheduler, context.runnable));
                        }
                    }
                }
                let remove_from_kernel = state.is_empty();
                let new_mask = state.mask();
                if remove_from_kernel {
                    states.remove(&fd);
                }
                FireResult { fired, remove_from_kernel, mask: new_mask }
            }
            None => FireResult { fired: Vec::new(), remove_from_kernel: false, mask: 0 },
        }
    }
}

impl IdleBackend for PollIoManager {
    /// Ignores `_timeout` (the scheduler's dispatch loop always passes `None`) and instead
    /// derives the wait timeout from the attached [`TimerManager`], matching the readiness-poll
    /// idle contract.
    fn block(&self, _timeout: Option<Duration>) {
        let timeout = self.timers.next_timeout();
        let mut ready = Vec::new();
        if let Err(err) = backend::wait(self.reactor_fd, timeout, &mut ready) {
            weave_log!(Level::Error, "io", "readiness wait failed: {}", err);
            return;
        }

        for thunk in self.timers.collect_expired() {
            self.scheduler.schedule(thunk);
        }

        for (fd, mask) in ready {
            if fd == self.tickle_read {
                drain_pipe(self.tickle_read);
                continue;
            }

            let result = self.take_fired(fd, mask);
            if result.fired.is_empty() {
                continue;
            }
            if result.remove_from_kernel {
                let _ = backend::remove(self.reactor_fd, fd);
            } else {
                let _ = backend::modify(self.reactor_fd, fd, result.mask);
            }
            let n = result.fired.len();
            for (scheduler, runnable) in result.fired {
                scheduler.schedule_raw(runnable, None);
            }
            self.pending_event_count.fetch_sub(n, Ordering::SeqCst);
        }
    }

    fn tickle(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.tickle_write, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn is_quiescent(&self) -> bool {
        self.pending_event_count.load(Ordering::SeqCst) == 0 && self.timers.next_timeout().is_none()
    }
}

impl Drop for PollIoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.reactor_fd);
            libc::close(self.tickle_read);
            libc::close(self.tickle_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn tickle_and_timer_wake_idle_worker() {
        let manager = PollIoManager::new(1, true, 4).expect("create poll io manager");
        manager.start();
        let fired = Arc::new(StdAtomicUsize::new(0));
        let fired_clone = fired.clone();
        let manager_ref = manager.clone();
        manager.timers().register_timer(Duration::from_millis(1), Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            manager_ref.stop();
        }), false);
        manager.dispatch();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_event_wakes_waiter_with_aborted_error() {
        let manager = PollIoManager::new(1, true, 4).expect("create poll io manager");
        manager.start();
        let (read_fd, _write_fd) = make_pipe().expect("pipe");
        let manager_for_fiber = manager.clone();
        let manager_for_cancel = manager.clone();

        manager.scheduler.schedule(Box::new(move || {
            let result = manager_for_fiber.wait_event(read_fd, Event::Read);
            assert!(matches!(result, Err(WeaveError::OperationAborted)));
            manager_for_fiber.stop();
        }));

        manager.scheduler.schedule(Box::new(move || {
            while !manager_for_cancel.cancel_event(read_fd, Event::Read) {
                crate::scheduler::yield_now();
            }
        }));

        manager.dispatch();
        unsafe {
            libc::close(read_fd);
            libc::close(_write_fd);
        }
    }
}
