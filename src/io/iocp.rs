//! Completion-port I/O manager (Windows): a [`Scheduler`] paired with an I/O completion port for
//! overlapped operations, plus a bounded pool of auxiliary wait-block threads for plain
//! `HANDLE` events that don't go through overlapped I/O (e.g. `CreateEventW` handles).

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{CloseHandle, BOOL, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED, OVERLAPPED_ENTRY,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE,
};

use crate::config::ConfigSource;
use crate::error::{Result, WeaveError};
use crate::log::{weave_log, Level};
use crate::scheduler::{current, current_handle, yield_to_scheduler, FiberHandle, IdleBackend, Runnable, Scheduler, Thunk};
use crate::timer::TimerManager;

const MAXIMUM_WAIT_OBJECTS: usize = 64;
/// Reserved completion key distinguishing a [`IocpIoManager::tickle`] sentinel from real I/O.
const TICKLE_KEY: usize = 0;
const DEFAULT_ERROR_TOLERANCE_COUNT: usize = 3;
const DEFAULT_ERROR_TOLERANCE_WINDOW: Duration = Duration::from_secs(60);

struct EventContext {
    scheduler: Arc<Scheduler>,
    originating_thread: ThreadId,
    handle: FiberHandle,
}

/// Per-operation state, embedded as the first field so a raw `LPOVERLAPPED` returned by the
/// completion port can be reinterpreted as a pointer to the enclosing `AsyncEvent`.
#[repr(C)]
pub struct AsyncEvent {
    pub overlapped: OVERLAPPED,
    context: Mutex<Option<EventContext>>,
}

impl AsyncEvent {
    pub fn new() -> AsyncEvent {
        AsyncEvent { overlapped: unsafe { mem::zeroed() }, context: Mutex::new(None) }
    }
}

impl Default for AsyncEvent {
    fn default() -> AsyncEvent {
        AsyncEvent::new()
    }
}

struct WaitEntry {
    handle: HANDLE,
    scheduler: Arc<Scheduler>,
    runnable: Option<Runnable>,
    recurring: bool,
}

/// A group of up to [`MAXIMUM_WAIT_OBJECTS`] `- 1` auxiliary event handles serviced by one
/// dedicated OS thread via `WaitForMultipleObjects`; slot 0 is reserved for the reconfiguration
/// signal so a register/unregister call can safely hand the waiting thread a fresh snapshot.
struct WaitBlock {
    reconfigured: HANDLE,
    entries: Mutex<Vec<WaitEntry>>,
}

unsafe impl Send for WaitBlock {}
unsafe impl Sync for WaitBlock {}

impl WaitBlock {
    fn new() -> WaitBlock {
        let reconfigured = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
        WaitBlock { reconfigured, entries: Mutex::new(Vec::new()) }
    }

    /// Attempts to add `runnable` to this block. Returns it back on failure (no room) so the
    /// caller can try the next block or start a new one.
    fn register(&self, handle: HANDLE, scheduler: Arc<Scheduler>, runnable: Runnable, recurring: bool) -> std::result::Result<(), Runnable> {
        let mut entries = self.entries.lock().expect("wait block lock poisoned");
        if entries.len() + 1 >= MAXIMUM_WAIT_OBJECTS {
            return Err(runnable);
        }
        entries.push(WaitEntry { handle, scheduler, runnable: Some(runnable), recurring });
        drop(entries);
        unsafe {
            SetEvent(self.reconfigured);
        }
        Ok(())
    }

    fn unregister(&self, handle: HANDLE) -> usize {
        let mut entries = self.entries.lock().expect("wait block lock poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            unsafe {
                SetEvent(self.reconfigured);
            }
        }
        removed
    }

    fn run(self: Arc<Self>) {
        loop {
            let snapshot: Vec<HANDLE> = {
                let entries = self.entries.lock().expect("wait block lock poisoned");
                std::iter::once(self.reconfigured).chain(entries.iter().map(|e| e.handle)).collect()
            };

            let result = unsafe { WaitForMultipleObjects(snapshot.len() as u32, snapshot.as_ptr(), 0, INFINITE) };

            if result == WAIT_OBJECT_0 {
                // Reconfiguration signal: loop back around and rebuild the snapshot.
                continue;
            }

            let index = (result - WAIT_OBJECT_0) as usize;
            if index == 0 || index >= snapshot.len() {
                continue;
            }

            let fired = {
                let mut entries = self.entries.lock().expect("wait block lock poisoned");
                let entry_index = index - 1;
                if entry_index >= entries.len() {
                    None
                } else if entries[entry_index].recurring {
                    let entry = &mut entries[entry_index];
                    Some((entry.scheduler.clone(), entry.runnable.take()))
                } else {
                    let entry = entries.remove(entry_index);
                    Some((entry.scheduler, entry.runnable))
                }
            };

            if let Some((scheduler, Some(runnable))) = fired {
                scheduler.schedule_raw(runnable, None);
            }
        }
    }
}

impl Drop for WaitBlock {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.reconfigured);
        }
    }
}

struct ErrorTolerance {
    allowed_count: usize,
    window: Duration,
    seen: Mutex<(usize, Instant)>,
}

/// A scheduler whose idle worker blocks on an I/O completion port.
pub struct IocpIoManager {
    pub scheduler: Arc<Scheduler>,
    timers: TimerManager,
    completion_port: HANDLE,
    pending_event_count: AtomicUsize,
    pending_events: Mutex<HashMap<usize, ()>>,
    wait_blocks: Mutex<Vec<Arc<WaitBlock>>>,
    error_tolerance: ErrorTolerance,
}

unsafe impl Send for IocpIoManager {}
unsafe impl Sync for IocpIoManager {}

impl IocpIoManager {
    /// Creates the manager. `error_tolerance_count`/`error_tolerance_window` bound how many
    /// transient [`IocpIoManager::tickle`] failures are swallowed within a sliding window before
    /// escalating to a fatal log, addressing intermittent `PostQueuedCompletionStatus` failures
    /// under kernel resource pressure.
    pub fn new(
        thread_count: usize,
        hijack_caller: bool,
        batch_size: usize,
        error_tolerance_count: usize,
        error_tolerance_window: Duration,
    ) -> std::io::Result<Arc<IocpIoManager>> {
        let scheduler = Scheduler::new(thread_count, hijack_caller, batch_size);
        let completion_port = unsafe { CreateIoCompletionPort(-1isize as HANDLE, 0, 0, thread_count as u32) };
        if completion_port == 0 {
            return Err(std::io::Error::last_os_error());
        }

        let manager = Arc::new(IocpIoManager {
            scheduler: scheduler.clone(),
            timers: TimerManager::new(),
            completion_port,
            pending_event_count: AtomicUsize::new(0),
            pending_events: Mutex::new(HashMap::new()),
            wait_blocks: Mutex::new(Vec::new()),
            error_tolerance: ErrorTolerance {
                allowed_count: error_tolerance_count,
                window: error_tolerance_window,
                seen: Mutex::new((0, Instant::now())),
            },
        });

        scheduler.set_backend(manager.clone());
        let hook_target = manager.clone();
        manager.timers.on_timer_inserted_at_front(Box::new(move || hook_target.tickle()));

        Ok(manager)
    }

    /// Creates the manager with `error_tolerance_count`/`error_tolerance_window` read from
    /// `weave.iocp.error_tolerance_count` and `weave.iocp.error_tolerance_window_us`, falling
    /// back to 3 failures per minute when either key is unset.
    pub fn from_config(config: &dyn ConfigSource, thread_count: usize, hijack_caller: bool, batch_size: usize) -> std::io::Result<Arc<IocpIoManager>> {
        let error_tolerance_count = config
            .get_int("weave.iocp.error_tolerance_count")
            .map(|n| n.max(0) as usize)
            .unwrap_or(DEFAULT_ERROR_TOLERANCE_COUNT);
        let error_tolerance_window = config
            .get_int("weave.iocp.error_tolerance_window_us")
            .map(|us| Duration::from_micros(us.max(0) as u64))
            .unwrap_or(DEFAULT_ERROR_TOLERANCE_WINDOW);
        IocpIoManager::new(thread_count, hijack_caller, batch_size, error_tolerance_count, error_tolerance_window)
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

    /// Associates `handle` with the completion port. Required once per handle before any
    /// overlapped call that will complete through it.
    pub fn register_file(&self, handle: HANDLE) -> Result<()> {
        let result = unsafe { CreateIoCompletionPort(handle, self.completion_port, 0, 0) };
        if result == 0 {
            return Err(WeaveError::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Stamps `event` with the current fiber/scheduler context. The caller passes
    /// `&mut event.overlapped` to the overlapped Windows call and then suspends (typically via
    /// [`yield_to_scheduler`]); [`IocpIoManager`]'s idle loop reschedules it on completion.
    pub fn register_event(&self, event: &AsyncEvent) -> Result<()> {
        let scheduler = current().ok_or(WeaveError::NoCurrentScheduler)?;
        let handle = current_handle().ok_or(WeaveError::NoCurrentFiber)?;
        *event.context.lock().expect("async event lock poisoned") =
            Some(EventContext { scheduler, originating_thread: thread::current().id(), handle });
        self.pending_event_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Undoes a [`IocpIoManager::register_event`] whose synchronous launch failed before any
    /// completion could be posted.
    pub fn unregister_event(&self, event: &AsyncEvent) {
        if event.context.lock().expect("async event lock poisoned").take().is_some() {
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Cancels an in-flight overlapped operation. `CancelIoEx` is thread-independent on the
    /// platforms this crate targets, so no marshaling to the issuing thread is required.
    pub fn cancel_event(&self, handle: HANDLE, event: &AsyncEvent) -> bool {
        unsafe { CancelIoEx(handle, &event.overlapped as *const OVERLAPPED as *mut OVERLAPPED) != 0 }
    }

    /// Registers a plain Windows event `HANDLE` (not an overlapped I/O completion) with an
    /// auxiliary wait-block thread. With `thunk = None`, the current fiber is attached and
    /// rescheduled once `handle` signals; pass a thunk to run arbitrary code instead.
    pub fn register_handle_event(&self, handle: HANDLE, thunk: Option<Thunk>, recurring: bool) -> Result<()> {
        let scheduler = current().ok_or(WeaveError::NoCurrentScheduler)?;
        let runnable = match thunk {
            Some(thunk) => Runnable::Thunk(thunk),
            None => Runnable::Handle(current_handle().ok_or(WeaveError::NoCurrentFiber)?),
        };

        let mut blocks = self.wait_blocks.lock().expect("io manager lock poisoned");
        let mut runnable = runnable;
        for block in blocks.iter() {
            match block.register(handle, scheduler.clone(), runnable, recurring) {
                Ok(()) => return Ok(()),
                Err(returned) => runnable = returned,
            }
        }

        let block = Arc::new(WaitBlock::new());
        let worker = block.clone();
        thread::spawn(move || worker.run());
        block.register(handle, scheduler, runnable, recurring).expect("a brand new wait block has room for one entry");
        blocks.push(block);
        Ok(())
    }

    pub fn unregister_handle_event(&self, handle: HANDLE) -> usize {
        let blocks = self.wait_blocks.lock().expect("io manager lock poisoned");
        blocks.iter().map(|block| block.unregister(handle)).sum()
    }

    fn tickle_failed(&self) -> bool {
        let mut seen = self.error_tolerance.seen.lock().expect("io manager lock poisoned");
        let now = Instant::now();
        if now.duration_since(seen.1) > self.error_tolerance.window {
            *seen = (0, now);
        }
        seen.0 += 1;
        seen.0 > self.error_tolerance.allowed_count
    }
}

impl IdleBackend for IocpIoManager {
    fn block(&self, _timeout: Option<Duration>) {
        let timeout_ms = match self.timers.next_timeout() {
            Some(d) => d.as_millis().min(u32::MAX as u128) as u32,
            None => INFINITE,
        };

        let mut entries: [OVERLAPPED_ENTRY; 64] = unsafe { mem::zeroed() };
        let mut removed = 0u32;
        let ok: BOOL = unsafe {
            GetQueuedCompletionStatusEx(
                self.completion_port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };

        for thunk in self.timers.collect_expired() {
            self.scheduler.schedule(thunk);
        }

        if ok == 0 {
            return;
        }

        let mut real_completions = 0usize;
        for entry in &entries[..removed as usize] {
            if entry.lpCompletionKey == TICKLE_KEY && entry.lpOverlapped.is_null() {
                continue;
            }
            real_completions += 1;

            let event = entry.lpOverlapped as *mut AsyncEvent;
            let context = unsafe { (*event).context.lock().expect("async event lock poisoned").take() };
            if let Some(context) = context {
                context.scheduler.schedule_handle(context.handle);
            } else {
                weave_log!(Level::Warning, "io", "completion for an unregistered AsyncEvent on thread {:?}", thread::current().id());
            }
        }
        self.pending_event_count.fetch_sub(real_completions, Ordering::SeqCst);
    }

    fn tickle(&self) {
        let ok = unsafe { PostQueuedCompletionStatus(self.completion_port, 0, TICKLE_KEY, ptr::null_mut()) };
        if ok == 0 && self.tickle_failed() {
            weave_log!(Level::Fatal, "io", "PostQueuedCompletionStatus failed beyond the configured tolerance window");
        }
    }

    fn is_quiescent(&self) -> bool {
        self.pending_event_count.load(Ordering::SeqCst) == 0 && self.timers.next_timeout().is_none()
    }
}

impl Drop for IocpIoManager {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.completion_port);
        }
    }
}
