//! A library for creating and managing fibers in a cross-platform manner.
//!
//! Fibers are cooperative units of execution that must be manually resumed by the client
//! application, as opposed to threads which are scheduled by the OS. Each fiber has its own
//! stack and can yield control back to its resumer at any point during execution. This allows
//! for forms of concurrency that aren't available with plain system threads: blocking-style
//! code that suspends on I/O or a timer without blocking the underlying OS thread.
//!
//! This library is the stack-switching primitive underneath a fiber-pool scheduler; on its own
//! it only knows how to create, resume, suspend, and cancel a single fiber.
//!
//! # Fibers and threads
//!
//! Fibers run on top of system threads, with one fiber active on a thread at a time. Once a
//! fiber has suspended, it can be resumed on any thread, not just the one it was previously
//! running on. Moving a `!Send` value across that boundary would be unsound, which is why
//! `resume()` is `unsafe`: the caller must ensure nothing non-`Send` is alive on the fiber's
//! stack across a resume on a different thread.
//!
//! # Examples
//!
//! ```
//! use fiber::{Fiber, Yielder};
//!
//! let fiber = Fiber::new(64 * 1024, |yielder: Yielder| {
//!     println!("fiber running");
//!     yielder.suspend();
//!     println!("fiber resumed");
//! });
//!
//! let fiber = unsafe { fiber.call() };
//! assert_eq!(fiber.state(), fiber::State::Hold);
//! let fiber = unsafe { fiber.call() };
//! assert_eq!(fiber.state(), fiber::State::Term);
//! ```

mod platform;

use std::any::Any;
use std::fmt;
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

pub use platform::PlatformId;

/// A boxed cancellation or injected-panic payload.
pub type Payload = Box<dyn Any + Send>;

/// The lifecycle state of a [`Fiber`].
///
/// `Init -> Exec -> Hold -> Exec -> ... -> Term`, with a detour to `Except` if the fiber's entry
/// point unwinds (either from a genuine panic or from an injected cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created but never resumed.
    Init = 0,
    /// Currently running on some thread.
    Exec = 1,
    /// Suspended at a yield point, waiting to be resumed.
    Hold = 2,
    /// Entry point returned normally.
    Term = 3,
    /// Entry point unwound (panic or injected cancellation).
    Except = 4,
}

impl From<u8> for State {
    fn from(value: u8) -> State {
        match value {
            0 => State::Init,
            1 => State::Exec,
            2 => State::Hold,
            3 => State::Term,
            4 => State::Except,
            other => panic!("invalid fiber state discriminant {}", other),
        }
    }
}

/// Shared bookkeeping between a [`Fiber`] handle and the [`Yielder`] visible to its entry point.
struct Control {
    state: AtomicU8,
    injected: Mutex<Option<Payload>>,
    panicked: Mutex<Option<Payload>>,
}

impl Control {
    fn new() -> Control {
        Control {
            state: AtomicU8::new(State::Init as u8),
            injected: Mutex::new(None),
            panicked: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle given to a fiber's entry point, allowing it to suspend itself.
#[derive(Clone)]
pub struct Yielder {
    control: Arc<Control>,
}

impl Yielder {
    /// Suspends the current fiber, returning control to whoever last called [`Fiber::call`].
    ///
    /// Returns once the fiber is resumed again. If a cancellation was injected while the fiber
    /// was suspended, this resumes the unwind immediately instead of returning.
    pub fn suspend(&self) {
        self.control.set_state(State::Hold);
        platform::yield_now();
        self.control.set_state(State::Exec);
        self.check_injected();
    }

    /// Checks for and raises an injected cancellation without suspending.
    ///
    /// Entry points that run for a long time between suspension points may call this to observe
    /// cancellation promptly.
    pub fn check_injected(&self) {
        let payload = self.control.injected.lock().expect("fiber control poisoned").take();
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
    }
}

/// A unique, thread- and process-wide identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(PlatformId);

unsafe impl Send for FiberId {}
unsafe impl Sync for FiberId {}

/// A cooperatively-scheduled execution context with its own stack.
pub struct Fiber {
    raw: PlatformId,
    control: Arc<Control>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.raw)
            .field("state", &self.control.state())
            .finish()
    }
}

// A `Fiber` owns a raw platform handle (effectively a pointer) but is designed to move freely
// between threads; the only genuinely unsafe operation, resuming it, is already marked `unsafe`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Control>>> = std::cell::RefCell::new(None);
}

/// Initializes the current thread for fiber usage.
///
/// Converts the calling OS thread into a fiber context (required on some platforms before any
/// fiber can be created or resumed). Idempotent: calling it again on an already-initialized
/// thread is a no-op.
pub fn init() {
    platform::init_thread();
}

/// Returns the id of the fiber currently running on this thread, if any.
pub fn current() -> Option<FiberId> {
    CURRENT.with(|cell| cell.borrow().is_some())
        .then(platform::current_id)
        .map(FiberId)
}

impl Fiber {
    /// Creates a new fiber with the given stack size, ready to run `entry` once resumed.
    ///
    /// `entry` receives a [`Yielder`] it can use to suspend itself. The entry point is run to
    /// completion or until it unwinds; the fiber then transitions to [`State::Term`] or
    /// [`State::Except`] and the final [`Fiber::call`] returns normally to the resumer.
    pub fn new<F>(stack_size: usize, entry: F) -> Fiber
    where
        F: FnOnce(Yielder) + Send + 'static,
    {
        let control = Arc::new(Control::new());
        let trampoline_control = control.clone();
        let boxed: Box<dyn FnOnce()> = Box::new(move || {
            let yielder = Yielder { control: trampoline_control.clone() };
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(yielder)));
            match result {
                Ok(()) => trampoline_control.set_state(State::Term),
                Err(payload) => {
                    *trampoline_control.panicked.lock().expect("fiber control poisoned") = Some(payload);
                    trampoline_control.set_state(State::Except);
                }
            }
        });

        let raw = platform::create(stack_size, boxed);
        Fiber { raw, control }
    }

    /// Resumes the fiber, running it until it suspends or terminates.
    ///
    /// # Safety
    ///
    /// The caller must not resume a fiber that is already running ([`State::Exec`]) on another
    /// thread, and must not keep a `!Send` value alive across a resume that could hand off to a
    /// different thread.
    pub unsafe fn call(self) -> Fiber {
        assert_ne!(self.control.state(), State::Term, "resumed a terminated fiber");
        assert_ne!(self.control.state(), State::Except, "resumed a fiber that had panicked");

        self.control.set_state(State::Exec);
        let prev = CURRENT.with(|cell| cell.replace(Some(self.control.clone())));

        platform::resume(self.raw);

        CURRENT.with(|cell| *cell.borrow_mut() = prev);
        self
    }

    /// Returns the fiber's current lifecycle state.
    pub fn state(&self) -> State {
        self.control.state()
    }

    /// Returns the fiber's unique id.
    pub fn id(&self) -> FiberId {
        FiberId(self.raw)
    }

    /// Injects a cancellation payload that will be raised the next time this fiber is resumed
    /// from [`State::Hold`].
    ///
    /// Has no effect (returns `false`) if the fiber isn't currently suspended.
    pub fn inject(&self, payload: Payload) -> bool {
        if self.control.state() != State::Hold {
            return false;
        }
        *self.control.injected.lock().expect("fiber control poisoned") = Some(payload);
        true
    }

    /// Cancels a fiber parked in [`State::Hold`] by injecting an unwind and resuming it once to
    /// drive it to [`State::Except`].
    ///
    /// A no-op (returns `self` unchanged) for a fiber that isn't currently suspended; the
    /// resulting panic payload, if any, is discarded. Callers that care about it should use
    /// [`Fiber::inject`] and [`Fiber::take_panic`] directly instead.
    pub fn cancel(self) -> Fiber {
        if self.control.state() != State::Hold {
            return self;
        }
        let injected = self.inject(Box::new("fiber reset while suspended"));
        debug_assert!(injected, "state was Hold but inject reported the fiber wasn't suspended");
        let mut drained = unsafe { self.call() };
        debug_assert_ne!(drained.state(), State::Hold, "fiber still suspended after cancellation");
        let _ = drained.take_panic();
        drained
    }

    /// Rebinds this fiber to a fresh entry point, reusing its stack allocation.
    ///
    /// A fiber parked in [`State::Hold`] is cancelled first (see [`Fiber::cancel`]) and driven to
    /// termination, since there is no safe way to discard a live stack frame in place.
    pub fn reset<F>(self, stack_size: usize, entry: F) -> Fiber
    where
        F: FnOnce(Yielder) + Send + 'static,
    {
        let _ = self.cancel();
        Fiber::new(stack_size, entry)
    }

    /// Takes the panic payload captured when this fiber's entry point unwound, if any.
    pub fn take_panic(&self) -> Option<Payload> {
        self.control.panicked.lock().expect("fiber control poisoned").take()
    }
}
