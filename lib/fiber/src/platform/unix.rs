//! Unix backend, implemented on top of `ucontext(3)`.
//!
//! Each fiber owns a heap-allocated stack and a `ucontext_t` pair: one context for the fiber
//! itself, one (`resumer`) for whoever last called [`resume`]. `resume`/`yield_now` are a matched
//! pair of `swapcontext` calls; nothing here assumes anything about which OS thread is doing the
//! swapping, which is what lets a fiber move between threads across a suspend point.

use std::cell::Cell;
use std::ffi::c_void;
use std::mem;

/// Opaque handle to a fiber's context-and-stack allocation.
pub type PlatformId = usize;

struct FiberData {
    context: libc::ucontext_t,
    resumer: libc::ucontext_t,
    // Kept alive for the lifetime of the context; `ucontext_t::uc_stack` points into it.
    _stack: Vec<u8>,
    thunk: Option<Box<dyn FnOnce()>>,
}

thread_local! {
    static CURRENT: Cell<Option<PlatformId>> = Cell::new(None);
}

pub fn init_thread() {
    // No conversion step is required on Unix: any thread can call `getcontext`/`swapcontext`.
}

pub fn current_id() -> PlatformId {
    CURRENT.with(Cell::get).expect("fiber::current() called with no active fiber")
}

pub fn create(stack_size: usize, thunk: Box<dyn FnOnce()>) -> PlatformId {
    let mut stack = vec![0u8; stack_size];

    let mut data = Box::new(FiberData {
        context: unsafe { mem::zeroed() },
        resumer: unsafe { mem::zeroed() },
        _stack: Vec::new(),
        thunk: Some(thunk),
    });

    unsafe {
        libc::getcontext(&mut data.context);
    }
    data.context.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
    data.context.uc_stack.ss_size = stack_size;
    data.context.uc_link = std::ptr::null_mut();
    data._stack = stack;

    let raw = Box::into_raw(data) as usize;
    let (hi, lo) = split_pointer(raw);

    unsafe {
        let data = &mut *(raw as *mut FiberData);
        libc::makecontext(
            &mut data.context,
            mem::transmute::<extern "C" fn(u32, u32), extern "C" fn()>(trampoline),
            2,
            hi,
            lo,
        );
    }

    raw
}

pub fn resume(id: PlatformId) {
    CURRENT.with(|cell| cell.set(Some(id)));
    let data = unsafe { &mut *(id as *mut FiberData) };
    unsafe {
        libc::swapcontext(&mut data.resumer, &mut data.context);
    }
}

pub fn yield_now() {
    let id = current_id();
    let data = unsafe { &mut *(id as *mut FiberData) };
    unsafe {
        libc::swapcontext(&mut data.context, &mut data.resumer);
    }
}

fn split_pointer(ptr: usize) -> (u32, u32) {
    let value = ptr as u64;
    ((value >> 32) as u32, (value & 0xffff_ffff) as u32)
}

fn join_pointer(hi: u32, lo: u32) -> usize {
    (((hi as u64) << 32) | lo as u64) as usize
}

extern "C" fn trampoline(hi: u32, lo: u32) {
    let raw = join_pointer(hi, lo);
    let thunk = {
        let data = unsafe { &mut *(raw as *mut FiberData) };
        data.thunk.take().expect("fiber trampoline invoked twice")
    };

    thunk();

    // The thunk (see `Fiber::new`) has already recorded `Term`/`Except` state. We must never
    // fall off the end of this function, and the fiber will never be resumed again once
    // terminated, so park here by swapping back to the resumer in a loop.
    loop {
        let data = unsafe { &mut *(raw as *mut FiberData) };
        unsafe {
            libc::swapcontext(&mut data.context, &mut data.resumer);
        }
    }
}
