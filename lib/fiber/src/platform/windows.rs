//! Windows backend, implemented on top of the Win32 Fiber API.
//!
//! `ConvertThreadToFiber` gives each OS thread a "native" fiber handle so it can participate in
//! `SwitchToFiber` calls; every created fiber remembers the handle that resumed it (`resumer`) so
//! yielding is a matched `SwitchToFiber` back, mirroring the unix `swapcontext` pair.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;

use windows_sys::Win32::System::Threading::{
    ConvertThreadToFiber, CreateFiber, SwitchToFiber,
};

/// Opaque handle to a fiber's context-and-stack allocation.
pub type PlatformId = usize;

struct FiberData {
    win_handle: *mut c_void,
    resumer: *mut c_void,
    thunk: Option<Box<dyn FnOnce()>>,
}

thread_local! {
    static CURRENT_ID: Cell<Option<PlatformId>> = Cell::new(None);
    static NATIVE_HANDLE: Cell<*mut c_void> = Cell::new(ptr::null_mut());
}

pub fn init_thread() {
    NATIVE_HANDLE.with(|cell| {
        if cell.get().is_null() {
            let handle = unsafe { ConvertThreadToFiber(ptr::null()) };
            assert!(!handle.is_null(), "ConvertThreadToFiber failed");
            cell.set(handle);
        }
    });
}

pub fn current_id() -> PlatformId {
    CURRENT_ID.with(Cell::get).expect("fiber::current() called with no active fiber")
}

pub fn create(stack_size: usize, thunk: Box<dyn FnOnce()>) -> PlatformId {
    let data = Box::new(FiberData {
        win_handle: ptr::null_mut(),
        resumer: ptr::null_mut(),
        thunk: Some(thunk),
    });

    let raw = Box::into_raw(data) as usize;

    let win_handle = unsafe {
        CreateFiber(stack_size, Some(trampoline), raw as *const c_void)
    };
    assert!(!win_handle.is_null(), "CreateFiber failed");

    unsafe {
        (*(raw as *mut FiberData)).win_handle = win_handle;
    }

    raw
}

pub fn resume(id: PlatformId) {
    init_thread();

    let caller_handle = NATIVE_HANDLE.with(Cell::get);
    let prev_id = CURRENT_ID.with(Cell::get);

    let target_handle = unsafe {
        let data = &mut *(id as *mut FiberData);
        data.resumer = caller_handle;
        data.win_handle
    };

    CURRENT_ID.with(|cell| cell.set(Some(id)));
    NATIVE_HANDLE.with(|cell| cell.set(target_handle));

    unsafe {
        SwitchToFiber(target_handle);
    }

    // Control returns here once some fiber switches back to `caller_handle`.
    NATIVE_HANDLE.with(|cell| cell.set(caller_handle));
    CURRENT_ID.with(|cell| cell.set(prev_id));
}

pub fn yield_now() {
    let id = current_id();
    let resumer = unsafe { (*(id as *const FiberData)).resumer };
    unsafe {
        SwitchToFiber(resumer);
    }
}

unsafe extern "system" fn trampoline(param: *mut c_void) {
    let raw = param as usize;
    let thunk = {
        let data = &mut *(raw as *mut FiberData);
        data.thunk.take().expect("fiber trampoline invoked twice")
    };

    thunk();

    // The thunk has already recorded `Term`/`Except` state; this fiber will never be resumed
    // again, so park by switching back to whoever resumed us, forever.
    loop {
        let resumer = (*(raw as *const FiberData)).resumer;
        SwitchToFiber(resumer);
    }
}
