use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weave::error::WeaveError;
use weave::parallel::parallel_do;
use weave::pipe::pipe_stream;
use weave::scheduler::{Scheduler, Thunk};

#[test]
fn every_scheduled_thunk_runs_exactly_once() {
    let scheduler = Scheduler::new(3, true, 8);
    scheduler.start();
    let counts = Arc::new(Mutex::new(vec![0u32; 200]));
    for i in 0..200usize {
        let counts = counts.clone();
        let scheduler_ref = scheduler.clone();
        let last = i == 199;
        scheduler.schedule(Box::new(move || {
            counts.lock().unwrap()[i] += 1;
            if last {
                scheduler_ref.stop();
            }
        }));
    }
    scheduler.dispatch();
    assert!(counts.lock().unwrap().iter().all(|&c| c == 1));
}

#[test]
fn pipe_preserves_byte_order_across_many_small_writes() {
    let scheduler = Scheduler::new(1, true, 4);
    scheduler.start();
    let (a, b) = pipe_stream(16);
    let scheduler_ref = scheduler.clone();

    scheduler.schedule(Box::new(move || {
        for chunk in b"the quick brown fox jumps over the lazy dog".chunks(3) {
            let mut written = 0;
            while written < chunk.len() {
                written += a.write(&chunk[written..]).unwrap();
            }
        }
        drop(a);
    }));

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    scheduler.schedule(Box::new(move || {
        let mut buf = [0u8; 5];
        loop {
            let n = b.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received_clone.lock().unwrap().extend_from_slice(&buf[..n]);
        }
        scheduler_ref.stop();
    }));

    scheduler.dispatch();
    assert_eq!(received.lock().unwrap().as_slice(), b"the quick brown fox jumps over the lazy dog".as_slice());
}

#[test]
fn parallel_do_observes_the_first_panic() {
    let scheduler = Scheduler::new(2, false, 4);
    scheduler.start();
    let scheduler_ref = scheduler.clone();

    scheduler.schedule(Box::new(move || {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let thunks: Vec<Thunk> = vec![
                Box::new(|| {}),
                Box::new(|| panic!("deliberate failure")),
                Box::new(|| {}),
            ];
            parallel_do(thunks, Some(3));
        }));
        assert!(result.is_err());
        scheduler_ref.stop();
    }));

    scheduler.stop();
}

#[test]
fn stop_is_idempotent() {
    let scheduler = Scheduler::new(2, false, 4);
    scheduler.start();
    scheduler.stop();
    scheduler.stop();
    scheduler.stop();
}

#[test]
fn start_is_idempotent() {
    let scheduler = Scheduler::new(1, false, 4);
    scheduler.start();
    scheduler.start();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    let scheduler_ref = scheduler.clone();
    scheduler.schedule(Box::new(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
        scheduler_ref.stop();
    }));
    std::thread::sleep(std::time::Duration::from_millis(50));
    scheduler.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
#[test]
fn cancel_event_restores_pending_event_count() {
    use weave::io::{Event, IoManager};

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let [read_fd, write_fd] = fds;

    let manager = IoManager::new(1, true, 4).expect("create io manager");
    manager.start();

    let manager_for_waiter = manager.clone();
    let manager_for_cancel = manager.clone();

    manager.scheduler.schedule(Box::new(move || {
        let result = manager_for_waiter.wait_event(read_fd, Event::Read);
        assert!(matches!(result, Err(WeaveError::OperationAborted)));
        manager_for_waiter.stop();
    }));

    manager.scheduler.schedule(Box::new(move || {
        while !manager_for_cancel.cancel_event(read_fd, Event::Read) {
            weave::scheduler::yield_now();
        }
    }));

    manager.dispatch();

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
