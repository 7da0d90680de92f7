use fiber::{Fiber, State};

#[test]
fn basic_usage() {
    let fiber = Fiber::new(64 * 1024, |yielder| {
        yielder.suspend();
    });

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Hold);

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn runs_to_completion_without_suspending() {
    let fiber = Fiber::new(64 * 1024, |_yielder| {});
    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn yields_multiple_times() {
    let fiber = Fiber::new(64 * 1024, |yielder| {
        for _ in 0..3 {
            yielder.suspend();
        }
    });

    let mut fiber = unsafe { fiber.call() };
    for _ in 0..3 {
        assert_eq!(fiber.state(), State::Hold);
        fiber = unsafe { fiber.call() };
    }
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn captures_panics_as_except() {
    let fiber = Fiber::new(64 * 1024, |_yielder| {
        panic!("boom");
    });

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Except);
    assert!(fiber.take_panic().is_some());
}

#[test]
fn injected_cancellation_unwinds_at_next_resume() {
    let fiber = Fiber::new(64 * 1024, |yielder| {
        yielder.suspend();
        panic!("should never reach here, injection should unwind first");
    });

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Hold);
    assert!(fiber.inject(Box::new("cancelled")));

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Except);
}

#[test]
fn cancel_is_a_no_op_on_a_finished_fiber() {
    let fiber = Fiber::new(64 * 1024, |_yielder| {});
    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Term);
    let fiber = fiber.cancel();
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn reset_on_a_suspended_fiber_injects_and_rebinds() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let fiber = Fiber::new(64 * 1024, |yielder| {
        yielder.suspend();
        panic!("should never reach here, reset should cancel first");
    });

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Hold);

    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = ran.clone();
    let fiber = fiber.reset(64 * 1024, move |_yielder| {
        ran_clone.store(true, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), State::Init);

    let fiber = unsafe { fiber.call() };
    assert_eq!(fiber.state(), State::Term);
    assert!(ran.load(Ordering::SeqCst));
}
