//! Monotonic timer wheel: an expiry-ordered set of timers with cancellation, recurring timers,
//! conditional (weak-reference-gated) timers, and rebasing on backwards clock jumps.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::config::ConfigSource;
use crate::log::{weave_log, Level};

const DEFAULT_CLOCK_JUMP_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Abstraction over "now", so tests can drive the clock without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default clock, backed by [`Instant::now`].
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

type Thunk = Box<dyn FnOnce() + Send>;

enum Guard {
    Always,
    Conditional(Weak<()>),
}

struct Entry {
    deadline: Instant,
    sequence: u64,
    period: Option<Duration>,
    thunk: Mutex<Option<Thunk>>,
    guard: Guard,
    cancelled: std::sync::atomic::AtomicBool,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.sequence).cmp(&(other.deadline, other.sequence))
    }
}

/// A handle to a registered timer, used to cancel or reschedule it.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<Entry>,
    manager: Arc<Shared>,
}

impl TimerHandle {
    /// Cancels the timer. Idempotent; a no-op if the timer already fired or was cancelled.
    pub fn cancel(&self) {
        if !self.entry.cancelled.swap(true, Ordering::SeqCst) {
            self.manager.set.lock().expect("timer lock poisoned").remove(&OrdEntry(self.entry.clone()));
        }
    }

    /// Reschedules the timer to fire `delay` from now, cancelling any pending firing.
    pub fn refresh(&self, delay: Duration) {
        let mut set = self.manager.set.lock().expect("timer lock poisoned");
        set.remove(&OrdEntry(self.entry.clone()));
        // `deadline` is behind an `Arc` shared with any in-flight firing; since `Entry` fields
        // besides the cancellation flag and thunk are logically immutable once constructed, a
        // true refresh constructs a fresh entry sharing the same cancellation semantics.
        let refreshed = Arc::new(Entry {
            deadline: self.manager.clock.now() + delay,
            sequence: self.manager.next_sequence(),
            period: self.entry.period,
            thunk: Mutex::new(self.entry.thunk.lock().expect("timer lock poisoned").take()),
            guard: match &self.entry.guard {
                Guard::Always => Guard::Always,
                Guard::Conditional(weak) => Guard::Conditional(weak.clone()),
            },
            cancelled: std::sync::atomic::AtomicBool::new(false),
        });
        let became_front = set.iter().next().is_none_or(|front| refreshed.deadline < front.0.deadline);
        set.insert(OrdEntry(refreshed));
        drop(set);
        if became_front {
            self.manager.notify_front_inserted();
        }
    }
}

struct OrdEntry(Arc<Entry>);
impl PartialEq for OrdEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for OrdEntry {}
impl PartialOrd for OrdEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

struct Shared {
    set: Mutex<BTreeSet<OrdEntry>>,
    sequence: AtomicU64,
    clock: Arc<dyn Clock>,
    last_observed_now: Mutex<Instant>,
    clock_jump_threshold: Duration,
    on_front_inserted: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Shared {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn notify_front_inserted(&self) {
        if let Some(callback) = self.on_front_inserted.lock().expect("timer lock poisoned").as_ref() {
            callback();
        }
    }
}

/// An expiry-ordered collection of timers, shared by the I/O managers to compute idle timeouts.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> TimerManager {
        TimerManager::with_clock(Arc::new(SystemClock))
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> TimerManager {
        TimerManager::with_clock_and_threshold(clock, DEFAULT_CLOCK_JUMP_THRESHOLD)
    }

    /// Reads `weave.timer.clock_jump_threshold_us` from `config`, falling back to one hour if
    /// unset, and builds a manager with the given clock.
    pub fn from_config(config: &dyn ConfigSource, clock: Arc<dyn Clock>) -> TimerManager {
        let threshold = config
            .get_int("weave.timer.clock_jump_threshold_us")
            .map(|us| Duration::from_micros(us.max(0) as u64))
            .unwrap_or(DEFAULT_CLOCK_JUMP_THRESHOLD);
        TimerManager::with_clock_and_threshold(clock, threshold)
    }

    fn with_clock_and_threshold(clock: Arc<dyn Clock>, clock_jump_threshold: Duration) -> TimerManager {
        let now = clock.now();
        TimerManager {
            shared: Arc::new(Shared {
                set: Mutex::new(BTreeSet::new()),
                sequence: AtomicU64::new(0),
                clock,
                last_observed_now: Mutex::new(now),
                clock_jump_threshold,
                on_front_inserted: Mutex::new(None),
            }),
        }
    }

    /// Installs the hook invoked whenever a newly registered timer becomes the earliest
    /// deadline in the set. I/O managers use this to tickle their idle fiber.
    pub fn on_timer_inserted_at_front(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.shared.on_front_inserted.lock().expect("timer lock poisoned") = Some(callback);
    }

    fn insert(&self, deadline: Instant, period: Option<Duration>, guard: Guard, thunk: Thunk) -> TimerHandle {
        let entry = Arc::new(Entry {
            deadline,
            sequence: self.shared.next_sequence(),
            period,
            thunk: Mutex::new(Some(thunk)),
            guard,
            cancelled: std::sync::atomic::AtomicBool::new(false),
        });

        let mut set = self.shared.set.lock().expect("timer lock poisoned");
        let became_front = set.iter().next().is_none_or(|front| entry.deadline < front.0.deadline);
        set.insert(OrdEntry(entry.clone()));
        drop(set);

        if became_front {
            self.shared.notify_front_inserted();
        }

        TimerHandle { entry, manager: self.shared.clone() }
    }

    /// Registers a one-shot or recurring timer firing `delay` from now.
    pub fn register_timer(&self, delay: Duration, thunk: Thunk, recurring: bool) -> TimerHandle {
        let deadline = self.shared.clock.now() + delay;
        let period = recurring.then_some(delay);
        self.insert(deadline, period, Guard::Always, thunk)
    }

    /// Registers a timer that only fires if `owner` is still alive when the deadline is reached.
    pub fn register_conditional_timer(&self, delay: Duration, thunk: Thunk, owner: &Arc<()>) -> TimerHandle {
        let deadline = self.shared.clock.now() + delay;
        self.insert(deadline, None, Guard::Conditional(Arc::downgrade(owner)), thunk)
    }

    /// Duration until the next timer fires, or `None` if no timers are pending.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.rebase_if_clock_jumped();
        let set = self.shared.set.lock().expect("timer lock poisoned");
        let now = self.shared.clock.now();
        set.iter().next().map(|front| front.0.deadline.saturating_duration_since(now))
    }

    /// Removes and returns the thunks for every timer whose deadline has passed, rescheduling
    /// recurring timers for their next occurrence.
    pub fn collect_expired(&self) -> Vec<Thunk> {
        self.rebase_if_clock_jumped();
        let now = self.shared.clock.now();
        let mut fired = Vec::new();
        let mut to_reinsert = Vec::new();

        {
            let mut set = self.shared.set.lock().expect("timer lock poisoned");
            while let Some(front) = set.iter().next() {
                if front.0.deadline > now {
                    break;
                }
                let entry = set.pop_first().expect("just peeked").0;

                let fire = match &entry.guard {
                    Guard::Always => true,
                    Guard::Conditional(weak) => weak.upgrade().is_some(),
                };

                if fire {
                    if let Some(thunk) = entry.thunk.lock().expect("timer lock poisoned").take() {
                        fired.push(thunk);
                    }
                } else {
                    weave_log!(Level::Debug, "timer", "dropping conditional timer, owner gone");
                }

                if let Some(period) = entry.period {
                    if !entry.cancelled.load(Ordering::SeqCst) {
                        to_reinsert.push((entry, period));
                    }
                }
            }
        }

        for (entry, period) in to_reinsert {
            let fresh = Arc::new(Entry {
                deadline: now + period,
                sequence: self.shared.next_sequence(),
                period: Some(period),
                thunk: Mutex::new(entry.thunk.lock().expect("timer lock poisoned").take()),
                guard: Guard::Always,
                cancelled: std::sync::atomic::AtomicBool::new(false),
            });
            self.shared.set.lock().expect("timer lock poisoned").insert(OrdEntry(fresh));
        }

        fired
    }

    fn rebase_if_clock_jumped(&self) {
        let now = self.shared.clock.now();
        let mut last = self.shared.last_observed_now.lock().expect("timer lock poisoned");
        if *last > now && *last - now > self.shared.clock_jump_threshold {
            let jump = *last - now;
            weave_log!(Level::Warning, "timer", "clock jumped backwards by {:?}, rebasing timers", jump);
            let mut set = self.shared.set.lock().expect("timer lock poisoned");
            let rebased: BTreeSet<OrdEntry> = std::mem::take(&mut *set)
                .into_iter()
                .map(|OrdEntry(entry)| {
                    OrdEntry(Arc::new(Entry {
                        deadline: entry.deadline.checked_sub(jump).unwrap_or(now),
                        sequence: entry.sequence,
                        period: entry.period,
                        thunk: Mutex::new(entry.thunk.lock().expect("timer lock poisoned").take()),
                        guard: match &entry.guard {
                            Guard::Always => Guard::Always,
                            Guard::Conditional(weak) => Guard::Conditional(weak.clone()),
                        },
                        cancelled: std::sync::atomic::AtomicBool::new(entry.cancelled.load(Ordering::SeqCst)),
                    }))
                })
                .collect();
            *set = rebased;
        }
        *last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigValue, StaticConfig};
    use std::sync::atomic::AtomicUsize;

    /// A settable clock so tests can force a backwards jump without sleeping for real.
    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Arc<FakeClock> {
            Arc::new(FakeClock { now: Mutex::new(Instant::now()) })
        }

        fn rewind(&self, by: Duration) {
            let mut now = self.now.lock().expect("fake clock lock poisoned");
            *now -= by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock().expect("fake clock lock poisoned")
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let manager = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        manager.register_timer(Duration::from_millis(0), Box::new(move || o1.lock().unwrap().push(1)), false);
        let o2 = order.clone();
        manager.register_timer(Duration::from_millis(0), Box::new(move || o2.lock().unwrap().push(2)), false);

        std::thread::sleep(Duration::from_millis(5));
        for thunk in manager.collect_expired() {
            thunk();
        }
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let handle = manager.register_timer(Duration::from_millis(0), Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }), false);
        handle.cancel();
        std::thread::sleep(Duration::from_millis(5));
        for thunk in manager.collect_expired() {
            thunk();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conditional_timer_drops_when_owner_gone() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let owner = Arc::new(());
        manager.register_conditional_timer(Duration::from_millis(0), Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }), &owner);
        drop(owner);
        std::thread::sleep(Duration::from_millis(5));
        for thunk in manager.collect_expired() {
            thunk();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_is_reinserted() {
        let manager = TimerManager::new();
        manager.register_timer(Duration::from_millis(0), Box::new(|| {}), true);
        std::thread::sleep(Duration::from_millis(5));
        let fired = manager.collect_expired();
        assert_eq!(fired.len(), 1);
        assert!(manager.next_timeout().is_some());
    }

    #[test]
    fn backwards_clock_jump_past_threshold_rebases_pending_timers() {
        let clock = FakeClock::new();
        let manager = TimerManager::with_clock(clock.clone());

        manager.register_timer(Duration::from_secs(30 * 60), Box::new(|| {}), false);

        // Establish `last_observed_now` at the pre-jump instant.
        assert_eq!(manager.next_timeout(), Some(Duration::from_secs(30 * 60)));

        // Jump further back than `clock_jump_threshold` (1 hour). Without rebasing, the timer's
        // unchanged absolute deadline would now be nearly 2.5 hours out by the rewound clock;
        // rebasing shifts it back by the same jump so its remaining wait is unaffected.
        clock.rewind(Duration::from_secs(2 * 60 * 60));

        assert_eq!(manager.next_timeout(), Some(Duration::from_secs(30 * 60)));
    }

    #[test]
    fn from_config_reads_clock_jump_threshold() {
        let config = StaticConfig::new();
        config.set("weave.timer.clock_jump_threshold_us", ConfigValue::Int(1_000));
        let clock = FakeClock::new();
        let manager = TimerManager::from_config(&config, clock.clone());
        assert_eq!(manager.shared.clock_jump_threshold, Duration::from_micros(1_000));

        manager.register_timer(Duration::from_secs(10), Box::new(|| {}), false);
        assert_eq!(manager.next_timeout(), Some(Duration::from_secs(10)));

        // A 2ms backwards jump is well past the 1ms-configured threshold, so even this small a
        // jump should trigger a rebase that keeps the timer's remaining wait at 10s.
        clock.rewind(Duration::from_millis(2));
        assert_eq!(manager.next_timeout(), Some(Duration::from_secs(10)));
    }
}
