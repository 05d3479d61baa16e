//! The timer service boundary and a thread-backed implementation.
//!
//! # Overview
//! [`TimerService`] is the one-shot/periodic timer primitive the timed
//! registrations race against. Callbacks fire from the service's own execution
//! context, which may run concurrently with event delivery.
//!
//! [`ThreadTimerService`] keeps every armed timer in one deadline-ordered set
//! serviced by a single named thread. Each armed slot remembers its own
//! deadline, so `stop` removes the pending expiry directly and the set only
//! ever holds live expiries.
//!
//! # Notes
//! - `stop` is best-effort: once an expiry has been taken off the pending set its
//!   callback runs even if `stop` is called concurrently.
//! - Callbacks run outside the service lock and may call back into the service.
//! - A panicking callback is logged and does not stop the service thread.

use crate::config::TimerConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::sync::{AtomicBool, Ordering, lock};
use log::{debug, error, trace, warn};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Callback fired when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle identifying one timer of a [`TimerService`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// One-shot/periodic hardware-style timer service.
pub trait TimerService: Send + Sync {
    fn create(&self, callback: TimerCallback) -> Result<TimerId, ErrorCode>;

    /// Fire once after `timeout`. Fails with `InvalidState` if already running.
    fn start_once(&self, timer: TimerId, timeout: Duration) -> Result<(), ErrorCode>;

    /// Fire every `period`. Fails with `InvalidState` if already running.
    fn start_periodic(&self, timer: TimerId, period: Duration) -> Result<(), ErrorCode>;

    /// Fails with `InvalidState` if the timer is not running.
    fn stop(&self, timer: TimerId) -> Result<(), ErrorCode>;

    /// Fails with `InvalidState` if the timer is still running.
    fn delete(&self, timer: TimerId) -> Result<(), ErrorCode>;
}

struct Armed {
    deadline: Instant,
    period: Option<Duration>,
}

struct Slot {
    callback: TimerCallback,
    armed: Option<Armed>,
}

#[derive(Default)]
struct State {
    slots: HashMap<u64, Slot>,
    pending: BTreeSet<(Instant, u64)>,
    next_id: u64,
}

impl State {
    fn arm(&mut self, timer: TimerId, after: Duration, period: Option<Duration>) -> Result<(), ErrorCode> {
        let slot = self.slots.get_mut(&timer.0).ok_or(ErrorCode::NotFound)?;
        if slot.armed.is_some() {
            return Err(ErrorCode::InvalidState);
        }
        let deadline = Instant::now()
            .checked_add(after)
            .ok_or(ErrorCode::InvalidArg)?;
        slot.armed = Some(Armed { deadline, period });
        self.pending.insert((deadline, timer.0));
        Ok(())
    }

    fn disarm(&mut self, timer: TimerId) -> Result<(), ErrorCode> {
        let slot = self.slots.get_mut(&timer.0).ok_or(ErrorCode::NotFound)?;
        let armed = slot.armed.take().ok_or(ErrorCode::InvalidState)?;
        self.pending.remove(&(armed.deadline, timer.0));
        Ok(())
    }

    /// Pop the next due expiry, re-arming periodic timers.
    fn take_due(&mut self, now: Instant) -> Option<TimerCallback> {
        let &(deadline, id) = self.pending.first()?;
        if deadline > now {
            return None;
        }
        self.pending.pop_first();

        let slot = self.slots.get_mut(&id)?;
        let next = slot
            .armed
            .as_ref()
            .and_then(|armed| armed.period)
            .map(|period| (period, deadline.checked_add(period)));
        match next {
            Some((_, Some(next))) => {
                if let Some(armed) = slot.armed.as_mut() {
                    armed.deadline = next;
                }
                self.pending.insert((next, id));
            }
            Some((period, None)) => {
                warn!("timer {}: period {:?} overflows, disarming", id, period);
                slot.armed = None;
            }
            None => slot.armed = None,
        }
        Some(Arc::clone(&slot.callback))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.first().map(|&(deadline, _)| deadline)
    }
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

/// [`TimerService`] running every callback on one dedicated thread.
pub struct ThreadTimerService {
    inner: Arc<Inner>,
    task: Option<JoinHandle<()>>,
}

impl ThreadTimerService {
    pub fn new(config: &TimerConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut builder = thread::Builder::new().name(config.task_name.clone());
        if let Some(size) = config.task_stack_size {
            builder = builder.stack_size(size);
        }
        let task_inner = Arc::clone(&inner);
        let task = builder
            .spawn(move || timer_task(task_inner))
            .map_err(|source| {
                error!("failed to start timer service '{}': {}", config.task_name, source);
                Error::Spawn {
                    task: config.task_name.clone(),
                    source,
                }
            })?;

        debug!("started timer service '{}'", config.task_name);
        Ok(Self {
            inner,
            task: Some(task),
        })
    }

    /// Number of timers created and not yet deleted.
    pub fn timer_count(&self) -> usize {
        lock(&self.inner.state).slots.len()
    }

    /// Number of armed expiries waiting to fire.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    fn arm(&self, timer: TimerId, after: Duration, period: Option<Duration>) -> Result<(), ErrorCode> {
        lock(&self.inner.state).arm(timer, after, period)?;
        self.inner.condvar.notify_one();
        Ok(())
    }
}

impl TimerService for ThreadTimerService {
    fn create(&self, callback: TimerCallback) -> Result<TimerId, ErrorCode> {
        let mut state = lock(&self.inner.state);
        let id = state.next_id;
        state.next_id += 1;
        state.slots.insert(
            id,
            Slot {
                callback,
                armed: None,
            },
        );
        Ok(TimerId(id))
    }

    fn start_once(&self, timer: TimerId, timeout: Duration) -> Result<(), ErrorCode> {
        self.arm(timer, timeout, None)
    }

    fn start_periodic(&self, timer: TimerId, period: Duration) -> Result<(), ErrorCode> {
        if period.is_zero() {
            return Err(ErrorCode::InvalidArg);
        }
        self.arm(timer, period, Some(period))
    }

    fn stop(&self, timer: TimerId) -> Result<(), ErrorCode> {
        lock(&self.inner.state).disarm(timer)
    }

    fn delete(&self, timer: TimerId) -> Result<(), ErrorCode> {
        let mut state = lock(&self.inner.state);
        match state.slots.get(&timer.0) {
            None => Err(ErrorCode::NotFound),
            Some(slot) if slot.armed.is_some() => Err(ErrorCode::InvalidState),
            Some(_) => {
                state.slots.remove(&timer.0);
                Ok(())
            }
        }
    }
}

impl Drop for ThreadTimerService {
    fn drop(&mut self) {
        {
            let _state = lock(&self.inner.state);
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.condvar.notify_all();
        }
        if let Some(task) = self.task.take() {
            if task.thread().id() != thread::current().id() {
                let _ = task.join();
            }
        }
    }
}

fn timer_task(inner: Arc<Inner>) {
    let mut state = lock(&inner.state);
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(callback) = state.take_due(Instant::now()) {
            drop(state);
            trace!("timer fired");
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!("timer callback panicked");
            }
            state = lock(&inner.state);
            continue;
        }

        state = match state.next_deadline() {
            None => inner
                .condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                inner
                    .condvar
                    .wait_timeout(state, remaining)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0)
            }
        };
    }
    debug!("timer service exiting");
}

#[cfg(test)]
mod tests {
    use super::{State, ThreadTimerService, TimerCallback, TimerId, TimerService};
    use crate::config::TimerConfig;
    use crate::error::ErrorCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn service() -> ThreadTimerService {
        ThreadTimerService::new(&TimerConfig::default()).unwrap()
    }

    fn counting(count: &Arc<AtomicUsize>) -> TimerCallback {
        let count = Arc::clone(count);
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn one_shot_fires_once() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timers.create(counting(&count)).unwrap();

        timers.start_once(timer, Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.stop(timer), Err(ErrorCode::InvalidState));
        assert_eq!(timers.delete(timer), Ok(()));
        assert_eq!(timers.timer_count(), 0);
    }

    #[test]
    fn stopped_timer_does_not_fire() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timers.create(counting(&count)).unwrap();

        timers.start_once(timer, Duration::from_millis(50)).unwrap();
        timers.stop(timer).unwrap();
        thread::sleep(Duration::from_millis(120));

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_replaces_previous_arming() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timers.create(counting(&count)).unwrap();

        timers.start_once(timer, Duration::from_millis(20)).unwrap();
        timers.stop(timer).unwrap();
        timers.start_once(timer, Duration::from_millis(40)).unwrap();
        thread::sleep(Duration::from_millis(150));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_fires_until_stopped() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timers.create(counting(&count)).unwrap();

        timers.start_periodic(timer, Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(105));
        timers.stop(timer).unwrap();
        let fired = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));

        // An expiry already taken off the pending set may still land once.
        assert!(fired >= 3, "fired {fired} times");
        assert!(count.load(Ordering::SeqCst) <= fired + 1);
    }

    #[test]
    fn lifecycle_errors() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timers.create(counting(&count)).unwrap();

        assert_eq!(timers.stop(timer), Err(ErrorCode::InvalidState));
        timers.start_once(timer, Duration::from_secs(10)).unwrap();
        assert_eq!(
            timers.start_once(timer, Duration::from_secs(10)),
            Err(ErrorCode::InvalidState)
        );
        assert_eq!(timers.delete(timer), Err(ErrorCode::InvalidState));
        assert_eq!(
            timers.start_periodic(timer, Duration::ZERO),
            Err(ErrorCode::InvalidArg)
        );
        timers.stop(timer).unwrap();
        timers.delete(timer).unwrap();
        assert_eq!(timers.delete(timer), Err(ErrorCode::NotFound));
    }

    #[test]
    fn stop_and_delete_leave_nothing_pending() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let timer = timers.create(counting(&count)).unwrap();
            timers.start_once(timer, Duration::from_secs(3600)).unwrap();
            timers.stop(timer).unwrap();
            timers.delete(timer).unwrap();
        }

        assert_eq!(timers.pending_count(), 0);
        assert_eq!(timers.timer_count(), 0);
    }

    #[test]
    fn restarting_keeps_one_pending_expiry() {
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timers.create(counting(&count)).unwrap();

        for _ in 0..10 {
            timers.start_periodic(timer, Duration::from_secs(3600)).unwrap();
            timers.stop(timer).unwrap();
        }
        timers.start_once(timer, Duration::from_secs(3600)).unwrap();

        assert_eq!(timers.pending_count(), 1);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_service() {
        let _ = env_logger::builder().is_test(true).try_init();
        let timers = service();
        let count = Arc::new(AtomicUsize::new(0));

        let bad = timers.create(Arc::new(|| panic!("timer callback failure"))).unwrap();
        let good = timers.create(counting(&count)).unwrap();
        timers.start_once(bad, Duration::from_millis(1)).unwrap();
        timers.start_once(good, Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(150));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending_count(), 0);
    }

    #[test]
    fn periodic_overflow_disarms() {
        let now = Instant::now();
        let mut period = Duration::from_secs(u64::MAX >> 1);
        while now.checked_add(period).is_none() {
            period /= 2;
        }

        let count = Arc::new(AtomicUsize::new(0));
        let mut state = State::default();
        state.slots.insert(
            0,
            super::Slot {
                callback: counting(&count),
                armed: None,
            },
        );
        state.arm(TimerId(0), period, Some(period)).unwrap();
        let (deadline, _) = *state.pending.first().unwrap();

        // The next deadline would be at least `now + 2 * period`, which overflows.
        let callback = state.take_due(deadline).unwrap();
        callback();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(state.pending.is_empty());
        assert!(state.slots[&0].armed.is_none());
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn unsatisfiable_stack_reports_spawn_failure() {
        let config = TimerConfig {
            task_stack_size: Some(usize::MAX / 2),
            ..TimerConfig::default()
        };
        let err = ThreadTimerService::new(&config).err();
        assert!(matches!(
            err,
            Some(crate::error::Error::Spawn { ref task, .. }) if task == "timer_svc"
        ));
    }
}
