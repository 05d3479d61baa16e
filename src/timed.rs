//! Event-or-timeout registrations.
//!
//! # Overview
//! A [`TimedRegistration`] races an event registration against a one-shot
//! timer. Whichever side claims the registration first runs its callback; the
//! other side becomes a no-op. A registration settles at most once.
//!
//! # Settling
//! The race is decided by a single compare-and-swap on the settle state
//! (`ARMED -> EVENT|RUNNING` or `ARMED -> TIMEOUT|RUNNING`). Neither callback
//! path ever blocks on the other. The `RUNNING` bit stays set until the winning
//! path has finished, including the timeout path's unregistration of the event
//! side, so a late event cannot slip through after a timeout.
//!
//! Dropping the registration retires it (`ARMED -> RETIRED`) or, if a callback
//! is in flight on another thread, waits for that callback to finish before
//! tearing down the timer and the event registration.
//!
//! # Timer cancellation
//! Stopping the timer from the event path is best-effort. An expiry that was
//! already dispatched simply loses the CAS. [`MIN_TIMEOUT`] keeps timeouts above
//! the window in which the timer service cannot cancel reliably.

use crate::channel::{Dispatch, EventChannel};
use crate::error::{Error, ErrorCode, Result};
use crate::event::{EventData, EventKey};
use crate::registration::{EventCallback, Registration};
use crate::sync::{AtomicU8, Ordering, lock};
use crate::timer::{TimerId, TimerService};
use log::{debug, trace, warn};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Smallest timeout a [`TimedRegistration`] accepts.
pub const MIN_TIMEOUT: Duration = Duration::from_micros(20);

/// User callback for the timeout path.
pub type TimeoutCallback = Arc<dyn Fn(EventKey) + Send + Sync>;

/// Which side of the race settled a [`TimedRegistration`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Event,
    Timeout,
}

const ARMED: u8 = 0;
const EVENT: u8 = 1;
const TIMEOUT: u8 = 2;
const RETIRED: u8 = 3;
const RUNNING: u8 = 0x80;

struct Settle {
    state: AtomicU8,
    owner: Mutex<Option<ThreadId>>,
    done: Condvar,
}

struct SettleGuard<'a> {
    settle: &'a Settle,
}

impl Settle {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ARMED),
            owner: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// First caller wins; everyone else gets `None` without blocking.
    fn claim(&self, outcome: u8) -> Option<SettleGuard<'_>> {
        self.state
            .compare_exchange(ARMED, outcome | RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *lock(&self.owner) = Some(thread::current().id());
        Some(SettleGuard { settle: self })
    }

    /// Stop further claims and wait out a callback running on another thread.
    fn retire(&self) {
        if self
            .state
            .compare_exchange(ARMED, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }

        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        while self.state.load(Ordering::Acquire) & RUNNING != 0 {
            if *owner == Some(me) {
                return;
            }
            owner = self.done.wait(owner).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn outcome(&self) -> Option<Outcome> {
        match self.state.load(Ordering::Acquire) & !RUNNING {
            EVENT => Some(Outcome::Event),
            TIMEOUT => Some(Outcome::Timeout),
            _ => None,
        }
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        let mut owner = lock(&self.settle.owner);
        *owner = None;
        self.settle.state.fetch_and(!RUNNING, Ordering::AcqRel);
        self.settle.done.notify_all();
    }
}

struct Shared {
    key: EventKey,
    settle: Settle,
    on_event: EventCallback,
    on_timeout: TimeoutCallback,
    timers: Arc<dyn TimerService>,
    timer: OnceLock<TimerId>,
    event: OnceLock<Registration>,
}

impl Shared {
    fn event_arrived(&self, key: EventKey, data: Option<&EventData>) {
        let Some(_settled) = self.settle.claim(EVENT) else {
            trace!("{}: late event ignored", self.key);
            return;
        };
        if let Some(timer) = self.timer.get() {
            // InvalidState: the expiry is already in flight and will lose the claim.
            match self.timers.stop(*timer) {
                Ok(()) | Err(ErrorCode::InvalidState) => {}
                Err(code) => warn!("{}: failed to stop timer: {}", self.key, code),
            }
        }
        (self.on_event)(key, data);
    }

    fn timed_out(&self) {
        let Some(_settled) = self.settle.claim(TIMEOUT) else {
            trace!("{}: late timeout ignored", self.key);
            return;
        };
        (self.on_timeout)(self.key);
        self.release_event();
    }

    fn release_event(&self) {
        if let Some(event) = self.event.get() {
            event.release();
        }
    }

    fn teardown_timer(&self) {
        let Some(timer) = self.timer.get() else {
            return;
        };
        match self.timers.stop(*timer) {
            Ok(()) | Err(ErrorCode::InvalidState) => {}
            Err(code) => warn!("{}: failed to stop timer: {}", self.key, code),
        }
        if let Err(code) = self.timers.delete(*timer) {
            warn!("{}: failed to delete timer: {}", self.key, code);
        }
    }
}

struct EventArm(Weak<Shared>);

impl Dispatch for EventArm {
    fn dispatch(&self, key: EventKey, data: Option<&EventData>) {
        if let Some(shared) = self.0.upgrade() {
            shared.event_arrived(key, data);
        }
    }
}

/// A [`Registration`] racing against a timeout. Single use.
pub struct TimedRegistration {
    shared: Arc<Shared>,
}

impl TimedRegistration {
    /// Register `on_event` for `key` and start a one-shot timer of `timeout`
    /// that calls `on_timeout` if no event arrives first.
    ///
    /// Fails with [`Error::InvalidArgument`] if `timeout` is below
    /// [`MIN_TIMEOUT`], before touching the channel or the timer service. If a
    /// later step fails, everything already set up is torn down before the
    /// error is returned.
    pub fn new<F, T>(
        key: EventKey,
        on_event: F,
        timeout: Duration,
        on_timeout: T,
        channel: Arc<dyn EventChannel>,
        timers: Arc<dyn TimerService>,
    ) -> Result<Self>
    where
        F: Fn(EventKey, Option<&EventData>) + Send + Sync + 'static,
        T: Fn(EventKey) + Send + Sync + 'static,
    {
        if timeout < MIN_TIMEOUT {
            return Err(Error::InvalidArgument("timeout is below MIN_TIMEOUT"));
        }

        let shared = Arc::new(Shared {
            key,
            settle: Settle::new(),
            on_event: Arc::new(on_event),
            on_timeout: Arc::new(on_timeout),
            timers,
            timer: OnceLock::new(),
            event: OnceLock::new(),
        });

        let arm = Arc::new(EventArm(Arc::downgrade(&shared)));
        let registration = Registration::with_dispatch(key, arm, channel)?;
        let _ = shared.event.set(registration);

        let weak = Arc::downgrade(&shared);
        let created = shared.timers.create(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.timed_out();
            }
        }));
        let timer = match created {
            Ok(timer) => timer,
            Err(code) => {
                shared.release_event();
                return Err(Error::RegistrationFailed { key, code });
            }
        };
        let _ = shared.timer.set(timer);

        if let Err(code) = shared.timers.start_once(timer, timeout) {
            if let Err(code) = shared.timers.delete(timer) {
                warn!("{}: failed to delete unstarted timer: {}", key, code);
            }
            shared.release_event();
            return Err(Error::RegistrationFailed { key, code });
        }

        debug!("{}: armed with {:?} timeout", key, timeout);
        Ok(Self { shared })
    }

    pub fn key(&self) -> EventKey {
        self.shared.key
    }

    /// `None` while armed (or if dropped unsettled), otherwise the winning side.
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.settle.outcome()
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }
}

impl Drop for TimedRegistration {
    fn drop(&mut self) {
        self.shared.settle.retire();
        self.shared.teardown_timer();
        self.shared.release_event();
    }
}

impl fmt::Debug for TimedRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedRegistration")
            .field("key", &self.shared.key)
            .field("outcome", &self.outcome())
            .finish()
    }
}
