//! Blocking-wait adapter over callback delivery.
//!
//! # Overview
//! A [`SyncEventHandler`] listens to a set of keys and funnels every delivered
//! event into one bounded queue. Application threads pull results with
//! [`SyncEventHandler::wait_event`] or [`SyncEventHandler::wait_event_for`].
//!
//! # Back-pressure
//! Callbacks never block on the queue. When it is full the event is dropped
//! and [`SyncEventHandler::get_send_queue_errors`] goes up by one.

use crate::error::{Error, Result};
use crate::event::{EventData, EventKey};
use crate::event_loop::EventLoop;
use crate::registration::Registration;
use crate::sync::{AtomicUsize, Ordering, lock};
use crate::ticks::Ticks;
use crossbeam_channel::{Receiver, Sender, bounded};
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One delivered event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventResult {
    pub key: EventKey,
    pub data: Option<EventData>,
}

/// Result of a bounded wait. `event` is `None` exactly when `timeout` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventResultTimed {
    pub event: Option<EventResult>,
    pub timeout: bool,
}

/// Queue-backed adapter turning event callbacks into blocking waits.
pub struct SyncEventHandler {
    event_loop: EventLoop,
    registrations: Mutex<HashMap<EventKey, Registration>>,
    queue_tx: Sender<EventResult>,
    queue_rx: Receiver<EventResult>,
    send_errors: Arc<AtomicUsize>,
}

impl SyncEventHandler {
    /// Create a handler whose queue holds at most `queue_size` undelivered results.
    pub fn new(event_loop: &EventLoop, queue_size: usize) -> Result<Self> {
        if queue_size == 0 {
            return Err(Error::InvalidArgument("event queue size must be non-zero"));
        }
        let (queue_tx, queue_rx) = bounded(queue_size);
        Ok(Self {
            event_loop: event_loop.clone(),
            registrations: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx,
            send_errors: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Queue every event matching `key`.
    ///
    /// Listening to a key that is already listened to replaces the previous
    /// registration: the old one is unregistered before the new one is
    /// installed, so one post never yields two results. If registering fails
    /// the key is left unlistened.
    pub fn listen_to(&self, key: EventKey) -> Result<()> {
        let queue_tx = self.queue_tx.clone();
        let send_errors = Arc::clone(&self.send_errors);

        let mut registrations = lock(&self.registrations);
        drop(registrations.remove(&key));
        let registration = self.event_loop.register_event(
            key,
            move |key: EventKey, data: Option<&EventData>| {
                let result = EventResult {
                    key,
                    data: data.cloned(),
                };
                if queue_tx.try_send(result).is_err() {
                    send_errors.fetch_add(1, Ordering::Relaxed);
                    trace!("{}: result queue full, event dropped", key);
                }
            },
        )?;
        registrations.insert(key, registration);
        Ok(())
    }

    /// Stop listening to `key`. Returns whether it was listened to.
    pub fn stop_listening(&self, key: EventKey) -> bool {
        let removed = lock(&self.registrations).remove(&key);
        removed.is_some()
    }

    pub fn is_listening(&self, key: EventKey) -> bool {
        lock(&self.registrations).contains_key(&key)
    }

    /// Block until an event is queued and return it.
    pub fn wait_event(&self) -> EventResult {
        loop {
            if let Some(result) = self.receive(Ticks::MAX_DELAY) {
                return result;
            }
        }
    }

    /// Block for at most `timeout` (rounded down to whole ticks).
    pub fn wait_event_for(&self, timeout: Duration) -> EventResultTimed {
        let event = self.receive(Ticks::from_duration(timeout));
        EventResultTimed {
            timeout: event.is_none(),
            event,
        }
    }

    /// Events dropped because the queue was full.
    pub fn get_send_queue_errors(&self) -> usize {
        self.send_errors.load(Ordering::Relaxed)
    }

    fn receive(&self, wait: Ticks) -> Option<EventResult> {
        match wait.to_duration() {
            None => self.queue_rx.recv().ok(),
            Some(wait) if wait.is_zero() => self.queue_rx.try_recv().ok(),
            Some(wait) => self.queue_rx.recv_timeout(wait).ok(),
        }
    }
}

impl Drop for SyncEventHandler {
    fn drop(&mut self) {
        // Unregister before the queue goes away.
        lock(&self.registrations).clear();
    }
}
