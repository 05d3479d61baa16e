//! In-process [`EventChannel`] backed by a bounded post queue.
//!
//! # Overview
//! - Posts are copied into a bounded queue of `queue_size` events.
//! - Delivery runs either on a dedicated named thread or, for task-less
//!   channels, on whichever thread calls [`LocalChannel::run`].
//! - For one posted event, exact-key handlers run first, then base wildcards,
//!   then loop wildcards; within a level, in registration order.
//!
//! # Unregistration
//! Each handler entry carries a gate that is held while the handler runs.
//! `unregister` removes the entry, marks it dead and then passes through the
//! gate, so once it returns the handler is neither running on another thread
//! nor able to start again. A handler unregistering itself skips the gate.
//!
//! A panicking handler is logged and skipped; delivery carries on with the
//! next handler and the next event.

use crate::channel::{Dispatch, EventChannel, HandlerId};
use crate::config::ChannelConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::event::{ANY_ID, EventData, EventKey};
use crate::sync::{AtomicBool, AtomicU64, Ordering, lock};
use crate::ticks::Ticks;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded, select};
use log::{debug, error, trace};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

static NEXT_HANDLER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DISPATCHING: Cell<Option<HandlerId>> = const { Cell::new(None) };
}

struct Posted {
    key: EventKey,
    data: Option<EventData>,
}

struct HandlerEntry {
    id: HandlerId,
    key: EventKey,
    handler: Arc<dyn Dispatch>,
    live: AtomicBool,
    gate: Mutex<()>,
    invoked: AtomicU64,
}

impl HandlerEntry {
    fn invoke(&self, key: EventKey, data: Option<&EventData>) {
        let _gate = lock(&self.gate);
        if !self.live.load(Ordering::Acquire) {
            return;
        }
        self.invoked.fetch_add(1, Ordering::Relaxed);
        let previous = DISPATCHING.with(|d| d.replace(Some(self.id)));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.dispatch(key, data)));
        DISPATCHING.with(|d| d.set(previous));
        if outcome.is_err() {
            error!("handler {} panicked while handling {}", self.id.0, key);
        }
    }
}

struct Shared {
    queue_tx: Sender<Posted>,
    queue_rx: Receiver<Posted>,
    handlers: Mutex<Vec<Arc<HandlerEntry>>>,
    running: AtomicBool,
}

impl Shared {
    fn deliver(&self, posted: Posted) {
        let mut matching: Vec<Arc<HandlerEntry>> = lock(&self.handlers)
            .iter()
            .filter(|entry| entry.key.matches(&posted.key))
            .cloned()
            .collect();
        matching.sort_by_key(|entry| entry.key.specificity());

        trace!("delivering {} to {} handler(s)", posted.key, matching.len());
        for entry in matching {
            entry.invoke(posted.key, posted.data.as_ref());
        }
    }
}

/// Bounded, in-process event channel.
pub struct LocalChannel {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LocalChannel {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        if config.queue_size == 0 {
            return Err(Error::InvalidArgument("channel queue size must be non-zero"));
        }

        let (queue_tx, queue_rx) = bounded(config.queue_size);
        let shared = Arc::new(Shared {
            queue_tx,
            queue_rx,
            handlers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        });

        let Some(name) = config.task_name.clone() else {
            debug!("created task-less channel (queue {})", config.queue_size);
            return Ok(Self {
                shared,
                stop_tx: None,
                task: None,
            });
        };

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = config.task_stack_size {
            builder = builder.stack_size(size);
        }
        let task_shared = Arc::clone(&shared);
        let task = builder
            .spawn(move || delivery_task(task_shared, stop_rx))
            .map_err(|source| {
                error!("failed to start delivery task '{}': {}", name, source);
                Error::Spawn {
                    task: name.clone(),
                    source,
                }
            })?;

        debug!("created channel '{}' (queue {})", name, config.queue_size);
        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Deliver posted events on the calling thread for `ticks`.
    ///
    /// [`Ticks::ZERO`] delivers whatever is already queued and returns. Only
    /// valid on channels created without a delivery thread, and only one
    /// `run` may be active at a time.
    pub fn run(&self, ticks: Ticks) -> Result<(), ErrorCode> {
        if self.task.is_some() {
            return Err(ErrorCode::InvalidState);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(ErrorCode::InvalidState);
        }

        let deadline = ticks.to_duration().map(|d| Instant::now() + d);
        loop {
            let next = match deadline {
                None => self.shared.queue_rx.recv().ok(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.shared.queue_rx.try_recv().ok()
                    } else {
                        self.shared.queue_rx.recv_timeout(remaining).ok()
                    }
                }
            };
            match next {
                Some(posted) => self.shared.deliver(posted),
                None => break,
            }
        }

        self.shared.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Events queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.queue_rx.len()
    }

    /// Live handler registrations.
    pub fn handler_count(&self) -> usize {
        lock(&self.shared.handlers).len()
    }

    /// Write one line per registered handler, in registration order:
    /// handle, key and how many times it has been invoked.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let handlers = lock(&self.shared.handlers);
        writeln!(
            out,
            "channel: {} pending, {} handler(s), {}",
            self.pending(),
            handlers.len(),
            if self.task.is_some() { "dedicated task" } else { "task-less" },
        )?;
        for entry in handlers.iter() {
            writeln!(
                out,
                "  handler {} {} invoked {}",
                entry.id.0,
                entry.key,
                entry.invoked.load(Ordering::Relaxed)
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalChannel")
            .field("pending", &self.pending())
            .field("handlers", &self.handler_count())
            .field("task", &self.task.is_some())
            .finish()
    }
}

impl EventChannel for LocalChannel {
    fn register(&self, key: EventKey, handler: Arc<dyn Dispatch>) -> Result<HandlerId, ErrorCode> {
        if key.base.is_any() && key.id != ANY_ID {
            return Err(ErrorCode::InvalidArg);
        }

        let id = HandlerId(NEXT_HANDLER.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.handlers).push(Arc::new(HandlerEntry {
            id,
            key,
            handler,
            live: AtomicBool::new(true),
            gate: Mutex::new(()),
            invoked: AtomicU64::new(0),
        }));
        debug!("registered handler {} for {}", id.0, key);
        Ok(id)
    }

    fn unregister(&self, key: EventKey, handle: HandlerId) -> Result<(), ErrorCode> {
        let entry = {
            let mut handlers = lock(&self.shared.handlers);
            let pos = handlers
                .iter()
                .position(|entry| entry.id == handle && entry.key == key)
                .ok_or(ErrorCode::NotFound)?;
            handlers.remove(pos)
        };

        entry.live.store(false, Ordering::Release);
        let own_callback = DISPATCHING.with(|d| d.get() == Some(handle));
        if !own_callback {
            drop(lock(&entry.gate));
        }
        debug!("unregistered handler {} for {}", handle.0, key);
        Ok(())
    }

    fn post(&self, key: EventKey, data: Option<&[u8]>, wait: Ticks) -> Result<(), ErrorCode> {
        if key.is_wildcard() {
            return Err(ErrorCode::InvalidArg);
        }

        let posted = Posted {
            key,
            data: data.map(EventData::copy_from),
        };
        let tx = &self.shared.queue_tx;
        match wait.to_duration() {
            None => tx.send(posted).map_err(|_| ErrorCode::Fail),
            Some(wait) if wait.is_zero() => tx.try_send(posted).map_err(|e| match e {
                TrySendError::Full(_) => ErrorCode::Timeout,
                TrySendError::Disconnected(_) => ErrorCode::Fail,
            }),
            Some(wait) => tx.send_timeout(posted, wait).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ErrorCode::Timeout,
                SendTimeoutError::Disconnected(_) => ErrorCode::Fail,
            }),
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        // Disconnecting the stop channel wakes the delivery thread.
        self.stop_tx.take();
        if let Some(task) = self.task.take() {
            if task.thread().id() != thread::current().id() {
                let _ = task.join();
            }
        }
    }
}

fn delivery_task(shared: Arc<Shared>, stop_rx: Receiver<()>) {
    loop {
        select! {
            recv(shared.queue_rx) -> posted => match posted {
                Ok(posted) => shared.deliver(posted),
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
        }
    }
    debug!("delivery task exiting");
}

#[cfg(test)]
mod tests {
    use super::LocalChannel;
    use crate::channel::{Dispatch, EventChannel, HandlerId};
    use crate::config::ChannelConfig;
    use crate::error::{Error, ErrorCode};
    use crate::event::{ANY_ID, EventBase, EventData, EventKey};
    use crate::ticks::Ticks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const BASE1: EventBase = EventBase::new("TEST_BASE1");
    const BASE2: EventBase = EventBase::new("TEST_BASE2");
    const EV1: i32 = 0;
    const EV2: i32 = 1;

    fn taskless(queue_size: usize) -> LocalChannel {
        LocalChannel::new(&ChannelConfig::without_task(queue_size)).unwrap()
    }

    fn counter(count: &Arc<AtomicUsize>) -> Arc<dyn Dispatch> {
        let count = Arc::clone(count);
        Arc::new(move |_: EventKey, _: Option<&EventData>| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn Dispatch> {
        let log = Arc::clone(log);
        Arc::new(move |_: EventKey, _: Option<&EventData>| log.lock().unwrap().push(tag))
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let err = LocalChannel::new(&ChannelConfig::without_task(0)).err();
        assert!(matches!(err, Some(Error::InvalidArgument(_))));
    }

    #[test]
    fn can_post_up_to_queue_size() {
        let channel = taskless(2);
        let key = EventKey::new(BASE1, EV1);
        assert_eq!(channel.post(key, None, Ticks::from_millis(10)), Ok(()));
        assert_eq!(channel.post(key, None, Ticks::from_millis(10)), Ok(()));
        assert_eq!(channel.pending(), 2);
    }

    #[test]
    fn posting_to_full_channel_times_out() {
        let channel = taskless(1);
        let key = EventKey::new(BASE1, EV1);
        assert_eq!(channel.post(key, None, Ticks::ZERO), Ok(()));
        assert_eq!(channel.post(key, None, Ticks::ZERO), Err(ErrorCode::Timeout));
        assert_eq!(
            channel.post(key, None, Ticks::from_millis(10)),
            Err(ErrorCode::Timeout)
        );
    }

    #[test]
    fn can_run_without_registrations() {
        let channel = taskless(4);
        channel
            .post(EventKey::new(BASE1, EV1), None, Ticks::from_millis(10))
            .unwrap();
        assert_eq!(channel.run(Ticks::ZERO), Ok(()));
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn posting_wildcards_fails() {
        let channel = taskless(4);
        let count = Arc::new(AtomicUsize::new(0));
        channel.register(EventKey::ANY, counter(&count)).unwrap();

        for key in [
            EventKey::ANY,
            EventKey::any_of(BASE1),
            EventKey::new(EventBase::ANY, EV1),
        ] {
            assert_eq!(channel.post(key, None, Ticks::MAX_DELAY), Err(ErrorCode::InvalidArg));
        }
        channel.run(Ticks::ZERO).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn any_base_with_specific_id_cannot_register() {
        let channel = taskless(4);
        let count = Arc::new(AtomicUsize::new(0));
        let err = channel.register(EventKey::new(EventBase::ANY, EV1), counter(&count));
        assert_eq!(err, Err(ErrorCode::InvalidArg));
        assert_eq!(channel.handler_count(), 0);
    }

    #[test]
    fn handlers_run_by_level_then_registration_order() {
        let channel = taskless(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.register(EventKey::ANY, recorder(&log, "loop")).unwrap();
        channel.register(EventKey::any_of(BASE1), recorder(&log, "base")).unwrap();
        channel.register(EventKey::new(BASE1, EV1), recorder(&log, "id-1")).unwrap();
        channel.register(EventKey::new(BASE1, EV1), recorder(&log, "id-2")).unwrap();
        channel.register(EventKey::new(BASE2, EV1), recorder(&log, "other")).unwrap();

        channel.post(EventKey::new(BASE1, EV1), None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();

        assert_eq!(&log.lock().unwrap()[..], &["id-1", "id-2", "base", "loop"]);
    }

    #[test]
    fn any_id_not_called_for_other_base() {
        let channel = taskless(4);
        let count = Arc::new(AtomicUsize::new(0));
        channel
            .register(EventKey::new(BASE1, ANY_ID), counter(&count))
            .unwrap();
        channel.post(EventKey::new(BASE2, EV1), None, Ticks::ZERO).unwrap();
        channel.post(EventKey::new(BASE1, EV2), None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_handler_is_not_executed() {
        let channel = taskless(4);
        let key = EventKey::new(BASE1, EV1);
        let count = Arc::new(AtomicUsize::new(0));
        let id = channel.register(key, counter(&count)).unwrap();

        channel.post(key, None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();
        channel.unregister(key, id).unwrap();
        channel.post(key, None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(channel.unregister(key, id), Err(ErrorCode::NotFound));
    }

    #[test]
    fn handler_can_unregister_itself() {
        let channel = Arc::new(taskless(4));
        let key = EventKey::new(BASE1, EV1);
        let count = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));

        let handler = {
            let channel = Arc::downgrade(&channel);
            let count = Arc::clone(&count);
            let own_id = Arc::clone(&own_id);
            Arc::new(move |key: EventKey, _: Option<&EventData>| {
                count.fetch_add(1, Ordering::SeqCst);
                let id = own_id.lock().unwrap().take();
                if let (Some(channel), Some(id)) = (channel.upgrade(), id) {
                    channel.unregister(key, id).unwrap();
                }
            })
        };
        let id = channel.register(key, handler).unwrap();
        *own_id.lock().unwrap() = Some(id);

        channel.post(key, None, Ticks::ZERO).unwrap();
        channel.post(key, None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(channel.handler_count(), 0);
    }

    #[test]
    fn event_data_is_copied_on_post() {
        let channel = taskless(4);
        let key = EventKey::new(BASE1, EV1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel
            .register(
                key,
                Arc::new(move |_: EventKey, data: Option<&EventData>| {
                    sink.lock().unwrap().push(data.map(|d| d.to_vec()));
                }),
            )
            .unwrap();

        let mut payload = [0x11u8, 0x22, 0x33];
        channel.post(key, Some(&payload[..]), Ticks::ZERO).unwrap();
        payload[0] = 0xff;
        channel.post(key, None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();

        assert_eq!(
            &seen.lock().unwrap()[..],
            &[Some(vec![0x11, 0x22, 0x33]), None]
        );
    }

    #[test]
    fn run_is_rejected_with_dedicated_task() {
        let channel = LocalChannel::new(&ChannelConfig::default()).unwrap();
        assert_eq!(channel.run(Ticks::ZERO), Err(ErrorCode::InvalidState));
    }

    #[test]
    fn dedicated_task_delivers_in_post_order() {
        let channel = LocalChannel::new(&ChannelConfig::default()).unwrap();
        let key = EventKey::new(BASE1, EV1);
        let (tx, rx) = crossbeam_channel::unbounded();
        channel
            .register(
                key,
                Arc::new(move |_: EventKey, data: Option<&EventData>| {
                    let _ = tx.send(data.map(|d| d[0]));
                }),
            )
            .unwrap();

        for i in 0..5u8 {
            channel.post(key, Some(&[i][..]), Ticks::MAX_DELAY).unwrap();
        }
        let got: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let _ = env_logger::builder().is_test(true).try_init();
        let channel = LocalChannel::new(&ChannelConfig::default()).unwrap();
        let bad = EventKey::new(BASE1, EV1);
        let good = EventKey::new(BASE2, EV1);
        let count = Arc::new(AtomicUsize::new(0));
        channel
            .register(
                bad,
                Arc::new(|_: EventKey, _: Option<&EventData>| panic!("handler failure")),
            )
            .unwrap();
        channel.register(bad, counter(&count)).unwrap();
        channel.register(good, counter(&count)).unwrap();

        channel.post(bad, None, Ticks::MAX_DELAY).unwrap();
        channel.post(good, None, Ticks::MAX_DELAY).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn panicking_handler_restores_dispatch_context() {
        let channel = Arc::new(taskless(4));
        let key = EventKey::new(BASE1, EV1);
        let panicking = channel
            .register(
                key,
                Arc::new(|_: EventKey, _: Option<&EventData>| panic!("handler failure")),
            )
            .unwrap();

        channel.post(key, None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();

        // Not inside a callback any more, so unregister must pass the gate normally.
        assert_eq!(super::DISPATCHING.with(|d| d.get()), None);
        channel.unregister(key, panicking).unwrap();
        assert_eq!(channel.handler_count(), 0);
    }

    #[test]
    fn dump_lists_handlers_with_invocation_counts() {
        let channel = taskless(4);
        let count = Arc::new(AtomicUsize::new(0));
        let exact = channel.register(EventKey::new(BASE1, EV1), counter(&count)).unwrap();
        let wildcard = channel.register(EventKey::any_of(BASE2), counter(&count)).unwrap();

        channel.post(EventKey::new(BASE1, EV1), None, Ticks::ZERO).unwrap();
        channel.post(EventKey::new(BASE1, EV1), None, Ticks::ZERO).unwrap();
        channel.run(Ticks::ZERO).unwrap();

        let mut out = String::new();
        channel.dump(&mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "channel: 0 pending, 2 handler(s), task-less");
        assert_eq!(
            lines[1],
            format!("  handler {} TEST_BASE1:0 invoked 2", exact.0)
        );
        assert_eq!(
            lines[2],
            format!("  handler {} TEST_BASE2:ANY invoked 0", wildcard.0)
        );
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn unsatisfiable_stack_reports_spawn_failure() {
        let config = ChannelConfig {
            task_stack_size: Some(usize::MAX / 2),
            ..ChannelConfig::default()
        };
        let err = LocalChannel::new(&config).err();
        assert!(matches!(err, Some(Error::Spawn { ref task, .. }) if task == "evt_loop"));
    }
}
