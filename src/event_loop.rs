//! Factory for registrations over one shared event channel.

use crate::channel::EventChannel;
use crate::config::LoopConfig;
use crate::error::{Error, Result};
use crate::event::{EventData, EventKey};
use crate::local::LocalChannel;
use crate::registration::Registration;
use crate::ticks::Ticks;
use crate::timed::TimedRegistration;
use crate::timer::{ThreadTimerService, TimerService};
use std::sync::Arc;
use std::time::Duration;

/// Wait bound for [`EventLoop::post`] that never times out.
pub const WAIT_FOREVER: Duration = Duration::MAX;

/// Owns shared handles to an event channel and a timer service and hands out
/// registrations bound to them.
///
/// The loop keeps no registry of its own: every registration belongs to the
/// caller and unregisters when dropped. Cloning is cheap and clones share the
/// same channel.
#[derive(Clone)]
pub struct EventLoop {
    channel: Arc<dyn EventChannel>,
    timers: Arc<dyn TimerService>,
}

impl EventLoop {
    pub fn new(channel: Arc<dyn EventChannel>, timers: Arc<dyn TimerService>) -> Self {
        Self { channel, timers }
    }

    /// Build a loop over a [`LocalChannel`] and a [`ThreadTimerService`].
    pub fn from_config(config: &LoopConfig) -> Result<Self> {
        let channel = LocalChannel::new(&config.channel)?;
        let timers = ThreadTimerService::new(&config.timer)?;
        Ok(Self::new(Arc::new(channel), Arc::new(timers)))
    }

    pub fn register_event<F>(&self, key: EventKey, callback: F) -> Result<Registration>
    where
        F: Fn(EventKey, Option<&EventData>) + Send + Sync + 'static,
    {
        Registration::new(callback, key, Arc::clone(&self.channel))
    }

    pub fn register_event_timed<F, T>(
        &self,
        key: EventKey,
        callback: F,
        timeout: Duration,
        timeout_callback: T,
    ) -> Result<TimedRegistration>
    where
        F: Fn(EventKey, Option<&EventData>) + Send + Sync + 'static,
        T: Fn(EventKey) + Send + Sync + 'static,
    {
        TimedRegistration::new(
            key,
            callback,
            timeout,
            timeout_callback,
            Arc::clone(&self.channel),
            Arc::clone(&self.timers),
        )
    }

    /// Post an event, waiting up to `wait` for space in the channel.
    ///
    /// `wait` is rounded down to whole ticks; [`WAIT_FOREVER`] blocks until the
    /// channel accepts the event. Not retried on failure.
    pub fn post(&self, key: EventKey, data: Option<&[u8]>, wait: Duration) -> Result<()> {
        self.channel
            .post(key, data, Ticks::from_duration(wait))
            .map_err(|code| Error::PostFailed { key, code })
    }

    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }

    pub fn timers(&self) -> &Arc<dyn TimerService> {
        &self.timers
    }
}
