//! A callback bound to one event key for as long as the registration lives.

use crate::channel::{Dispatch, EventChannel, HandlerId};
use crate::error::{Error, Result};
use crate::event::{EventData, EventKey};
use crate::sync::{AtomicBool, Ordering};
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;

/// User callback for event delivery.
pub type EventCallback = Arc<dyn Fn(EventKey, Option<&EventData>) + Send + Sync>;

/// Live binding of a callback to an [`EventKey`].
///
/// Dropping the registration unregisters it from the channel; once the drop
/// returns the callback is never invoked again.
pub struct Registration {
    key: EventKey,
    handle: HandlerId,
    channel: Arc<dyn EventChannel>,
    live: AtomicBool,
}

impl Registration {
    pub fn new<F>(callback: F, key: EventKey, channel: Arc<dyn EventChannel>) -> Result<Self>
    where
        F: Fn(EventKey, Option<&EventData>) + Send + Sync + 'static,
    {
        Self::with_dispatch(key, Arc::new(callback), channel)
    }

    /// Register an arbitrary dispatch target under `key`.
    pub(crate) fn with_dispatch(
        key: EventKey,
        dispatch: Arc<dyn Dispatch>,
        channel: Arc<dyn EventChannel>,
    ) -> Result<Self> {
        let handle = channel
            .register(key, dispatch)
            .map_err(|code| Error::RegistrationFailed { key, code })?;
        debug!("registration {} live for {}", handle.0, key);
        Ok(Self {
            key,
            handle,
            channel,
            live: AtomicBool::new(true),
        })
    }

    pub fn key(&self) -> EventKey {
        self.key
    }

    /// Unregister from the channel. Only the first call has an effect.
    pub(crate) fn release(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(code) = self.channel.unregister(self.key, self.handle) {
            warn!("failed to unregister {} (handler {}): {}", self.key, self.handle.0, code);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}
