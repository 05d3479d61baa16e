//! The event channel boundary.
//!
//! The dispatch core talks to the event bus only through [`EventChannel`]. A
//! registration hands the channel a [`Dispatch`] object; the channel keys it by
//! the returned [`HandlerId`] and calls it from its delivery context for every
//! matching post.
//!
//! # Channel contract
//! - Delivery is at-least-once per registration and runs on a single delivery
//!   context.
//! - Events for one key are delivered in post order.
//! - When several registrations match one posted event, their relative order is
//!   defined by the channel implementation.
//! - `unregister` must be effective when it returns: no invocation of the
//!   removed handler may start afterwards.

use crate::error::ErrorCode;
use crate::event::{EventData, EventKey};
use crate::ticks::Ticks;
use std::sync::Arc;

/// Channel-facing side of a registration.
pub trait Dispatch: Send + Sync {
    /// Called from the channel's delivery context with the posted key.
    fn dispatch(&self, key: EventKey, data: Option<&EventData>);
}

impl<F> Dispatch for F
where
    F: Fn(EventKey, Option<&EventData>) + Send + Sync,
{
    #[inline]
    fn dispatch(&self, key: EventKey, data: Option<&EventData>) {
        self(key, data)
    }
}

/// Handle identifying one live channel registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Publish/subscribe primitive the dispatch core is built on.
pub trait EventChannel: Send + Sync {
    fn register(&self, key: EventKey, handler: Arc<dyn Dispatch>) -> Result<HandlerId, ErrorCode>;

    fn unregister(&self, key: EventKey, handle: HandlerId) -> Result<(), ErrorCode>;

    /// Queue an event, waiting up to `wait` for space. `data` is copied.
    fn post(&self, key: EventKey, data: Option<&[u8]>, wait: Ticks) -> Result<(), ErrorCode>;
}
