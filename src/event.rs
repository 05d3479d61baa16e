//! Event identity and payload types.
//!
//! An event class is identified by an [`EventKey`]: an opaque [`EventBase`] plus a
//! signed 32-bit id. Both halves have a wildcard form that is only meaningful
//! when registering; posted events always carry a concrete key.

use core::fmt;
use core::ops::Deref;
use std::sync::Arc;

/// Wildcard id: matches every id of the registered base.
pub const ANY_ID: i32 = -1;

/// Opaque event base identifier, compared by name.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct EventBase(Option<&'static str>);

impl EventBase {
    /// Wildcard base: matches every base. Only valid together with [`ANY_ID`].
    pub const ANY: EventBase = EventBase(None);

    #[inline]
    pub const fn new(name: &'static str) -> Self {
        EventBase(Some(name))
    }

    #[inline]
    pub const fn is_any(self) -> bool {
        self.0.is_none()
    }

    /// The base name, `"ANY"` for the wildcard.
    #[inline]
    pub fn name(self) -> &'static str {
        self.0.unwrap_or("ANY")
    }
}

impl fmt::Debug for EventBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for EventBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `(base, id)` pair identifying an event class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub base: EventBase,
    pub id: i32,
}

impl EventKey {
    /// Matches every event posted to a channel.
    pub const ANY: EventKey = EventKey::new(EventBase::ANY, ANY_ID);

    #[inline]
    pub const fn new(base: EventBase, id: i32) -> Self {
        EventKey { base, id }
    }

    /// Every id of `base`.
    #[inline]
    pub const fn any_of(base: EventBase) -> Self {
        EventKey { base, id: ANY_ID }
    }

    #[inline]
    pub const fn is_wildcard(&self) -> bool {
        self.base.is_any() || self.id == ANY_ID
    }

    /// Whether a registration under `self` receives an event posted as `posted`.
    pub fn matches(&self, posted: &EventKey) -> bool {
        match (self.base.is_any(), self.id == ANY_ID) {
            (true, true) => true,
            (false, true) => self.base == posted.base,
            (false, false) => self == posted,
            (true, false) => false,
        }
    }

    /// Dispatch level: 0 for an exact key, 1 for a base wildcard, 2 for the loop wildcard.
    pub(crate) fn specificity(&self) -> u8 {
        match (self.base.is_any(), self.id == ANY_ID) {
            (false, false) => 0,
            (false, true) => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == ANY_ID {
            write!(f, "{}:ANY", self.base)
        } else {
            write!(f, "{}:{}", self.base, self.id)
        }
    }
}

/// Event payload. Posting copies the caller's bytes once; every subscriber
/// shares that copy.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EventData(Arc<[u8]>);

impl EventData {
    pub fn copy_from(bytes: &[u8]) -> Self {
        EventData(Arc::from(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for EventData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for EventData {
    fn from(bytes: Vec<u8>) -> Self {
        EventData(Arc::from(bytes))
    }
}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventData").field(&self.0.len()).finish()
    }
}
