//! Event dispatch core for interrupt/driver-style event buses.
//!
//! # Highlights
//! - RAII [`Registration`]s binding one callback to one [`EventKey`].
//! - [`TimedRegistration`]: event-or-timeout with a lock-free "first side wins" race.
//! - [`SyncEventHandler`]: bounded queue turning callbacks into blocking waits.
//! - Collaborators behind traits ([`EventChannel`], [`TimerService`]), with
//!   in-process implementations ([`LocalChannel`], [`ThreadTimerService`]).
//!
//! # Quick start
//! ```
//! use ph_dispatch::{EventBase, EventKey, EventLoop, LoopConfig, SyncEventHandler, WAIT_FOREVER};
//!
//! const SENSOR: EventBase = EventBase::new("SENSOR_EVENT");
//! let ready = EventKey::new(SENSOR, 1);
//!
//! let event_loop = EventLoop::from_config(&LoopConfig::default()).unwrap();
//! let handler = SyncEventHandler::new(&event_loop, 8).unwrap();
//! handler.listen_to(ready).unwrap();
//!
//! event_loop.post(ready, Some(&[42u8][..]), WAIT_FOREVER).unwrap();
//! let result = handler.wait_event();
//! assert_eq!(result.key, ready);
//! assert_eq!(result.data.as_deref(), Some(&[42u8][..]));
//! ```
//!
//! # Execution contexts
//! Event callbacks run on the channel's delivery context; timeout callbacks run
//! on the timer service's context. The two may run concurrently. Callbacks must
//! not block on each other; [`SyncEventHandler`] exists so application threads
//! can wait instead.
//!
//! # Semantics
//! - Dropping a registration unregisters it; the callback never runs after the
//!   drop returns (unless the drop happens inside that very callback).
//! - A [`TimedRegistration`] settles at most once. A timeout unregisters the
//!   event side before the registration is considered settled.
//! - All millisecond/tick conversion goes through [`Ticks`].
//!
//! # Features
//! - `portable-atomic`: route atomics through `portable-atomic`.
//! - `portable-atomic-critical-section`: as above, backed by `critical-section`.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod local;
pub mod registration;
pub mod sync_handler;
pub mod ticks;
pub mod timed;
pub mod timer;

mod sync;

pub use channel::{Dispatch, EventChannel, HandlerId};
pub use config::{ChannelConfig, DEFAULT_QUEUE_SIZE, LoopConfig, TimerConfig};
pub use error::{Error, ErrorCode, Result};
pub use event::{ANY_ID, EventBase, EventData, EventKey};
pub use event_loop::{EventLoop, WAIT_FOREVER};
pub use local::LocalChannel;
pub use registration::{EventCallback, Registration};
pub use sync_handler::{EventResult, EventResultTimed, SyncEventHandler};
pub use ticks::{TICK_RATE_HZ, Ticks};
pub use timed::{MIN_TIMEOUT, Outcome, TimeoutCallback, TimedRegistration};
pub use timer::{ThreadTimerService, TimerCallback, TimerId, TimerService};
