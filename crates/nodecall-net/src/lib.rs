//! Event loop and framed connection layer for nodecall.
//!
//! A [`Loop`] owns one or more connection contexts (plain TCP or TLS), their
//! listeners and their sockets, and drives all of them from a single thread.
//! Other threads reach it through a [`LoopHandle`], which queues [`Event`]s
//! and wakes the loop.
//!
//! Incoming bytes are reassembled into length-prefixed frames and delivered
//! whole to a [`Handler`]. Outgoing payloads get their 4-byte header on the
//! way out.
//!
//! Queued events may be deferred by a number of drain passes. A pass runs
//! whenever the loop wakes (new events, socket activity) and on a short tick
//! while deferred events are parked, so deferral is a cooperative retry
//! rather than a timer.

pub mod context;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod handler;
pub mod socket;

pub use context::{ContextConfig, ContextId, ListenerId};
pub use error::{NetError, Result};
pub use event::{AfterFn, CustomFn, Event, EventOutcome, LoopHandle, LoopState, Queued};
pub use event_loop::{Loop, LoopConfig, Net};
pub use handler::{CloseReason, ConnectFailure, Handler, OpenInfo};
pub use socket::{SocketId, WRITE_HIGH_WATER};
