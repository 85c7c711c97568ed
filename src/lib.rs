//! `everstream` is an event-sourcing storage runtime.
//!
//! An [object document][document::ObjectDocument] catalogs the append-only
//! event streams of one aggregate instance. The runtime appends events
//! under optimistic concurrency through a [leased session][session::LeasedSession],
//! supports chunked physical layouts, snapshots, and type-versioned
//! payloads with [upcasting][upcast::UpcasterRegistry].
//!
//! On top of the storage runtime sits the [migration][] orchestrator: a
//! saga that copies a stream to a new one with optional transformation,
//! under a [distributed lock][lock] with heartbeats, with dry-run planning,
//! backup hooks, verification, atomic cutover, book-closing and
//! compensating rollback.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod backup;
pub mod document;
pub mod event;
pub mod health;
pub mod hooks;
pub mod lock;
pub mod migration;
pub mod registry;
pub mod serde;
pub mod session;
pub mod store;
pub mod stream;
pub mod upcast;
pub mod version;

pub use crate::document::{ObjectDocument, StreamInformation};
pub use crate::event::Event;
pub use crate::registry::EventTypeRegistry;
pub use crate::session::LeasedSession;
pub use crate::stream::{Constraint, EventStream};
pub use crate::upcast::UpcasterRegistry;
pub use crate::version::{Version, NO_STREAM};
