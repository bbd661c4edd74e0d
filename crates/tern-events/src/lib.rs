//! # tern-events
//!
//! Event store backing stream resumption.
//!
//! - **Contract**: [`EventStore`] appends messages to per-stream logs and
//!   replays everything after a given event id
//! - **Reference backend**: [`InMemoryEventStore`], one mutex per instance,
//!   optionally bounded per stream
//! - **Factories**: [`EventStoreFactory`] hands each HTTP session its own
//!   store instance

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod store;

pub use errors::{EventStoreError, Result};
pub use memory::{InMemoryEventStore, InMemoryEventStoreFactory};
pub use store::{EventStore, EventStoreFactory, StoredEvent};
