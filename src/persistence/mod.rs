//! Durable persistence for runs and their event logs.
//!
//! The engine journals every state change as one JSON line; replaying the
//! journal at startup rebuilds the exact in-memory state, which is what
//! makes restart-resume possible.

mod journal;

pub use journal::JournalStore;
