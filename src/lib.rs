//! DocSync: real-time collaborative text editing.
//!
//! The replicated document core ([`sync::CollabDocument`] and its sequence
//! CRDT) is usable on its own by client replicas. [`sync::SyncServer`] hosts
//! one server replica per open document and relays updates and presence
//! between sessions; [`storage`] persists update logs with sled.

pub mod config;
pub mod storage;
pub mod sync;
