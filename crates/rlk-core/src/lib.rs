//! RLK Core - Session logic for Remote Lock.
//!
//! This crate implements:
//! - The session store adapter (path-based document store with subscriptions)
//! - The session record and command wire model
//! - Controller and client state machines (projections of one session record)
//! - Controller and client role logic driving those machines
//! - The operator-visible activity log
//! - Share link construction and parsing

#![forbid(unsafe_code)]

// Core state machines
pub mod session;

// Roles
pub mod client;
pub mod controller;

// Infrastructure
pub mod activity;
pub mod store;
pub mod tree;
pub mod watch;

// Supporting modules
pub mod device;
pub mod errors;
pub mod harness;
pub mod link;
pub mod model;
pub mod types;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use errors::SessionError;
pub use model::{Command, CommandPayload, LockState, SessionRecord, SessionStatus};
pub use store::{InMemoryStore, SessionStore, StoreError};
