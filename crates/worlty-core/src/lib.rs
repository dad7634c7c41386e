//! Session engine for a single Worlty gateway.
//!
//! [`Session::setup`] authenticates, restores the persisted device map and
//! starts the session tasks; collaborators then work through a cloneable
//! [`SessionHandle`]. [`tree`] and [`queue`] hold the synchronous core
//! (device tree merge and debounced command queue) and can be driven on their
//! own.

pub mod config;
pub mod queue;
pub mod store;
pub mod tree;

pub(crate) mod health;
pub(crate) mod listener;

mod error;
mod session;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use session::{Session, SessionHandle};
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use tree::{DeviceTree, DiscoveryCallback, EntityListener, MergeStats};
pub use queue::CommandQueue;

pub use worlty_rpc::{AuthError, AuthState, Command, GatewayIdentity};
pub use worlty_types::*;
