//! # cvmfs-client
//!
//! The client engine of the CernVM-FS read-only network filesystem.
//!
//! The [`Engine`] turns kernel filesystem calls into catalog lookups and
//! content fetches: metadata from the lazily-loaded catalog tree, file
//! content from the tiered cache (downloaded and verified on first
//! access). The remount machinery swaps in new catalog revisions behind a
//! drain-out fence while calls are in flight, and the whole runtime state
//! can be serialized for a graceful process hand-over.

pub mod caches;
pub mod chunks;
pub mod config;
pub mod dirhandles;
pub mod engine;
pub mod fence;
pub mod fuse;
pub mod state;
pub mod tracker;
pub mod ttl;
mod xattr;

pub use config::{BootError, ClientConfig};
pub use engine::{Engine, EngineOptions, Errno};
pub use fence::RemountFence;
