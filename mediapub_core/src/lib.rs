//! Core mediapub protocol types and traits.
//!
//! This crate defines the shared surface used by all mediapub crates.
//!
//! ## Wire-stable types
//!
//! - Announcement messages ([`announce::Announcement`]): the signed payload
//!   published to the announcement pub-sub topic. Byte-for-byte
//!   compatibility with other participants on the topic is required, so
//!   changes here are protocol changes.
//!
//! ## Client abstraction
//!
//! - [`net::NetClient`]: the content-network operations the daemon consumes
//!   (add, cat, mutable-name publish/resolve, pub-sub). Implementations
//!   live in the `net_clients/` crates; the sync engine and announcer are
//!   written strictly against this trait and never learn which
//!   implementation is behind it.
//!
//! ## Test utilities
//!
//! With the `testutil` feature enabled, [`testutil::MemoryNet`] provides a
//! fully in-memory client with failure injection for exercising retry and
//! offline paths.

pub mod announce;
pub mod net;

#[cfg(feature = "testutil")]
pub mod testutil;

pub use announce::{Announcement, AnnounceError};
pub use net::{AddOptions, ByteStream, NamePublishOptions, NameRecord, NetClient, NetError, NetResult, PubsubEvent};
