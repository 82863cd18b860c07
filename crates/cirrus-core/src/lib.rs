//! Cirrus Core - Domain types and port definitions
//!
//! This crate contains the shared vocabulary of the sync core:
//! - Domain entities (`SyncConfig`, `CloudNode`, `FileFingerprint`)
//! - Strongly-typed identifiers (`BackupId`, `NodeHandle`, `Fsid`)
//! - Port definitions (traits the engine consumes: cloud RPC, transfers,
//!   app notifications, the client waiter)
//!
//! Nothing in here performs I/O beyond fingerprint computation; the adapter
//! crates (`cirrus-fs`, `cirrus-scan`, `cirrus-store`) and the engine itself
//! build on these types.

pub mod domain;
pub mod ports;
