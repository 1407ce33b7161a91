//! # muster-core
//!
//! Core library for muster - a distributed agent-management platform.
//!
//! This crate provides the building blocks shared by the muster daemons,
//! with a focus on the enrollment pipeline: the authoritative agent
//! keystore, the pending-change journal that links enrollment to durable
//! persistence, and the text wire protocol agents speak when requesting a
//! key.
//!
//! ## Modules
//!
//! - [`keystore`]: Authoritative registry of enrolled agents and its
//!   on-disk key file format
//! - [`journal`]: Ordered pending-change records between enrollment and the
//!   next flush
//! - [`protocol`]: Enrollment request/response wire format
//! - [`config`]: Daemon configuration (TOML)
//! - [`persist`]: Atomic file persistence primitives
//!
//! ## Example
//!
//! ```rust
//! use muster_core::keystore::KeyStore;
//! use muster_core::protocol::EnrollmentRequest;
//!
//! let request = EnrollmentRequest::parse("OSSEC A:'web01' G:'dmz'").unwrap();
//! assert_eq!(request.name, "web01");
//!
//! let mut keystore = KeyStore::new();
//! assert_eq!(keystore.next_id(), "001");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod journal;
pub mod keystore;
pub mod persist;
pub mod protocol;

pub use config::AuthdConfig;
pub use journal::JournalRecord;
pub use keystore::{AgentEntry, KeyStore};
pub use protocol::EnrollmentRequest;
