//! vgx-core — shared model for the VGX cluster control plane.
//!
//! Holds the system descriptor (instances, transaction replication tree,
//! dispatch routing), the validation engine that turns a raw JSON document
//! into a partition-annotated [`TopologyDescriptor`], the admin error
//! taxonomy, and the TOML-backed [`AdminConfig`] shared by the remote,
//! instance, sync and auth crates.
//!
//! # Validation pipeline
//!
//! ```text
//! raw JSON ──► normalize (legacy keys, common section, list topologies)
//!          ──► validate  (name/graphs → instances → transaction walk
//!                         → dispatch walk → default dispatcher partitions)
//!          ──► TopologyDescriptor (immutable)
//! ```
//!
//! Validation is all-or-nothing: the first failure is returned as a
//! [`ConfigError`] naming the offending field path and value.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod normalize;
pub mod types;
pub mod validate;

pub use config::{AdminConfig, AuthConfig, RemoteConfig, SyncConfig};
pub use descriptor::{TopologyDescriptor, TransactionNode};
pub use error::{AdminError, AdminResult, ConfigError, ServerError};
pub use types::*;
