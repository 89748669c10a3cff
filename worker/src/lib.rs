//! Rebuilder pipeline workers.
//!
//! This crate runs the Discover, Rebuild, Attest, Report and Publish stages
//! over per-stage task queues. It is used by the `rebuilder` binary and can
//! be driven programmatically with in-memory collaborators for testing.
//!
//! # Modules
//!
//! - [`cli`] - Command-line argument definitions
//! - [`dispatcher`] - Message delivery and retry policy
//! - [`engine`] - Rebuild engine invocation
//! - [`error`] - Stage and pipeline error types
//! - [`executor`] - External command execution
//! - [`fetch`] - HTTP listing and catalog retrieval
//! - [`layout`] - Artifact and durable tree layout
//! - [`logging`] - Stderr logger for the binary
//! - [`merger`] - Attestation merging across architectures
//! - [`message`] - Typed stage messages
//! - [`queue`] - In-memory and spooled task queues
//! - [`resolver`] - Repository resolution per ecosystem
//! - [`scheduler`] - Periodic discovery and publication
//! - [`signer`] - Provenance signing tool
//! - [`stages`] - The five pipeline stages
//! - [`status`] - Status aggregation over the record store
//! - [`store`] - Build record store

pub mod cli;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod layout;
pub mod logging;
pub mod merger;
pub mod message;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod signer;
pub mod stages;
pub mod status;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
