//! # Overview
//! This crate provisions ephemeral Quorum test networks on a local container engine.
//! A build creates one labeled, isolated network, starts a transaction manager and a
//! ledger node per declared node, and can later be torn down purely from its labels,
//! even from a different process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use quorum_testcontainer::builder::QuorumBuilder;
//! use quorum_testcontainer::docker::DockerEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topology = std::fs::File::open("network.yml")?;
//!     let engine = Arc::new(DockerEngine::connect()?);
//!     let mut builder = QuorumBuilder::from_reader(topology, engine)?;
//!     builder.build().await?;
//!     for node in builder.directory().list().await {
//!         println!("{} -> {:?}", node.index, node.rpc_url);
//!     }
//!     builder.destroy().await
//! }
//! ```

/// Read-only view of the running nodes.
pub mod api;
/// Identity, permissioning and genesis material.
pub mod bootstrap;
/// The build pipeline and label-driven teardown.
pub mod builder;
/// Environment driven settings.
pub mod config;
/// Container configuration and lifecycle shared by every role.
pub mod container;
/// Container engine backed by a local Docker daemon.
pub mod docker;
/// The container engine boundary.
pub mod engine;
/// Defines error types and custom error handling related to builds.
pub mod errors;
/// Ledger node containers.
pub mod ledger;
/// Build networks and address leasing.
pub mod network;
/// Runs one unit of work per node concurrently and aggregates failures.
pub mod parallel;
/// Declarative topology.
pub mod spec;
/// Provides an in-memory engine for testing builds.
pub mod test_utils;
/// Transaction manager containers.
pub mod txmanager;
/// A helper function used across the test container.
pub mod utils;
