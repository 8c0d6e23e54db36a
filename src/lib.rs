//! # Nodegate
//!
//! Nodegate admits physical or virtual hosts into a managed cluster
//! inventory and keeps that inventory consistent with the live state
//! reported by a Kubernetes control plane.
//!
//! ## Core pieces
//!
//! - **Probe**: an SSH preflight gate that proves a candidate host can
//!   round-trip file transfer and command execution before it is saved.
//! - **Registry**: the durable store of admitted nodes, keyed by
//!   network address (unique across all clusters).
//! - **Cluster**: read-only facts about nodes currently known to the
//!   control plane, with capacities normalized to display units.
//! - **Reconciler**: orchestrates admission and produces the two merged
//!   views: bound nodes (registry joined with live facts by address)
//!   and unbound nodes (live facts with no registry entry).

pub mod cli;
pub mod cluster;
pub mod config;
pub mod probe;
pub mod reconcile;
pub mod registry;
pub mod server;
