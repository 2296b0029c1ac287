//! Library root for the `evidence_graph` crate
//!
//! A tamper-evident compliance evidence system: hash-chained event streams,
//! regulatory deadline clocks, periodic Merkle anchoring with external
//! witnesses, and compliance queries over an explicitly linked graph.

// Core error handling
pub mod errors;

// Data model and hashing
pub mod canonicalize;
pub mod model;

// Graph storage
pub mod graph_store;
pub mod memory_store;
pub mod sled_store;

// Ambient services
pub mod alerts;
pub mod config;
pub mod time_source;

// Ledger and clocks
pub mod clock_engine;
pub mod ledger;

// Anchoring and witnesses
pub mod anchor_service;
pub mod merkle;
pub mod tsa;
pub mod witness_registry;

// Ingestion
pub mod orchestrator;

// Compliance queries
pub mod query;
pub mod query_catalog;
pub mod query_engine;

// Runtime, background jobs and collaborator surfaces
pub mod api;
pub mod cli;
pub mod runtime;
pub mod scheduler;


pub use errors::{EvidenceError, EvidenceResult};
pub use graph_store::GraphStore;
pub use model::{Clock, ClockStatus, Edge, EdgeType, Event, EventDraft, Node, NodeKind, NodeRef};
pub use query::{ComplianceQueryResult, TimeRange, Verdict};
pub use runtime::EvidenceRuntime;
