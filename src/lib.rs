//! An event-driven materialized view indexer for EVM chains.
//!
//! Handlers registered per contract template turn decoded logs and resolved
//! off-chain content into versioned entities. Blocks are executed atomically
//! in chain order, and chain reorganizations roll the entity store back to
//! the fork point.

pub mod config;
pub mod engine;
pub mod feed;
pub mod handlers;
pub mod query;
pub mod registry;
pub mod sources;
pub mod store;
pub mod trigger;
pub mod value;
