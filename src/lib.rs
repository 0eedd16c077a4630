//! tokensync: distributed token lifecycle state for gateway nodes.
//!
//! Each node keeps token state in a local cache, flushes changes to a shared
//! coordination store on a fixed interval, and reads through to that store
//! for tokens issued elsewhere.

pub mod alias;
pub mod cache;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod service;
pub mod store;
pub mod vault;

pub use errors::TokenStateError;
pub use service::TokenStateService;
