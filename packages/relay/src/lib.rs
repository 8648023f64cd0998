//! CA Relay Library
//!
//! This crate provides components for watching channel messages for asset
//! identifiers, filtering them against a persistent blacklist and a session
//! dedup set, forwarding fresh ones, and recording each forward.

pub mod blacklist;
pub mod config;
pub mod enrichment;
pub mod extractor;
pub mod forwarder;
pub mod pipeline;
pub mod runtime;
pub mod source;
pub mod txlog;

// Re-export commonly used types
pub use blacklist::Blacklist;
pub use config::Config;
pub use extractor::{extract, ExtractRule, Extraction};
pub use pipeline::{Outcome, Pipeline, PipelineState};
pub use source::{ChatIdentity, InboundMessage};
pub use txlog::{TransactionLog, TransactionRecord};
