//! leadline: multi-tenant call webhook ingestion, enrichment and CRM sync
//!
//! A completed call arrives as a signed webhook, is attributed to a tenant's
//! office, and moves through a persisted pipeline: recording fetch and
//! transcription, model-based lead analysis and spam scoring, then CRM push.

pub mod analysis;
pub mod audio;
pub mod client;
pub mod commands;
pub mod config;
pub mod crm;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod signature;
pub mod tenant;

pub use config::Config;
pub use error::{Error, Result};
