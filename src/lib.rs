//! Batch ingestion engine for Korean tourism (KTO) and weather (KMA)
//! open-data APIs.
//!
//! The crate is organised around four subsystems: a multi-key API gateway
//! (`keys`, `gateway`), a transform/upsert pipeline (`pipeline`,
//! `repository`), a data-quality gate (`quality`), and a job scheduler
//! (`jobs`, `scheduler`).

pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod keys;
pub mod notify;
pub mod pipeline;
pub mod providers;
pub mod quality;
pub mod repository;
pub mod scheduler;
pub mod schema;

pub use config::Settings;
pub use error::{BatchError, Severity};
