//! VRMAcquire: discovery, download, and cataloging of freely licensed 3D
//! avatar models from several providers.
//!
//! The pipeline runs discovery through per-provider source adapters, pulls
//! payloads through a per-source rate limiter, classifies and stores each
//! download, and records everything in a deduplicated SQLite catalog.

pub mod classify;
pub mod config;
pub mod crawler;
pub mod credentials;
pub mod error;
pub mod models;
pub mod repository;
pub mod schema;
pub mod sources;
