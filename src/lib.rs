//! Lead Qualifier Library
//!
//! Scores business leads (aesthetic and health clinics) with a generative model and
//! classifies them by ICP fit and estimated revenue, in adaptive concurrent batches with a
//! result cache and incremental persistence.
//!
//! # Modules
//!
//! - `api`: HTTP-facing components.
//! - `core`: Pipeline logic, models and errors.
//! - `integrations`: External services (model API, Postgres).
//! - `analysis_parser`: Model output cleanup and parsing.
//! - `batch`: Windowed batch orchestration.
//! - `cache_store`: Analysis cache backends.
//! - `cache_validator`: Checksummed cache entries.
//! - `circuit_breaker`: Circuit breaker for database calls.
//! - `concurrency`: Adaptive concurrency controller.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `errors`: Error handling types.
//! - `export`: CSV export.
//! - `gemini_models`: Model API wire types.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `persistence`: Outcome persistence sinks.
//! - `prompt`: Prompt construction.
//! - `scoring_client`: Model API client with retries and fallback.

pub mod api;
pub mod core;
pub mod integrations;

pub mod analysis_parser;
pub mod batch;
pub mod cache_store;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod gemini_models;
pub mod handlers;
pub mod models;
pub mod persistence;
pub mod prompt;
pub mod scoring_client;
