//! InsightPulse Core Library
//!
//! This crate provides the worker configuration record, the asset manifest
//! and the request/response types of the sentiment API.

pub mod config;
pub mod types;

pub use config::{AssetManifest, CacheVersion, RuntimeCacheConfig, WorkerConfig};
pub use types::{
    AnalyzeRequest, AnalyzeResponse, ErrorBody, LoginRequest, LoginResponse, Probabilities,
    Sentiment, MAX_TEXT_CHARS,
};
