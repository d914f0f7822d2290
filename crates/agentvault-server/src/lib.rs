//! AgentVault Server Library
//!
//! The control plane for encrypted agent backups:
//! - Pluggable storage (embedded SQLite, cloud KV) behind one contract
//! - Object-store brokerage via short-lived presigned URLs
//! - HTTP pipeline with bearer auth, admission gating, and rate limiting
//! - Background hard-purge of soft-deleted metadata

pub mod config;
pub mod http;
pub mod objectstore;
pub mod purge;
pub mod storage;
