//! Per-user knowledge-base ingestion and hybrid retrieval engine.
//!
//! Documents are validated, extracted, cleaned, chunked, embedded and
//! indexed into a per-tenant vector collection plus a keyword index; queries
//! combine dense and sparse retrieval with configurable reranking. A
//! separate streaming path forwards token-by-token chat responses to many
//! concurrent clients.

pub mod config;
pub mod daemon;
pub mod db;
pub mod domain;
pub mod embed_cache;
pub mod ingest;
pub mod ipc;
pub mod jobs;
pub mod keyword;
pub mod limits;
pub mod provider;
pub mod retrieval;
pub mod server;
pub mod service;
pub mod stream;
pub mod vector;
