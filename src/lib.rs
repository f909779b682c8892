//! Deterministic parity-arbitrage engine for binary-outcome CLOB markets.
//!
//! A market's YES and NO outcome tokens form a basket paying exactly 1 at
//! resolution; whenever the combined best asks price the basket below 1
//! minus costs, the engine emits a paired buy. All decision state lives on
//! one single-writer task (`engine`); websocket readers, the REST fetcher,
//! the signing/submit pool, persistence and the admin endpoint are sibling
//! tasks behind bounded queues (`venue`, `persistence`, `admin`).

pub mod admin;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod venue;
