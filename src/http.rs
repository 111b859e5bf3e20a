//! HTTP helpers for key-set retrieval and cache semantics.

pub mod client;
pub mod retry;
pub mod semantics;
