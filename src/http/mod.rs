//! HTTP layer for the ref-pinning Git proxy.
//!
//! This module provides the axum-based HTTP server that answers Git smart
//! HTTP requests for `owner/name:ref` paths, rewriting the upstream reference
//! advertisement and relaying pack negotiation.

pub mod handler;
