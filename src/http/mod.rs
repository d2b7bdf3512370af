//! HTTP layer for the failover proxy.
//!
//! This module provides the axum router, the gateway that forwards requests
//! and falls back to stored responses, header helpers and the access log.

pub mod access_log;
pub mod gateway;
pub mod handler;
pub mod headers;
