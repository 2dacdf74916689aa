//! Tollgate - Request Admission for API Gateways
//!
//! This crate implements the pre-routing admission stage of an API gateway:
//! every inbound request must carry a resolvable access credential and pass a
//! per-identity rate check, implemented as a distributed token bucket over a
//! shared state store. Routing, proxying, and credential issuance are the
//! surrounding gateway's business; this crate only decides whether a request
//! may proceed.

pub mod admission;
pub mod config;
pub mod error;
pub mod http;
pub mod resolver;
pub mod store;
