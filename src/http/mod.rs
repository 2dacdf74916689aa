//! HTTP pipeline integration.

mod filter;
mod server;

pub use filter::{admission_filter, CREDENTIAL_HEADER, CREDENTIAL_PARAM};
pub use server::HttpServer;
