//! The HTTP pub/sub endpoint (spec §4.4): one axum router per stream,
//! the query DSL it parses, and per-language schema rendering.

pub mod endpoint;
pub mod query;
pub mod schema;

pub use endpoint::{router, HttpEndpointConfig};
