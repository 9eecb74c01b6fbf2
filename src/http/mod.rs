//! HTTP schemas, raw request parsing, and the transport boundary

pub mod parser;
pub mod schema;
pub mod transport;

pub use parser::{build, parse, request_fingerprint, META_SPA};
pub use schema::{RequestBody, RequestSchema, ResponseSchema};
pub use transport::{HttpTransport, Transport, TransportConfig, TransportCoordinator};
