//! Messaging transport for ostore.
//!
//! The object store is layered on a messaging system that offers publish and
//! request/reply over named subjects with at-least-once delivery. This crate
//! defines that contract ([`Transport`]) and the server-side counterpart
//! ([`RequestHandler`]), plus [`LoopbackTransport`], which delivers requests to
//! an in-process handler.

pub mod error;
pub mod loopback;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use loopback::LoopbackTransport;
pub use traits::{RequestHandler, Transport};
