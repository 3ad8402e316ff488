//! Built-in services.
//!
//! Bound into every [`ServiceRegistry`](crate::ServiceRegistry):
//! - `twinrpc.Meta`: introspection of the registry and pending calls.

mod meta_service;
pub use meta_service::{MetaService, MetaServiceImpl, MetaServiceProxy};
