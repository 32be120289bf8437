//! Gateway server implementation

pub mod auth;
mod router;
mod server;
pub mod tools;

pub use auth::{CallerIdentity, InboundGuard, auth_middleware};
pub use server::Gateway;
pub use tools::GdpTools;
