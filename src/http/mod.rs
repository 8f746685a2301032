//! HTTP surface: identity resolution, gating middleware and the check service.

pub mod identity;
pub mod middleware;
mod server;
mod service;

pub use identity::resolve_identity;
pub use middleware::{enforce, protect, RateLimitLayerState};
pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest};
