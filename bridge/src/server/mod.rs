//! HTTP/WebSocket control surface.

mod error;
mod http;
mod layouts;
mod ws;

use std::sync::Arc;

use crate::registry::TargetRegistry;
pub use http::{router, BridgeServer};
pub use layouts::LayoutStore;

/// Shared application state for the control surface.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LayoutStore>,
    pub registry: Arc<TargetRegistry>,
}
