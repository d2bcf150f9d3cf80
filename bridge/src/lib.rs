//! Recording and replay bridge for channelised telemetry streams.
//!
//! The bridge sits between upstream telemetry sources (WebSocket
//! subprotocol, schema-tagged binary messages) and visualisation clients.
//! For each retained target it keeps a live upstream connection, records
//! every message into hourly indexed MCAP segments, and serves a
//! per-target WebSocket endpoint that replays a configurable historical
//! window before forwarding live traffic.
//!
//! # Architecture
//!
//! - [`TargetRegistry`] reconciles the retained-set descriptor against
//!   running [`TargetManager`]s.
//! - Each manager runs an upstream connector (the single writer of that
//!   target's ring buffer and recorder) plus a retention sweeper.
//! - Client sessions replay disk history, then ring history, then follow
//!   the live stream; per topic the delivered timestamps never decrease.

mod config;
mod connector;
mod error;
mod history;
mod manager;
mod model;
mod protocol;
mod recorder;
mod registry;
mod ring;
pub mod server;

pub use config::{CliArgs, Config};
pub use error::{Error, Result};
pub use manager::{ClientSink, Session, TargetEvent, TargetManager};
pub use model::{
    slug_from_url, ChannelId, ChannelInfo, LayoutEntry, ServerChannelId, SubscriptionId, Target,
};
pub use registry::TargetRegistry;
pub use server::{AppState, BridgeServer, LayoutStore};
