//! Client WebSocket endpoint: `/ws/{slug}`.
//!
//! Each connection gets a per-client subprotocol facade and a manager
//! session; the socket task interleaves client operations (subscribe /
//! unsubscribe) with live events from the target's bus. Closing the
//! socket drops the session, which detaches it.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use crate::error::{Error, Result};
use crate::manager::ClientSink;
use crate::model::{ChannelInfo, ServerChannelId, SubscriptionId};
use crate::protocol::{self, ClientMessage, ServerMessage};

use super::AppState;

/// Close code for a failed subprotocol negotiation.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Debug, serde::Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub lookback: Option<String>,
}

/// Handle the upgrade at GET /ws/{slug}.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if protocol::choose_protocol(offered.split(',')).is_none() {
        tracing::debug!(slug = %slug, offered, "subprotocol negotiation failed");
        return ws.on_upgrade(close_unsupported).into_response();
    }

    if state.registry.get(&slug).await.is_err() {
        tracing::debug!(slug = %slug, "upgrade for unknown slug");
        return StatusCode::NOT_FOUND.into_response();
    }

    ws.protocols([protocol::SUBPROTOCOL])
        .on_upgrade(move |socket| client_session(socket, state, slug, query.lookback))
        .into_response()
}

async fn close_unsupported(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_PROTOCOL_ERROR,
            reason: "Unsupported protocol".into(),
        })))
        .await;
}

async fn client_session(
    socket: WebSocket,
    state: AppState,
    slug: String,
    lookback: Option<String>,
) {
    // The manager can disappear between the upgrade check and here; treat
    // that as an immediate disconnect.
    let Ok(manager) = state.registry.get(&slug).await else {
        return;
    };

    let (sender, mut receiver) = socket.split();
    let mut facade = WsFacade::new(sender);
    if facade
        .send_server_info(&format!("Bridge {slug}"))
        .await
        .is_err()
    {
        return;
    }

    let mut session = match manager.attach(&mut facade, lookback.as_deref()).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(slug = %slug, error = %err, "attach failed");
            return;
        }
    };
    tracing::info!(slug = %slug, "client session opened");

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let parsed = match protocol::parse_client_message(text.as_str()) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            tracing::debug!(slug = %slug, error = %err, "undecodable client frame");
                            continue;
                        }
                    };
                    match parsed {
                        Some(ClientMessage::Subscribe { subscriptions }) => {
                            for subscription in subscriptions {
                                let channel_id = subscription.channel_id;
                                if session.topic_of(channel_id).is_none() {
                                    tracing::debug!(
                                        slug = %slug,
                                        channel = channel_id,
                                        "subscribe to unknown channel",
                                    );
                                    continue;
                                }
                                facade.subscribe(subscription.id, channel_id);
                                if session.replay(channel_id, &mut facade).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(ClientMessage::Unsubscribe { subscription_ids }) => {
                            facade.unsubscribe(&subscription_ids);
                        }
                        None => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(slug = %slug, error = %err, "client socket error");
                    break;
                }
            },
            event = session.next_event() => match event {
                Some(event) => {
                    if session.apply_event(event, &mut facade).await.is_err() {
                        break;
                    }
                }
                // Manager torn down; end the session.
                None => break,
            },
        }
    }

    tracing::info!(slug = %slug, "client session closed");
}

/// Downstream subprotocol facade over one client socket.
///
/// Assigns server channel ids, rewrites advertises to them, and delivers
/// message frames only for channels the client subscribed to.
struct WsFacade {
    sender: SplitSink<WebSocket, Message>,
    next_channel_id: ServerChannelId,
    /// Server channel id → the subscription id the client chose.
    subscriptions: HashMap<ServerChannelId, SubscriptionId>,
}

impl WsFacade {
    fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender,
            next_channel_id: 0,
            subscriptions: HashMap::new(),
        }
    }

    async fn send_server_info(&mut self, name: &str) -> Result<()> {
        self.send_op(&ServerMessage::ServerInfo {
            name: name.to_string(),
            capabilities: Vec::new(),
        })
        .await
    }

    fn subscribe(&mut self, subscription_id: SubscriptionId, channel_id: ServerChannelId) {
        self.subscriptions.insert(channel_id, subscription_id);
    }

    fn unsubscribe(&mut self, subscription_ids: &[SubscriptionId]) {
        self.subscriptions
            .retain(|_, id| !subscription_ids.contains(id));
    }

    async fn send_op(&mut self, message: &ServerMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| Error::ClientGone)
    }
}

#[async_trait]
impl ClientSink for WsFacade {
    async fn add_channel(&mut self, channel: &ChannelInfo) -> Result<ServerChannelId> {
        self.next_channel_id += 1;
        let id = self.next_channel_id;
        let mut advertised = channel.clone();
        advertised.id = id;
        self.send_op(&ServerMessage::Advertise {
            channels: vec![advertised],
        })
        .await?;
        Ok(id)
    }

    async fn send_message(
        &mut self,
        server_channel_id: ServerChannelId,
        log_time_ns: u64,
        payload: &[u8],
    ) -> Result<()> {
        // Not subscribed: nothing to deliver.
        let Some(&subscription_id) = self.subscriptions.get(&server_channel_id) else {
            return Ok(());
        };
        let frame = protocol::encode_message_data(subscription_id, log_time_ns, payload);
        self.sender
            .send(Message::Binary(frame))
            .await
            .map_err(|_| Error::ClientGone)
    }

    async fn remove_channel(&mut self, server_channel_id: ServerChannelId) -> Result<()> {
        self.subscriptions.remove(&server_channel_id);
        self.send_op(&ServerMessage::Unadvertise {
            channel_ids: vec![server_channel_id],
        })
        .await
    }
}
