//! Upstream WebSocket connector for one target.
//!
//! The connector owns the upstream session, the subscription bookkeeping,
//! and the target's recorder; it is the single writer of the ring and the
//! segment files. Reconnects are unbounded: 2 s after a session that
//! reached open, 5 s after a failed dial.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::manager::{TargetEvent, TargetShared};
use crate::model::{ChannelId, SubscriptionId};
use crate::protocol::{self, ClientMessage, ServerMessage, Subscription};
use crate::recorder::Recorder;

/// Delay before redialling after a session that reached open.
const RECONNECT_AFTER_CLOSE: Duration = Duration::from_secs(2);
/// Delay before redialling after a failed dial.
const RECONNECT_AFTER_DIAL_FAILURE: Duration = Duration::from_secs(5);

/// Requests serialised onto the connector task.
#[derive(Debug)]
pub(crate) enum ConnectorCommand {
    /// The topic whitelist in the shared state changed; re-run
    /// subscription reconciliation.
    ReconcileFilter,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

pub(crate) struct Connector {
    url: String,
    slug: String,
    shared: Arc<TargetShared>,
    recorder: Recorder,
    commands: mpsc::Receiver<ConnectorCommand>,
    cancel: CancellationToken,
    subscription_by_channel: HashMap<ChannelId, SubscriptionId>,
    channel_by_subscription: HashMap<SubscriptionId, ChannelId>,
    next_subscription_id: SubscriptionId,
}

impl Connector {
    pub(crate) fn new(
        url: String,
        slug: String,
        shared: Arc<TargetShared>,
        recorder: Recorder,
        commands: mpsc::Receiver<ConnectorCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url,
            slug,
            shared,
            recorder,
            commands,
            cancel,
            subscription_by_channel: HashMap::new(),
            channel_by_subscription: HashMap::new(),
            next_subscription_id: 0,
        }
    }

    /// Connect-process-reconnect loop. Returns only on cancellation, after
    /// closing the open segment.
    pub(crate) async fn run(mut self) {
        self.recorder.start();

        while !self.cancel.is_cancelled() {
            let delay = match Self::dial_url(&self.url, &self.cancel).await {
                Ok(Some(ws)) => {
                    tracing::info!(slug = %self.slug, url = %self.url, "upstream connected");
                    if let Err(err) = self.session(ws).await {
                        tracing::warn!(slug = %self.slug, error = %err, "upstream session ended");
                    } else {
                        tracing::info!(slug = %self.slug, "upstream closed");
                    }
                    // Subscriptions die with the socket; the channel table,
                    // ring and open segment survive the disconnect.
                    self.clear_subscriptions();
                    RECONNECT_AFTER_CLOSE
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(slug = %self.slug, url = %self.url, error = %err, "dial failed");
                    RECONNECT_AFTER_DIAL_FAILURE
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.recorder.close();
    }

    /// Opens the upstream socket, offering the subprotocol. `Ok(None)`
    /// means cancellation interrupted the dial.
    async fn dial_url(url: &str, cancel: &CancellationToken) -> Result<Option<WsStream>> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(protocol::SUBPROTOCOL),
        );

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = connect_async(request) => {
                let (ws, _response) = result?;
                Ok(Some(ws))
            }
        }
    }

    /// Processes one open upstream session until close, error, or
    /// cancellation.
    async fn session(&mut self, ws: WsStream) -> Result<()> {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                command = self.commands.recv() => match command {
                    Some(ConnectorCommand::ReconcileFilter) => self.reconcile(&mut sink).await?,
                    // Manager gone; cancellation follows.
                    None => return Ok(()),
                },
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        if !self.handle_frame(message, &mut sink).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Handles one upstream frame; returns `false` when the peer closed.
    async fn handle_frame(&mut self, message: Message, sink: &mut WsSink) -> Result<bool> {
        match message {
            Message::Text(text) => self.handle_text(&text, sink).await?,
            Message::Binary(data) => self.handle_message_data(Bytes::from(data)).await,
            Message::Ping(payload) => sink.send(Message::Pong(payload)).await?,
            Message::Close(_) => return Ok(false),
            _ => {}
        }
        Ok(true)
    }

    async fn handle_text(&mut self, text: &str, sink: &mut WsSink) -> Result<()> {
        // A malformed frame is a transient fault: log it, keep the session.
        let parsed = match protocol::parse_server_message(text) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(slug = %self.slug, error = %err, "undecodable upstream frame");
                return Ok(());
            }
        };

        match parsed {
            Some(ServerMessage::ServerInfo { name, .. }) => {
                tracing::debug!(slug = %self.slug, upstream = %name, "server info");
            }
            Some(ServerMessage::Advertise { channels }) => {
                {
                    let mut table = self.shared.channels.write().await;
                    for channel in channels {
                        tracing::debug!(
                            slug = %self.slug,
                            channel = channel.id,
                            topic = %channel.topic,
                            "channel advertised",
                        );
                        self.recorder.channel_advertised(&channel);
                        let channel = Arc::new(channel);
                        table.insert(channel.id, channel.clone());
                        let _ = self.shared.events.send(TargetEvent::ChannelAdded(channel));
                    }
                }
                self.reconcile(sink).await?;
            }
            Some(ServerMessage::Unadvertise { channel_ids }) => {
                let mut unsubscribe = Vec::new();
                {
                    let mut table = self.shared.channels.write().await;
                    for id in channel_ids {
                        table.remove(&id);
                        self.recorder.channel_unadvertised(id);
                        if let Some(subscription) = self.subscription_by_channel.remove(&id) {
                            self.channel_by_subscription.remove(&subscription);
                            unsubscribe.push(subscription);
                        }
                        let _ = self.shared.events.send(TargetEvent::ChannelRemoved(id));
                    }
                }
                if !unsubscribe.is_empty() {
                    self.send(sink, &ClientMessage::Unsubscribe {
                        subscription_ids: unsubscribe,
                    })
                    .await?;
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Demultiplexes one binary message: ring, recorder, then live fan-out.
    async fn handle_message_data(&mut self, frame: Bytes) {
        let data = match protocol::decode_message_data(&frame) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(slug = %self.slug, error = %err, "undecodable message frame");
                return;
            }
        };

        let Some(&channel_id) = self.channel_by_subscription.get(&data.subscription_id) else {
            tracing::warn!(
                slug = %self.slug,
                subscription = data.subscription_id,
                "message for unknown subscription",
            );
            return;
        };
        let channel = self.shared.channels.read().await.get(&channel_id).cloned();
        let Some(channel) = channel else {
            tracing::warn!(slug = %self.slug, channel = channel_id, "message for unknown channel");
            return;
        };

        // Filter race: a message in flight while the whitelist changed.
        {
            let filter = self.shared.topic_filter.read().await;
            if let Some(filter) = filter.as_ref() {
                if !filter.contains(&channel.topic) {
                    return;
                }
            }
        }

        self.shared
            .ring
            .push(&channel.topic, data.log_time_ns, data.payload.clone());
        self.recorder
            .write(channel_id, data.log_time_ns, &data.payload);
        let _ = self.shared.events.send(TargetEvent::Message {
            channel_id,
            log_time_ns: data.log_time_ns,
            payload: data.payload,
        });
    }

    /// Aligns subscriptions with the whitelist: subscribe to every wanted
    /// channel lacking a subscription, unsubscribe from the rest.
    async fn reconcile(&mut self, sink: &mut WsSink) -> Result<()> {
        let filter = self.shared.topic_filter.read().await.clone();
        let channels: Vec<(ChannelId, String)> = {
            let table = self.shared.channels.read().await;
            table
                .values()
                .map(|c| (c.id, c.topic.clone()))
                .collect()
        };

        let plan = reconcile_plan(&channels, filter.as_ref(), &self.subscription_by_channel);

        if !plan.subscribe.is_empty() {
            let mut subscriptions = Vec::with_capacity(plan.subscribe.len());
            for channel_id in plan.subscribe {
                self.next_subscription_id += 1;
                let id = self.next_subscription_id;
                self.subscription_by_channel.insert(channel_id, id);
                self.channel_by_subscription.insert(id, channel_id);
                subscriptions.push(Subscription { id, channel_id });
            }
            self.send(sink, &ClientMessage::Subscribe { subscriptions })
                .await?;
        }

        if !plan.unsubscribe.is_empty() {
            let mut subscription_ids = Vec::with_capacity(plan.unsubscribe.len());
            for channel_id in plan.unsubscribe {
                if let Some(id) = self.subscription_by_channel.remove(&channel_id) {
                    self.channel_by_subscription.remove(&id);
                    subscription_ids.push(id);
                }
            }
            self.send(sink, &ClientMessage::Unsubscribe { subscription_ids })
                .await?;
        }

        Ok(())
    }

    async fn send(&mut self, sink: &mut WsSink, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    fn clear_subscriptions(&mut self) {
        self.subscription_by_channel.clear();
        self.channel_by_subscription.clear();
    }
}

/// The subscribe/unsubscribe actions needed to restore parity between the
/// whitelist and the current subscription set.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReconcilePlan {
    subscribe: Vec<ChannelId>,
    unsubscribe: Vec<ChannelId>,
}

fn reconcile_plan(
    channels: &[(ChannelId, String)],
    filter: Option<&HashSet<String>>,
    subscribed: &HashMap<ChannelId, SubscriptionId>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for (channel_id, topic) in channels {
        let desired = filter.map_or(true, |f| f.contains(topic));
        let actual = subscribed.contains_key(channel_id);
        if desired && !actual {
            plan.subscribe.push(*channel_id);
        } else if !desired && actual {
            plan.unsubscribe.push(*channel_id);
        }
    }
    plan.subscribe.sort_unstable();
    plan.unsubscribe.sort_unstable();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(topics: &[&str]) -> HashSet<String> {
        topics.iter().map(|t| t.to_string()).collect()
    }

    fn subscribed(ids: &[ChannelId]) -> HashMap<ChannelId, SubscriptionId> {
        ids.iter()
            .enumerate()
            .map(|(i, &id)| (id, i as SubscriptionId + 1))
            .collect()
    }

    fn channels() -> Vec<(ChannelId, String)> {
        vec![(7, "/a".to_string()), (8, "/b".to_string())]
    }

    #[test]
    fn should_subscribe_everything_without_filter() {
        // given no whitelist and no subscriptions
        let plan = reconcile_plan(&channels(), None, &HashMap::new());

        // then every channel is wanted
        assert_eq!(plan.subscribe, vec![7, 8]);
        assert!(plan.unsubscribe.is_empty());
    }

    #[test]
    fn should_subscribe_only_whitelisted_topics() {
        // given
        let plan = reconcile_plan(&channels(), Some(&filter(&["/a"])), &HashMap::new());

        // then
        assert_eq!(plan.subscribe, vec![7]);
        assert!(plan.unsubscribe.is_empty());
    }

    #[test]
    fn should_swap_subscriptions_on_filter_change() {
        // given /a subscribed, whitelist now /b only
        let plan = reconcile_plan(&channels(), Some(&filter(&["/b"])), &subscribed(&[7]));

        // then 7 is dropped and 8 is added
        assert_eq!(plan.subscribe, vec![8]);
        assert_eq!(plan.unsubscribe, vec![7]);
    }

    #[test]
    fn should_be_stable_at_parity() {
        // given subscriptions already match the whitelist
        let plan = reconcile_plan(&channels(), None, &subscribed(&[7, 8]));

        // then no actions are planned
        assert_eq!(plan, ReconcilePlan::default());

        // and the same holds after re-advertisement with no filter change
        let again = reconcile_plan(&channels(), None, &subscribed(&[7, 8]));
        assert_eq!(again, ReconcilePlan::default());
    }

    #[test]
    fn should_unsubscribe_all_when_filter_becomes_empty() {
        // given an explicit empty whitelist
        let plan = reconcile_plan(&channels(), Some(&filter(&[])), &subscribed(&[7, 8]));

        // then everything is dropped
        assert!(plan.subscribe.is_empty());
        assert_eq!(plan.unsubscribe, vec![7, 8]);
    }
}
