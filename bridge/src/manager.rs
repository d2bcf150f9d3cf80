//! Per-target composition: connector, ring, recorder, and client sessions.
//!
//! A [`TargetManager`] owns the tasks for one retained upstream source and
//! hands out [`Session`]s to attaching clients. A session replays disk
//! history, then ring history, then forwards live messages, per topic, in
//! non-decreasing timestamp order.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{parse_lookback, Clock};

use crate::config::Config;
use crate::connector::{Connector, ConnectorCommand};
use crate::error::Result;
use crate::history::{self, DiskBacklog};
use crate::model::{ChannelId, ChannelInfo, ServerChannelId, Target};
use crate::recorder::{run_sweeper, Recorder};
use crate::ring::RingBuffer;

/// Capacity of the per-target live event bus. Sessions that fall further
/// behind than this miss messages and log a warning.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Events published by a target's connector to its attached sessions.
#[derive(Debug, Clone)]
pub enum TargetEvent {
    ChannelAdded(Arc<ChannelInfo>),
    ChannelRemoved(ChannelId),
    Message {
        channel_id: ChannelId,
        log_time_ns: u64,
        payload: Bytes,
    },
}

/// State shared between a target's connector task and its sessions.
pub(crate) struct TargetShared {
    /// Channels currently advertised upstream. Written by the connector,
    /// read by sessions at attach time.
    pub(crate) channels: RwLock<HashMap<ChannelId, Arc<ChannelInfo>>>,
    /// Topic whitelist; `None` accepts everything.
    pub(crate) topic_filter: RwLock<Option<HashSet<String>>>,
    pub(crate) ring: RingBuffer,
    pub(crate) events: broadcast::Sender<TargetEvent>,
}

/// The per-client half of a session: the downstream subprotocol facade.
///
/// `add_channel` advertises a channel to the client and returns the
/// server-side id; `send_message` delivers one payload on a previously
/// added channel. Implementations decide what an unsubscribed channel
/// means (the WebSocket facade drops such sends).
#[async_trait]
pub trait ClientSink: Send {
    async fn add_channel(&mut self, channel: &ChannelInfo) -> Result<ServerChannelId>;
    async fn send_message(
        &mut self,
        server_channel_id: ServerChannelId,
        log_time_ns: u64,
        payload: &[u8],
    ) -> Result<()>;

    /// The upstream side withdrew this channel. The server id stays
    /// reserved for the life of the session.
    async fn remove_channel(&mut self, _server_channel_id: ServerChannelId) -> Result<()> {
        Ok(())
    }
}

/// Manager for one retained target.
pub struct TargetManager {
    target: Target,
    dir: PathBuf,
    default_lookback: Duration,
    clock: Arc<dyn Clock>,
    shared: Arc<TargetShared>,
    open_key: Arc<parking_lot::RwLock<Option<String>>>,
    commands: mpsc::Sender<ConnectorCommand>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TargetManager {
    /// Creates the manager and spawns its connector and retention sweeper.
    pub fn start(target: Target, config: &Config, clock: Arc<dyn Clock>) -> Arc<Self> {
        let shared = Arc::new(TargetShared {
            channels: RwLock::new(HashMap::new()),
            topic_filter: RwLock::new(target.topic_filter.clone()),
            ring: RingBuffer::new(config.max_ring_age, clock.clone()),
            events: broadcast::channel(EVENT_BUS_CAPACITY).0,
        });

        let recorder = Recorder::new(&config.data_dir, &target.slug, clock.clone());
        let open_key = recorder.open_key_handle();
        let dir = recorder.dir().to_path_buf();

        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let connector = Connector::new(
            target.url.clone(),
            target.slug.clone(),
            shared.clone(),
            recorder,
            command_rx,
            cancel.child_token(),
        );
        let connector_task = tokio::spawn(connector.run());
        let sweeper_task = tokio::spawn(run_sweeper(
            dir.clone(),
            config.retention,
            clock.clone(),
            cancel.child_token(),
        ));

        tracing::info!(slug = %target.slug, url = %target.url, "target manager started");

        Arc::new(Self {
            target,
            dir,
            default_lookback: config.max_ring_age,
            clock,
            shared,
            open_key,
            commands: command_tx,
            cancel,
            tasks: Mutex::new(vec![connector_task, sweeper_task]),
        })
    }

    pub fn slug(&self) -> &str {
        &self.target.slug
    }

    pub fn url(&self) -> &str {
        &self.target.url
    }

    /// Stops the connector and sweeper, closing the open segment. Waits
    /// for the segment close to complete before returning.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(slug = %self.target.slug, error = %err, "task join failed");
            }
        }
        self.shared.ring.clear();
        self.shared.channels.write().await.clear();
        tracing::info!(slug = %self.target.slug, "target manager stopped");
    }

    /// Replaces the topic whitelist and re-runs subscription reconciliation.
    pub async fn set_topic_filter(&self, filter: Option<HashSet<String>>) {
        *self.shared.topic_filter.write().await = filter;
        // The inbox is only drained while an upstream session is open; a
        // full queue is fine, the next advertise reconciles anyway.
        if self
            .commands
            .try_send(ConnectorCommand::ReconcileFilter)
            .is_err()
        {
            tracing::debug!(slug = %self.target.slug, "connector inbox full or closed");
        }
    }

    pub async fn topic_filter(&self) -> Option<HashSet<String>> {
        self.shared.topic_filter.read().await.clone()
    }

    /// Attaches a client: advertises the current channels into `sink`,
    /// loads the disk backlog for the requested window, and returns the
    /// session that will serve replay and live forwarding.
    ///
    /// `lookback` is the raw client-supplied window; empty or unparseable
    /// values fall back to the configured ring age. Disk history loading
    /// is best-effort: a client may start with partial history.
    pub async fn attach(&self, sink: &mut dyn ClientSink, lookback: Option<&str>) -> Result<Session> {
        // Subscribing to the bus before snapshotting the channel table
        // guarantees a channel advertised concurrently is seen at least
        // once (duplicates are filtered by the session's id map).
        let events = self.shared.events.subscribe();

        let snapshot: Vec<Arc<ChannelInfo>> = {
            let channels = self.shared.channels.read().await;
            channels.values().cloned().collect()
        };

        let mut by_upstream = HashMap::new();
        let mut topics_by_server = HashMap::new();
        let mut snapshot_topics = HashSet::new();
        for channel in &snapshot {
            let server_id = sink.add_channel(channel).await?;
            by_upstream.insert(channel.id, server_id);
            topics_by_server.insert(server_id, channel.topic.clone());
            snapshot_topics.insert(channel.topic.clone());
        }

        let window = lookback
            .filter(|s| !s.is_empty())
            .and_then(|s| match parse_lookback(s) {
                Ok(duration) => Some(duration),
                Err(err) => {
                    tracing::debug!(slug = %self.target.slug, error = %err, "bad lookback, using default");
                    None
                }
            })
            .unwrap_or(self.default_lookback);
        let earliest_ns = self
            .clock
            .now_millis()
            .saturating_sub(window.as_millis() as u64)
            .saturating_mul(1_000_000);

        let open_key = self.open_key.read().clone();
        let backlog = history::load_backlog(
            &self.dir,
            earliest_ns,
            &snapshot_topics,
            &self.shared.ring,
            open_key.as_deref(),
        )
        .await;

        tracing::debug!(
            slug = %self.target.slug,
            channels = snapshot.len(),
            earliest_ns,
            "client attached",
        );

        Ok(Session {
            slug: self.target.slug.clone(),
            earliest_ns,
            by_upstream,
            topics_by_server,
            backlog,
            shared: self.shared.clone(),
            events,
            cancel: self.cancel.child_token(),
            replay_horizon: HashMap::new(),
        })
    }
}

/// One attached client. Dropping the session detaches it: the live event
/// subscription and the subscribe bookkeeping go with it.
pub struct Session {
    slug: String,
    earliest_ns: u64,
    by_upstream: HashMap<ChannelId, ServerChannelId>,
    topics_by_server: HashMap<ServerChannelId, String>,
    backlog: DiskBacklog,
    shared: Arc<TargetShared>,
    events: broadcast::Receiver<TargetEvent>,
    cancel: CancellationToken,
    /// Per topic, the newest timestamp delivered from the ring during
    /// replay. Live events at or below it were already delivered.
    replay_horizon: HashMap<String, u64>,
}

impl Session {
    /// Replays history for one server channel the client subscribed to:
    /// all disk-backlog entries in the window first, then the current ring
    /// snapshot, both in ascending time order.
    pub async fn replay(
        &mut self,
        server_channel_id: ServerChannelId,
        sink: &mut dyn ClientSink,
    ) -> Result<()> {
        let Some(topic) = self.topics_by_server.get(&server_channel_id).cloned() else {
            return Ok(());
        };

        for entry in self.backlog.entries(&topic) {
            if entry.log_time_ns >= self.earliest_ns {
                sink.send_message(server_channel_id, entry.log_time_ns, &entry.payload)
                    .await?;
            }
        }

        let snapshot = self.shared.ring.snapshot(&topic);
        if let Some(last) = snapshot.last() {
            self.replay_horizon.insert(topic.clone(), last.log_time_ns);
        }
        for entry in snapshot {
            if entry.log_time_ns >= self.earliest_ns {
                sink.send_message(server_channel_id, entry.log_time_ns, &entry.payload)
                    .await?;
            }
        }
        Ok(())
    }

    /// Waits for the next live event. `None` means the manager went away
    /// and the session should end.
    pub async fn next_event(&mut self) -> Option<TargetEvent> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.events.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            slug = %self.slug,
                            skipped,
                            "session fell behind the live stream",
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Applies one live event to the client.
    ///
    /// New channels are advertised before any of their messages are
    /// forwarded (bus ordering); unadvertised channels keep their server
    /// id for the life of the session.
    pub async fn apply_event(
        &mut self,
        event: TargetEvent,
        sink: &mut dyn ClientSink,
    ) -> Result<()> {
        match event {
            TargetEvent::ChannelAdded(channel) => {
                if !self.by_upstream.contains_key(&channel.id) {
                    let server_id = sink.add_channel(&channel).await?;
                    self.by_upstream.insert(channel.id, server_id);
                    self.topics_by_server
                        .insert(server_id, channel.topic.clone());
                }
            }
            TargetEvent::ChannelRemoved(channel_id) => {
                // The mapping stays so a re-advertise reuses the same
                // server id; the client just learns the channel went away.
                if let Some(&server_id) = self.by_upstream.get(&channel_id) {
                    sink.remove_channel(server_id).await?;
                }
            }
            TargetEvent::Message {
                channel_id,
                log_time_ns,
                payload,
            } => {
                let Some(&server_id) = self.by_upstream.get(&channel_id) else {
                    return Ok(());
                };
                if let Some(topic) = self.topics_by_server.get(&server_id) {
                    if let Some(&horizon) = self.replay_horizon.get(topic) {
                        // Already delivered from the ring during replay.
                        if log_time_ns <= horizon {
                            return Ok(());
                        }
                    }
                }
                sink.send_message(server_id, log_time_ns, &payload).await?;
            }
        }
        Ok(())
    }

    /// Server channel id for an upstream channel, if advertised into this
    /// session.
    pub fn server_channel(&self, channel_id: ChannelId) -> Option<ServerChannelId> {
        self.by_upstream.get(&channel_id).copied()
    }

    /// Topic behind a server channel id, if this session advertised it.
    pub fn topic_of(&self, server_channel_id: ServerChannelId) -> Option<&str> {
        self.topics_by_server
            .get(&server_channel_id)
            .map(String::as_str)
    }
}

#[cfg(test)]
impl TargetManager {
    /// Test hook: make a channel known without an upstream session.
    pub(crate) async fn inject_channel(&self, channel: ChannelInfo) {
        let channel = Arc::new(channel);
        self.shared
            .channels
            .write()
            .await
            .insert(channel.id, channel.clone());
        let _ = self
            .shared
            .events
            .send(TargetEvent::ChannelAdded(channel));
    }

    /// Test hook: publish a live message as the connector would.
    pub(crate) fn inject_message(&self, channel_id: ChannelId, log_time_ns: u64, payload: &[u8]) {
        let topic = {
            let channels = self.shared.channels.try_read().expect("uncontended in tests");
            channels
                .get(&channel_id)
                .map(|c| c.topic.clone())
                .expect("channel injected")
        };
        self.shared
            .ring
            .push(&topic, log_time_ns, Bytes::copy_from_slice(payload));
        let _ = self.shared.events.send(TargetEvent::Message {
            channel_id,
            log_time_ns,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Test hook: withdraw a channel as an upstream unadvertise would.
    pub(crate) async fn inject_channel_removed(&self, channel_id: ChannelId) {
        self.shared.channels.write().await.remove(&channel_id);
        let _ = self
            .shared
            .events
            .send(TargetEvent::ChannelRemoved(channel_id));
    }
}
