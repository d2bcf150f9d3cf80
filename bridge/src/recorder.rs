//! On-disk recording: segment files, hourly rotation, retention.
//!
//! A [`Recorder`] owns at most one open [`SegmentWriter`]. Segment files are
//! indexed MCAP logs named `YYYYMMDD_HH.mcap` after the UTC hour of their
//! first write; rotation happens lazily on the first message of a new hour.
//! Retention is a periodic best-effort sweep deleting segments older than
//! the configured horizon.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use common::Clock;

use crate::config::{SEGMENT_EXT, SWEEP_INTERVAL};
use crate::error::Result;
use crate::model::{ChannelId, ChannelInfo};

/// Formats the segment key for an instant: `YYYYMMDD_HH` in UTC.
pub fn segment_key(instant: SystemTime) -> String {
    let utc: DateTime<Utc> = instant.into();
    utc.format("%Y%m%d_%H").to_string()
}

/// Maps a message encoding to the schema encoding implied by convention,
/// for upstreams that omit an explicit schema encoding.
pub fn infer_schema_encoding(message_encoding: &str) -> &'static str {
    match message_encoding {
        "json" => "jsonschema",
        "ros1" => "ros1msg",
        "cdr" => "ros2msg",
        _ => "text",
    }
}

/// Append-only writer over one open segment file.
///
/// Schema registration is idempotent per `(name, encoding)` within the
/// file; channel registration always assigns a fresh id.
pub struct SegmentWriter {
    writer: Option<mcap::Writer<BufWriter<File>>>,
    schemas: HashMap<(String, String), u16>,
}

impl SegmentWriter {
    /// Creates the file and emits the header record.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let writer = mcap::WriteOptions::new()
            .profile("")
            .create(BufWriter::new(file))?;
        Ok(Self {
            writer: Some(writer),
            schemas: HashMap::new(),
        })
    }

    fn writer(&mut self) -> Result<&mut mcap::Writer<BufWriter<File>>> {
        self.writer.as_mut().ok_or(crate::error::Error::SegmentClosed)
    }

    /// Registers a schema, reusing the id assigned to an identical
    /// `(name, encoding)` pair earlier in this file.
    pub fn register_schema(&mut self, name: &str, encoding: &str, data: &[u8]) -> Result<u16> {
        if let Some(&id) = self.schemas.get(&(name.to_string(), encoding.to_string())) {
            return Ok(id);
        }
        let id = self.writer()?.add_schema(name, encoding, data)?;
        self.schemas
            .insert((name.to_string(), encoding.to_string()), id);
        Ok(id)
    }

    /// Registers a channel under an already-registered schema.
    pub fn register_channel(
        &mut self,
        schema_id: u16,
        topic: &str,
        message_encoding: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<u16> {
        Ok(self
            .writer()?
            .add_channel(schema_id, topic, message_encoding, metadata)?)
    }

    /// Appends one message to the current chunk.
    pub fn add_message(
        &mut self,
        channel_id: u16,
        sequence: u32,
        log_time_ns: u64,
        publish_time_ns: u64,
        payload: &[u8],
    ) -> Result<()> {
        self.writer()?.write_to_known_channel(
            &mcap::records::MessageHeader {
                channel_id,
                sequence,
                log_time: log_time_ns,
                publish_time: publish_time_ns,
            },
            payload,
        )?;
        Ok(())
    }

    /// Flushes the last chunk and writes the summary section. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to finalise segment on drop");
        }
    }
}

/// Recording state for one target.
///
/// Owned by the target's connector task, which is the single writer.
/// `open_key` is shared with the history loader so replay can exclude the
/// segment currently being written.
pub struct Recorder {
    dir: PathBuf,
    slug: String,
    clock: Arc<dyn Clock>,
    writer: Option<SegmentWriter>,
    current_key: Option<String>,
    open_key: Arc<RwLock<Option<String>>>,
    /// Channels known upstream, re-registered into each new segment.
    known: HashMap<ChannelId, ChannelInfo>,
    /// Upstream channel id → id within the current segment.
    segment_channels: HashMap<ChannelId, u16>,
    /// Next sequence number per segment channel, from 1.
    sequences: HashMap<u16, u32>,
    /// Topics already logged for write failures in the current segment.
    warned_topics: HashSet<String>,
}

impl Recorder {
    pub fn new(data_dir: &Path, slug: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: data_dir.join(slug),
            slug: slug.to_string(),
            clock,
            writer: None,
            current_key: None,
            open_key: Arc::new(RwLock::new(None)),
            known: HashMap::new(),
            segment_channels: HashMap::new(),
            sequences: HashMap::new(),
            warned_topics: HashSet::new(),
        }
    }

    /// Directory holding this target's segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shared view of the currently-open segment key.
    pub fn open_key_handle(&self) -> Arc<RwLock<Option<String>>> {
        self.open_key.clone()
    }

    /// Opens the segment for the current hour.
    pub fn start(&mut self) {
        let key = segment_key(self.clock.now());
        self.open_segment(key);
    }

    /// Records a newly-advertised channel for re-registration on rotation.
    pub fn channel_advertised(&mut self, channel: &ChannelInfo) {
        self.known.insert(channel.id, channel.clone());
    }

    pub fn channel_unadvertised(&mut self, channel_id: ChannelId) {
        self.known.remove(&channel_id);
    }

    /// Writes one message, rotating first if the UTC hour has changed.
    ///
    /// Best-effort: failures are logged (once per segment per topic) and
    /// swallowed so that ring storage and live fan-out are unaffected.
    pub fn write(&mut self, channel_id: ChannelId, log_time_ns: u64, payload: &[u8]) {
        let key = segment_key(self.clock.now());
        if self.current_key.as_deref() != Some(key.as_str()) {
            self.rotate(key);
        }
        if self.writer.is_none() || !self.known.contains_key(&channel_id) {
            return;
        }

        if let Err(err) = self.write_inner(channel_id, log_time_ns, payload) {
            let topic = self
                .known
                .get(&channel_id)
                .map(|c| c.topic.clone())
                .unwrap_or_default();
            if self.warned_topics.insert(topic.clone()) {
                tracing::warn!(
                    slug = %self.slug,
                    topic = %topic,
                    error = %err,
                    "dropping message persistence for current segment",
                );
            }
        }
    }

    fn write_inner(&mut self, channel_id: ChannelId, log_time_ns: u64, payload: &[u8]) -> Result<()> {
        let segment_channel = match self.segment_channels.get(&channel_id) {
            Some(&id) => id,
            None => {
                let channel = self
                    .known
                    .get(&channel_id)
                    .cloned()
                    .ok_or(crate::error::Error::SegmentClosed)?;
                let Some(writer) = self.writer.as_mut() else {
                    return Err(crate::error::Error::SegmentClosed);
                };
                let id = Self::register(writer, &channel)?;
                self.segment_channels.insert(channel_id, id);
                id
            }
        };

        let sequence = self.sequences.entry(segment_channel).or_insert(0);
        *sequence += 1;
        let sequence = *sequence;

        let Some(writer) = self.writer.as_mut() else {
            return Err(crate::error::Error::SegmentClosed);
        };
        writer.add_message(segment_channel, sequence, log_time_ns, log_time_ns, payload)
    }

    /// Registers a channel (and its schema) into the given writer.
    fn register(writer: &mut SegmentWriter, channel: &ChannelInfo) -> Result<u16> {
        let schema_encoding = channel
            .schema_encoding
            .clone()
            .unwrap_or_else(|| infer_schema_encoding(&channel.encoding).to_string());
        let schema_id = writer.register_schema(
            &channel.schema_name,
            &schema_encoding,
            channel.schema.as_bytes(),
        )?;

        let mut metadata = BTreeMap::new();
        for (key, value) in &channel.extra {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            metadata.insert(key.clone(), rendered);
        }
        writer.register_channel(schema_id, &channel.topic, &channel.encoding, &metadata)
    }

    fn rotate(&mut self, key: String) {
        self.close_writer();
        self.open_segment(key);

        // The new file must be self-describing: re-register every channel
        // known at rotation time, not just those that receive messages.
        let channels: Vec<ChannelInfo> = self.known.values().cloned().collect();
        for channel in channels {
            let Some(writer) = self.writer.as_mut() else {
                break;
            };
            match Self::register(writer, &channel) {
                Ok(id) => {
                    self.segment_channels.insert(channel.id, id);
                }
                Err(err) => {
                    tracing::warn!(
                        slug = %self.slug,
                        topic = %channel.topic,
                        error = %err,
                        "failed to re-register channel after rotation",
                    );
                }
            }
        }
    }

    fn open_segment(&mut self, key: String) {
        self.segment_channels.clear();
        self.sequences.clear();
        self.warned_topics.clear();

        let path = self.dir.join(format!("{key}.{SEGMENT_EXT}"));
        let writer = std::fs::create_dir_all(&self.dir)
            .map_err(crate::error::Error::from)
            .and_then(|_| SegmentWriter::create(&path));
        match writer {
            Ok(writer) => {
                tracing::info!(slug = %self.slug, segment = %key, "opened segment");
                self.writer = Some(writer);
            }
            Err(err) => {
                tracing::error!(
                    slug = %self.slug,
                    segment = %key,
                    error = %err,
                    "segment unavailable, recording in-memory only until next rotation",
                );
                self.writer = None;
            }
        }
        *self.open_key.write() = Some(key.clone());
        self.current_key = Some(key);
    }

    fn close_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.close() {
                tracing::warn!(slug = %self.slug, error = %err, "error closing segment");
            }
        }
    }

    /// Closes the open segment. Called on manager teardown.
    pub fn close(&mut self) {
        self.close_writer();
        self.current_key = None;
        *self.open_key.write() = None;
    }
}

/// Deletes segment files older than the retention horizon. Best-effort:
/// deletion errors are swallowed and unrelated files are ignored.
pub async fn sweep_expired(dir: &Path, retention: Duration, now: SystemTime) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if expired {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::info!(path = %path.display(), "deleted expired segment"),
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "sweep delete failed")
                }
            }
        }
    }
}

/// Runs the retention sweep for one target directory until cancelled.
pub async fn run_sweeper(
    dir: PathBuf,
    retention: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => sweep_expired(&dir, retention, clock.now()).await,
        }
    }
}
