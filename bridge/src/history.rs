//! Disk history: discovery and filtered reads of closed segments.
//!
//! Used when a client attaches: segment files whose hour could overlap the
//! requested window are read oldest-first into a per-topic backlog, which
//! the session replays ahead of ring and live content.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};

use crate::config::SEGMENT_EXT;
use crate::error::{Error, Result};
use crate::ring::{RingBuffer, RingEntry};

/// A closed segment file and the UTC hour it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub key: String,
    pub start: DateTime<Utc>,
}

/// Parses a `YYYYMMDD_HH` segment key into the hour it starts.
pub fn parse_segment_key(key: &str) -> Option<DateTime<Utc>> {
    let (date, hour) = key.split_once('_')?;
    if date.len() != 8 || hour.len() != 2 {
        return None;
    }
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let hour: u32 = hour.parse().ok()?;
    let start = date.and_hms_opt(hour, 0, 0)?;
    Some(start.and_utc())
}

/// Lists closed segments that could hold messages at or after
/// `earliest_ms`, oldest first. The currently-open segment and files that
/// do not look like segments are excluded. A missing directory is empty.
pub async fn overlapping_segments(
    dir: &Path,
    earliest_ms: u64,
    open_key: Option<&str>,
) -> Vec<SegmentFile> {
    let mut segments = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return segments;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if open_key == Some(key) {
            continue;
        }
        let Some(start) = parse_segment_key(key) else {
            continue;
        };
        // A segment covers up to one hour from its start.
        let end_ms = (start.timestamp_millis() as u64).saturating_add(3_600_000);
        if end_ms >= earliest_ms {
            let key = key.to_string();
            segments.push(SegmentFile {
                path,
                key,
                start,
            });
        }
    }

    segments.sort_by_key(|s| s.start);
    segments
}

/// Messages read from disk for replay, grouped by topic and sorted by
/// `log_time_ns` ascending within each topic.
#[derive(Debug, Default)]
pub struct DiskBacklog {
    by_topic: HashMap<String, Vec<RingEntry>>,
}

impl DiskBacklog {
    pub fn entries(&self, topic: &str) -> &[RingEntry] {
        self.by_topic.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

/// Reads one closed segment, appending matching messages to the backlog.
///
/// A message is accepted when its log time is inside the window, its topic
/// is in the snapshot set, and it predates the ring's earliest entry for
/// that topic (the ring serves everything from that point on).
fn read_segment(
    segment: &SegmentFile,
    buf: &[u8],
    earliest_ns: u64,
    topics: &HashSet<String>,
    ring: &RingBuffer,
    into: &mut HashMap<String, Vec<RingEntry>>,
) -> Result<()> {
    let corrupt = |reason: String| Error::CorruptSegment {
        path: segment.path.display().to_string(),
        reason,
    };

    let stream = mcap::MessageStream::new(buf).map_err(|e| corrupt(e.to_string()))?;
    let mut accepted: HashMap<String, Vec<RingEntry>> = HashMap::new();
    for message in stream {
        let message = message.map_err(|e| corrupt(e.to_string()))?;
        if message.log_time < earliest_ns {
            continue;
        }
        let topic = &message.channel.topic;
        if !topics.contains(topic) {
            continue;
        }
        if let Some(ring_earliest) = ring.earliest(topic) {
            if message.log_time >= ring_earliest {
                continue;
            }
        }
        accepted.entry(topic.clone()).or_default().push(RingEntry {
            log_time_ns: message.log_time,
            payload: Bytes::from(message.data.into_owned()),
        });
    }

    // Only merge once the whole file parsed; a truncated file contributes
    // nothing rather than a partial tail.
    for (topic, mut entries) in accepted {
        into.entry(topic).or_default().append(&mut entries);
    }
    Ok(())
}

/// Builds the disk backlog for a session window.
///
/// Best-effort: corrupt or unreadable files are skipped with a warning and
/// the remaining files still contribute.
pub async fn load_backlog(
    dir: &Path,
    earliest_ns: u64,
    topics: &HashSet<String>,
    ring: &RingBuffer,
    open_key: Option<&str>,
) -> DiskBacklog {
    let earliest_ms = earliest_ns / 1_000_000;
    let segments = overlapping_segments(dir, earliest_ms, open_key).await;

    let mut by_topic: HashMap<String, Vec<RingEntry>> = HashMap::new();
    for segment in &segments {
        let buf = match tokio::fs::read(&segment.path).await {
            Ok(buf) => buf,
            Err(err) => {
                tracing::warn!(
                    path = %segment.path.display(),
                    error = %err,
                    "skipping unreadable segment",
                );
                continue;
            }
        };
        if let Err(err) = read_segment(segment, &buf, earliest_ns, topics, ring, &mut by_topic) {
            tracing::warn!(path = %segment.path.display(), error = %err, "skipping segment");
        }
    }

    // Segments are visited oldest-first but within a file order is
    // per-channel; each topic gets one final sort.
    for entries in by_topic.values_mut() {
        entries.sort_by_key(|e| e.log_time_ns);
    }

    DiskBacklog { by_topic }
}
