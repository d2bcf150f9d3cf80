//! Core data types for the bridge.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream-assigned channel identifier.
pub type ChannelId = u64;

/// Locally-assigned subscription identifier on the upstream session.
pub type SubscriptionId = u32;

/// Channel identifier assigned by a client-facing session facade.
pub type ServerChannelId = u64;

/// Derives a stable identifier from a target URL.
///
/// Lowercased, with every run of non-alphanumeric characters collapsed to a
/// single `-` and leading/trailing `-` trimmed. Used as the per-target
/// directory name and as the `/ws/{slug}` path component.
pub fn slug_from_url(url: &str) -> String {
    let mut slug = String::with_capacity(url.len());
    let mut pending_dash = false;
    for c in url.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// An upstream telemetry source retained for recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub slug: String,
    /// `None` accepts every advertised topic.
    pub topic_filter: Option<HashSet<String>>,
}

impl Target {
    pub fn new(url: impl Into<String>, topic_filter: Option<HashSet<String>>) -> Self {
        let url = url.into();
        let slug = slug_from_url(&url);
        Self {
            url,
            slug,
            topic_filter,
        }
    }
}

/// An advertised channel: a `(topic, schema)` binding with an upstream id.
///
/// Descriptors are open-ended; fields we do not model are preserved in
/// `extra` and passed through to session facades and the segment writer
/// metadata untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub topic: String,
    /// Message payload encoding, e.g. `json`, `cdr`.
    pub encoding: String,
    pub schema_name: String,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One entry of the retained-set descriptor (`{layouts_dir}/index.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutEntry {
    pub name: String,
    /// Upstream URL; absent disables the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Absent or `false` disables recording.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<bool>,
    /// Topic whitelist; absent accepts all topics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LayoutEntry {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            target: None,
            retention: None,
            topics: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this entry asks for a running recorder.
    pub fn retained(&self) -> bool {
        self.target.is_some() && self.retention == Some(true)
    }

    pub fn topic_filter(&self) -> Option<HashSet<String>> {
        self.topics
            .as_ref()
            .map(|topics| topics.iter().cloned().collect())
    }
}

/// Parses the retained-set index, migrating the legacy array-of-names form
/// by synthesising `createdAt = updatedAt = now`.
pub fn parse_index(raw: &[u8], now: DateTime<Utc>) -> serde_json::Result<Vec<LayoutEntry>> {
    match serde_json::from_slice::<Vec<LayoutEntry>>(raw) {
        Ok(entries) => Ok(entries),
        Err(_) => {
            let names: Vec<String> = serde_json::from_slice(raw)?;
            Ok(names
                .into_iter()
                .map(|name| LayoutEntry::new(name, now))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_slugify_urls() {
        assert_eq!(slug_from_url("ws://robot-1:8765"), "ws-robot-1-8765");
        assert_eq!(slug_from_url("WS://Up.example/8765/"), "ws-up-example-8765");
        assert_eq!(slug_from_url("---"), "");
    }

    #[test]
    fn should_collapse_runs_of_separators() {
        // given a url with consecutive non-alphanumeric characters
        let slug = slug_from_url("ws://a//b");

        // then runs collapse to a single dash
        assert_eq!(slug, "ws-a-b");
    }

    #[test]
    fn should_parse_channel_descriptor_with_unknown_fields() {
        // given
        let raw = r#"{
            "id": 7,
            "topic": "/a",
            "encoding": "json",
            "schemaName": "X",
            "schema": "{}",
            "vendorHint": {"k": 1}
        }"#;

        // when
        let channel: ChannelInfo = serde_json::from_str(raw).unwrap();

        // then
        assert_eq!(channel.id, 7);
        assert_eq!(channel.topic, "/a");
        assert_eq!(channel.schema_encoding, None);
        assert!(channel.extra.contains_key("vendorHint"));

        // and unknown fields survive re-serialisation
        let round: serde_json::Value = serde_json::to_value(&channel).unwrap();
        assert_eq!(round["vendorHint"]["k"], 1);
    }

    #[test]
    fn should_parse_modern_index() {
        // given
        let raw = br#"[{"name":"demo","target":"ws://up:8765","retention":true,
            "topics":["/a"],"createdAt":"2024-01-01T00:00:00Z",
            "updatedAt":"2024-01-02T00:00:00Z"}]"#;

        // when
        let entries = parse_index(raw, Utc::now()).unwrap();

        // then
        assert_eq!(entries.len(), 1);
        assert!(entries[0].retained());
        assert_eq!(
            entries[0].topic_filter(),
            Some(["/a".to_string()].into_iter().collect())
        );
    }

    #[test]
    fn should_migrate_legacy_index() {
        // given the legacy array-of-strings form
        let raw = br#"["alpha","beta"]"#;
        let now = Utc::now();

        // when
        let entries = parse_index(raw, now).unwrap();

        // then names become full entries with synthesised timestamps
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "alpha");
        assert_eq!(entries[0].created_at, now);
        assert_eq!(entries[0].updated_at, now);
        assert!(!entries[0].retained());
    }

    #[test]
    fn should_not_retain_without_target_or_flag() {
        // given
        let mut entry = LayoutEntry::new("demo", Utc::now());
        assert!(!entry.retained());

        entry.target = Some("ws://up:8765".to_string());
        assert!(!entry.retained());

        entry.retention = Some(false);
        assert!(!entry.retained());

        // when retention is granted
        entry.retention = Some(true);

        // then
        assert!(entry.retained());
    }
}
