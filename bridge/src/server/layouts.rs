//! Layout descriptor storage and the routes that mutate the retained set.
//!
//! Descriptors are opaque blobs at `{layouts_dir}/{name}.json`; the
//! retained-set metadata lives in `{layouts_dir}/index.json`. Every
//! mutation re-syncs the registry against the updated index.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use common::Clock;

use crate::error::{Error, Result};
use crate::model::{parse_index, LayoutEntry};

use super::error::ApiError;
use super::AppState;

/// Filesystem store for layout descriptors and the retained-set index.
pub struct LayoutStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LayoutStore {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().into()
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    /// Path for a layout descriptor; rejects names that escape the
    /// directory or collide with the index.
    fn descriptor_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == "index"
            || name.contains(['/', '\\'])
            || name.contains("..")
        {
            return Err(Error::LayoutNotFound(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Reads the retained-set index, migrating the legacy form. A missing
    /// file is an empty set.
    pub async fn read_index(&self) -> Result<Vec<LayoutEntry>> {
        match tokio::fs::read(self.index_path()).await {
            Ok(raw) => Ok(parse_index(&raw, self.now())?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_index(&self, entries: &[LayoutEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(self.index_path(), raw).await?;
        Ok(())
    }

    pub async fn read_descriptor(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.descriptor_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::LayoutNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write_descriptor(&self, name: &str, blob: &[u8]) -> Result<()> {
        let path = self.descriptor_path(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, blob).await?;
        Ok(())
    }

    pub async fn descriptor_exists(&self, name: &str) -> Result<bool> {
        let path = self.descriptor_path(name)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    pub async fn delete_descriptor(&self, name: &str) -> Result<()> {
        let path = self.descriptor_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::LayoutNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Applies `mutate` to the named entry, creating it if absent, bumps
    /// `updatedAt`, persists, and returns the full index.
    pub async fn upsert_entry<F>(&self, name: &str, mutate: F) -> Result<Vec<LayoutEntry>>
    where
        F: FnOnce(&mut LayoutEntry),
    {
        let now = self.now();
        let mut entries = self.read_index().await?;
        let entry = match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry,
            None => {
                entries.push(LayoutEntry::new(name, now));
                entries.last_mut().expect("just pushed")
            }
        };
        mutate(entry);
        entry.updated_at = now;
        self.write_index(&entries).await?;
        Ok(entries)
    }

    /// Removes the named entry, persists, and returns the full index.
    pub async fn remove_entry(&self, name: &str) -> Result<Vec<LayoutEntry>> {
        let mut entries = self.read_index().await?;
        entries.retain(|e| e.name != name);
        self.write_index(&entries).await?;
        Ok(entries)
    }
}

/// Strips the required `.json` suffix from a `/layouts/{file}` segment.
fn layout_name(file: &str) -> std::result::Result<&str, ApiError> {
    file.strip_suffix(".json")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::LayoutNotFound(file.to_string()).into())
}

/// Applies the `X-Layout-*` headers to a retained-set entry. Absent
/// headers leave their field untouched; empty values unset it.
fn apply_layout_headers(entry: &mut LayoutEntry, headers: &HeaderMap) {
    if let Some(value) = headers.get("x-layout-target").and_then(|v| v.to_str().ok()) {
        let trimmed = value.trim();
        entry.target = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    if let Some(value) = headers
        .get("x-layout-retention")
        .and_then(|v| v.to_str().ok())
    {
        entry.retention = Some(value.trim() == "true");
    }
    if let Some(value) = headers.get("x-layout-topics").and_then(|v| v.to_str().ok()) {
        let topics: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        entry.topics = (!topics.is_empty()).then_some(topics);
    }
}

/// Handle GET /layouts/{name}.json
pub async fn get_layout(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
) -> std::result::Result<Response, ApiError> {
    let name = layout_name(&file)?;
    let blob = state.store.read_descriptor(name).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        blob,
    )
        .into_response())
}

/// Handle PUT /layouts/{name}.json
pub async fn put_layout(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let name = layout_name(&file)?;
    state.store.write_descriptor(name, &body).await?;
    let entries = state
        .store
        .upsert_entry(name, |entry| apply_layout_headers(entry, &headers))
        .await?;
    state.registry.sync(&entries).await;
    Ok(Json(json!({ "ok": true })))
}

/// Handle DELETE /layouts/{name}.json
pub async fn delete_layout(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let name = layout_name(&file)?;
    state.store.delete_descriptor(name).await?;
    let entries = state.store.remove_entry(name).await?;
    state.registry.sync(&entries).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RetentionRequest {
    pub enabled: bool,
}

/// Handle POST /api/layouts/{name}/retention
pub async fn post_retention(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(request): Json<RetentionRequest>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    if !state.store.descriptor_exists(&name).await? {
        return Err(Error::LayoutNotFound(name).into());
    }
    let entries = state
        .store
        .upsert_entry(&name, |entry| entry.retention = Some(request.enabled))
        .await?;
    state.registry.sync(&entries).await;
    Ok(Json(json!({ "ok": true })))
}

/// Handle GET /layouts/index.json
pub async fn get_index(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<LayoutEntry>>, ApiError> {
    Ok(Json(state.store.read_index().await?))
}

/// Handle GET /-/healthy
pub async fn handle_healthy() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MockClock;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LayoutStore {
        LayoutStore::new(dir.path(), Arc::new(MockClock::new()))
    }

    #[tokio::test]
    async fn should_return_empty_index_when_file_missing() {
        // given
        let dir = TempDir::new().unwrap();

        // then
        assert!(store(&dir).read_index().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_round_trip_descriptors() {
        // given
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // when
        store.write_descriptor("demo", br#"{"panels":[]}"#).await.unwrap();

        // then
        let blob = store.read_descriptor("demo").await.unwrap();
        assert_eq!(blob, br#"{"panels":[]}"#);

        // and deletion makes it unknown again
        store.delete_descriptor("demo").await.unwrap();
        assert!(matches!(
            store.read_descriptor("demo").await,
            Err(Error::LayoutNotFound(_))
        ));
    }

    #[tokio::test]
    async fn should_reject_escaping_names() {
        // given
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // then traversal and reserved names are refused
        assert!(store.read_descriptor("../etc/passwd").await.is_err());
        assert!(store.read_descriptor("a/b").await.is_err());
        assert!(store.read_descriptor("index").await.is_err());
        assert!(store.read_descriptor("").await.is_err());
    }

    #[tokio::test]
    async fn should_upsert_and_persist_entries() {
        // given
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // when a new entry is created and mutated
        store
            .upsert_entry("demo", |entry| {
                entry.target = Some("ws://up:8765".to_string());
                entry.retention = Some(true);
            })
            .await
            .unwrap();

        // then a fresh read sees it
        let entries = store.read_index().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "demo");
        assert!(entries[0].retained());
    }

    #[tokio::test]
    async fn should_migrate_legacy_index_on_read() {
        // given a legacy array-of-strings index on disk
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("index.json"), br#"["old-layout"]"#)
            .await
            .unwrap();

        // when
        let entries = store(&dir).read_index().await.unwrap();

        // then
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "old-layout");
        assert!(!entries[0].retained());
    }

    #[test]
    fn should_strip_json_suffix_from_path_segment() {
        assert_eq!(layout_name("demo.json").unwrap(), "demo");
        assert!(layout_name("demo").is_err());
        assert!(layout_name(".json").is_err());
    }

    #[test]
    fn should_apply_layout_headers() {
        // given
        let mut entry = LayoutEntry::new("demo", Utc::now());
        let mut headers = HeaderMap::new();
        headers.insert("x-layout-target", " ws://up:8765 ".parse().unwrap());
        headers.insert("x-layout-retention", "true".parse().unwrap());
        headers.insert("x-layout-topics", "/a, /b ,".parse().unwrap());

        // when
        apply_layout_headers(&mut entry, &headers);

        // then values are trimmed and split
        assert_eq!(entry.target.as_deref(), Some("ws://up:8765"));
        assert_eq!(entry.retention, Some(true));
        assert_eq!(
            entry.topics,
            Some(vec!["/a".to_string(), "/b".to_string()])
        );
    }

    #[test]
    fn should_unset_fields_for_empty_header_values() {
        // given an entry with everything set
        let mut entry = LayoutEntry::new("demo", Utc::now());
        entry.target = Some("ws://up:8765".to_string());
        entry.topics = Some(vec!["/a".to_string()]);

        let mut headers = HeaderMap::new();
        headers.insert("x-layout-target", "".parse().unwrap());
        headers.insert("x-layout-topics", " , ".parse().unwrap());

        // when
        apply_layout_headers(&mut entry, &headers);

        // then empty values unset the fields
        assert_eq!(entry.target, None);
        assert_eq!(entry.topics, None);
    }
}
