//! Reconciliation between the retained-set descriptor and running managers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use common::Clock;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manager::TargetManager;
use crate::model::{slug_from_url, LayoutEntry, Target};

/// Owns the set of running [`TargetManager`]s.
pub struct TargetRegistry {
    config: Config,
    clock: Arc<dyn Clock>,
    managers: RwLock<HashMap<String, Arc<TargetManager>>>,
}

impl TargetRegistry {
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Reconciles the running set against the desired set. Idempotent:
    /// re-syncing an unchanged set starts and stops nothing.
    ///
    /// One target's failure to stop cleanly never affects the others.
    pub async fn sync(&self, desired: &[LayoutEntry]) {
        let mut enabled: HashMap<String, Target> = HashMap::new();
        for entry in desired {
            if !entry.retained() {
                continue;
            }
            let Some(url) = entry.target.as_deref() else {
                continue;
            };
            let target = Target::new(url, entry.topic_filter());
            if target.slug.is_empty() {
                tracing::warn!(layout = %entry.name, url, "target url yields empty slug, skipping");
                continue;
            }
            if let Some(previous) = enabled.insert(target.slug.clone(), target) {
                tracing::warn!(
                    slug = %previous.slug,
                    "duplicate slug in retained set, later entry wins",
                );
            }
        }

        let mut to_stop = Vec::new();
        {
            let mut managers = self.managers.write().await;

            managers.retain(|slug, manager| {
                if enabled.contains_key(slug) {
                    true
                } else {
                    to_stop.push(manager.clone());
                    false
                }
            });

            for (slug, target) in enabled {
                match managers.get(&slug) {
                    Some(manager) => {
                        if manager.topic_filter().await != target.topic_filter {
                            manager.set_topic_filter(target.topic_filter.clone()).await;
                        }
                    }
                    None => {
                        let manager =
                            TargetManager::start(target, &self.config, self.clock.clone());
                        managers.insert(slug, manager);
                    }
                }
            }
        }

        for manager in to_stop {
            manager.stop().await;
        }
    }

    /// Resolves a slug to its running manager. Never starts one: starting
    /// is driven only by [`sync`](Self::sync).
    pub async fn get(&self, slug: &str) -> Result<Arc<TargetManager>> {
        self.managers
            .read()
            .await
            .get(slug)
            .cloned()
            .ok_or_else(|| Error::UnknownSlug(slug.to_string()))
    }

    /// Stops every running manager. Used on process shutdown.
    pub async fn shutdown(&self) {
        let managers: Vec<Arc<TargetManager>> =
            self.managers.write().await.drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::MockClock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(name: &str, target: Option<&str>, retention: bool, topics: Option<&[&str]>) -> LayoutEntry {
        let mut entry = LayoutEntry::new(name, Utc::now());
        entry.target = target.map(|t| t.to_string());
        entry.retention = Some(retention);
        entry.topics = topics.map(|list| list.iter().map(|t| t.to_string()).collect());
        entry
    }

    fn registry(dir: &TempDir) -> TargetRegistry {
        let config = Config {
            layouts_dir: dir.path().join("layouts"),
            data_dir: dir.path().join("data"),
            port: 0,
            max_ring_age: Duration::from_secs(900),
            retention: Duration::from_secs(7 * 86_400),
        };
        TargetRegistry::new(config, Arc::new(MockClock::new()))
    }

    #[tokio::test]
    async fn should_start_managers_for_retained_entries_only() {
        // given
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let desired = vec![
            entry("demo", Some("ws://127.0.0.1:9"), true, None),
            entry("paused", Some("ws://127.0.0.1:10"), false, None),
            entry("orphan", None, true, None),
        ];

        // when
        registry.sync(&desired).await;

        // then only the retained entry with a target runs
        assert!(registry.get("ws-127-0-0-1-9").await.is_ok());
        assert!(registry.get("ws-127-0-0-1-10").await.is_err());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn should_be_idempotent_across_syncs() {
        // given a synced set
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let desired = vec![entry("demo", Some("ws://127.0.0.1:9"), true, Some(&["/a"]))];
        registry.sync(&desired).await;
        let first = registry.get("ws-127-0-0-1-9").await.unwrap();

        // when the identical set syncs again
        registry.sync(&desired).await;

        // then the same manager instance is still running with the same filter
        let second = registry.get("ws-127-0-0-1-9").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            second.topic_filter().await,
            Some(["/a".to_string()].into_iter().collect())
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn should_stop_managers_that_leave_the_set() {
        // given
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry
            .sync(&[entry("demo", Some("ws://127.0.0.1:9"), true, None)])
            .await;
        assert!(registry.get("ws-127-0-0-1-9").await.is_ok());

        // when the entry loses retention
        registry
            .sync(&[entry("demo", Some("ws://127.0.0.1:9"), false, None)])
            .await;

        // then its manager is gone
        assert!(matches!(
            registry.get("ws-127-0-0-1-9").await,
            Err(Error::UnknownSlug(_))
        ));
    }

    #[tokio::test]
    async fn should_update_filter_without_restarting_manager() {
        // given a running manager filtered to /a
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry
            .sync(&[entry("demo", Some("ws://127.0.0.1:9"), true, Some(&["/a"]))])
            .await;
        let before = registry.get("ws-127-0-0-1-9").await.unwrap();

        // when the filter changes to /b
        registry
            .sync(&[entry("demo", Some("ws://127.0.0.1:9"), true, Some(&["/b"]))])
            .await;

        // then the same manager carries the new filter
        let after = registry.get("ws-127-0-0-1-9").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(
            after.topic_filter().await,
            Some(["/b".to_string()].into_iter().collect())
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn should_never_auto_start_on_get() {
        // given an empty registry
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        // then lookup fails rather than starting anything
        assert!(registry.get("anything").await.is_err());
    }
}
