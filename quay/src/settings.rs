//! Administrative control-plane settings: pauses and cron switches.
//!
//! The scheduler only reads these rows; they are written by operators
//! through [`Settings`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::job::JobRecord;
use crate::store::SettingStore;

/// Setting key holding the [`Pauses`] record.
pub const PAUSES_KEY: &str = "pauses";
/// Setting key listing cron keys switched on.
pub const CRON_ENABLED_KEY: &str = "cron_keys_enabled";
/// Setting key listing cron keys switched off.
pub const CRON_DISABLED_KEY: &str = "cron_keys_disabled";

/// What a pause applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PauseTarget {
    Queue(String),
    JobClass(String),
    Label(String),
}

/// Queues, job classes and labels that workers must not start.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pauses {
    pub queues: BTreeSet<String>,
    pub job_classes: BTreeSet<String>,
    pub labels: BTreeSet<String>,
}

impl Pauses {
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.job_classes.is_empty() && self.labels.is_empty()
    }

    /// Whether the job may not be claimed.
    pub fn blocks(&self, job: &JobRecord) -> bool {
        self.queues.contains(&job.queue_name)
            || self.job_classes.contains(&job.job_class)
            || job.labels.iter().any(|label| self.labels.contains(label))
    }

    fn set_mut(&mut self, target: &PauseTarget) -> (&mut BTreeSet<String>, String) {
        match target {
            PauseTarget::Queue(name) => (&mut self.queues, name.clone()),
            PauseTarget::JobClass(name) => (&mut self.job_classes, name.clone()),
            PauseTarget::Label(name) => (&mut self.labels, name.clone()),
        }
    }
}

/// Read the current pauses from a setting store.
pub async fn load_pauses<St: SettingStore + ?Sized>(store: &St) -> anyhow::Result<Pauses> {
    match store.get_setting(PAUSES_KEY).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Pauses::default()),
    }
}

/// Operator handle over the settings rows.
#[derive(Debug)]
pub struct Settings<St> {
    store: Arc<St>,
}

impl<St> Clone for Settings<St> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<St: SettingStore> Settings<St> {
    pub fn new(store: Arc<St>) -> Self {
        Self { store }
    }

    pub async fn pauses(&self) -> anyhow::Result<Pauses> {
        load_pauses(self.store.as_ref()).await
    }

    /// Stop workers from starting matching jobs. Returns false if already paused.
    pub async fn pause(&self, target: PauseTarget) -> anyhow::Result<bool> {
        let mut pauses = self.pauses().await?;
        let (set, name) = pauses.set_mut(&target);
        if !set.insert(name) {
            return Ok(false);
        }
        self.store
            .put_setting(PAUSES_KEY, serde_json::to_value(&pauses)?)
            .await?;
        tracing::info!(target = ?target, "paused");
        Ok(true)
    }

    /// Returns false if the target was not paused.
    pub async fn unpause(&self, target: PauseTarget) -> anyhow::Result<bool> {
        let mut pauses = self.pauses().await?;
        let (set, name) = pauses.set_mut(&target);
        if !set.remove(&name) {
            return Ok(false);
        }
        if pauses.is_empty() {
            self.store.delete_setting(PAUSES_KEY).await?;
        } else {
            self.store
                .put_setting(PAUSES_KEY, serde_json::to_value(&pauses)?)
                .await?;
        }
        tracing::info!(target = ?target, "unpaused");
        Ok(true)
    }

    pub async fn enable_cron(&self, key: &str) -> anyhow::Result<()> {
        self.switch_cron(key, CRON_ENABLED_KEY, CRON_DISABLED_KEY).await
    }

    pub async fn disable_cron(&self, key: &str) -> anyhow::Result<()> {
        self.switch_cron(key, CRON_DISABLED_KEY, CRON_ENABLED_KEY).await
    }

    /// Whether the cron entry may fire, given its default when no override exists.
    pub async fn cron_enabled(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        if self.key_list(CRON_DISABLED_KEY).await?.contains(key) {
            return Ok(false);
        }
        if self.key_list(CRON_ENABLED_KEY).await?.contains(key) {
            return Ok(true);
        }
        Ok(default)
    }

    async fn switch_cron(&self, key: &str, add_to: &str, remove_from: &str) -> anyhow::Result<()> {
        let mut removed = self.key_list(remove_from).await?;
        if removed.remove(key) {
            self.store
                .put_setting(remove_from, serde_json::to_value(&removed)?)
                .await?;
        }

        let mut added = self.key_list(add_to).await?;
        if added.insert(key.to_string()) {
            self.store
                .put_setting(add_to, serde_json::to_value(&added)?)
                .await?;
        }
        Ok(())
    }

    async fn key_list(&self, setting: &str) -> anyhow::Result<BTreeSet<String>> {
        match self.store.get_setting(setting).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(BTreeSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapSettings {
        rows: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl SettingStore for MapSettings {
        async fn get_setting(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(self.rows.lock().get(key).cloned())
        }

        async fn put_setting(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
            self.rows.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete_setting(&self, key: &str) -> anyhow::Result<bool> {
            Ok(self.rows.lock().remove(key).is_some())
        }
    }

    #[tokio::test]
    async fn test_pause_and_unpause() {
        let settings = Settings::new(Arc::new(MapSettings::default()));

        assert!(settings.pause(PauseTarget::Queue("mice".into())).await.unwrap());
        assert!(!settings.pause(PauseTarget::Queue("mice".into())).await.unwrap());
        assert!(settings.pause(PauseTarget::Label("slow".into())).await.unwrap());

        let pauses = settings.pauses().await.unwrap();
        let mut job = NewJob::new("Example", serde_json::json!({}))
            .queue("mice")
            .into_record(Utc::now());
        assert!(pauses.blocks(&job));
        job.queue_name = "elephants".into();
        assert!(!pauses.blocks(&job));
        job.labels = vec!["slow".into()];
        assert!(pauses.blocks(&job));

        assert!(settings.unpause(PauseTarget::Queue("mice".into())).await.unwrap());
        assert!(settings.unpause(PauseTarget::Label("slow".into())).await.unwrap());
        assert!(!settings.unpause(PauseTarget::Label("slow".into())).await.unwrap());
        assert!(settings.pauses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cron_overrides() {
        let settings = Settings::new(Arc::new(MapSettings::default()));

        assert!(settings.cron_enabled("nightly", true).await.unwrap());
        assert!(!settings.cron_enabled("nightly", false).await.unwrap());

        settings.disable_cron("nightly").await.unwrap();
        assert!(!settings.cron_enabled("nightly", true).await.unwrap());

        settings.enable_cron("nightly").await.unwrap();
        assert!(settings.cron_enabled("nightly", false).await.unwrap());
    }
}
