//! Builders for test jobs and executor settings.

#![allow(dead_code)]

use std::time::Duration;

use docflow::jobs::NewJob;
use docflow::worker::ExecutorSettings;

/// Builder for `NewJob` with test-friendly defaults.
pub struct JobBuilder {
    id: String,
    group_id: String,
    blob_ref: String,
    max_attempts: Option<u32>,
}

impl JobBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            group_id: "eng-1".to_string(),
            blob_ref: format!("uploads/{}.txt", id),
            max_attempts: None,
        }
    }

    pub fn group(mut self, group_id: &str) -> Self {
        self.group_id = group_id.to_string();
        self
    }

    pub fn blob(mut self, blob_ref: &str) -> Self {
        self.blob_ref = blob_ref.to_string();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn build(self) -> NewJob {
        let job = NewJob::new(self.id, self.group_id, self.blob_ref);
        match self.max_attempts {
            Some(n) => job.with_max_attempts(n),
            None => job,
        }
    }
}

/// Builder for `ExecutorSettings`.
pub struct SettingsBuilder {
    settings: ExecutorSettings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: ExecutorSettings::default(),
        }
    }

    pub fn lease(mut self, secs: u64) -> Self {
        self.settings.lease_duration = Duration::from_secs(secs);
        self
    }

    pub fn renew_every(mut self, secs: u64) -> Self {
        self.settings.renew_interval = Duration::from_secs(secs);
        self
    }

    pub fn retry_via_redelivery(mut self) -> Self {
        self.settings.retry_via_redelivery = true;
        self
    }

    pub fn build(self) -> ExecutorSettings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
