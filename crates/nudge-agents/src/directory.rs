//! Baseline and company configuration lookups.
//!
//! The engine only depends on the two traits; the worker serves both from a
//! [`CompanyDirectory`] loaded at startup.

use std::sync::Arc;

use async_trait::async_trait;

use coordination::config::{CompanyConfig, CompanyDirectory};
use coordination::error::EngineResult;
use coordination::state::Baseline;

#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// The active baseline for a company, if one is configured.
    async fn active_baseline(&self, company_id: &str) -> EngineResult<Option<Baseline>>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Tone and thresholds; unknown companies get defaults.
    async fn company_config(&self, company_id: &str) -> EngineResult<CompanyConfig>;
}

/// Both stores backed by an immutable company directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    directory: Arc<CompanyDirectory>,
}

impl DirectoryStore {
    pub fn new(directory: CompanyDirectory) -> Self {
        Self {
            directory: Arc::new(directory),
        }
    }

    pub fn directory(&self) -> &CompanyDirectory {
        &self.directory
    }
}

#[async_trait]
impl BaselineStore for DirectoryStore {
    async fn active_baseline(&self, company_id: &str) -> EngineResult<Option<Baseline>> {
        Ok(self.directory.baseline(company_id).cloned())
    }
}

#[async_trait]
impl ConfigStore for DirectoryStore {
    async fn company_config(&self, company_id: &str) -> EngineResult<CompanyConfig> {
        Ok(self.directory.company(company_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_store_serves_baselines_and_defaults() {
        let directory = CompanyDirectory::from_toml_str(
            r#"
            [[companies]]
            company_id = "acme"
            escalation_threshold = 5

            [[baselines]]
            company_id = "acme"
            event_sequence = [{ event_type = "signup" }, { event_type = "create_project" }]
            "#,
        )
        .unwrap();
        let store = DirectoryStore::new(directory);

        let baseline = store.active_baseline("acme").await.unwrap().unwrap();
        assert_eq!(baseline.event_sequence.len(), 2);
        assert!(store.active_baseline("globex").await.unwrap().is_none());

        assert_eq!(store.company_config("acme").await.unwrap().escalation_threshold, 5);
        let fallback = store.company_config("globex").await.unwrap();
        assert_eq!(fallback.company_id, "globex");
        assert_eq!(fallback.escalation_threshold, 3);
    }
}
