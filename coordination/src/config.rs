//! Company directory: per-company tone, thresholds and baselines
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! dashboard_url = "https://app.example.com"
//!
//! [tracker]
//! idle_threshold_secs = 120
//!
//! [[companies]]
//! company_id = "acme"
//! escalation_threshold = 3
//! confidence_threshold = 0.6
//! tone = { voice = "friendly", formality = "casual", emoji = true }
//!
//! [[baselines]]
//! company_id = "acme"
//! event_sequence = [
//!     { event_type = "signup" },
//!     { event_type = "create_project", label = "Create a project" },
//!     { event_type = "invite_team" },
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::escalation::{DEFAULT_DASHBOARD_URL, DEFAULT_ESCALATION_THRESHOLD};
use crate::router::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::state::{Baseline, CompanyId};
use crate::tracker::TrackerConfig;

/// Allowed range for `escalation_threshold`
pub const ESCALATION_THRESHOLD_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// Voice of generated nudges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// e.g. "friendly", "professional", "playful"
    pub voice: String,
    /// e.g. "casual", "formal"
    pub formality: String,
    pub emoji: bool,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            voice: "friendly".to_string(),
            formality: "casual".to_string(),
            emoji: false,
        }
    }
}

/// Per-company engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub company_id: CompanyId,
    #[serde(default)]
    pub tone: ToneConfig,
    /// Nudges tolerated before escalating (1..=10)
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_escalation_threshold() -> u32 {
    DEFAULT_ESCALATION_THRESHOLD
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl CompanyConfig {
    /// Defaults for a company with no directory entry.
    pub fn new(company_id: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            tone: ToneConfig::default(),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.company_id.trim().is_empty() {
            return Err(EngineError::invalid_config("company_id must not be empty"));
        }
        if !ESCALATION_THRESHOLD_RANGE.contains(&self.escalation_threshold) {
            return Err(EngineError::invalid_config(format!(
                "{}: escalation_threshold {} outside 1..=10",
                self.company_id, self.escalation_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::invalid_config(format!(
                "{}: confidence_threshold {} outside [0, 1]",
                self.company_id, self.confidence_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    dashboard_url: Option<String>,
    #[serde(default)]
    tracker: TrackerConfig,
    #[serde(default)]
    companies: Vec<CompanyConfig>,
    #[serde(default)]
    baselines: Vec<Baseline>,
}

/// Validated company directory
#[derive(Debug, Clone)]
pub struct CompanyDirectory {
    pub dashboard_url: String,
    pub tracker: TrackerConfig,
    companies: HashMap<CompanyId, CompanyConfig>,
    baselines: HashMap<CompanyId, Baseline>,
}

impl Default for CompanyDirectory {
    fn default() -> Self {
        Self {
            dashboard_url: DEFAULT_DASHBOARD_URL.to_string(),
            tracker: TrackerConfig::default(),
            companies: HashMap::new(),
            baselines: HashMap::new(),
        }
    }
}

impl CompanyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let file: DirectoryFile = toml::from_str(content)
            .map_err(|e| EngineError::invalid_config(format!("directory parse error: {}", e)))?;

        let mut directory = Self {
            dashboard_url: file
                .dashboard_url
                .unwrap_or_else(|| DEFAULT_DASHBOARD_URL.to_string()),
            tracker: file.tracker,
            ..Self::default()
        };
        for company in file.companies {
            directory.insert_company(company)?;
        }
        for baseline in file.baselines {
            directory.insert_baseline(baseline)?;
        }
        Ok(directory)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Add or replace a company entry after validating it.
    pub fn insert_company(&mut self, company: CompanyConfig) -> EngineResult<()> {
        company.validate()?;
        if self.companies.contains_key(&company.company_id) {
            return Err(EngineError::invalid_config(format!(
                "duplicate company {}",
                company.company_id
            )));
        }
        self.companies.insert(company.company_id.clone(), company);
        Ok(())
    }

    /// Register a baseline. At most one active baseline per company.
    pub fn insert_baseline(&mut self, baseline: Baseline) -> EngineResult<()> {
        if !baseline.is_active {
            return Ok(());
        }
        if baseline.event_sequence.is_empty() {
            return Err(EngineError::invalid_config(format!(
                "{}: baseline '{}' has no steps",
                baseline.company_id, baseline.name
            )));
        }
        if self.baselines.contains_key(&baseline.company_id) {
            return Err(EngineError::invalid_config(format!(
                "{}: more than one active baseline",
                baseline.company_id
            )));
        }
        self.baselines.insert(baseline.company_id.clone(), baseline);
        Ok(())
    }

    /// Company settings, falling back to defaults for unknown companies.
    pub fn company(&self, company_id: &str) -> CompanyConfig {
        self.companies
            .get(company_id)
            .cloned()
            .unwrap_or_else(|| CompanyConfig::new(company_id))
    }

    pub fn baseline(&self, company_id: &str) -> Option<&Baseline> {
        self.baselines.get(company_id)
    }

    pub fn company_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.companies.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn baselines(&self) -> impl Iterator<Item = &Baseline> {
        self.baselines.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DIRECTORY: &str = r#"
dashboard_url = "https://app.example.com"

[tracker]
idle_threshold_secs = 90

[[companies]]
company_id = "acme"
escalation_threshold = 2
tone = { voice = "playful", formality = "casual", emoji = true }

[[baselines]]
company_id = "acme"
event_sequence = [
    { event_type = "signup" },
    { event_type = "create_project", label = "Create a project" },
    { event_type = "invite_team" },
]
"#;

    #[test]
    fn test_parse_directory() {
        let d = CompanyDirectory::from_toml_str(DIRECTORY).unwrap();
        assert_eq!(d.dashboard_url, "https://app.example.com");
        assert_eq!(d.tracker.idle_threshold_secs, 90);
        assert_eq!(d.tracker.session_timeout_secs, 3_600);

        let acme = d.company("acme");
        assert_eq!(acme.escalation_threshold, 2);
        assert_eq!(acme.confidence_threshold, 0.6);
        assert!(acme.tone.emoji);

        let baseline = d.baseline("acme").unwrap();
        assert_eq!(baseline.event_sequence.len(), 3);
        assert_eq!(baseline.event_sequence[1].display_name(), "Create a project");
    }

    #[test]
    fn test_unknown_company_gets_defaults() {
        let d = CompanyDirectory::from_toml_str(DIRECTORY).unwrap();
        let other = d.company("globex");
        assert_eq!(other.escalation_threshold, 3);
        assert_eq!(other.tone, ToneConfig::default());
        assert!(d.baseline("globex").is_none());
    }

    #[test]
    fn test_threshold_range_is_enforced() {
        for bad in [0, 11] {
            let toml = format!(
                "[[companies]]\ncompany_id = \"acme\"\nescalation_threshold = {}\n",
                bad
            );
            let err = CompanyDirectory::from_toml_str(&toml).unwrap_err();
            assert_eq!(err.code(), "INVALID_CONFIG");
        }
        let err = CompanyDirectory::from_toml_str(
            "[[companies]]\ncompany_id = \"acme\"\nconfidence_threshold = 1.5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn test_second_active_baseline_rejected() {
        let toml = r#"
[[baselines]]
company_id = "acme"
event_sequence = [{ event_type = "signup" }]

[[baselines]]
company_id = "acme"
name = "v2"
event_sequence = [{ event_type = "signup" }]
"#;
        assert!(CompanyDirectory::from_toml_str(toml).is_err());

        let inactive = toml.replace("name = \"v2\"", "name = \"v2\"\nis_active = false");
        assert!(CompanyDirectory::from_toml_str(&inactive).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DIRECTORY.as_bytes()).unwrap();
        let d = CompanyDirectory::load(file.path()).unwrap();
        assert_eq!(d.company_ids(), vec!["acme"]);

        let missing = CompanyDirectory::load("/nonexistent/directory.toml").unwrap_err();
        assert_eq!(missing.code(), "INVALID_CONFIG");
    }
}
