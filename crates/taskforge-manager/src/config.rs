use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Operator-maintained bot roster (`config/bots.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotsConfig {
    /// Users allowed to talk to any bot. A bot with no allowed users is
    /// never started.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    #[serde(default)]
    pub bots: Vec<BotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEntry {
    pub bot_id: String,
    pub token: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub bot_name: Option<String>,
}

impl BotsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    fn allowed_user_ids(&self) -> Vec<i64> {
        self.allowed_users.iter().copied().filter(|id| *id > 0).collect()
    }

    /// The desired worker set: bots flagged active, carrying a token, with at
    /// least one globally allowed user.
    pub fn desired_bots(&self) -> Vec<&BotEntry> {
        if self.allowed_user_ids().is_empty() {
            return Vec::new();
        }
        self.bots
            .iter()
            .filter(|bot| bot.active && !bot.bot_id.trim().is_empty() && !bot.token.trim().is_empty())
            .collect()
    }

    pub fn allowed_users_csv(&self) -> String {
        self.allowed_user_ids()
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(tmp: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
        let path = tmp.path().join("bots.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn load_and_filter_desired_bots() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
allowed_users: [100, 200, 0]
bots:
  - bot_id: alpha
    token: "t-alpha"
    active: true
  - bot_id: beta
    token: "t-beta"
    active: false
  - bot_id: gamma
    token: ""
    active: true
"#,
        );
        let config = BotsConfig::load(&path).unwrap();
        let desired = config.desired_bots();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].bot_id, "alpha");
        assert_eq!(config.allowed_users_csv(), "100,200");
    }

    #[test]
    fn no_allowed_users_means_no_workers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
allowed_users: []
bots:
  - bot_id: alpha
    token: "t-alpha"
    active: true
"#,
        );
        let config = BotsConfig::load(&path).unwrap();
        assert!(config.desired_bots().is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(BotsConfig::load(&tmp.path().join("absent.yaml")).is_err());
    }
}
