//! Config loading and startup validation.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::schema::NiBotConfig;
use crate::utils::get_data_path;

/// Aggregate configuration error: every problem found, in one failure, so
/// operators fix the file in one pass.
#[derive(Debug, thiserror::Error)]
#[error("configuration errors:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
pub struct ConfigError(pub Vec<String>);

pub fn default_config_path() -> PathBuf {
    get_data_path().join("config.json")
}

/// Load the config file, falling back to defaults when absent. A malformed
/// file is an error — silently running with defaults would mask it.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<NiBotConfig> {
    let path = path.map(PathBuf::from).unwrap_or_else(default_config_path);
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(NiBotConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let config = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
    Ok(config)
}

/// Deployment-level checks, separate from the serde schema. Returns every
/// problem found; the composition root merges these with the scheduler's
/// cron validation into one `ConfigError`.
pub fn startup_errors(config: &NiBotConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if !config.providers.any_configured() {
        errors.push(
            "no provider configured: set at least one apiKey or apiBase under providers.{name}"
                .into(),
        );
    }

    for job in &config.schedules {
        if job.id.is_empty() {
            errors.push(format!("schedule with prompt '{}' has no id", job.prompt));
        }
        if job.cron.is_empty() {
            errors.push(format!("schedule '{}': empty cron expression", job.id));
        }
    }

    let level = config.log.level.to_lowercase();
    let valid = ["trace", "debug", "info", "warn", "error"];
    if !valid.iter().any(|v| level.starts_with(v) || level.contains('=')) {
        errors.push(format!(
            "log.level '{}' invalid, expected one of {valid:?} or an env-filter directive",
            config.log.level
        ));
    }

    if config.rate_limit.enabled
        && config.rate_limit.per_user_rpm == 0
        && config.rate_limit.per_channel_rpm == 0
    {
        errors.push("rateLimit.enabled=true but both rpm limits are 0".into());
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ScheduledJob;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.agent.name, "NiBot");
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_load_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"agent": {"name": "TestBot"}}"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.agent.name, "TestBot");
    }

    #[test]
    fn test_startup_errors_no_provider() {
        let config = NiBotConfig::default();
        let errors = startup_errors(&config);
        assert!(errors.iter().any(|e| e.contains("no provider configured")));
    }

    #[test]
    fn test_startup_errors_all_collected() {
        let mut config = NiBotConfig::default();
        config.schedules.push(ScheduledJob {
            id: String::new(),
            cron: String::new(),
            prompt: "p".into(),
            ..Default::default()
        });
        config.log.level = "loud".into();
        let errors = startup_errors(&config);
        // provider + job id + empty cron + log level, all reported at once
        assert!(errors.len() >= 4);
    }

    #[test]
    fn test_startup_ok_with_provider() {
        let mut config = NiBotConfig::default();
        config.providers.openai.api_key = "sk-test".into();
        assert!(startup_errors(&config).is_empty());
    }

    #[test]
    fn test_config_error_lists_everything() {
        let err = ConfigError(vec!["first problem".into(), "second problem".into()]);
        let text = err.to_string();
        assert!(text.contains("first problem"));
        assert!(text.contains("second problem"));
    }
}
