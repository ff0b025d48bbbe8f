//! Configuration loading and schema definitions for the execution core.
//!
//! This module provides types and functions for loading the core's
//! configuration from TOML files or strings: pool-wide settings, driver
//! settings, and per-runtime resource templates.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::function::RuntimeClass;

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g. doesn't exist or permission denied)
/// - The file is not valid TOML or doesn't conform to the schema
/// - A `[runtimes.*]` section names an unknown runtime class or carries an
///   inconsistent pool sizing (see [`validate_config`])
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks cross-field consistency the schema types cannot express.
///
/// Every `[runtimes.*]` key must name a known runtime class, and each
/// template must satisfy `min_warm <= target_warm <= max_total` with
/// `max_total >= 1`.
pub fn validate_config(config: &Config) -> Result<()> {
    for (key, tpl) in &config.runtimes {
        let _: RuntimeClass = key
            .parse()
            .with_context(|| format!("Unknown runtime class in [runtimes.{key}]"))?;

        if tpl.max_total == 0 {
            bail!("[runtimes.{key}] max_total must be at least 1");
        }
        if tpl.min_warm > tpl.target_warm || tpl.target_warm > tpl.max_total {
            bail!(
                "[runtimes.{key}] requires min_warm <= target_warm <= max_total \
                 (got {} <= {} <= {})",
                tpl.min_warm,
                tpl.target_warm,
                tpl.max_total
            );
        }
        if !(tpl.scale_up_factor > 0.0) {
            bail!("[runtimes.{key}] scale_up_factor must be positive");
        }
    }
    Ok(())
}

impl Config {
    /// Resolves the resource template for a runtime class, falling back to
    /// the built-in defaults for runtimes without a configured section.
    pub fn runtime_template(&self, runtime: RuntimeClass) -> RuntimeTemplate {
        self.runtimes.get(runtime.as_str()).cloned().unwrap_or_default()
    }

    /// Resolves the sandbox image for a runtime class.
    pub fn runtime_image(&self, runtime: RuntimeClass) -> String {
        self.runtimes
            .get(runtime.as_str())
            .and_then(|tpl| tpl.image.clone())
            .unwrap_or_else(|| runtime.default_image().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_runtime_key_rejected() {
        let toml = r#"
            [runtimes."ruby3.3"]
            max_total = 4
        "#;
        let err = load_config_str(toml).unwrap_err();
        assert!(err.to_string().contains("ruby3.3"));
    }

    #[test]
    fn inconsistent_sizing_rejected() {
        let toml = r#"
            [runtimes."python3.11"]
            min_warm = 5
            target_warm = 2
            max_total = 10
        "#;
        assert!(load_config_str(toml).is_err());
    }

    #[test]
    fn zero_max_total_rejected() {
        let toml = r#"
            [runtimes."nodejs20"]
            max_total = 0
            target_warm = 0
        "#;
        assert!(load_config_str(toml).is_err());
    }

    #[test]
    fn template_falls_back_to_defaults() {
        let config = load_config_str("").unwrap();
        let tpl = config.runtime_template(RuntimeClass::Go124);
        assert_eq!(tpl.memory_mb, 512);
        assert_eq!(tpl.max_total, 10);
        assert_eq!(config.runtime_image(RuntimeClass::Go124), "nimbus/runtime-go:1.24");
    }

    #[test]
    fn image_override_wins() {
        let toml = r#"
            [runtimes."python3.11"]
            image = "registry.internal/py:3.11-slim"
        "#;
        let config = load_config_str(toml).unwrap();
        assert_eq!(
            config.runtime_image(RuntimeClass::Python311),
            "registry.internal/py:3.11-slim"
        );
    }
}
