//! Configuration file loading.
//!
//! ```toml
//! [execution]
//! mode = "cache"
//! timeout = 60
//! exclude_patterns = ["drafts/*"]
//! cache_path = ".cellar_cache"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use cellar_core::ExecutionConfig;
use serde::Deserialize;

/// File looked up in the current directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "cellar.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    execution: ExecutionConfig,
}

/// Load the configuration from `path`, or from `cellar.toml` if it exists.
pub fn load(path: Option<&Path>) -> anyhow::Result<ExecutionConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.is_file() {
                return Ok(ExecutionConfig::default());
            }
            default
        }
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let config = parse(&content, base)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn parse(content: &str, base: &Path) -> anyhow::Result<ExecutionConfig> {
    let file: SettingsFile = toml::from_str(content)?;
    let mut config = file.execution;

    config.cache_path = base.join(&config.cache_path);
    config.artifact_dir = config.artifact_dir.map(|p| base.join(p));
    config.report_dir = config.report_dir.map(|p| base.join(p));
    config.kernel_paths = config.kernel_paths.iter().map(|p| base.join(p)).collect();

    config.validate()?;
    Ok(config)
}
