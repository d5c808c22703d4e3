//! Execution configuration supplied by the host build.
//!
//! All fields have defaults, so a host can deserialize a partial table
//! (e.g. a `[execution]` section of a TOML file) straight into
//! [`ExecutionConfig`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Default timeout per cell, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default regex for names accepted by inline evaluation.
pub const DEFAULT_EVAL_NAME_REGEX: &str = r"^[a-zA-Z_][a-zA-Z0-9_]*$";

/// Default cache directory name.
pub const DEFAULT_CACHE_DIR: &str = ".cellar_cache";

/// How notebooks are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Never execute; use the outputs stored in the notebook.
    Off,
    /// Always execute.
    Force,
    /// Execute only if some code cell has no outputs.
    #[default]
    Auto,
    /// Like `cache`, but a miss only executes when outputs are missing.
    Lazy,
    /// Execute on cache miss, reuse cached outputs on hit.
    Cache,
    /// Execute cell by cell while the document is rendered.
    Inline,
}

impl ExecutionMode {
    /// The configuration spelling of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Off => "off",
            ExecutionMode::Force => "force",
            ExecutionMode::Auto => "auto",
            ExecutionMode::Lazy => "lazy",
            ExecutionMode::Cache => "cache",
            ExecutionMode::Inline => "inline",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(ExecutionMode::Off),
            "force" => Ok(ExecutionMode::Force),
            "auto" => Ok(ExecutionMode::Auto),
            "lazy" => Ok(ExecutionMode::Lazy),
            "cache" => Ok(ExecutionMode::Cache),
            "inline" => Ok(ExecutionMode::Inline),
            other => Err(Error::Config(format!(
                "unknown execution mode '{}' (expected off, force, auto, lazy, cache or inline)",
                other
            ))),
        }
    }
}

/// One entry of the kernel-name alias table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAlias {
    /// Regex that must match the whole kernel name.
    pub pattern: String,
    /// Replacement kernel name.
    pub name: String,
}

/// Configuration consumed by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Execution mode.
    pub mode: ExecutionMode,

    /// Per-cell timeout in seconds; `None` (or a negative value) means no limit.
    #[serde(deserialize_with = "deserialize_timeout")]
    pub timeout: Option<u64>,

    /// Record cell errors and keep going instead of aborting the notebook.
    pub allow_errors: bool,

    /// Fail the build on a notebook execution error instead of warning.
    pub raise_on_error: bool,

    /// Append the traceback to execution failure warnings.
    pub show_traceback: bool,

    /// POSIX glob patterns of notebooks never to execute.
    pub exclude_patterns: Vec<String>,

    /// Location of the cache store.
    pub cache_path: PathBuf,

    /// Execute in a temporary working directory instead of the notebook's directory.
    pub in_temp: bool,

    /// Where artifacts are materialised; defaults to the notebook's directory.
    pub artifact_dir: Option<PathBuf>,

    /// Ordered kernel-name aliases; the first full match wins.
    pub kernel_aliases: Vec<KernelAlias>,

    /// Extra kernelspec search directories, searched first.
    pub kernel_paths: Vec<PathBuf>,

    /// Names accepted by inline evaluation.
    pub eval_name_regex: String,

    /// Merge stream outputs of the same name after execution.
    pub merge_streams: bool,

    /// Directory receiving `<doc>.err.log` files for failed notebooks.
    pub report_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            timeout: Some(DEFAULT_TIMEOUT_SECS),
            allow_errors: false,
            raise_on_error: false,
            show_traceback: false,
            exclude_patterns: Vec::new(),
            cache_path: PathBuf::from(DEFAULT_CACHE_DIR),
            in_temp: false,
            artifact_dir: None,
            kernel_aliases: Vec::new(),
            kernel_paths: Vec::new(),
            eval_name_regex: DEFAULT_EVAL_NAME_REGEX.to_string(),
            merge_streams: false,
            report_dir: None,
        }
    }
}

impl ExecutionConfig {
    /// Create a configuration with the given mode and defaults otherwise.
    pub fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Global timeout as a duration.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Compile the exclusion patterns.
    ///
    /// `*` does not cross a `/`. A pattern without a leading `/` is anchored
    /// at the end of the path, so `skip_*.ipynb` also excludes
    /// `guide/skip_me.ipynb`.
    pub fn exclusion_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            let anchored = if pattern.starts_with('/') || pattern.starts_with("**/") {
                pattern.clone()
            } else {
                format!("**/{}", pattern)
            };
            let glob = GlobBuilder::new(&anchored)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    Error::Config(format!("invalid exclude pattern '{}': {}", pattern, e))
                })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| Error::Config(format!("invalid exclude patterns: {}", e)))
    }

    /// Compile the inline evaluation name regex.
    pub fn eval_name_matcher(&self) -> Result<Regex> {
        Regex::new(&self.eval_name_regex).map_err(|e| {
            Error::Config(format!(
                "invalid eval name regex '{}': {}",
                self.eval_name_regex, e
            ))
        })
    }

    /// Check that every pattern in the configuration compiles.
    pub fn validate(&self) -> Result<()> {
        self.exclusion_set()?;
        self.eval_name_matcher()?;
        crate::kernel::KernelAliases::compile(&self.kernel_aliases)?;
        Ok(())
    }
}

/// Accept `timeout = -1` (and any negative value) as "no limit".
fn deserialize_timeout<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.and_then(|secs| u64::try_from(secs).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.mode, ExecutionMode::Auto);
        assert_eq!(config.timeout_duration(), Some(Duration::from_secs(30)));
        assert!(!config.allow_errors);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: ExecutionConfig =
            serde_json::from_str(r#"{"mode": "cache", "timeout": -1, "allow_errors": true}"#)
                .unwrap();
        assert_eq!(config.mode, ExecutionMode::Cache);
        assert_eq!(config.timeout, None);
        assert!(config.allow_errors);
        assert_eq!(config.cache_path, PathBuf::from(DEFAULT_CACHE_DIR));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("lazy".parse::<ExecutionMode>().unwrap(), ExecutionMode::Lazy);
        assert!("sometimes".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::Inline.to_string(), "inline");
    }

    #[test]
    fn test_exclusion_matches_path_suffix() {
        let config = ExecutionConfig {
            exclude_patterns: vec!["skip_*.ipynb".to_string(), "drafts/*".to_string()],
            ..Default::default()
        };
        let set = config.exclusion_set().unwrap();
        assert!(set.is_match("skip_me.ipynb"));
        assert!(set.is_match("guide/skip_me.ipynb"));
        assert!(set.is_match("/docs/guide/skip_me.ipynb"));
        assert!(set.is_match("guide/drafts/wip.ipynb"));
        assert!(!set.is_match("guide/keep.ipynb"));
        // `*` stays within one path component
        assert!(!set.is_match("drafts/old/wip.ipynb"));

        let config = ExecutionConfig {
            exclude_patterns: vec!["/docs/*.ipynb".to_string()],
            ..Default::default()
        };
        let set = config.exclusion_set().unwrap();
        assert!(set.is_match("/docs/a.ipynb"));
        assert!(!set.is_match("/other/docs/a.ipynb"));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let config = ExecutionConfig {
            exclude_patterns: vec!["[".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ExecutionConfig {
            eval_name_regex: "(".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
