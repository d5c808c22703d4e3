//! Kernel discovery and name resolution.
//!
//! Kernels are installed as directories holding a `kernel.json`:
//!
//! ```text
//! <search path>/
//! └── python3/
//!     └── kernel.json   {"argv": [...], "display_name": "...", "language": "..."}
//! ```
//!
//! The directory name is the kernel name. Search paths are consulted in
//! order: configured paths, `CELLAR_KERNEL_PATH`, then the user data dir.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::KernelAlias;
use crate::error::{Error, KernelError, Result};

/// Environment variable holding extra kernel search paths.
pub const KERNEL_PATH_ENV: &str = "CELLAR_KERNEL_PATH";

/// File name of a kernel specification.
pub const KERNEL_SPEC_FILE: &str = "kernel.json";

/// Contents of a `kernel.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecFile {
    /// Command line launching the kernel.
    pub argv: Vec<String>,

    /// Human readable name.
    #[serde(default)]
    pub display_name: String,

    /// Language the kernel executes.
    #[serde(default)]
    pub language: String,

    /// Extra environment for the kernel process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A kernel found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKernel {
    /// Kernel name (its directory name).
    pub name: String,
    /// Directory holding `kernel.json`.
    pub resource_dir: PathBuf,
    /// Parsed specification.
    pub spec: KernelSpecFile,
}

/// Ordered kernel-name alias table.
///
/// Patterns are anchored so they must match the whole name; the first
/// matching entry wins. Compiled once per configuration and owned by the
/// caller, so no regex state is shared between threads implicitly.
#[derive(Debug, Clone, Default)]
pub struct KernelAliases {
    rules: Vec<(Regex, String)>,
}

impl KernelAliases {
    /// Compile an alias table.
    pub fn compile(aliases: &[KernelAlias]) -> Result<Self> {
        let rules = aliases
            .iter()
            .map(|alias| {
                Regex::new(&format!("^(?:{})$", alias.pattern))
                    .map(|re| (re, alias.name.clone()))
                    .map_err(|e| {
                        Error::Config(format!(
                            "invalid kernel alias pattern '{}': {}",
                            alias.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Resolve a kernel name through the alias table.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        for (pattern, replacement) in &self.rules {
            if pattern.is_match(name) {
                tracing::debug!("Replaced kernel name: '{}' -> '{}'", name, replacement);
                return replacement;
            }
        }
        name
    }
}

/// Locates installed kernels.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    search_paths: Vec<PathBuf>,
}

impl KernelRegistry {
    /// Registry over exactly the given search paths.
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Registry over `extra` followed by the standard locations.
    pub fn with_default_paths(extra: &[PathBuf]) -> Self {
        let mut search_paths = extra.to_vec();

        if let Some(env_paths) = std::env::var_os(KERNEL_PATH_ENV) {
            search_paths.extend(std::env::split_paths(&env_paths));
        }

        if let Some(data_dir) = dirs::data_dir() {
            search_paths.push(data_dir.join("cellar").join("kernels"));
        }

        Self { search_paths }
    }

    /// Directories searched, in order.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find a kernel by name. The first search path holding it wins.
    pub fn find(&self, name: &str) -> std::result::Result<InstalledKernel, KernelError> {
        for dir in &self.search_paths {
            let resource_dir = dir.join(name);
            let spec_path = resource_dir.join(KERNEL_SPEC_FILE);
            if !spec_path.is_file() {
                continue;
            }
            let spec = read_spec(&spec_path).map_err(|reason| KernelError::Start {
                kernel: name.to_string(),
                reason,
            })?;
            return Ok(InstalledKernel {
                name: name.to_string(),
                resource_dir,
                spec,
            });
        }

        Err(KernelError::Start {
            kernel: name.to_string(),
            reason: format!(
                "no such kernel installed (searched {})",
                self.search_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }

    /// List all installed kernels, earlier search paths shadowing later ones.
    pub fn list(&self) -> Vec<InstalledKernel> {
        let mut found: BTreeMap<String, InstalledKernel> = BTreeMap::new();

        for dir in &self.search_paths {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let resource_dir = entry.path();
                let Some(name) = resource_dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if found.contains_key(name) {
                    continue;
                }
                match read_spec(&resource_dir.join(KERNEL_SPEC_FILE)) {
                    Ok(spec) => {
                        found.insert(
                            name.to_string(),
                            InstalledKernel {
                                name: name.to_string(),
                                resource_dir: resource_dir.clone(),
                                spec,
                            },
                        );
                    }
                    Err(reason) => {
                        tracing::debug!("Skipping kernel dir {}: {}", resource_dir.display(), reason);
                    }
                }
            }
        }

        found.into_values().collect()
    }
}

fn read_spec(path: &Path) -> std::result::Result<KernelSpecFile, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let spec: KernelSpecFile =
        serde_json::from_str(&content).map_err(|e| format!("{}: {}", path.display(), e))?;
    if spec.argv.is_empty() {
        return Err(format!("{}: empty argv", path.display()));
    }
    Ok(spec)
}
