use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BlockflowError, Result};
use crate::storage::DataFormat;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Storages to register up front, in addition to those named by `run`.
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_url")]
    pub url: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            url: default_metadata_url(),
        }
    }
}

fn default_metadata_url() -> String { "sqlite://:memory:".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Namespaces searched, in order, when a key has no namespace.
    #[serde(default)]
    pub namespace_precedence: Vec<String>,
    /// Fall back to schemas generated by earlier runs.
    #[serde(default = "default_global_schema_lookup")]
    pub use_global_schema_lookup: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace_precedence: Vec::new(),
            use_global_schema_lookup: default_global_schema_lookup(),
        }
    }
}

fn default_global_schema_lookup() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub url: String,
}

/// Per-run execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Storage emitted blocks are written to. Defaults to the local storage.
    #[serde(default)]
    pub target_storage: Option<String>,
    /// Scratch storage emits are staged in before conversion.
    #[serde(default = "default_local_storage")]
    pub local_storage: String,
    /// Overrides the target storage's natural format.
    #[serde(default)]
    pub target_format: Option<DataFormat>,
    /// Storages input blocks may be read from. Empty admits all.
    #[serde(default)]
    pub storages: Vec<String>,
    #[serde(default)]
    pub execution_timelimit_seconds: Option<u64>,
    #[serde(default = "default_abort_on_function_error")]
    pub abort_on_function_error: bool,
    #[serde(default = "default_run_until_inputs_exhausted")]
    pub run_until_inputs_exhausted: bool,
    #[serde(default)]
    pub result_handler: ResultHandlerConfig,
    #[serde(default = "default_compute_record_counts")]
    pub compute_record_counts: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_storage: None,
            local_storage: default_local_storage(),
            target_format: None,
            storages: Vec::new(),
            execution_timelimit_seconds: None,
            abort_on_function_error: default_abort_on_function_error(),
            run_until_inputs_exhausted: default_run_until_inputs_exhausted(),
            result_handler: ResultHandlerConfig::default(),
            compute_record_counts: default_compute_record_counts(),
        }
    }
}

fn default_local_storage() -> String { "memory://_local".to_string() }
fn default_abort_on_function_error() -> bool { false }
fn default_run_until_inputs_exhausted() -> bool { false }
fn default_compute_record_counts() -> bool { true }

impl RunConfig {
    pub fn target_storage_url(&self) -> &str {
        self.target_storage.as_deref().unwrap_or(&self.local_storage)
    }

    /// Every storage url this run touches, deduplicated.
    pub fn storage_urls(&self) -> Vec<String> {
        let mut urls = vec![self.local_storage.clone()];
        for url in std::iter::once(self.target_storage_url().to_string())
            .chain(self.storages.iter().cloned())
        {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }
}

/// How finished runs are handed off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultHandlerConfig {
    /// Persist into the metadata store.
    #[default]
    Metadata,
    /// Log the result.
    Debug,
    /// POST the result as JSON.
    RemoteCallback {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String { "blockflow=info,warn".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BlockflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| BlockflowError::Config(e.to_string()))
    }

    /// Storage urls from `[[storages]]` and `[run]`, deduplicated.
    pub fn all_storage_urls(&self) -> Vec<String> {
        let mut urls = self.run.storage_urls();
        for s in &self.storages {
            if !urls.contains(&s.url) {
                urls.push(s.url.clone());
            }
        }
        urls
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
