//! Configuration management for cpe-mapper

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const NVD_API_KEY_ENV: &str = "NVD_API_KEY";
pub const LLM_API_KEY_ENV: &str = "LLM_API_KEY";
pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub nvd: NvdConfig,
    pub mapping: MappingConfig,
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvdConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub results_per_page: u32,
    pub timeout_seconds: u64,
}

impl Default for NvdConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://services.nvd.nist.gov/rest/json/cpes/2.0".to_string(),
            api_key: None,
            results_per_page: 5,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub prompt_template: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: None,
            timeout_seconds: 30,
            prompt_template: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nvd: NvdConfig::default(),
            mapping: MappingConfig {
                database_path: PathBuf::from("cpe_mappings.db"),
            },
            llm: Some(LlmConfig::default()),
        }
    }
}

impl Config {
    pub fn get_app_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "cpe-mapper", "cpe-mapper")
            .ok_or_else(|| anyhow::anyhow!("Failed to determine application directories"))
    }

    pub fn resolve_paths(&mut self) -> Result<()> {
        let project_dirs = Self::get_app_dirs()?;

        // Resolve database path if relative
        if self.mapping.database_path.is_relative() {
            let data_dir = project_dirs.data_dir();
            std::fs::create_dir_all(data_dir)?;
            self.mapping.database_path = data_dir.join(&self.mapping.database_path);
        }

        Ok(())
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.resolve_paths()?;
        Ok(config)
    }

    pub fn get_default_config_path() -> Result<PathBuf> {
        let project_dirs = Self::get_app_dirs()?;
        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("cpe-mapper.toml"))
    }

    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Environment variables win over the config file, so API keys can be
    /// supplied at deploy time without editing the file on disk.
    pub fn apply_env_overrides(&mut self) {
        if self.nvd.api_key.is_none() {
            if let Ok(key) = std::env::var(NVD_API_KEY_ENV) {
                if !key.is_empty() {
                    self.nvd.api_key = Some(key);
                }
            }
        }

        if let Some(llm) = self.llm.as_mut() {
            if llm.api_key.is_none() {
                if let Ok(key) = std::env::var(LLM_API_KEY_ENV) {
                    if !key.is_empty() {
                        llm.api_key = Some(key);
                    }
                }
            }
        }

        if let Ok(path) = std::env::var(DATABASE_PATH_ENV) {
            if !path.is_empty() {
                self.mapping.database_path = PathBuf::from(path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nvd.endpoint.is_empty() {
            return Err(anyhow::anyhow!("NVD endpoint must not be empty"));
        }

        if !(1..=100).contains(&self.nvd.results_per_page) {
            return Err(anyhow::anyhow!(
                "results_per_page must be between 1 and 100"
            ));
        }

        if let Some(llm) = &self.llm {
            if llm.enabled && llm.endpoint.is_empty() {
                return Err(anyhow::anyhow!(
                    "LLM endpoint must not be empty when enabled"
                ));
            }
        }

        if let Some(parent) = self.mapping.database_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }
}
