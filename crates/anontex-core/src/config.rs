//! Configuration management for anontex

use crate::error::{AnontexError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com";
pub const DEFAULT_MAPPING_TTL_SECONDS: u64 = 600;
pub const DEFAULT_ENTITIES: [&str; 6] = [
    "PHONE_NUMBER",
    "PERSON",
    "EMAIL_ADDRESS",
    "LOCATION",
    "ORGANIZATION",
    "CREDIT_CARD",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub faker: FakerConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub upstream_url: String,
    pub host: String,
    pub port: u16,
    pub upstream_timeout_seconds: Option<u64>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub language: String,
    pub entities: Vec<String>,
    pub patterns: HashMap<String, String>,
    pub recognizers_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakerConfig {
    pub locale: String,
    pub seed: Option<u64>,
    pub max_collision_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub database_path: PathBuf,
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            upstream_timeout_seconds: Some(300),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            entities: DEFAULT_ENTITIES.iter().map(|e| e.to_string()).collect(),
            patterns: HashMap::new(),
            recognizers_path: None,
        }
    }
}

impl Default for FakerConfig {
    fn default() -> Self {
        Self {
            locale: "en_US".to_string(),
            seed: None,
            max_collision_retries: 8,
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("mappings.db"),
            ttl_seconds: DEFAULT_MAPPING_TTL_SECONDS,
            sweep_interval_seconds: 60,
        }
    }
}

impl Config {
    pub fn get_app_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "anontex", "anontex")
            .ok_or_else(|| {
                AnontexError::Config("Failed to determine application directories".to_string())
            })
    }

    pub fn resolve_paths(&mut self) -> Result<()> {
        if self.mapping.database_path.is_relative() && !self.is_in_memory_store() {
            let project_dirs = Self::get_app_dirs()?;
            let data_dir = project_dirs.data_dir();
            std::fs::create_dir_all(data_dir).map_err(config_io)?;
            self.mapping.database_path = data_dir.join(&self.mapping.database_path);
        }

        Ok(())
    }

    pub fn is_in_memory_store(&self) -> bool {
        self.mapping.database_path == Path::new(":memory:")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(config_io)?;
        let mut config: Self = toml::from_str(&contents).map_err(|e| {
            AnontexError::Config(format!(
                "Invalid config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        config.resolve_paths()?;
        Ok(config)
    }

    pub fn get_default_config_path() -> Result<PathBuf> {
        let project_dirs = Self::get_app_dirs()?;
        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir).map_err(config_io)?;
        Ok(config_dir.join("anontex.toml"))
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| AnontexError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(config_io)?;
        Ok(())
    }

    /// Applies `ANONTEX_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ANONTEX_UPSTREAM_URL") {
            self.proxy.upstream_url = url;
        }
        if let Some(path) = lookup("ANONTEX_MAPPING_DB") {
            self.mapping.database_path = PathBuf::from(path);
        }
        if let Some(ttl) = lookup("ANONTEX_MAPPING_TTL") {
            self.mapping.ttl_seconds = ttl.parse().map_err(|_| {
                AnontexError::Config(format!("Invalid ANONTEX_MAPPING_TTL '{}'", ttl))
            })?;
        }
        if let Some(host) = lookup("ANONTEX_HOST") {
            self.proxy.host = host;
        }
        if let Some(port) = lookup("ANONTEX_PORT") {
            self.proxy.port = port
                .parse()
                .map_err(|_| AnontexError::Config(format!("Invalid ANONTEX_PORT '{}'", port)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pattern) in &self.detection.patterns {
            regex::Regex::new(pattern).map_err(|e| {
                AnontexError::Config(format!("Invalid regex pattern for '{}': {}", name, e))
            })?;
        }

        if self.detection.entities.is_empty() {
            return Err(AnontexError::Config("Entity allow-list must not be empty".to_string()));
        }

        if self.mapping.ttl_seconds == 0 {
            return Err(AnontexError::Config("Mapping TTL must be at least one second".to_string()));
        }

        let upstream = reqwest::Url::parse(&self.proxy.upstream_url).map_err(|e| {
            AnontexError::Config(format!(
                "Invalid upstream URL '{}': {}",
                self.proxy.upstream_url, e
            ))
        })?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(AnontexError::Config(format!(
                "Upstream URL must use http or https, got '{}'",
                upstream.scheme()
            )));
        }

        if !self.is_in_memory_store() {
            if let Some(parent) = self.mapping.database_path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(config_io)?;
                }
            }
        }

        Ok(())
    }

    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.proxy.upstream_url.trim_end_matches('/')
    }
}

fn config_io(e: std::io::Error) -> AnontexError {
    AnontexError::Config(e.to_string())
}

/// A detected PII occurrence, in byte offsets over the scanned text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub entity_type: String,
}

impl Span {
    pub fn new(start: usize, end: usize, entity_type: impl Into<String>) -> Self {
        Self {
            start,
            end,
            entity_type: entity_type.into(),
        }
    }
}
