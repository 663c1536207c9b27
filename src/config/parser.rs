//! Document loading with `.env` support and environment overrides.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::Document;

/// Environment variable holding the REST provider bearer token.
pub const PROVIDER_TOKEN_ENV: &str = "CONVERGE_PROVIDER_TOKEN";

/// Loads `converge.yaml` documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory `.env` is loaded from.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Document> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a document from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Document> {
        let doc: Document = serde_yaml::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed project {} with {} resources",
            doc.project.name,
            doc.resources.len()
        );
        Ok(doc)
    }

    /// Loads a document and applies `CONVERGE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or an override is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Document> {
        let mut doc = self.load_file(path)?;
        apply_overrides(&mut doc, |key| std::env::var(key).ok())?;
        Ok(doc)
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Returns the REST provider token.
    ///
    /// # Errors
    ///
    /// Returns `MissingEnvVar` if it is not set.
    pub fn provider_token() -> Result<String> {
        std::env::var(PROVIDER_TOKEN_ENV).map_err(|_| {
            ConvergeError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_TOKEN_ENV),
            })
        })
    }
}

/// Applies overrides read through `lookup` (the process environment in production).
///
/// # Errors
///
/// Returns `ParseError` if `CONVERGE_PARALLELISM` is not a number.
pub fn apply_overrides<F>(doc: &mut Document, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = lookup("CONVERGE_PROJECT_NAME") {
        debug!("Overriding project.name from environment");
        doc.project.name = name;
    }

    if let Some(env) = lookup("CONVERGE_PROJECT_ENVIRONMENT") {
        debug!("Overriding project.environment from environment");
        doc.project.environment = env;
    }

    if let Some(endpoint) = lookup("CONVERGE_PROVIDER_ENDPOINT") {
        debug!("Overriding provider.endpoint from environment");
        doc.provider.endpoint = Some(endpoint);
    }

    if let Some(raw) = lookup("CONVERGE_PARALLELISM") {
        debug!("Overriding settings.parallelism from environment");
        doc.settings.parallelism = raw.trim().parse().map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Invalid parallelism '{raw}': {e}"),
                location: Some(String::from("CONVERGE_PARALLELISM")),
            })
        })?;
    }

    Ok(())
}

/// Document file names searched for, in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml", "infra.yaml"];

/// Finds a document in `start_dir` or any parent directory.
///
/// # Errors
///
/// Returns `FileNotFound` if no document exists.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
