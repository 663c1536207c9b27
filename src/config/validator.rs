//! Document validation.
//!
//! Every problem is collected so the user can fix them all in one pass.
//! Graph-level checks (duplicate ids, unknown nodes, cycles) live in the
//! graph builder and scheduler.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::spec::{Document, ProviderKind, ResourceDecl};
use crate::graph::RESERVED_IDS;

/// Validator for `converge.yaml` documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// Field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns `ValidationFailed` listing every error if any were found.
    pub fn validate(&self, doc: &Document) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(doc, &mut result);
        Self::validate_settings(doc, &mut result);
        Self::validate_provider(doc, &mut result);
        for (i, resource) in doc.resources.iter().enumerate() {
            Self::validate_resource(i, resource, &mut result);
        }
        Self::validate_flags(doc, &mut result);

        for warning in &result.warnings {
            warn!("{}", warning);
        }

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            Err(ConvergeError::Config(ConfigError::ValidationFailed {
                errors: result.errors.iter().map(ToString::to_string).collect(),
            }))
        }
    }

    fn validate_project(doc: &Document, result: &mut ValidationResult) {
        if doc.project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&doc.project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    doc.project.name
                ),
            );
        }

        if doc.project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }

        if doc.state.path.trim().is_empty() {
            result.error("state.path", "State path cannot be empty");
        }
    }

    fn validate_settings(doc: &Document, result: &mut ValidationResult) {
        if doc.settings.parallelism == 0 {
            result.error("settings.parallelism", "Parallelism must be at least 1");
        }
    }

    fn validate_provider(doc: &Document, result: &mut ValidationResult) {
        match doc.provider.kind {
            ProviderKind::Http => match doc.provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error("provider.endpoint", "Endpoint is required for the http provider");
                }
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Local => {
                if doc.provider.endpoint.is_some() {
                    result.warn("provider.endpoint is ignored by the local provider");
                }
            }
        }

        if doc.provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    fn validate_resource(i: usize, resource: &ResourceDecl, result: &mut ValidationResult) {
        let field = format!("resources[{i}]");

        if resource.id.is_empty() {
            result.error(format!("{field}.id"), "Resource id cannot be empty");
        } else if !is_valid_id(&resource.id) {
            result.error(
                format!("{field}.id"),
                format!(
                    "Resource id '{}' is invalid. Must start with a lowercase letter and contain only lowercase letters, digits, '_' or '-'.",
                    resource.id
                ),
            );
        } else if RESERVED_IDS.contains(&resource.id.as_str()) {
            result.error(
                format!("{field}.id"),
                format!("Resource id '{}' is reserved", resource.id),
            );
        }

        if resource.attributes.keys().any(|k| k.trim().is_empty()) {
            result.error(format!("{field}.attributes"), "Attribute names cannot be empty");
        }

        if resource.depends_on.iter().any(|d| d.trim().is_empty()) {
            result.error(format!("{field}.depends_on"), "Dependency ids cannot be empty");
        }

        let mut seen = BTreeSet::new();
        for dep in &resource.depends_on {
            if !seen.insert(dep) {
                result.warn(format!(
                    "Resource '{}' lists dependency '{dep}' more than once",
                    resource.id
                ));
            }
        }
    }

    fn validate_flags(doc: &Document, result: &mut ValidationResult) {
        let mut used = BTreeSet::new();

        for (i, resource) in doc.resources.iter().enumerate() {
            let Some((flag, _)) = resource.enabled.flag() else {
                continue;
            };
            if flag.is_empty() {
                result.error(format!("resources[{i}].enabled"), "Flag name cannot be empty");
            } else if !doc.flags.contains_key(flag) {
                result.error(
                    format!("resources[{i}].enabled"),
                    format!("Resource '{}' references undeclared flag '{flag}'", resource.id),
                );
            } else {
                used.insert(flag.to_string());
            }
        }

        for flag in doc.flags.keys() {
            if !used.contains(flag) {
                result.warn(format!("Flag '{flag}' is declared but gates no resource"));
            }
        }
    }
}

/// Checks if a project name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }
    !name.ends_with('-') && !name.contains("--")
}

/// Checks if a resource id is valid. Unlike project names, ids may use `_`.
fn is_valid_id(id: &str) -> bool {
    id.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns true if validation passed.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
