//! Error types for the converge reconciler.
//!
//! This module provides the error hierarchy for every stage of a run:
//! document loading, graph construction, state management, provider calls,
//! planning, and reconciliation.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the converge reconciler.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Document loading or validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors (duplicates, cycles, dangling dependencies...).
    #[error("Invalid resource graph:\n{0}")]
    Graph(#[from] GraphErrors),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors that escape a single node (e.g. provider setup).
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Document-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The document could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed. Every problem found is listed.
    #[error("Configuration validation failed:\n{}", bullet_list(.errors))]
    ValidationFailed {
        /// All validation errors, formatted as `field: message`.
        errors: Vec<String>,
    },

    /// A flag override could not be parsed.
    #[error("Invalid flag binding '{binding}': {reason}")]
    InvalidFlag {
        /// The offending binding as given.
        binding: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// A single fatal configuration problem in the resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two resources share an id.
    #[error("duplicate resource id '{id}'")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// An edge or reference names a resource that is not declared.
    #[error("unknown resource '{id}'{}", referenced_by_suffix(.referenced_by.as_deref()))]
    UnknownNode {
        /// The missing resource id.
        id: String,
        /// The resource whose dependency or reference named it, if known.
        referenced_by: Option<String>,
    },

    /// A resource lists itself as a dependency.
    #[error("resource '{id}' depends on itself")]
    SelfDependency {
        /// The resource id.
        id: String,
    },

    /// An attribute reference is malformed or names an unknown run value.
    #[error("resource '{id}' attribute '{attribute}': invalid reference '{reference}'")]
    InvalidReference {
        /// The resource id.
        id: String,
        /// Attribute holding the reference.
        attribute: String,
        /// The raw reference text.
        reference: String,
    },

    /// An enabled expression names a flag that is not bound.
    #[error("resource '{id}' is gated by unknown flag '{flag}'")]
    UnknownFlag {
        /// The resource id.
        id: String,
        /// The unknown flag name.
        flag: String,
    },

    /// An enabled resource depends on a disabled one.
    #[error("resource '{dependent}' is enabled but depends on disabled resource '{dependency}'")]
    DanglingDependency {
        /// The enabled resource.
        dependent: String,
        /// The disabled resource it depends on.
        dependency: String,
    },

    /// The dependency edges contain a cycle.
    #[error("dependency cycle among resources: {}", .nodes.join(", "))]
    CycleDetected {
        /// Ids of every resource left unscheduled, in declaration order.
        nodes: Vec<String>,
    },

    /// The graph was mutated after being frozen.
    #[error("resource graph is frozen")]
    Frozen,
}

/// A non-empty list of graph errors, reported together so all of them can be
/// fixed in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphErrors(Vec<GraphError>);

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors reported by a provider implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Authentication failed.
    #[error("provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the request permanently.
    #[error("provider rejected request: {status} - {message}")]
    Rejected {
        /// Provider status code (HTTP status for the REST provider).
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The provider is temporarily unavailable.
    #[error("provider unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// The resource does not exist on the provider side.
    #[error("resource not found: {provider_id}")]
    NotFound {
        /// Provider-assigned id.
        provider_id: String,
    },

    /// Network error.
    #[error("network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Local provider storage failure.
    #[error("provider storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A plan entry waits on an entry that does not exist.
    #[error("Plan entry '{entry}' depends on missing entry #{index}")]
    MissingDependency {
        /// The waiting entry.
        entry: String,
        /// The missing index.
        index: usize,
    },

    /// State records a dependency cycle between resources being destroyed.
    #[error("Recorded state contains a dependency cycle: {}", .nodes.join(", "))]
    StateCycle {
        /// Resources involved.
        nodes: Vec<String>,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A worker task panicked or was lost.
    #[error("Worker for resource '{id}' did not complete: {reason}")]
    WorkerLost {
        /// Resource the worker was executing.
        id: String,
        /// Join error description.
        reason: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

/// Process exit code for a run that completed with every node successful.
pub const EXIT_SUCCESS: u8 = 0;

/// Process exit code for a run that completed but with failed or skipped nodes.
pub const EXIT_COMPLETED_WITH_FAILURES: u8 = 1;

/// Process exit code for fatal configuration errors detected before execution.
pub const EXIT_CONFIGURATION_ERROR: u8 = 2;

/// Process exit code for other runtime errors (state, lock, IO).
pub const EXIT_RUNTIME_ERROR: u8 = 3;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a fatal configuration error.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }

    /// Maps the error to the CLI exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_configuration_error() {
            EXIT_CONFIGURATION_ERROR
        } else {
            EXIT_RUNTIME_ERROR
        }
    }
}

impl ConfigError {
    /// Creates a parse error without a source location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl GraphErrors {
    /// Builds the error list, returning `None` when there is nothing to report.
    #[must_use]
    pub fn from_vec(errors: Vec<GraphError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    /// Wraps a single error.
    #[must_use]
    pub fn single(error: GraphError) -> Self {
        Self(vec![error])
    }

    /// Returns the individual errors.
    #[must_use]
    pub fn errors(&self) -> &[GraphError] {
        &self.0
    }

    /// Appends every error of `other`, keeping order.
    pub fn append(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Returns the number of errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the list is empty. Lists built through `from_vec` never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GraphErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphErrors {}

impl From<GraphError> for ConvergeError {
    fn from(error: GraphError) -> Self {
        Self::Graph(GraphErrors::single(error))
    }
}

impl ProviderError {
    /// Returns true if the provider signalled a transient condition.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::NetworkError { .. }
        )
    }

    /// Returns the provider-suggested delay before retrying, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

fn referenced_by_suffix(referenced_by: Option<&str>) -> String {
    referenced_by.map_or_else(String::new, |id| format!(" (required by '{id}')"))
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("  - {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_errors_list_every_issue() {
        let errors = GraphErrors::from_vec(vec![
            GraphError::DuplicateId { id: String::from("vpc") },
            GraphError::CycleDetected {
                nodes: vec![String::from("a"), String::from("b")],
            },
        ])
        .unwrap();

        let text = errors.to_string();
        assert!(text.contains("duplicate resource id 'vpc'"));
        assert!(text.contains("dependency cycle among resources: a, b"));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_empty_graph_errors_is_none() {
        assert!(GraphErrors::from_vec(vec![]).is_none());
    }

    #[test]
    fn test_exit_codes() {
        let config: ConvergeError = GraphError::Frozen.into();
        assert_eq!(config.exit_code(), EXIT_CONFIGURATION_ERROR);

        let state = ConvergeError::State(StateError::write("disk full"));
        assert_eq!(state.exit_code(), EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn test_transient_provider_errors() {
        assert!(ProviderError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(!ProviderError::rejected(400, "bad cidr").is_transient());
        assert_eq!(
            ProviderError::RateLimited { retry_after_secs: 5 }.retry_after_secs(),
            Some(5)
        );
    }
}
