//! Configuration for converge.
//!
//! This module handles:
//! - Parsing `converge.yaml` with `.env` and `CONVERGE_*` overrides
//! - Flag bindings gating optional resources
//! - Validation of the document
//! - Canonical hashing for change detection

mod flags;
mod hash;
mod parser;
mod spec;
mod validator;

pub use flags::{FlagBindings, FLAG_ENV_PREFIX};
pub use hash::ConfigHasher;
pub use parser::{apply_overrides, find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_ENV};
pub use spec::{
    Document, ProjectConfig, ProviderConfig, ProviderKind, ResourceDecl, Settings, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
