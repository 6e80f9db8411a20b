//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (clap handles syntactic)
//! - Check port assignments do not collide
//! - Validate the context path shape before the router sees it
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure: ServerConfig → Result<(), Vec<ConfigError>>
//! - File existence is checked at load time, not here

use thiserror::Error;

use super::ServerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("public port must be non-zero")]
    ZeroPublicPort,

    #[error("secure port {0} and insecure port {0} collide")]
    PortCollision(u16),

    #[error("context path {0:?} must start with '/'")]
    ContextPathMissingSlash(String),

    #[error("context path {0:?} must not end with '/'")]
    ContextPathTrailingSlash(String),

    #[error("congestion control algorithm name is empty")]
    EmptyCongestionAlgorithm,

    #[error("config name is empty")]
    EmptyConfigName,
}

/// Checks a configuration for semantic errors, collecting every failure.
pub fn validate(config: &ServerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.public_port == 0 {
        errors.push(ConfigError::ZeroPublicPort);
    }

    // Only meaningful when both ports would actually bind.
    if config.tls.is_some()
        && !config.enable_h2c
        && config.insecure_public_port != 0
        && config.insecure_public_port == config.public_port
    {
        errors.push(ConfigError::PortCollision(config.public_port));
    }

    if !config.context_path.is_empty() {
        if !config.context_path.starts_with('/') {
            errors.push(ConfigError::ContextPathMissingSlash(
                config.context_path.clone(),
            ));
        }
        if config.context_path.ends_with('/') {
            errors.push(ConfigError::ContextPathTrailingSlash(
                config.context_path.clone(),
            ));
        }
    }

    if matches!(config.tuning.congestion.as_deref(), Some("")) {
        errors.push(ConfigError::EmptyCongestionAlgorithm);
    }

    if config.config_name.is_empty() {
        errors.push(ConfigError::EmptyConfigName);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
