//! Error types for the membrane's configuration and backend-selection
//! surfaces. These are ordinary library errors raised
//! during startup parsing; they are never surfaced across the interposed
//! malloc/free boundary, which must never itself fail in a
//! way that propagates a Rust error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("definitions file references unknown backend '{name}'")]
    UnknownBackend { name: String },

    #[error("rules file line {line}: {reason}")]
    MalformedRule { line: usize, reason: String },

    #[error("environment variable {var} has an invalid value '{value}'")]
    InvalidEnvValue { var: &'static str, value: String },

    #[error("could not read file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no backend named '{name}' is registered")]
    NotFound { name: String },

    #[error("backend '{name}' rejected configuration line: {line}")]
    RejectedConfiguration { name: String, line: String },
}
