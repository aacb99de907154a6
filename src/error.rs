use miette::Diagnostic;
use thiserror::Error;

use crate::capacity::Violation;
use crate::console::{SessionError, TransportError};

#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("host check failed: {message}")]
    Host { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Capacity(#[from] Violation),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}
