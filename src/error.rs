//! Error taxonomy for a reconciliation pass.

use std::path::PathBuf;

use thiserror::Error;

use crate::snapshot::PartialSnapshot;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// One or more required snapshot keys are empty. The orchestrator
    /// recovers from this by aborting the pass without side effects.
    #[error("missing data for {missing:?} in {partial:?}")]
    ConfigurationIncomplete {
        missing: Vec<&'static str>,
        partial: PartialSnapshot,
    },

    #[error("could not resolve address '{addr}': {reason}")]
    AddressResolution { addr: String, reason: String },

    #[error("failed to read relation data from {path:?}: {source}")]
    RelationRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed relation data in {path:?}: {source}")]
    RelationParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to read template for '{service}' at {path:?}: {source}")]
    TemplateRead {
        service: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid template for '{service}': {source}")]
    TemplateParse {
        service: String,
        source: Box<handlebars::TemplateError>,
    },

    #[error("failed to render template for '{service}': {source}")]
    TemplateRender {
        service: String,
        source: handlebars::RenderError,
    },

    #[error("failed to write service file {path:?}: {source}")]
    ServiceFileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("'{action}' of service '{service}' failed: {reason}")]
    ServiceControl {
        service: String,
        action: &'static str,
        reason: String,
    },

    #[error("failed to add user '{user}' to group '{group}': {reason}")]
    GroupSetup {
        user: String,
        group: String,
        reason: String,
    },

    /// The control plane's first-registration race. Retried once by the
    /// registrar and never surfaced on its own.
    #[error("transient registration failure from {endpoint}: {message}")]
    RegistrationTransient { endpoint: String, message: String },

    #[error("unable to register machine with {endpoint} ({reason}), request: {request}")]
    RegistrationFatal {
        endpoint: String,
        reason: String,
        request: String,
    },

    #[error("failed to read state file {path:?}: {source}")]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write state file {path:?}: {source}")]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode state: {0}")]
    StateEncode(#[from] serde_json::Error),
}
