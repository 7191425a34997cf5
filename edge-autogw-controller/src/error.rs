use thiserror::Error;

use crate::{
    client::{ClientError, ResourceKind},
    label::DecodeError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Service {0} has no namespace")]
    MissingNamespace(String),

    #[error("malformed exposure label on Service {namespace}/{name}: {source}")]
    MalformedExposure {
        namespace: String,
        name: String,
        source: DecodeError,
    },

    #[error("failed to create {kind} {namespace}/{name}: {source}")]
    RemoteCreateFailed {
        kind: ResourceKind,
        namespace: String,
        name: String,
        source: ClientError,
    },

    #[error("failed to update {kind} {namespace}/{name}: {source}")]
    RemoteUpdateFailed {
        kind: ResourceKind,
        namespace: String,
        name: String,
        source: ClientError,
    },

    #[error("failed to get {kind} {namespace}/{name}: {source}")]
    RemoteGetFailed {
        kind: ResourceKind,
        namespace: String,
        name: String,
        source: ClientError,
    },

    #[error("failed to delete {kind} {namespace}/{name}: {source}")]
    RemoteDeleteFailed {
        kind: ResourceKind,
        namespace: String,
        name: String,
        source: ClientError,
    },

    #[error("cleanup of {namespace}/{name} failed for {} resource(s)", .failures.len())]
    CleanupFailed {
        namespace: String,
        name: String,
        failures: Vec<Error>,
    },

    #[error("event handler {0} is already registered")]
    HandlerConflict(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::MissingNamespace(_) => "missing_namespace",
            Error::MalformedExposure { .. } => "malformed_exposure",
            Error::RemoteCreateFailed { .. } => "remote_create_failed",
            Error::RemoteUpdateFailed { .. } => "remote_update_failed",
            Error::RemoteGetFailed { .. } => "remote_get_failed",
            Error::RemoteDeleteFailed { .. } => "remote_delete_failed",
            Error::CleanupFailed { .. } => "cleanup_failed",
            Error::HandlerConflict(_) => "handler_conflict",
        }
        .to_string()
    }
}
