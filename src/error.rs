use crate::configuration::EntityKind;
use thiserror::Error;

/// Error kinds surfaced by the configuration and lifecycle core.
///
/// Per-entity failures are collected into aggregate reports rather than
/// aborting a whole changeset, so every variant is cheap to clone and compare.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SnampError {
    /// An entity with the same name already exists in the target collection.
    #[error("{kind} '{name}' already exists")]
    ConfigurationKeyConflict { kind: EntityKind, name: String },

    /// No factory is registered for the declared connector or gateway type.
    #[error("no factory registered for {kind} type '{type_name}'")]
    UnknownEntityType { kind: EntityKind, type_name: String },

    /// Instantiation or reconfiguration of a live instance failed.
    #[error("{kind} '{name}' failed: {reason}")]
    ConnectionFailure {
        kind: EntityKind,
        name: String,
        reason: String,
    },

    /// The update window of an instance was used after it was closed.
    #[error("update window '{0}' is closed")]
    UpdateWindowClosed(String),

    /// The feature is already bound for this resource.
    #[error("feature '{feature}' of resource '{resource}' is already bound")]
    BindingConflict { resource: String, feature: String },
}

impl SnampError {
    /// Builds a `ConnectionFailure` from any plugin error, keeping the full cause chain.
    pub fn connection_failure(kind: EntityKind, name: &str, error: &anyhow::Error) -> Self {
        SnampError::ConnectionFailure {
            kind,
            name: name.to_string(),
            reason: format!("{:#}", error),
        }
    }
}
