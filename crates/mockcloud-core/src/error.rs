//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy shared by the store and the resource service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;
use uuid::Uuid;

use crate::model::{LifecycleState, ResourceKind};

/// Failures raised by [`crate::store::ResourceStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{} with id {id} not found", .kind.label())]
    NotFound { kind: ResourceKind, id: Uuid },
    #[error("{} with name '{name}' already exists", .kind.label())]
    NameTaken { kind: ResourceKind, name: String },
    /// The request references records that do not fit together.
    #[error("{message}")]
    Rejected { message: String },
    #[error("{message}")]
    InvalidState {
        kind: ResourceKind,
        id: Uuid,
        message: String,
    },
    #[error("{message}")]
    Conflict {
        kind: ResourceKind,
        id: Uuid,
        message: String,
    },
    #[error("{} {id} cannot move from {from} to {to}", .kind.label())]
    InvalidTransition {
        kind: ResourceKind,
        id: Uuid,
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Failures surfaced to callers of [`crate::service::ResourceService`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{} with id {id} not found", .kind.label())]
    NotFound { kind: ResourceKind, id: Uuid },
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    InvalidState {
        kind: ResourceKind,
        id: Uuid,
        message: String,
    },
    #[error("{message}")]
    Conflict {
        kind: ResourceKind,
        id: Option<Uuid>,
        message: String,
    },
    #[error("{} {id} cannot move from {from} to {to}", .kind.label())]
    InvalidTransition {
        kind: ResourceKind,
        id: Uuid,
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("{message}")]
    Unavailable {
        kind: ResourceKind,
        id: Uuid,
        message: String,
    },
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, id: Uuid) -> Self {
        ServiceError::NotFound { kind, id }
    }

    /// Resource the error refers to, when there is one.
    pub fn resource(&self) -> Option<(ResourceKind, Option<Uuid>)> {
        match self {
            ServiceError::NotFound { kind, id }
            | ServiceError::InvalidState { kind, id, .. }
            | ServiceError::InvalidTransition { kind, id, .. }
            | ServiceError::Unavailable { kind, id, .. } => Some((*kind, Some(*id))),
            ServiceError::Conflict { kind, id, .. } => Some((*kind, *id)),
            ServiceError::Validation { .. } => None,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound { kind, id } => ServiceError::NotFound { kind, id },
            StoreError::NameTaken { kind, .. } => ServiceError::Conflict {
                kind,
                id: None,
                message,
            },
            StoreError::Rejected { .. } => ServiceError::Validation { message },
            StoreError::InvalidState { kind, id, .. } => {
                ServiceError::InvalidState { kind, id, message }
            }
            StoreError::Conflict { kind, id, .. } => ServiceError::Conflict {
                kind,
                id: Some(id),
                message,
            },
            StoreError::InvalidTransition { kind, id, from, to } => {
                ServiceError::InvalidTransition { kind, id, from, to }
            }
        }
    }
}
