//! Controller error taxonomy.
//!
//! Validation problems and illegal phase transitions are terminal. Everything that comes
//! from a collaborator (store, engine) is transient and handled by requeueing with backoff.

use crate::engine::EngineError;
use crate::model::Phase;
use crate::store::StoreError;

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: Phase },

    #[error("request store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution engine error: {0}")]
    Engine(#[from] EngineError),
}

impl ControllerError {
    /// Whether the reconcile that produced this error should be retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            ControllerError::Validation(_) | ControllerError::InvalidTransition { .. } => false,
            ControllerError::Store(e) => e.is_retriable(),
            ControllerError::Engine(e) => e.is_retriable(),
        }
    }
}
