//! Erosion error taxonomy.

use thiserror::Error;

use crate::backend::BackendError;

use super::simulation::SimulationState;

#[derive(Debug, Error)]
pub enum ErosionError {
    /// No (or an empty) height field was supplied.
    #[error("Missing input: a non-empty height field is required")]
    MissingInput,
    /// Zero-sized or mismatched resolutions.
    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),
    /// An operation was invoked out of sequence.
    #[error("Invalid state: cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SimulationState,
    },
    /// The compute backend failed to allocate or dispatch.
    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),
    /// The cancellation flag was raised between iterations.
    #[error("Simulation cancelled after {completed} of {total} iterations")]
    Cancelled { completed: u32, total: u32 },
}
