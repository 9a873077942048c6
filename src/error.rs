//! Standard error and result types.
//!
//! Each engine module defines its own error enum; this module folds them
//! into one crate-level [`Error`] so `?` composes across the API surface.

use crate::plugin::PluginError;
use crate::sim::{KernelError, LaunchError, MemoryError};

pub type Result<T> = std::result::Result<T, Error>;

/// Any error the engine can surface to a caller.
///
/// Memory faults raised *during* execution never appear here: they are
/// scoped to the faulting work-item and reported through the plugin bus.
/// This type covers setup and teardown paths, where an error is terminal
/// for the operation that raised it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Memory(#[from] MemoryError),
    #[error("{0}")]
    Kernel(#[from] KernelError),
    #[error("{0}")]
    Launch(#[from] LaunchError),
    #[error("{0}")]
    Plugin(#[from] PluginError),
}

impl From<Error> for String {
    fn from(err: Error) -> String {
        err.to_string()
    }
}
