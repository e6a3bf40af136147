//! Core traits and types for the partflow engine
//!
//! This module defines the element bound shared by every dataset, the
//! partition type and the engine error taxonomy.

use partflow_common::CommonError;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a stage, unique within a `FlowContext`.
pub type StageId = usize;

/// Errors surfaced by datasets, storage and promises.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error(
        "Matrix '{name}' already exists with dimensions {existing:?}, requested {requested:?}"
    )]
    DimensionMismatch {
        name: String,
        existing: (usize, usize),
        requested: (usize, usize),
    },

    #[error("Stage {stage_id} ({operator}) failed on partition {partition}{}: {source}", key_suffix(.key))]
    ExecutionFailure {
        stage_id: StageId,
        operator: &'static str,
        partition: usize,
        key: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Storage(#[from] CommonError),

    /// A failure observed by several consumers, e.g. every caller of a
    /// failed promise.
    #[error(transparent)]
    Shared(Arc<EngineError>),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" at key {}", key),
        None => String::new(),
    }
}

/// Coarse classification of an `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    IllegalState,
    ExecutionFailure,
    Storage,
}

impl EngineError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument { .. } | EngineError::DimensionMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            EngineError::IllegalState { .. } => ErrorKind::IllegalState,
            EngineError::ExecutionFailure { .. } => ErrorKind::ExecutionFailure,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Shared(inner) => inner.kind(),
        }
    }

    /// Already carries stage identity; schedulers pass it through unchanged.
    pub(crate) fn is_stage_failure(&self) -> bool {
        match self {
            EngineError::ExecutionFailure { .. } => true,
            EngineError::Shared(inner) => inner.is_stage_failure(),
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// A data type that can be used in a dataset.
pub trait Data:
    Send + Sync + Clone + Debug + Serialize + for<'de> Deserialize<'de> + 'static
{
}
impl<T> Data for T where
    T: Send + Sync + Clone + Debug + Serialize + for<'de> Deserialize<'de> + 'static
{
}

/// Ordered, immutable chunk of a dataset.
///
/// Cloning is cheap: the elements are shared, and dropped once neither a
/// stage output nor a cache entry references them.
#[derive(Debug)]
pub struct Partition<T> {
    index: usize,
    data: Arc<Vec<T>>,
}

impl<T> Clone for Partition<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            data: Arc::clone(&self.data),
        }
    }
}

impl<T> Partition<T> {
    pub fn new(index: usize, data: Vec<T>) -> Self {
        Self {
            index,
            data: Arc::new(data),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when both handles point at the same materialized elements.
    pub fn shares_data_with(&self, other: &Partition<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl<T: Clone> Partition<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.data.as_ref().clone()
    }
}
