//! Error taxonomy for the engine.
//!
//! Compile-time problems (`ValidationError`, `CoercionError`) are surfaced
//! synchronously and never reach the job state machine. Streaming problems
//! (`ExecutionError`) always end a job in `failed`. Cancellation is not an
//! error and has no variant here.

use crate::job::{JobId, JobStatus};
use crate::rule::OperatorKind;
use crate::schema::ColumnType;
use thiserror::Error;

/// Structural or type problems found while compiling a rule tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("rule payload is malformed: {0}")]
    Malformed(String),

    #[error("unknown field '{field}' at {path}")]
    UnknownField { field: String, path: String },

    #[error("operator '{operator}' cannot be applied to {column_type} field '{field}' at {path}")]
    OperatorNotApplicable {
        field: String,
        operator: OperatorKind,
        column_type: ColumnType,
        path: String,
    },

    #[error("operator '{operator}' on field '{field}' requires a value at {path}")]
    MissingValue {
        field: String,
        operator: OperatorKind,
        path: String,
    },

    #[error("rule group at {path} has no rules")]
    EmptyGroup { path: String },

    #[error("rule tree nesting exceeds the maximum depth of {max_depth}")]
    DepthExceeded { max_depth: usize },

    #[error("rule tree contains no conditions")]
    EmptyRuleTree,
}

/// A rule value that cannot be converted to its column's type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("value {value} for field '{field}' is not a valid {target}: {reason}")]
pub struct CoercionError {
    pub field: String,
    pub value: String,
    pub target: ColumnType,
    pub reason: String,
}

/// Any failure `RuleCompiler::compile` can report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

/// Failures while streaming a dataset through a predicate.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not decode chunk {chunk}: {source}")]
    Decode {
        chunk: usize,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("could not write output: {0}")]
    Write(#[source] arrow::error::ArrowError),

    #[error("could not write parquet output: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("row {row} has a value '{value}' in column '{column}' that is not a valid {expected}")]
    MalformedRow {
        row: u64,
        column: String,
        value: String,
        expected: ColumnType,
    },

    #[error("dataset storage reference '{0}' cannot be opened")]
    UnknownStorage(String),

    #[error("dataset header [{found}] does not match the registered columns [{expected}]")]
    HeaderMismatch { expected: String, found: String },

    #[error("execution task aborted: {0}")]
    Aborted(String),
}

/// Errors returned by the job state machine to its callers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("rules rejected: {0}")]
    Rejected(#[from] CompileError),

    #[error("dataset '{0}' is not registered")]
    DatasetNotFound(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already has an active execution")]
    AlreadyActive(JobId),

    #[error("job {0} already exists; resubmission requires a new job id")]
    AlreadyExists(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job queue is closed")]
    QueueClosed,

    #[error("could not read dataset sample: {0}")]
    Sample(#[source] ExecutionError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ValidationError> for JobError {
    fn from(err: ValidationError) -> Self {
        Self::Rejected(CompileError::Validation(err))
    }
}

impl From<tempfile::PersistError> for ExecutionError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(err.error)
    }
}
