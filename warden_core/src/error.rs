use crate::value::ValueType;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to rewrite a unit binary. The unit is then not loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum TransformError {
    #[error("malformed unit binary: {0}")]
    Malformed(String),

    #[error("unit binary declares {found} but was requested as {expected}")]
    NameMismatch { expected: String, found: String },

    #[error("unit {unit} already declares a field named {field}")]
    FieldCollision { unit: String, field: String },

    #[error("failed to encode rewritten unit: {0}")]
    Encode(String),

    #[error("unit {unit} with {probe_count} probes no longer fits the {limit}-byte unit limit")]
    TooLarge {
        unit: String,
        probe_count: u32,
        limit: usize,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ProbeAccessError {
    #[error("unit {unit} was not instrumented")]
    NotInstrumented { unit: String },

    #[error("probe field {field} is missing from unit {unit}")]
    Missing { unit: String, field: String },

    #[error("probe field {field} of unit {unit} is {found}, expected bool[{expected}]")]
    WrongShape {
        unit: String,
        field: String,
        expected: u32,
        found: String,
    },
}

/// The call could not be dispatched. Distinct from a fault raised by the
/// target itself, which travels inside `ExecutionResult::Failure`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum DispatchError {
    #[error("unit {unit} not found on the configured paths")]
    UnitNotFound { unit: String },

    #[error("unit {unit} could not be loaded: {reason}")]
    UnitLoad { unit: String, reason: String },

    #[error("unit {unit} has no member {member}")]
    MemberNotFound { unit: String, member: String },

    #[error("{member} takes {expected} arguments, got {found}")]
    ArityMismatch {
        member: String,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of {member} must be {expected}, got {found}")]
    ArgumentType {
        member: String,
        index: usize,
        expected: ValueType,
        found: String,
    },

    #[error("unit {unit} has no static field {field}")]
    FieldNotFound { unit: String, field: String },

    #[error("static field {unit}.{field} is not accessible")]
    FieldInaccessible { unit: String, field: String },

    #[error("static field {unit}.{field} is {expected}, got {found}")]
    FieldType {
        unit: String,
        field: String,
        expected: ValueType,
        found: String,
    },
}

/// Error payload of a worker response.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum WorkerError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    ProbeAccess(#[from] ProbeAccessError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("internal worker error: {0}")]
    Internal(String),
}
