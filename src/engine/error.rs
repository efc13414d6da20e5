use ulid::Ulid;

use crate::model::AppointmentStatus;
use crate::time::FormatError;

#[derive(Debug)]
pub enum EngineError {
    InvalidFormat(String),
    MissingField(&'static str),
    InvalidRange(String),
    NoAvailability,
    SlotAlreadyTaken(Ulid),
    /// Lock wait exceeded the transaction timeout. Safe to retry verbatim.
    Conflict,
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Unauthorized(&'static str),
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFormat,
    MissingField,
    InvalidRange,
    NoAvailability,
    SlotAlreadyTaken,
    Conflict,
    NotFound,
    AlreadyExists,
    Unauthorized,
    InvalidTransition,
    LimitExceeded,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Conflict)
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            EngineError::MissingField(_) => ErrorKind::MissingField,
            EngineError::InvalidRange(_) => ErrorKind::InvalidRange,
            EngineError::NoAvailability => ErrorKind::NoAvailability,
            EngineError::SlotAlreadyTaken(_) => ErrorKind::SlotAlreadyTaken,
            EngineError::Conflict => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show a client: storage internals are withheld.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::WalError(_) => "internal storage error".to_string(),
            // The blocking appointment belongs to someone else.
            EngineError::SlotAlreadyTaken(_) => "requested time is already booked".to_string(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidFormat(msg) => write!(f, "{msg}"),
            EngineError::MissingField(field) => write!(f, "missing required field: {field}"),
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::NoAvailability => {
                write!(f, "no availability interval covers the requested time")
            }
            EngineError::SlotAlreadyTaken(id) => {
                write!(f, "requested time is already booked by appointment {id}")
            }
            EngineError::Conflict => write!(f, "transaction timed out waiting for a lock; retry"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::InvalidTransition { id, from } => {
                write!(f, "appointment {id} is {from} and cannot change state")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<FormatError> for EngineError {
    fn from(e: FormatError) -> Self {
        EngineError::InvalidFormat(e.to_string())
    }
}
